//! Process-wide map from task identifier to output channel and
//! extracted metadata, shared between the producer-initiating and
//! consumer-attaching endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::stream::OutputChannel;

/// Extracted metadata for one task. `error` is the user-visible
/// surface for a background-execution failure; the stream consumer
/// forwards it inside the metadata frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub complaint_topic: Option<String>,
    pub complaint_location: Option<String>,
    pub complaint_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub type MetadataHandle = Arc<Mutex<TaskMetadata>>;

#[derive(Clone)]
struct TaskEntry {
    channel: OutputChannel,
    metadata: MetadataHandle,
    created_at: DateTime<Utc>,
}

/// Registry of live tasks. The map is the only structure mutated by
/// more than one logical task; every check-then-insert runs under the
/// single lock so concurrent callers racing to create the same task id
/// observe exactly one entry.
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { tasks: Mutex::new(HashMap::new()) })
    }

    /// Fresh opaque identifier for a task-creation call. Never reused,
    /// so concurrent unrelated conversations cannot collide on one
    /// task record.
    pub fn new_task_id() -> String {
        Uuid::new_v4().to_string()
    }

    async fn entry(&self, task_id: &str) -> TaskEntry {
        let mut tasks = self.tasks.lock().await;
        if let Some(entry) = tasks.get(task_id) {
            return entry.clone();
        }
        debug!(task_id, "creating task entry");
        let entry = TaskEntry {
            channel: OutputChannel::new(),
            metadata: Arc::new(Mutex::new(TaskMetadata::default())),
            created_at: Utc::now(),
        };
        tasks.insert(task_id.to_string(), entry.clone());
        entry
    }

    /// Idempotent: the first caller for a task id creates the channel,
    /// every later caller gets a handle to the same one.
    pub async fn get_or_create(&self, task_id: &str) -> OutputChannel {
        self.entry(task_id).await.channel
    }

    pub async fn get_or_create_metadata(&self, task_id: &str) -> MetadataHandle {
        self.entry(task_id).await.metadata
    }

    /// Delete the channel and metadata for a task. Called by the
    /// stream consumer exactly once after it observes the end-of-stream
    /// sentinel, and defensively when a consumer disconnects early.
    pub async fn remove(&self, task_id: &str) {
        let mut tasks = self.tasks.lock().await;
        if let Some(entry) = tasks.remove(task_id) {
            let age = Utc::now() - entry.created_at;
            debug!(task_id, age_ms = age.num_milliseconds(), "removed task entry");
        }
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamItem;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn test_concurrent_get_or_create_returns_one_channel() {
        let registry = TaskRegistry::new();

        let r1 = registry.clone();
        let r2 = registry.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { r1.get_or_create("T").await }),
            tokio::spawn(async move { r2.get_or_create("T").await }),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        // both handles must reach the same underlying queue
        a.put_fragment("shared");
        let item = timeout(Duration::from_millis(100), b.get())
            .await
            .expect("second handle should see the first handle's fragment");
        assert_eq!(item, StreamItem::Fragment("shared".into()));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_metadata_is_shared_per_task() {
        let registry = TaskRegistry::new();
        let first = registry.get_or_create_metadata("T").await;
        first.lock().await.complaint_topic = Some("Construction noise".into());

        let second = registry.get_or_create_metadata("T").await;
        assert_eq!(
            second.lock().await.complaint_topic.as_deref(),
            Some("Construction noise")
        );
    }

    #[tokio::test]
    async fn test_remove_deletes_channel_and_metadata() {
        let registry = TaskRegistry::new();
        registry.get_or_create("T").await;
        registry.get_or_create_metadata("T").await;
        assert_eq!(registry.len().await, 1);

        registry.remove("T").await;
        assert!(registry.is_empty().await);

        // removing twice is harmless
        registry.remove("T").await;
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = TaskRegistry::new_task_id();
        let b = TaskRegistry::new_task_id();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_metadata_error_field_is_hidden_when_absent() {
        let meta = TaskMetadata {
            complaint_topic: Some("Construction noise".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["complaint_topic"], "Construction noise");
    }
}
