use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A known complaint topic label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub topic: String,
}

impl Topic {
    pub fn new(topic: impl Into<String>) -> Self {
        Self { topic: topic.into() }
    }
}

/// Read-only lookup of the known topic labels. The extraction node
/// lists these in its prompt so the gateway classifies against the
/// same vocabulary the downstream agency uses.
#[async_trait]
pub trait TopicStore: Send + Sync {
    async fn list_topics(&self) -> Vec<Topic>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn TopicStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicStore").field("impl", &self.name()).finish()
    }
}

/// In-process topic list seeded at startup.
pub struct StaticTopicStore {
    topics: Vec<Topic>,
}

impl StaticTopicStore {
    pub fn new(labels: impl IntoIterator<Item = impl Into<String>>) -> Arc<Self> {
        Arc::new(Self { topics: labels.into_iter().map(Topic::new).collect() })
    }

    /// The default municipal topic vocabulary.
    pub fn with_defaults() -> Arc<Self> {
        Self::new([
            "Construction noise",
            "Noise pollution",
            "Illegal parking",
            "High-rise littering",
            "Cleanliness of public areas",
            "Pest control",
            "Smoking in prohibited areas",
            "Obstruction in common areas",
            "Damaged public facilities",
            "Animal issues",
        ])
    }
}

#[async_trait]
impl TopicStore for StaticTopicStore {
    async fn list_topics(&self) -> Vec<Topic> {
        self.topics.clone()
    }

    fn name(&self) -> &'static str {
        "StaticTopicStore"
    }
}
