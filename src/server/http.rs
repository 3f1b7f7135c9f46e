//! Task-queue endpoints: create a background execution, then attach to
//! its output stream over server-sent events.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::context::{ComplaintFields, FlowContext};
use crate::message::ChatMessage;
use crate::node::NodeError;
use crate::registry::TaskRegistry;
use crate::server::AppState;
use crate::stream::StreamItem;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(default)]
    pub complaint_topic: Option<String>,
    #[serde(default)]
    pub complaint_metadata: Option<ComplaintMetadata>,
    pub messages: Vec<ChatMessage>,
}

/// Caller-supplied field values accompanying a task request.
#[derive(Debug, Default, Deserialize)]
pub struct ComplaintMetadata {
    #[serde(default)]
    pub complaint_location: Option<String>,
    #[serde(default)]
    pub complaint_summary: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<NodeError> for ApiError {
    fn from(err: NodeError) -> Self {
        let status = match err {
            NodeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message: err.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Accept a task, start its flow in the background and return the
/// minted task id immediately. The caller attaches to
/// `/api/tasks/{task_id}/stream` for the output.
pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<CreateTaskResponse>, ApiError> {
    let task_id = TaskRegistry::new_task_id();

    let metadata = request.complaint_metadata.unwrap_or_default();
    let fields = ComplaintFields::new(
        request.complaint_topic,
        metadata.complaint_location,
        metadata.complaint_summary,
    );

    // validate before registering anything, a rejected request must
    // leave no trace in the registry
    let ctx = FlowContext::seeded(task_id.clone(), request.messages, fields.clone())?;

    let channel = state.registry.get_or_create(&task_id).await;
    let ctx = ctx.with_output(channel.clone());

    // a task whose fields are already complete has nothing to triage
    let flow = if fields.is_complete() { state.reject.clone() } else { state.triage.clone() };

    let handle = state.registry.get_or_create_metadata(&task_id).await;
    info!(task_id, complete = fields.is_complete(), "task accepted");

    tokio::spawn(run_task(flow, ctx, handle, channel));

    Ok(Json(CreateTaskResponse { task_id }))
}

/// Background execution wrapper. Owns the end-of-stream sentinel: it is
/// put exactly once here, after the metadata write, on success and on
/// failure alike.
async fn run_task(
    flow: Arc<crate::flow::Flow>,
    mut ctx: FlowContext,
    handle: crate::registry::MetadataHandle,
    channel: crate::stream::OutputChannel,
) {
    let result = flow.run(&mut ctx).await;

    let mut meta = handle.lock().await;
    meta.complaint_topic = ctx.fields.complaint_topic.clone();
    meta.complaint_location = ctx.fields.complaint_location.clone();
    meta.complaint_summary =
        ctx.final_summary.clone().or_else(|| ctx.fields.complaint_summary.clone());
    if let Err(err) = result {
        error!(task_id = ctx.task_id, %err, "task execution failed");
        meta.error = Some(err.to_string());
    }
    drop(meta);

    channel.put(StreamItem::Done);
}

/// Removes the task entry when the consumer goes away, whether it saw
/// the whole stream or disconnected early.
struct RemoveOnDrop {
    registry: Arc<TaskRegistry>,
    task_id: String,
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let task_id = std::mem::take(&mut self.task_id);
        tokio::spawn(async move { registry.remove(&task_id).await });
    }
}

/// Attach to a task's output stream. Frames, in order: `{"content"}`
/// per fragment, one `{"metadata"}` after the sentinel, then
/// `{"done": true}`.
pub async fn stream_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let channel = state.registry.get_or_create(&task_id).await;
    let handle = state.registry.get_or_create_metadata(&task_id).await;
    let guard = RemoveOnDrop { registry: state.registry.clone(), task_id };

    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            match channel.get().await {
                StreamItem::Fragment(text) => {
                    yield Ok(Event::default().data(json!({ "content": text }).to_string()));
                }
                StreamItem::Done => {
                    let meta = handle.lock().await.clone();
                    yield Ok(Event::default().data(json!({ "metadata": meta }).to_string()));
                    yield Ok(Event::default().data(json!({ "done": true }).to_string()));
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
