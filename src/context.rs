//! Shared state threaded through one flow execution.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::envelope::{ClientEnvelope, ServerEnvelope};
use crate::message::{ChatMessage, Role};
use crate::node::NodeError;
use crate::stream::OutputChannel;

/// Whether the conversation still needs more input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Continue,
    Complete,
}

/// The three structured fields extracted from a complaint
/// conversation. `None` and blank strings both count as "not yet
/// known".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplaintFields {
    #[serde(default)]
    pub complaint_topic: Option<String>,
    #[serde(default)]
    pub complaint_location: Option<String>,
    #[serde(default)]
    pub complaint_summary: Option<String>,
}

fn is_blank(field: &Option<String>) -> bool {
    field.as_deref().is_none_or(|s| s.trim().is_empty())
}

impl ComplaintFields {
    pub fn new(
        topic: Option<String>,
        location: Option<String>,
        summary: Option<String>,
    ) -> Self {
        Self {
            complaint_topic: topic.filter(|s| !s.trim().is_empty()),
            complaint_location: location.filter(|s| !s.trim().is_empty()),
            complaint_summary: summary.filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    /// Names of the fields still to be extracted.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if is_blank(&self.complaint_topic) {
            out.push("complaint_topic");
        }
        if is_blank(&self.complaint_location) {
            out.push("complaint_location");
        }
        if is_blank(&self.complaint_summary) {
            out.push("complaint_summary");
        }
        out
    }

    /// Fill previously-empty fields from `parsed`. Fields that already
    /// hold a value are never overwritten, even if `parsed` echoes a
    /// different one.
    pub fn merge(&mut self, parsed: &ComplaintFields) {
        if is_blank(&self.complaint_topic) && !is_blank(&parsed.complaint_topic) {
            self.complaint_topic = parsed.complaint_topic.clone();
        }
        if is_blank(&self.complaint_location) && !is_blank(&parsed.complaint_location) {
            self.complaint_location = parsed.complaint_location.clone();
        }
        if is_blank(&self.complaint_summary) && !is_blank(&parsed.complaint_summary) {
            self.complaint_summary = parsed.complaint_summary.clone();
        }
    }

    pub fn reset(&mut self) {
        *self = ComplaintFields::default();
    }
}

/// A duplex client connection: the flow awaits inbound envelopes and
/// pushes outbound ones over the same link. Implemented by the
/// WebSocket transport and by the interactive terminal in the CLI.
#[async_trait]
pub trait Duplex: Send + Sync {
    /// Wait for the next inbound envelope. Disconnection surfaces as a
    /// `ConnectionFailed` error and aborts the run.
    async fn recv(&self) -> Result<ClientEnvelope, NodeError>;

    async fn send(&self, envelope: ServerEnvelope) -> Result<(), NodeError>;
}

/// Mutable shared state for one flow execution. Exclusively owned by
/// that execution for its lifetime; nodes read and write it through
/// their prepare/finalize phases.
#[derive(Clone)]
pub struct FlowContext {
    pub task_id: String,
    pub conversation_history: Vec<ChatMessage>,
    pub latest_user_message: String,
    pub complaint: String,
    pub status: Status,
    pub fields: ComplaintFields,
    pub final_summary: Option<String>,
    output: Option<OutputChannel>,
    transport: Option<Arc<dyn Duplex>>,
}

impl FlowContext {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            conversation_history: Vec::new(),
            latest_user_message: String::new(),
            complaint: String::new(),
            status: Status::Continue,
            fields: ComplaintFields::default(),
            final_summary: None,
            output: None,
            transport: None,
        }
    }

    /// Context for a task-queue execution, seeded from an inbound task
    /// request. Rejects an empty message list so a misconfigured
    /// request fails at construction rather than mid-flow.
    pub fn seeded(
        task_id: impl Into<String>,
        messages: Vec<ChatMessage>,
        fields: ComplaintFields,
    ) -> Result<Self, NodeError> {
        if messages.is_empty() {
            return Err(NodeError::InvalidInput("task request has no messages".into()));
        }
        let mut ctx = Self::new(task_id);
        for msg in &messages {
            if msg.role == Role::User {
                if ctx.complaint.is_empty() {
                    ctx.complaint = msg.content.clone();
                }
                ctx.latest_user_message = msg.content.clone();
            }
        }
        ctx.conversation_history = messages;
        ctx.fields = fields;
        Ok(ctx)
    }

    pub fn with_output(mut self, output: OutputChannel) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Duplex>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn output(&self) -> Option<OutputChannel> {
        self.output.clone()
    }

    pub fn transport(&self) -> Result<Arc<dyn Duplex>, NodeError> {
        self.transport
            .clone()
            .ok_or_else(|| NodeError::ConnectionFailed("no duplex transport attached".into()))
    }

    pub fn maybe_transport(&self) -> Option<Arc<dyn Duplex>> {
        self.transport.clone()
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        let content = content.into();
        self.latest_user_message = content.clone();
        self.conversation_history.push(ChatMessage::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.conversation_history.push(ChatMessage::assistant(content));
    }
}

impl std::fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowContext")
            .field("task_id", &self.task_id)
            .field("turns", &self.conversation_history.len())
            .field("status", &self.status)
            .field("fields", &self.fields)
            .finish()
    }
}
