use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{Duplex, FlowContext};
use crate::envelope::ServerEnvelope;
use crate::stream::OutputChannel;

/// Outcome labels shared by the built-in flows. Any string is a valid
/// label; these are the ones the complaint state machine routes on.
pub mod outcome {
    pub const DEFAULT: &str = "default";
    pub const CONTINUE: &str = "continue";
    pub const COMPLETE: &str = "complete";
    pub const END: &str = "end";
    pub const INTERRUPT: &str = "interrupt";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeError {
    InvalidInput(String),
    ExecutionFailed(String),
    ConnectionFailed(String),
    Internal(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            NodeError::ExecutionFailed(msg) => write!(f, "Processing error: {}", msg),
            NodeError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            NodeError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for NodeError {}

/// What a node's prepare phase hands to its execute phase: a JSON
/// payload plus clones of the context's output sinks, so execute can
/// stream without touching the context itself.
#[derive(Clone, Default)]
pub struct ExecInput {
    pub payload: Value,
    pub output: Option<OutputChannel>,
    pub transport: Option<Arc<dyn Duplex>>,
}

impl ExecInput {
    pub fn new(payload: Value) -> Self {
        Self { payload, output: None, transport: None }
    }

    /// Payload plus the sinks currently attached to `ctx`.
    pub fn from_context(ctx: &FlowContext, payload: Value) -> Self {
        Self {
            payload,
            output: ctx.output(),
            transport: ctx.maybe_transport(),
        }
    }

    pub fn has_sink(&self) -> bool {
        self.output.is_some() || self.transport.is_some()
    }

    /// Push one generated fragment to every attached sink, in
    /// generation order.
    pub async fn emit(&self, text: &str) -> Result<(), NodeError> {
        if let Some(output) = &self.output {
            output.put_fragment(text);
        }
        if let Some(transport) = &self.transport {
            transport.send(ServerEnvelope::chunk(text)).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for ExecInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecInput")
            .field("payload", &self.payload)
            .field("output", &self.output.is_some())
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

/// The atomic unit of work in a flow. Three phases:
///
/// * `prepare` reads the context and assembles the execute input;
/// * `execute` does the work — this is the only phase allowed to call
///   the generation gateway, so gateway failures stay isolated and
///   tests can substitute a fake result without context plumbing;
/// * `finalize` writes results back to the context and returns the
///   outcome label the engine routes on.
///
/// Nodes are immutable once constructed; a flow may reuse an instance
/// only if it is stateless across invocations.
#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    async fn prepare(&self, ctx: &mut FlowContext) -> Result<ExecInput, NodeError>;

    async fn execute(&self, input: &ExecInput) -> Result<Value, NodeError>;

    async fn finalize(
        &self,
        ctx: &mut FlowContext,
        input: ExecInput,
        result: Value,
    ) -> Result<String, NodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamItem;
    use serde_json::json;

    #[test]
    fn test_node_error_display() {
        let err = NodeError::InvalidInput("bad".to_string());
        assert_eq!(format!("{}", err), "Invalid input: bad");
        let err = NodeError::ConnectionFailed("gone".to_string());
        assert_eq!(format!("{}", err), "Connection failed: gone");
    }

    #[tokio::test]
    async fn test_emit_pushes_to_output_channel() {
        let channel = OutputChannel::new();
        let input = ExecInput {
            payload: json!({}),
            output: Some(channel.clone()),
            transport: None,
        };
        input.emit("hello").await.unwrap();
        assert_eq!(channel.get().await, StreamItem::Fragment("hello".into()));
    }

    #[tokio::test]
    async fn test_emit_without_sinks_is_a_no_op() {
        let input = ExecInput::new(json!({"x": 1}));
        assert!(!input.has_sink());
        input.emit("dropped").await.unwrap();
    }
}
