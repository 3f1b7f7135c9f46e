//! Structured-field extraction from a seeded conversation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::context::{ComplaintFields, FlowContext};
use crate::gateway::Gateway;
use crate::message::{ChatMessage, render_history};
use crate::node::{ExecInput, Node, NodeError, outcome};
use crate::topics::TopicStore;

/// Pull the JSON object out of a gateway reply. Models wrap their
/// output in code fences or prose often enough that we cut from the
/// first `{` to the last `}` before parsing.
fn parse_extraction(reply: &str) -> Option<ComplaintFields> {
    let trimmed = reply.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// Extracts `complaint_topic`, `complaint_location` and
/// `complaint_summary` from the conversation so far, asking the
/// gateway only for the fields still missing. Classification is
/// constrained to the topic store's vocabulary.
pub struct ExtractDataNode {
    gateway: Arc<dyn Gateway>,
    topics: Arc<dyn TopicStore>,
}

impl ExtractDataNode {
    pub fn new(gateway: Arc<dyn Gateway>, topics: Arc<dyn TopicStore>) -> Self {
        Self { gateway, topics }
    }

    fn prompt(&self, history: &str, missing: &[&str], topics: &[String]) -> String {
        format!(
            "Extract the following fields from this citizen complaint conversation.\n\n\
             Conversation:\n{history}\n\
             Fields to extract: {fields}\n\
             For complaint_topic, choose the single best match from this list:\n{topics}\n\n\
             Respond with only a JSON object containing the requested fields. \
             Use null for any field the conversation does not answer.\n",
            fields = missing.join(", "),
            topics = topics.join("\n"),
        )
    }
}

#[async_trait]
impl Node for ExtractDataNode {
    fn name(&self) -> &str {
        "extract_data"
    }

    async fn prepare(&self, ctx: &mut FlowContext) -> Result<ExecInput, NodeError> {
        let fields = serde_json::to_value(&ctx.fields)
            .map_err(|e| NodeError::Internal(format!("fields encode: {e}")))?;
        let payload = json!({
            "fields": fields,
            "history": render_history(&ctx.conversation_history),
        });
        Ok(ExecInput::from_context(ctx, payload))
    }

    #[instrument(name = "extract_data", skip(self, input))]
    async fn execute(&self, input: &ExecInput) -> Result<Value, NodeError> {
        let fields: ComplaintFields = serde_json::from_value(input.payload["fields"].clone())
            .map_err(|e| NodeError::InvalidInput(format!("fields decode: {e}")))?;

        let missing = fields.missing();
        if missing.is_empty() {
            // nothing left to ask for, skip the gateway round-trip
            return Ok(json!({ "skipped": true }));
        }

        let topics: Vec<String> =
            self.topics.list_topics().await.into_iter().map(|t| t.topic).collect();
        let history = input.payload["history"].as_str().unwrap_or_default();
        let prompt = self.prompt(history, &missing, &topics);

        let reply = self
            .gateway
            .generate(&[ChatMessage::user(prompt)])
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("gateway: {e}")))?;

        match parse_extraction(&reply) {
            Some(parsed) => Ok(json!({ "parsed": parsed })),
            None => {
                warn!(reply_len = reply.len(), "extraction reply was not parseable JSON");
                Ok(json!({ "parsed": null }))
            }
        }
    }

    async fn finalize(
        &self,
        ctx: &mut FlowContext,
        _input: ExecInput,
        result: Value,
    ) -> Result<String, NodeError> {
        if result["skipped"].as_bool() == Some(true) {
            return Ok(outcome::END.into());
        }

        if result["parsed"].is_null() {
            // keep the conversation going, a later turn may extract more
            return Ok(outcome::CONTINUE.into());
        }

        let parsed: ComplaintFields = serde_json::from_value(result["parsed"].clone())
            .map_err(|e| NodeError::Internal(format!("parsed fields decode: {e}")))?;
        ctx.fields.merge(&parsed);
        debug!(missing = ?ctx.fields.missing(), "fields after merge");

        if ctx.fields.is_complete() {
            Ok(outcome::END.into())
        } else {
            Ok(outcome::CONTINUE.into())
        }
    }
}
