//! Nodes of the complaint conversation state machine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, instrument};

use crate::context::{FlowContext, Status};
use crate::envelope::{ClientEnvelope, ServerEnvelope};
use crate::gateway::Gateway;
use crate::message::{ChatMessage, render_history};
use crate::node::{ExecInput, Node, NodeError, outcome};

fn gateway_err(e: crate::gateway::GatewayError) -> NodeError {
    NodeError::ExecutionFailed(format!("gateway: {e}"))
}

/// One-shot or streamed generation for a single-prompt call. When the
/// input carries a sink, fragments are pushed as they arrive (with
/// `start`/`stream_complete` framing on a duplex transport) and the
/// accumulated text is returned; otherwise a plain one-shot call.
async fn generate_text(
    gateway: &dyn Gateway,
    input: &ExecInput,
    prompt: String,
) -> Result<String, NodeError> {
    use futures_util::StreamExt;

    let history = vec![ChatMessage::user(prompt)];
    if !input.has_sink() {
        return gateway.generate(&history).await.map_err(gateway_err);
    }

    if let Some(transport) = &input.transport {
        transport.send(ServerEnvelope::start()).await?;
    }

    let mut stream = gateway.generate_stream(&history).await.map_err(gateway_err)?;
    let mut full = String::new();
    while let Some(fragment) = stream.next().await {
        let fragment = fragment.map_err(gateway_err)?;
        full.push_str(&fragment);
        input.emit(&fragment).await?;
    }

    if let Some(transport) = &input.transport {
        transport.send(ServerEnvelope::complete()).await?;
    }
    Ok(full)
}

/// Await one inbound envelope and acknowledge it.
async fn receive_and_ack(ctx: &FlowContext) -> Result<Value, NodeError> {
    let transport = ctx.transport()?;
    let envelope = transport.recv().await?;
    transport.send(ServerEnvelope::ack()).await?;
    serde_json::to_value(&envelope)
        .map_err(|e| NodeError::Internal(format!("envelope encode: {e}")))
}

fn parse_envelope(value: &Value) -> Result<ClientEnvelope, NodeError> {
    serde_json::from_value(value.clone())
        .map_err(|e| NodeError::InvalidInput(format!("envelope decode: {e}")))
}

/// Initial node of the duplex flow: takes the citizen's opening
/// message, resets the extracted fields and starts a fresh history.
pub struct ReceiveComplaintNode;

#[async_trait]
impl Node for ReceiveComplaintNode {
    fn name(&self) -> &str {
        "receive_complaint"
    }

    async fn prepare(&self, ctx: &mut FlowContext) -> Result<ExecInput, NodeError> {
        let payload = receive_and_ack(ctx).await?;
        Ok(ExecInput::from_context(ctx, payload))
    }

    async fn execute(&self, input: &ExecInput) -> Result<Value, NodeError> {
        // passthrough of the inbound message
        parse_envelope(&input.payload)?;
        Ok(input.payload.clone())
    }

    async fn finalize(
        &self,
        ctx: &mut FlowContext,
        _input: ExecInput,
        result: Value,
    ) -> Result<String, NodeError> {
        match parse_envelope(&result)? {
            ClientEnvelope::Message { content } => {
                ctx.complaint = content.clone();
                ctx.push_user(content);
                ctx.fields.reset();
                ctx.status = Status::Continue;
                Ok(outcome::DEFAULT.into())
            }
            ClientEnvelope::Interrupt => Ok(outcome::INTERRUPT.into()),
        }
    }
}

/// Asks the gateway for the next clarifying question.
pub struct GenerateFollowUpNode {
    gateway: Arc<dyn Gateway>,
}

impl GenerateFollowUpNode {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Node for GenerateFollowUpNode {
    fn name(&self) -> &str {
        "generate_follow_up"
    }

    async fn prepare(&self, ctx: &mut FlowContext) -> Result<ExecInput, NodeError> {
        let payload = json!({
            "complaint": ctx.complaint,
            "history": render_history(&ctx.conversation_history),
        });
        Ok(ExecInput::from_context(ctx, payload))
    }

    #[instrument(name = "generate_follow_up", skip(self, input))]
    async fn execute(&self, input: &ExecInput) -> Result<Value, NodeError> {
        let complaint = input.payload["complaint"].as_str().unwrap_or_default();
        let history = input.payload["history"].as_str().unwrap_or_default();
        let prompt = format!(
            "Complaint: {complaint}\n\
             Follow-up Q&A so far:\n{history}\n\
             Suggest the next clarifying question to better understand this complaint.\n\
             Only output the question.\n"
        );
        let question = generate_text(self.gateway.as_ref(), input, prompt).await?;
        Ok(json!({ "question": question }))
    }

    async fn finalize(
        &self,
        ctx: &mut FlowContext,
        _input: ExecInput,
        result: Value,
    ) -> Result<String, NodeError> {
        let question = result["question"]
            .as_str()
            .ok_or_else(|| NodeError::Internal("follow-up result missing question".into()))?;
        ctx.push_assistant(question);
        Ok(outcome::DEFAULT.into())
    }
}

/// Blocks for the citizen's next answer on the duplex transport.
pub struct AwaitAnswerNode;

#[async_trait]
impl Node for AwaitAnswerNode {
    fn name(&self) -> &str {
        "await_answer"
    }

    async fn prepare(&self, ctx: &mut FlowContext) -> Result<ExecInput, NodeError> {
        let payload = receive_and_ack(ctx).await?;
        Ok(ExecInput::from_context(ctx, payload))
    }

    async fn execute(&self, input: &ExecInput) -> Result<Value, NodeError> {
        parse_envelope(&input.payload)?;
        Ok(input.payload.clone())
    }

    async fn finalize(
        &self,
        ctx: &mut FlowContext,
        _input: ExecInput,
        result: Value,
    ) -> Result<String, NodeError> {
        match parse_envelope(&result)? {
            ClientEnvelope::Message { content } => {
                ctx.push_user(content);
                Ok(outcome::DEFAULT.into())
            }
            ClientEnvelope::Interrupt => Ok(outcome::INTERRUPT.into()),
        }
    }
}

/// Asks the gateway whether the conversation is sufficient. The reply
/// itself becomes the outcome label: anything that is not exactly
/// `complete` (case-insensitive) routes to `continue`, failing open
/// toward more conversation.
pub struct DecideNode {
    gateway: Arc<dyn Gateway>,
}

impl DecideNode {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Node for DecideNode {
    fn name(&self) -> &str {
        "decide"
    }

    async fn prepare(&self, ctx: &mut FlowContext) -> Result<ExecInput, NodeError> {
        let payload = json!({
            "last_message": ctx.latest_user_message,
            "history": render_history(&ctx.conversation_history),
        });
        Ok(ExecInput::from_context(ctx, payload))
    }

    #[instrument(name = "decide", skip(self, input))]
    async fn execute(&self, input: &ExecInput) -> Result<Value, NodeError> {
        let last = input.payload["last_message"].as_str().unwrap_or_default();
        let history = input.payload["history"].as_str().unwrap_or_default();
        let prompt = format!(
            "Last message: {last}\n\
             Conversation history:\n{history}\n\
             Is this enough to understand and process the complaint?\n\
             Respond with one word: \"complete\" or \"continue\".\n"
        );
        let verdict = self
            .gateway
            .generate(&[ChatMessage::user(prompt)])
            .await
            .map_err(gateway_err)?;
        Ok(json!({ "verdict": verdict }))
    }

    async fn finalize(
        &self,
        ctx: &mut FlowContext,
        _input: ExecInput,
        result: Value,
    ) -> Result<String, NodeError> {
        let verdict = result["verdict"].as_str().unwrap_or_default().trim().to_lowercase();
        debug!(%verdict, "sufficiency verdict");
        if verdict == outcome::COMPLETE {
            ctx.status = Status::Complete;
            Ok(outcome::COMPLETE.into())
        } else {
            ctx.status = Status::Continue;
            Ok(outcome::CONTINUE.into())
        }
    }
}

/// Produces the one-paragraph complaint summary, streamed to any
/// attached sink. Terminal: no outgoing edge is registered for it.
pub struct SummarizeNode {
    gateway: Arc<dyn Gateway>,
}

impl SummarizeNode {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Node for SummarizeNode {
    fn name(&self) -> &str {
        "summarize"
    }

    async fn prepare(&self, ctx: &mut FlowContext) -> Result<ExecInput, NodeError> {
        let payload = json!({
            "complaint": ctx.complaint,
            "history": render_history(&ctx.conversation_history),
        });
        Ok(ExecInput::from_context(ctx, payload))
    }

    #[instrument(name = "summarize", skip(self, input))]
    async fn execute(&self, input: &ExecInput) -> Result<Value, NodeError> {
        let complaint = input.payload["complaint"].as_str().unwrap_or_default();
        let history = input.payload["history"].as_str().unwrap_or_default();
        let prompt = format!(
            "You are summarizing a citizen complaint for processing by a government agency.\n\n\
             Original complaint:\n{complaint}\n\n\
             Conversation history:\n{history}\n\
             Write a short, clear summary of the complaint as a single paragraph.\n"
        );
        let summary = generate_text(self.gateway.as_ref(), input, prompt).await?;
        Ok(json!({ "summary": summary }))
    }

    async fn finalize(
        &self,
        ctx: &mut FlowContext,
        _input: ExecInput,
        result: Value,
    ) -> Result<String, NodeError> {
        let summary = result["summary"]
            .as_str()
            .ok_or_else(|| NodeError::Internal("summarize result missing summary".into()))?
            .to_string();
        if ctx.fields.complaint_summary.is_none() {
            ctx.fields.complaint_summary = Some(summary.clone());
        }
        ctx.final_summary = Some(summary);
        ctx.status = Status::Complete;
        Ok(outcome::DEFAULT.into())
    }
}

/// Word-by-word pacing delay for the reject message.
const REJECT_PACING: Duration = Duration::from_millis(40);

const REJECT_MESSAGE: &str =
    "This complaint has already been processed and no further input is expected. \
     Please open a new complaint if something else needs attention.";

/// Fixed response for a task that was already finalized. Presentation
/// only: the message is delivered word by word with a small delay.
pub struct RejectNode;

#[async_trait]
impl Node for RejectNode {
    fn name(&self) -> &str {
        "reject"
    }

    async fn prepare(&self, ctx: &mut FlowContext) -> Result<ExecInput, NodeError> {
        Ok(ExecInput::from_context(ctx, json!({})))
    }

    async fn execute(&self, input: &ExecInput) -> Result<Value, NodeError> {
        let mut words = REJECT_MESSAGE.split_whitespace().peekable();
        while let Some(word) = words.next() {
            let fragment = if words.peek().is_some() {
                format!("{word} ")
            } else {
                word.to_string()
            };
            input.emit(&fragment).await?;
            sleep(REJECT_PACING).await;
        }
        Ok(json!({ "message": REJECT_MESSAGE }))
    }

    async fn finalize(
        &self,
        ctx: &mut FlowContext,
        _input: ExecInput,
        _result: Value,
    ) -> Result<String, NodeError> {
        ctx.status = Status::Complete;
        Ok(outcome::DEFAULT.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowBuilder;
    use crate::nodes::testing::{MockDuplex, ScriptedGateway};
    use crate::stream::{OutputChannel, StreamItem};

    async fn drain(channel: &OutputChannel) -> String {
        let mut out = String::new();
        loop {
            match channel.get().await {
                StreamItem::Fragment(text) => out.push_str(&text),
                StreamItem::Done => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn test_receive_appends_user_turn_and_resets_fields() {
        let transport = MockDuplex::with_inbound(vec![ClientEnvelope::Message {
            content: "noisy construction".into(),
        }]);
        let mut ctx = FlowContext::new("t").with_transport(transport.clone());
        ctx.fields.complaint_topic = Some("stale".into());

        let node = ReceiveComplaintNode;
        let input = node.prepare(&mut ctx).await.unwrap();
        let result = node.execute(&input).await.unwrap();
        let label = node.finalize(&mut ctx, input, result).await.unwrap();

        assert_eq!(label, outcome::DEFAULT);
        assert_eq!(ctx.complaint, "noisy construction");
        assert_eq!(ctx.latest_user_message, "noisy construction");
        assert_eq!(ctx.fields.complaint_topic, None);
        // the transport got an acknowledgment
        assert_eq!(transport.sent().await, vec![ServerEnvelope::ack()]);
    }

    #[tokio::test]
    async fn test_interrupt_terminates_the_flow() {
        let transport = MockDuplex::with_inbound(vec![ClientEnvelope::Interrupt]);
        let mut ctx = FlowContext::new("t").with_transport(transport);

        let node = AwaitAnswerNode;
        let input = node.prepare(&mut ctx).await.unwrap();
        let result = node.execute(&input).await.unwrap();
        let label = node.finalize(&mut ctx, input, result).await.unwrap();
        // no edge is ever registered for this label
        assert_eq!(label, outcome::INTERRUPT);
        assert!(ctx.conversation_history.is_empty());
    }

    #[tokio::test]
    async fn test_decide_complete_routes_to_summarize_not_generate() {
        let gateway = ScriptedGateway::new(vec![
            "complete",
            "The resident reports ongoing noisy construction.",
        ]);

        let mut builder = FlowBuilder::new();
        let decide = builder.node(Arc::new(DecideNode::new(gateway.clone())));
        let generate = builder.node(Arc::new(GenerateFollowUpNode::new(gateway.clone())));
        let summarize = builder.node(Arc::new(SummarizeNode::new(gateway.clone())));
        builder.start(decide);
        builder.edge(decide, outcome::CONTINUE, generate);
        builder.edge(decide, outcome::COMPLETE, summarize);
        let flow = builder.build().unwrap();

        let mut ctx = FlowContext::new("t");
        ctx.push_user("noisy construction");
        flow.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.status, Status::Complete);
        assert_eq!(
            ctx.final_summary.as_deref(),
            Some("The resident reports ongoing noisy construction.")
        );
        // the generate node never ran: only decide + summarize calls
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn test_decide_off_vocabulary_reply_fails_open_to_continue() {
        let gateway = ScriptedGateway::new(vec!["Maybe? I'd ask more."]);
        let node = DecideNode::new(gateway);
        let mut ctx = FlowContext::new("t");
        ctx.push_user("something vague");

        let input = node.prepare(&mut ctx).await.unwrap();
        let result = node.execute(&input).await.unwrap();
        let label = node.finalize(&mut ctx, input, result).await.unwrap();
        assert_eq!(label, outcome::CONTINUE);
        assert_eq!(ctx.status, Status::Continue);
    }

    #[tokio::test]
    async fn test_decide_is_case_insensitive() {
        let gateway = ScriptedGateway::new(vec![" Complete \n"]);
        let node = DecideNode::new(gateway);
        let mut ctx = FlowContext::new("t");
        ctx.push_user("done");

        let input = node.prepare(&mut ctx).await.unwrap();
        let result = node.execute(&input).await.unwrap();
        let label = node.finalize(&mut ctx, input, result).await.unwrap();
        assert_eq!(label, outcome::COMPLETE);
    }

    #[tokio::test]
    async fn test_generate_follow_up_streams_to_output_channel() {
        let gateway = ScriptedGateway::new(vec!["Where exactly is the construction site?"]);
        let channel = OutputChannel::new();
        let mut ctx = FlowContext::new("t").with_output(channel.clone());
        ctx.complaint = "noisy construction".into();
        ctx.push_user("noisy construction");

        let node = GenerateFollowUpNode::new(gateway);
        let input = node.prepare(&mut ctx).await.unwrap();
        let result = node.execute(&input).await.unwrap();
        let label = node.finalize(&mut ctx, input, result).await.unwrap();
        assert_eq!(label, outcome::DEFAULT);

        channel.put(StreamItem::Done);
        assert_eq!(drain(&channel).await, "Where exactly is the construction site?");
        assert_eq!(
            ctx.conversation_history.last().unwrap().content,
            "Where exactly is the construction site?"
        );
    }

    #[tokio::test]
    async fn test_summarize_frames_the_stream_on_a_duplex_transport() {
        let gateway = ScriptedGateway::new(vec!["A short summary."]);
        let transport = MockDuplex::with_inbound(vec![]);
        let mut ctx = FlowContext::new("t").with_transport(transport.clone());
        ctx.complaint = "noisy construction".into();

        let node = SummarizeNode::new(gateway);
        let input = node.prepare(&mut ctx).await.unwrap();
        let result = node.execute(&input).await.unwrap();
        node.finalize(&mut ctx, input, result).await.unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.first(), Some(&ServerEnvelope::start()));
        assert_eq!(sent.last(), Some(&ServerEnvelope::complete()));
        assert!(sent.iter().any(|e| matches!(e, ServerEnvelope::StreamChunk { .. })));
        assert_eq!(ctx.final_summary.as_deref(), Some("A short summary."));
        assert_eq!(ctx.fields.complaint_summary.as_deref(), Some("A short summary."));
    }

    #[tokio::test]
    async fn test_reject_paces_the_fixed_message_word_by_word() {
        let channel = OutputChannel::new();
        let mut ctx = FlowContext::new("t").with_output(channel.clone());

        let node = RejectNode;
        let input = node.prepare(&mut ctx).await.unwrap();
        let result = node.execute(&input).await.unwrap();
        let label = node.finalize(&mut ctx, input, result).await.unwrap();
        assert_eq!(label, outcome::DEFAULT);
        assert_eq!(ctx.status, Status::Complete);

        channel.put(StreamItem::Done);
        assert_eq!(drain(&channel).await, REJECT_MESSAGE);
    }

    #[tokio::test]
    async fn test_gateway_failure_aborts_execute_phase() {
        let gateway = ScriptedGateway::new(vec![]);
        let node = DecideNode::new(gateway);
        let mut ctx = FlowContext::new("t");
        ctx.push_user("hi");

        let input = node.prepare(&mut ctx).await.unwrap();
        let err = node.execute(&input).await.unwrap_err();
        assert!(matches!(err, NodeError::ExecutionFailed(_)));
    }
}
