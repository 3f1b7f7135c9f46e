//! End-to-end flow runs against scripted gateway and transport doubles.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use complaintflow::context::{ComplaintFields, Duplex, Status};
use complaintflow::envelope::{ClientEnvelope, ServerEnvelope};
use complaintflow::gateway::{FragmentStream, Gateway, GatewayError};
use complaintflow::message::ChatMessage;
use complaintflow::node::NodeError;
use complaintflow::nodes::{complaint_flow, triage_flow};
use complaintflow::topics::StaticTopicStore;
use complaintflow::{FlowContext, OutputChannel, StreamItem};

struct ScriptedGateway {
    script: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl ScriptedGateway {
    fn new(script: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().map(|s| s.to_string()).collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn next_reply(&self) -> Result<String, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| GatewayError::Backend("script exhausted".into()))
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn generate(&self, _history: &[ChatMessage]) -> Result<String, GatewayError> {
        self.next_reply().await
    }

    async fn generate_stream(
        &self,
        _history: &[ChatMessage],
    ) -> Result<FragmentStream, GatewayError> {
        let reply = self.next_reply().await?;
        let fragments: Vec<Result<String, GatewayError>> =
            reply.split_inclusive(' ').map(|w| Ok(w.to_string())).collect();
        Ok(Box::pin(futures::stream::iter(fragments)))
    }
}

struct ScriptedDuplex {
    inbound: Mutex<VecDeque<ClientEnvelope>>,
    outbound: Mutex<Vec<ServerEnvelope>>,
}

impl ScriptedDuplex {
    fn new(messages: &[&str]) -> Arc<Self> {
        let inbound = messages
            .iter()
            .map(|m| ClientEnvelope::Message { content: m.to_string() })
            .collect();
        Arc::new(Self { inbound: Mutex::new(inbound), outbound: Mutex::new(Vec::new()) })
    }

    async fn sent(&self) -> Vec<ServerEnvelope> {
        self.outbound.lock().await.clone()
    }
}

#[async_trait]
impl Duplex for ScriptedDuplex {
    async fn recv(&self) -> Result<ClientEnvelope, NodeError> {
        self.inbound
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| NodeError::ConnectionFailed("script ended".into()))
    }

    async fn send(&self, envelope: ServerEnvelope) -> Result<(), NodeError> {
        self.outbound.lock().await.push(envelope);
        Ok(())
    }
}

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
async fn triage_extracts_everything_and_streams_the_summary() {
    let gateway = ScriptedGateway::new(&[
        r#"{"complaint_topic": "Construction noise", "complaint_location": "Bishan", "complaint_summary": "Night drilling near Bishan flats."}"#,
        "A resident reports drilling at night near their flat in Bishan.",
    ]);
    let flow = triage_flow(gateway.clone(), StaticTopicStore::with_defaults()).unwrap();

    let channel = OutputChannel::new();
    let mut ctx = FlowContext::seeded(
        "task-1",
        vec![
            ChatMessage::user("there is drilling at night near my flat"),
            ChatMessage::assistant("where is the flat?"),
            ChatMessage::user("Bishan"),
        ],
        ComplaintFields::default(),
    )
    .unwrap()
    .with_output(channel.clone());

    flow.run(&mut ctx).await.unwrap();
    channel.put(StreamItem::Done);

    assert_eq!(ctx.status, Status::Complete);
    assert!(ctx.fields.is_complete());
    assert_eq!(ctx.fields.complaint_location.as_deref(), Some("Bishan"));
    assert_eq!(
        ctx.final_summary.as_deref(),
        Some("A resident reports drilling at night near their flat in Bishan.")
    );
    assert_eq!(
        drain(&channel).await,
        "A resident reports drilling at night near their flat in Bishan."
    );
    // extraction plus one streamed summary
    assert_eq!(gateway.calls(), 2);
}

#[tokio::test]
async fn triage_with_missing_fields_asks_a_follow_up_instead() {
    let gateway = ScriptedGateway::new(&[
        r#"{"complaint_topic": "Construction noise", "complaint_location": null, "complaint_summary": null}"#,
        "Where exactly is the construction happening?",
    ]);
    let flow = triage_flow(gateway.clone(), StaticTopicStore::with_defaults()).unwrap();

    let channel = OutputChannel::new();
    let mut ctx = FlowContext::seeded(
        "task-2",
        vec![ChatMessage::user("it is very noisy here")],
        ComplaintFields::default(),
    )
    .unwrap()
    .with_output(channel.clone());

    flow.run(&mut ctx).await.unwrap();
    channel.put(StreamItem::Done);

    assert_eq!(ctx.status, Status::Continue);
    assert!(ctx.final_summary.is_none());
    assert_eq!(ctx.fields.complaint_topic.as_deref(), Some("Construction noise"));
    assert_eq!(drain(&channel).await, "Where exactly is the construction happening?");
    assert_eq!(
        ctx.conversation_history.last().unwrap().content,
        "Where exactly is the construction happening?"
    );
}

#[tokio::test]
async fn complaint_flow_runs_one_full_conversation_round() {
    let gateway = ScriptedGateway::new(&[
        "Where is the noise coming from?",
        "complete",
        "A resident reports construction noise from the site next door.",
    ]);
    let flow = complaint_flow(gateway.clone()).unwrap();

    let transport = ScriptedDuplex::new(&[
        "construction noise next door",
        "it comes from the site next door, every night",
    ]);
    let mut ctx = FlowContext::new("task-3").with_transport(transport.clone());

    flow.run(&mut ctx).await.unwrap();

    assert_eq!(ctx.status, Status::Complete);
    assert_eq!(ctx.complaint, "construction noise next door");
    assert_eq!(
        ctx.final_summary.as_deref(),
        Some("A resident reports construction noise from the site next door.")
    );

    let sent = transport.sent().await;
    // two inbound messages, two acks
    let acks = sent.iter().filter(|e| **e == ServerEnvelope::ack()).count();
    assert_eq!(acks, 2);
    // both generations were framed and streamed
    let starts = sent.iter().filter(|e| matches!(e, ServerEnvelope::Start { .. })).count();
    let completes =
        sent.iter().filter(|e| matches!(e, ServerEnvelope::StreamComplete { .. })).count();
    assert_eq!(starts, 2);
    assert_eq!(completes, 2);

    let streamed: String = sent
        .iter()
        .filter_map(|e| match e {
            ServerEnvelope::StreamChunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert!(streamed.starts_with("Where is the noise coming from?"));
    assert!(streamed.ends_with("A resident reports construction noise from the site next door."));
    assert_eq!(gateway.calls(), 3);
}

#[tokio::test]
async fn complaint_flow_disconnect_surfaces_as_connection_failure() {
    let gateway = ScriptedGateway::new(&["Where is it?"]);
    let flow = complaint_flow(gateway).unwrap();

    // the client goes away after the opening message
    let transport = ScriptedDuplex::new(&["noise"]);
    let mut ctx = FlowContext::new("task-4").with_transport(transport);

    let err = flow.run(&mut ctx).await.unwrap_err();
    assert!(matches!(
        err,
        complaintflow::FlowError::Node { source: NodeError::ConnectionFailed(_), .. }
    ));
    // the opening message was still recorded before the failure
    assert_eq!(ctx.complaint, "noise");
}
