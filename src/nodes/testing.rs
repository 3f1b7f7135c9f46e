//! Shared test doubles for node and flow tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::context::Duplex;
use crate::envelope::{ClientEnvelope, ServerEnvelope};
use crate::gateway::{FragmentStream, Gateway, GatewayError};
use crate::message::ChatMessage;
use crate::node::NodeError;

/// Gateway returning replies from a fixed script, in order. An
/// exhausted script surfaces as a backend error so a test that makes
/// one call too many fails loudly.
pub struct ScriptedGateway {
    script: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new(script: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().map(String::from).collect()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Total generate calls, one-shot and streaming combined.
    pub fn calls(&self) -> usize {
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
        let fragments: Vec<Result<String, GatewayError>> = reply
            .split_inclusive(' ')
            .map(|word| Ok(word.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(fragments)))
    }
}

/// Duplex transport with a scripted inbound queue and a recorded
/// outbound log. An empty inbound queue behaves like a disconnect.
pub struct MockDuplex {
    inbound: Mutex<VecDeque<ClientEnvelope>>,
    outbound: Mutex<Vec<ServerEnvelope>>,
}

impl MockDuplex {
    pub fn with_inbound(envelopes: Vec<ClientEnvelope>) -> Arc<Self> {
        Arc::new(Self {
            inbound: Mutex::new(envelopes.into()),
            outbound: Mutex::new(Vec::new()),
        })
    }

    pub async fn sent(&self) -> Vec<ServerEnvelope> {
        self.outbound.lock().await.clone()
    }
}

#[async_trait]
impl Duplex for MockDuplex {
    async fn recv(&self) -> Result<ClientEnvelope, NodeError> {
        self.inbound
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| NodeError::ConnectionFailed("client disconnected".into()))
    }

    async fn send(&self, envelope: ServerEnvelope) -> Result<(), NodeError> {
        self.outbound.lock().await.push(envelope);
        Ok(())
    }
}
