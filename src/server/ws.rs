//! WebSocket endpoint driving the interactive complaint flow over one
//! duplex connection.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::context::{Duplex, FlowContext};
use crate::envelope::{ClientEnvelope, ServerEnvelope};
use crate::flow::FlowError;
use crate::node::NodeError;
use crate::registry::TaskRegistry;
use crate::server::AppState;

const WELCOME: &str = "Connected to the complaint service.";

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn parse_client_text(text: &str) -> Result<ClientEnvelope, NodeError> {
    serde_json::from_str(text)
        .map_err(|e| NodeError::InvalidInput(format!("malformed envelope: {e}")))
}

/// [`Duplex`] over one WebSocket. Send and receive halves are locked
/// independently so a node can stream outbound while another task
/// waits inbound.
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Arc<Self> {
        let (sink, stream) = socket.split();
        Arc::new(Self { sink: Mutex::new(sink), stream: Mutex::new(stream) })
    }
}

#[async_trait]
impl Duplex for WsTransport {
    async fn recv(&self) -> Result<ClientEnvelope, NodeError> {
        loop {
            let frame = {
                let mut stream = self.stream.lock().await;
                stream.next().await
            };
            match frame {
                Some(Ok(Message::Text(text))) => return parse_client_text(&text),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(NodeError::ConnectionFailed("client closed".into()));
                }
                Some(Ok(_)) => {} // ping/pong/binary
                Some(Err(err)) => {
                    return Err(NodeError::ConnectionFailed(err.to_string()));
                }
            }
        }
    }

    async fn send(&self, envelope: ServerEnvelope) -> Result<(), NodeError> {
        let text = serde_json::to_string(&envelope)
            .map_err(|e| NodeError::Internal(format!("envelope encode: {e}")))?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| NodeError::ConnectionFailed(e.to_string()))
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let transport = WsTransport::new(socket);
    if transport.send(ServerEnvelope::connection(WELCOME)).await.is_err() {
        return;
    }

    // one flow run per complaint; the connection survives across runs
    loop {
        let task_id = TaskRegistry::new_task_id();
        let mut ctx = FlowContext::new(task_id.clone()).with_transport(transport.clone());

        match state.complaint.run(&mut ctx).await {
            Ok(()) => {
                info!(task_id, "conversation finished");
                if ctx.final_summary.is_some() {
                    let fields = serde_json::to_value(&ctx.fields).unwrap_or(Value::Null);
                    let envelope = ServerEnvelope::Metadata {
                        complaint_topic: ctx.fields.complaint_topic.clone().unwrap_or_default(),
                        complaint_metadata: fields,
                    };
                    if transport.send(envelope).await.is_err() {
                        return;
                    }
                }
            }
            Err(FlowError::Node { source: NodeError::ConnectionFailed(reason), .. }) => {
                info!(task_id, %reason, "client disconnected");
                return;
            }
            Err(err) => {
                warn!(task_id, %err, "conversation failed");
                if transport.send(ServerEnvelope::error(err.to_string())).await.is_err() {
                    return;
                }
            }
        }
    }
}
