//! JSON envelopes exchanged with duplex (WebSocket) clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Message { content: String },
    Interrupt,
}

/// Messages sent from server to client, tagged on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Connection {
        message: String,
    },
    MessageReceived {
        content: String,
    },
    Start {
        content: String,
    },
    StreamChunk {
        content: String,
    },
    StreamComplete {
        content: String,
    },
    Metadata {
        #[serde(rename = "complaintTopic")]
        complaint_topic: String,
        #[serde(rename = "complaintMetadata")]
        complaint_metadata: Value,
    },
    Error {
        message: String,
    },
}

impl ServerEnvelope {
    pub fn connection(message: impl Into<String>) -> Self {
        ServerEnvelope::Connection { message: message.into() }
    }

    pub fn ack() -> Self {
        ServerEnvelope::MessageReceived { content: String::new() }
    }

    pub fn start() -> Self {
        ServerEnvelope::Start { content: String::new() }
    }

    pub fn chunk(content: impl Into<String>) -> Self {
        ServerEnvelope::StreamChunk { content: content.into() }
    }

    pub fn complete() -> Self {
        ServerEnvelope::StreamComplete { content: String::new() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEnvelope::Error { message: message.into() }
    }
}
