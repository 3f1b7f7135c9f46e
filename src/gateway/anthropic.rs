//! Anthropic Messages API adapter: raw HTTP via reqwest. Streaming
//! responses arrive as server-sent events; the chunk buffering and
//! line splitting live here and nowhere else.

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use crate::gateway::{FragmentStream, Gateway, GatewayConfig, GatewayError};
use crate::message::{ChatMessage, Role};

use async_trait::async_trait;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicGateway {
    client: reqwest::Client,
    config: GatewayConfig,
    base_url: Url,
}

impl AnthropicGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        Self::with_base_url(config, Url::parse(DEFAULT_BASE_URL).expect("static url"))
    }

    pub fn with_base_url(config: GatewayConfig, base_url: Url) -> Result<Self, GatewayError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.api_key)
            .map_err(|_| GatewayError::Backend("api key is not a valid header value".into()))?;
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(120))
            .build()?;

        Ok(Self { client, config, base_url })
    }

    fn messages_url(&self) -> Url {
        self.base_url.join("/v1/messages").expect("valid messages path")
    }

    fn request_body(&self, history: &[ChatMessage], stream: bool) -> Value {
        // the Messages API takes system turns out of band
        let system: Vec<&str> = history
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let messages: Vec<Value> = history
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n"));
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }
}

/// One parsed server-sent event line that the adapter cares about.
#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(String),
    Stop,
    Error(String),
}

/// Parse one SSE line. Non-data lines and event types the adapter does
/// not route on yield `None`.
fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data: ")?;
    let event: Value = serde_json::from_str(data).ok()?;
    match event["type"].as_str() {
        Some("content_block_delta") => {
            let text = event["delta"]["text"].as_str()?;
            if text.is_empty() {
                None
            } else {
                Some(SseEvent::Delta(text.to_string()))
            }
        }
        Some("message_stop") => Some(SseEvent::Stop),
        Some("error") => Some(SseEvent::Error(
            event["error"]["message"].as_str().unwrap_or("unknown error").to_string(),
        )),
        _ => None,
    }
}

#[async_trait]
impl Gateway for AnthropicGateway {
    async fn generate(&self, history: &[ChatMessage]) -> Result<String, GatewayError> {
        let response = self
            .client
            .post(self.messages_url())
            .json(&self.request_body(history, false))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Backend(format!("{status}: {body}")));
        }

        let body: Value = response.json().await?;
        body["content"][0]["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                GatewayError::MalformedResponse("response has no content[0].text".into())
            })
    }

    async fn generate_stream(&self, history: &[ChatMessage]) -> Result<FragmentStream, GatewayError> {
        let response = self
            .client
            .post(self.messages_url())
            .json(&self.request_body(history, true))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Backend(format!("{status}: {body}")));
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut buf = String::new();
            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Err(GatewayError::Http(err));
                        break 'outer;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find('\n') {
                    let line: String = buf.drain(..=pos).collect();
                    match parse_sse_line(line.trim_end()) {
                        Some(SseEvent::Delta(text)) => yield Ok(text),
                        Some(SseEvent::Stop) => {
                            debug!("stream finished");
                            break 'outer;
                        }
                        Some(SseEvent::Error(message)) => {
                            yield Err(GatewayError::Backend(message));
                            break 'outer;
                        }
                        None => {}
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
