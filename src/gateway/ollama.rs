//! Ollama adapter: drives a local (or remote) Ollama server through
//! the `ollama_rs` client library. If `OLLAMA_URL` is set another
//! server is used.

use async_trait::async_trait;
use futures_util::StreamExt;
use ollama_rs::Ollama;
use ollama_rs::generation::chat::{ChatMessage as OllamaChatMessage, request::ChatMessageRequest};
use url::Url;

use crate::gateway::{FragmentStream, Gateway, GatewayError};
use crate::message::{ChatMessage, Role};

const DEFAULT_MODEL: &str = "llama3:latest";

pub struct OllamaGateway {
    model: String,
    url: Option<Url>,
}

impl OllamaGateway {
    pub fn new(model: impl Into<String>, url: Option<Url>) -> Self {
        Self { model: model.into(), url }
    }

    pub fn from_env() -> Self {
        let model =
            std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let url = std::env::var("OLLAMA_URL").ok().and_then(|s| Url::parse(&s).ok());
        Self::new(model, url)
    }

    fn build_client(&self) -> Ollama {
        match &self.url {
            // only honour an override with an explicit port; otherwise
            // the default constructor already points at localhost:11434
            Some(url) => match url.port() {
                Some(port) => Ollama::new(url.clone(), port),
                None => Ollama::default(),
            },
            None => Ollama::default(),
        }
    }

    fn request(&self, history: &[ChatMessage]) -> ChatMessageRequest {
        let messages = history
            .iter()
            .map(|m| match m.role {
                Role::System => OllamaChatMessage::system(m.content.clone()),
                Role::User => OllamaChatMessage::user(m.content.clone()),
                Role::Assistant => OllamaChatMessage::assistant(m.content.clone()),
            })
            .collect();
        ChatMessageRequest::new(self.model.clone(), messages)
    }
}

#[async_trait]
impl Gateway for OllamaGateway {
    async fn generate(&self, history: &[ChatMessage]) -> Result<String, GatewayError> {
        let client = self.build_client();
        let response = client
            .send_chat_messages(self.request(history))
            .await
            .map_err(|e| GatewayError::Backend(format!("ollama chat: {e}")))?;
        Ok(response.message.content)
    }

    async fn generate_stream(&self, history: &[ChatMessage]) -> Result<FragmentStream, GatewayError> {
        let client = self.build_client();
        let stream = client
            .send_chat_messages_stream(self.request(history))
            .await
            .map_err(|e| GatewayError::Backend(format!("ollama chat stream: {e}")))?;

        let fragments = stream
            .map(|item| match item {
                Ok(response) => Ok(response.message.content),
                Err(e) => Err(GatewayError::Backend(format!("ollama chat stream: {e:?}"))),
            })
            .filter(|item| {
                futures::future::ready(!matches!(item, Ok(text) if text.is_empty()))
            });
        Ok(Box::pin(fragments))
    }
}
