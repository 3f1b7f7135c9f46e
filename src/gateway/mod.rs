//! The generation gateway: one capability interface over the external
//! text-generation backends. Nodes only ever see the [`Gateway`]
//! trait; backend wire formats stay private to their adapter.

pub mod anthropic;
pub mod ollama;

use std::env;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::message::ChatMessage;

pub use anthropic::AnthropicGateway;
pub use ollama::OllamaGateway;

/// Primary credential variable, then the fallback checked when the
/// primary is unset.
pub const PRIMARY_CREDENTIAL: &str = "ANTHROPIC_API_KEY";
pub const SECONDARY_CREDENTIAL: &str = "COMPLAINTFLOW_API_KEY";

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no gateway credential set: set {PRIMARY_CREDENTIAL} or {SECONDARY_CREDENTIAL}")]
    MissingCredential,
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed gateway response: {0}")]
    MalformedResponse(String),
    #[error("gateway backend error: {0}")]
    Backend(String),
}

/// A finite, non-restartable sequence of generated text fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>;

/// The external text-generation capability: one-shot and streaming.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Generate the full completion for a message history.
    async fn generate(&self, history: &[ChatMessage]) -> Result<String, GatewayError>;

    /// Generate lazily, yielding fragments in generation order. The
    /// stream terminates naturally when the model finishes.
    async fn generate_stream(&self, history: &[ChatMessage]) -> Result<FragmentStream, GatewayError>;
}

/// Constructor-level gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub api_key: String,
}

impl GatewayConfig {
    /// Resolve settings from the environment. Credential fallback
    /// order: [`PRIMARY_CREDENTIAL`], then [`SECONDARY_CREDENTIAL`],
    /// else a configuration error — fatal at startup, never retried.
    pub fn from_env() -> Result<Self, GatewayError> {
        let api_key = env::var(PRIMARY_CREDENTIAL)
            .or_else(|_| env::var(SECONDARY_CREDENTIAL))
            .map_err(|_| GatewayError::MissingCredential)?;

        let model =
            env::var("COMPLAINTFLOW_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let max_tokens = env::var("COMPLAINTFLOW_MAX_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_TOKENS);
        let temperature = env::var("COMPLAINTFLOW_TEMPERATURE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TEMPERATURE);

        Ok(Self { model, max_tokens, temperature, api_key })
    }

    pub fn with_key(api_key: impl Into<String>) -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            api_key: api_key.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_key_uses_defaults() {
        let config = GatewayConfig::with_key("k");
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(config.api_key, "k");
    }

    #[test]
    fn test_missing_credential_error_names_both_variables() {
        let msg = GatewayError::MissingCredential.to_string();
        assert!(msg.contains(PRIMARY_CREDENTIAL));
        assert!(msg.contains(SECONDARY_CREDENTIAL));
    }
}
