//! LLM-backed resource handler.
//!
//! Speaks the OpenAI-compatible chat-completions protocol. The handler keeps
//! one shared HTTP client and bounds in-flight requests with a semaphore, so
//! a wide update cycle cannot stampede the provider.

use axum::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use super::{HandlerError, ResourceHandler, ResourceRequest, ResourceResponse, ResponseExtractor};

const MAX_IN_FLIGHT_REQUESTS: usize = 5;
const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4";
const DEFAULT_MAX_TOKENS: u32 = 512;
const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Connection and sampling parameters for an [`LlmHandler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API.
    pub endpoint: String,
    /// Model identifier sent with every request.
    pub model: String,
    /// Bearer token for the API.
    pub api_key: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Completion token cap.
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: String::new(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Resource handler that fills attributes by prompting a language model.
///
/// The prompt comes from the iQuery's `parameters["prompt"]` template,
/// rendered against the entity's attributes; without a template the handler
/// falls back to asking for the target attribute directly.
pub struct LlmHandler {
    name: String,
    config: LlmConfig,
    client: reqwest::Client,
    limiter: Semaphore,
    extractor: ResponseExtractor,
}

impl LlmHandler {
    /// Creates a handler with a fresh HTTP client and the default extractor.
    pub fn new(name: impl Into<String>, config: LlmConfig) -> Self {
        Self {
            name: name.into(),
            config,
            client: reqwest::Client::new(),
            limiter: Semaphore::new(MAX_IN_FLIGHT_REQUESTS),
            extractor: ResponseExtractor::new(),
        }
    }

    /// Replaces the response extractor.
    pub fn with_extractor(mut self, extractor: ResponseExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    fn prompt_for(&self, request: &ResourceRequest) -> String {
        match request.parameters.get("prompt").and_then(Value::as_str) {
            Some(template) => request.render(template),
            None => request.render("Provide {target_attribute} for {entity_id}."),
        }
    }
}

#[async_trait]
impl ResourceHandler for LlmHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &ResourceRequest) -> Result<ResourceResponse, HandlerError> {
        let prompt = self.prompt_for(request);
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| HandlerError::Unavailable("request limiter closed".to_string()))?;

        let url = format!("{}/chat/completions", self.config.endpoint);
        let payload = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HandlerError::Transport(format!(
                "{} returned {}: {}",
                url, status, body
            )));
        }

        let data: Value = response.json().await?;
        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                HandlerError::Rejected("completion carries no message content".to_string())
            })?;
        self.extractor.extract(content)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::entity::Entity;

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: LlmConfig = serde_yml::from_str("model: gpt-4o-mini").unwrap();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn prompt_prefers_the_parameter_template() {
        let handler = LlmHandler::new("llm", LlmConfig::default());
        let mut entity = Entity::new("rust");
        entity.set_attribute("name", json!("Rust"));
        let parameters = json!({"prompt": "Define {name} precisely."});
        let request = ResourceRequest::new(&entity, "definition", &parameters);
        assert_eq!(handler.prompt_for(&request), "Define Rust precisely.");
    }

    #[test]
    fn prompt_falls_back_to_target_attribute() {
        let handler = LlmHandler::new("llm", LlmConfig::default());
        let entity = Entity::new("rust");
        let request = ResourceRequest::new(&entity, "definition", &Value::Null);
        assert_eq!(
            handler.prompt_for(&request),
            "Provide definition for rust."
        );
    }
}
