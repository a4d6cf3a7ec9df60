//! Response validation and extraction.
//!
//! Handlers run raw resource output through a [`ResponseExtractor`] before
//! returning it to the iQuery layer. Validation failures are handler
//! failures: the retry/fallback machine sees no difference between a broken
//! transport and a response that does not pass muster.

use regex::Regex;
use serde_json::Value;

use super::{HandlerError, ResourceResponse};
use crate::entity::EntitySpec;

/// Validates raw responses and decomposes them into `(value, new_entities)`.
///
/// Structured responses are JSON objects with a `value` key and an optional
/// `new_entities` array of entity specifications. Anything else is treated
/// as a plain-text value with no spawned entities.
#[derive(Debug, Clone, Default)]
pub struct ResponseExtractor {
    required: Option<Regex>,
}

impl ResponseExtractor {
    /// An extractor that accepts any non-empty response.
    pub fn new() -> Self {
        Self::default()
    }

    /// An extractor that additionally requires `pattern` to match the raw text.
    pub fn with_required_pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            required: Some(Regex::new(pattern)?),
        })
    }

    /// Whether `raw` is worth decomposing at all.
    pub fn validate(&self, raw: &str) -> bool {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return false;
        }
        match &self.required {
            Some(pattern) => pattern.is_match(trimmed),
            None => true,
        }
    }

    /// Validates and decomposes `raw` into a [`ResourceResponse`].
    pub fn extract(&self, raw: &str) -> Result<ResourceResponse, HandlerError> {
        if !self.validate(raw) {
            return Err(HandlerError::Rejected(
                "response failed validation".to_string(),
            ));
        }
        let body = strip_code_fence(raw.trim());
        if body.starts_with('{') {
            if let Ok(Value::Object(mut fields)) = serde_json::from_str::<Value>(body) {
                if let Some(value) = fields.remove("value") {
                    let new_entities = match fields.remove("new_entities") {
                        Some(specs) => serde_json::from_value::<Vec<EntitySpec>>(specs).map_err(
                            |e| HandlerError::Rejected(format!("malformed new_entities: {}", e)),
                        )?,
                        None => Vec::new(),
                    };
                    return Ok(ResourceResponse {
                        value,
                        new_entities,
                    });
                }
                return Ok(ResourceResponse::value(Value::Object(fields)));
            }
        }
        Ok(ResourceResponse::value(body.to_string()))
    }
}

/// Peels one markdown code fence off a response, if present. LLMs love
/// fencing JSON they were asked not to fence.
fn strip_code_fence(raw: &str) -> &str {
    let Some(rest) = raw.strip_prefix("```") else {
        return raw;
    };
    let rest = match rest.split_once('\n') {
        Some((_language, body)) => body,
        None => return raw,
    };
    match rest.rsplit_once("```") {
        Some((body, _)) => body.trim(),
        None => raw,
    }
}
