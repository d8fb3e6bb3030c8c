use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Output of one successful generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedContent {
    /// Step output (copy text, image references, layout, ...).
    pub content: JsonValue,

    /// Tokens the provider billed for this call.
    pub token_cost: u64,
}

impl GeneratedContent {
    pub fn new(content: JsonValue, token_cost: u64) -> Self {
        Self { content, token_cost }
    }
}

/// Whether a failed call is worth repeating.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("provider temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("invalid generation input: {0}")]
    InvalidInput(String),

    #[error("request rejected by provider: {0}")]
    Rejected(String),
}

impl GenerationError {
    pub fn class(&self) -> FailureClass {
        match self {
            GenerationError::Timeout(_)
            | GenerationError::RateLimited(_)
            | GenerationError::Unavailable(_) => FailureClass::Transient,
            GenerationError::InvalidInput(_) | GenerationError::Rejected(_) => {
                FailureClass::Permanent
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}
