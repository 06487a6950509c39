//! Adapter interfaces for external capabilities.
//!
//! The orchestrator never talks to a model or a search index directly;
//! it goes through these two traits. Identity is passed explicitly on
//! every call.

pub mod command;
pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Identity, TokenUsage};
use crate::errors::{GenerationError, RetrievalError};

pub use command::CommandGenerator;
pub use http::{HttpGenerator, HttpRetriever};

/// Per-call generation options
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,

    /// Upper bound for this single call
    #[serde(skip)]
    pub timeout: Duration,

    pub identity: Identity,
}

impl GenerationOptions {
    pub fn new(identity: Identity, timeout: Duration) -> Self {
        Self {
            model: None,
            max_tokens: None,
            temperature: None,
            timeout,
            identity,
        }
    }
}

/// Text returned by a generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub text: String,

    /// Token usage if the backend reports it
    pub usage: Option<TokenUsage>,
}

impl GenerationOutput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// The external text-generation capability (prompt -> text)
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationOutput, GenerationError>;
}

/// A ranked supporting passage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub source_id: String,
    pub relevance_score: f64,
}

/// Where a retrieval query may look
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalScope {
    pub identity: Identity,
    pub limit: usize,
}

/// The external retrieval capability (query -> ranked passages)
#[async_trait]
pub trait RetrievalClient: Send + Sync {
    fn name(&self) -> &str;

    async fn retrieve(
        &self,
        query: &str,
        scope: &RetrievalScope,
    ) -> Result<Vec<Passage>, RetrievalError>;
}

/// Rough token estimate for backends that do not report usage
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
