//! Error taxonomy for pipeline execution and checkpoint actions.
//!
//! Plumbing (stores, event log, config) uses `anyhow`; anything a caller
//! is expected to match on is a variant here.

use thiserror::Error;

use crate::domain::{ActionKind, StageId};

/// Errors surfaced by the orchestrator to its callers
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Request rejected before any stage ran
    #[error("invalid request: {0}")]
    RequestValidation(#[from] ValidationError),

    /// A stage could not produce valid output after exhausting retries
    #[error("stage '{stage}' failed after {attempts} attempt(s): {reason}")]
    StageFailure {
        stage: StageId,
        reason: String,
        attempts: u32,
    },

    #[error("checkpoint session not found: {0}")]
    SessionNotFound(String),

    #[error("checkpoint session expired: {0}")]
    SessionExpired(String),

    #[error("action '{action}' is not valid here: {reason}")]
    InvalidAction { action: ActionKind, reason: String },

    /// Another caller consumed the session first
    #[error("checkpoint session {0} was consumed by a concurrent action")]
    ConcurrencyConflict(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(uuid::Uuid),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    /// Checkpoint-action misuse (returned synchronously from `resume`)
    pub fn is_action_error(&self) -> bool {
        matches!(
            self,
            PipelineError::SessionNotFound(_)
                | PipelineError::SessionExpired(_)
                | PipelineError::InvalidAction { .. }
                | PipelineError::ConcurrencyConflict(_)
        )
    }
}

/// Reasons a content request is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("field '{field}' is too long ({actual} > {limit} characters)")]
    TooLong {
        field: &'static str,
        actual: usize,
        limit: usize,
    },

    #[error("target word count {0} is out of range (100..=20000)")]
    WordCountOutOfRange(u32),

    #[error("too many keywords ({actual} > {limit})")]
    TooManyKeywords { actual: usize, limit: usize },
}

/// Failure of the external text-generation capability
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("generation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("generation quota exceeded: {0}")]
    Quota(String),

    #[error("generation authentication failed: {0}")]
    Auth(String),

    #[error("generation transport error: {0}")]
    Transport(String),

    #[error("generation returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Failure of the external retrieval capability
#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("retrieval unavailable: {0}")]
    Unavailable(String),

    #[error("retrieval returned an invalid response: {0}")]
    InvalidResponse(String),
}
