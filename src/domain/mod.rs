//! Domain types for the longform orchestrator.
//!
//! This module contains the core data structures:
//! - Request: what the caller asks for
//! - Stage: stage identities and results
//! - State: execution progress
//! - Session: checkpoint sessions and actions
//! - Events: lifecycle events

pub mod events;
pub mod request;
pub mod session;
pub mod stage;
pub mod state;

// Re-export commonly used types
pub use events::{EventRecord, PipelineEvent};
pub use request::{ContentRequest, Identity};
pub use session::{new_session_token, ActionKind, ActionRequest, CheckpointSession, SessionScope};
pub use stage::{
    ContentDiff, DecisionLogEntry, Grounding, QualityBadge, StageId, StageResult, TokenUsage,
};
pub use state::{
    ExecutionMode, ExecutionStatus, FailureInfo, PipelineMetrics, PipelineState, StateSummary,
};
