//! longform - Checkpointable long-form content pipeline orchestrator
//!
//! Drives a fixed sequence of generative stages (research, tone analysis,
//! outline, draft, optimization, originality check, final polish) over a
//! single content request.
//!
//! # Architecture
//!
//! - Every lifecycle event is appended to a per-execution JSONL log before
//!   it is offered to the live consumer
//! - Execution state and checkpoint sessions live in SQLite
//! - In checkpoint mode the execution suspends after each non-final stage;
//!   an external action (approve, edit, approve_all, cancel, save) resumes
//!   it from the session snapshot, so a paused execution survives a restart
//!
//! # Modules
//!
//! - `adapters`: Generation and retrieval capabilities (HTTP, subprocess)
//! - `core`: Orchestration logic (registry, executor, stores, emitter)
//! - `domain`: Data structures (request, state, session, events)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run with a review pause after every stage
//! longform run "Cloud migration ROI" --tenant acme --user u1 --checkpoint
//!
//! # Continue a paused execution
//! longform resume <session-id> approve
//!
//! # Inspect an execution
//! longform status <execution-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod errors;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, OrchestratorSettings, StageRegistry};
pub use domain::{
    ActionKind, ActionRequest, CheckpointSession, ContentRequest, EventRecord, ExecutionMode,
    ExecutionStatus, Identity, PipelineEvent, PipelineState, StageId,
};
pub use errors::PipelineError;
