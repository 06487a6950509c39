//! Core orchestration logic.
//!
//! This module contains:
//! - Registry: ordered stage descriptors and retry policy
//! - Stages: the stage contract and the seven generative stages
//! - Executor: one stage invocation with timeout and retries
//! - EventStore / Emitter: durable event log and live streams
//! - Session and state stores: SQLite and in-memory persistence
//! - Recorder: activity observers
//! - Orchestrator: main execution engine

pub mod db;
pub mod emitter;
pub mod event_store;
pub mod executor;
pub mod orchestrator;
pub mod recorder;
pub mod registry;
pub mod schema;
pub mod session_store;
pub mod stages;
pub mod state_store;

// Re-export commonly used types
pub use db::SqliteStore;
pub use emitter::{EmitterMetrics, EventEmitter, EventHub, EventStream};
pub use event_store::EventStore;
pub use executor::StageExecutor;
pub use orchestrator::{
    ActionOutcome, ExecutionHandle, Orchestrator, OrchestratorBuilder, OrchestratorSettings,
};
pub use recorder::{
    ActivityRecorder, GuardedRecorder, JsonlActivityRecorder, NoopRecorder, TracingRecorder,
};
pub use registry::{
    RetrievalRequirement, RetryPolicy, StageDescriptor, StageOverride, StageRegistry,
};
pub use schema::{FieldKind, OutputSchema};
pub use session_store::{InMemorySessionStore, SessionStore};
pub use stages::{
    hash_input, standard_stages, GenerationDefaults, GenerativeStage, StageAttemptError,
    StageContext, StageHandler, StageInput, StageOutcome,
};
pub use state_store::{InMemoryStateStore, StateStore};
