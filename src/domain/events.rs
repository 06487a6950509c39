//! Lifecycle events for a pipeline execution.
//!
//! Every event except heartbeats is appended to the execution's durable
//! log before it is offered to the live consumer, so the log is the
//! authoritative history and the live stream is only a side channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::session::ActionKind;
use super::stage::{Grounding, StageId, TokenUsage};
use super::state::{ExecutionMode, PipelineMetrics};

/// Payload of a lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    PipelineStart {
        mode: ExecutionMode,
        topic: String,
        stages: Vec<StageId>,
    },

    StageStart {
        stage: StageId,
        index: usize,
        label: String,
    },

    StageComplete {
        stage: StageId,
        duration_ms: u64,
        usage: TokenUsage,
        attempts: u32,
        grounding: Grounding,
    },

    /// Execution suspended after `stage`; `next_stage` runs on continue
    CheckpointReached {
        stage: StageId,
        next_stage: StageId,
        session_id: String,
        expires_at: DateTime<Utc>,
    },

    /// An action was applied to a checkpoint session
    CheckpointResolved {
        session_id: String,
        action: ActionKind,
        edited: bool,
    },

    /// Session parked for later; closes the live stream
    CheckpointSaved {
        session_id: String,
        expires_at: DateTime<Utc>,
    },

    PipelineComplete {
        completed_stages: Vec<StageId>,
        metrics: PipelineMetrics,
    },

    PipelineError {
        stage: Option<StageId>,
        message: String,
    },

    PipelineCancelled {
        /// Stage that would have run next
        stage: Option<StageId>,
        reason: String,
    },

    Heartbeat {
        stage: StageId,
        elapsed_ms: u64,
    },
}

impl PipelineEvent {
    /// Events that end an execution's stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::PipelineComplete { .. }
                | PipelineEvent::PipelineError { .. }
                | PipelineEvent::PipelineCancelled { .. }
        )
    }

    /// Heartbeats are live-only and never written to the durable log
    pub fn is_durable(&self) -> bool {
        !matches!(self, PipelineEvent::Heartbeat { .. })
    }

    /// Events after which the live channel is closed
    pub fn closes_stream(&self) -> bool {
        self.is_terminal() || matches!(self, PipelineEvent::CheckpointSaved { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::PipelineStart { .. } => "pipeline_start",
            PipelineEvent::StageStart { .. } => "stage_start",
            PipelineEvent::StageComplete { .. } => "stage_complete",
            PipelineEvent::CheckpointReached { .. } => "checkpoint_reached",
            PipelineEvent::CheckpointResolved { .. } => "checkpoint_resolved",
            PipelineEvent::CheckpointSaved { .. } => "checkpoint_saved",
            PipelineEvent::PipelineComplete { .. } => "pipeline_complete",
            PipelineEvent::PipelineError { .. } => "pipeline_error",
            PipelineEvent::PipelineCancelled { .. } => "pipeline_cancelled",
            PipelineEvent::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Stage this event concerns, if any
    pub fn stage(&self) -> Option<StageId> {
        match self {
            PipelineEvent::StageStart { stage, .. }
            | PipelineEvent::StageComplete { stage, .. }
            | PipelineEvent::CheckpointReached { stage, .. }
            | PipelineEvent::Heartbeat { stage, .. } => Some(*stage),
            PipelineEvent::PipelineError { stage, .. }
            | PipelineEvent::PipelineCancelled { stage, .. } => *stage,
            _ => None,
        }
    }
}

/// An event with its position in the execution's sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonic per execution, starting at 1
    pub seq: u64,
    pub execution_id: Uuid,
    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub event: PipelineEvent,
}

impl EventRecord {
    pub fn new(seq: u64, execution_id: Uuid, event: PipelineEvent) -> Self {
        Self {
            seq,
            execution_id,
            timestamp: Utc::now(),
            event,
        }
    }

    /// One-line human summary (no payload contents)
    pub fn summary(&self) -> String {
        match &self.event {
            PipelineEvent::PipelineStart { mode, topic, .. } => {
                format!("pipeline started ({:?}) for '{}'", mode, topic)
            }
            PipelineEvent::StageStart { stage, index, .. } => {
                format!("stage {} '{}' started", index + 1, stage)
            }
            PipelineEvent::StageComplete {
                stage,
                duration_ms,
                attempts,
                ..
            } => format!(
                "stage '{}' completed in {}ms ({} attempt(s))",
                stage, duration_ms, attempts
            ),
            PipelineEvent::CheckpointReached {
                stage, next_stage, ..
            } => format!("checkpoint after '{}', next '{}'", stage, next_stage),
            PipelineEvent::CheckpointResolved { action, .. } => {
                format!("checkpoint resolved with '{}'", action)
            }
            PipelineEvent::CheckpointSaved { expires_at, .. } => {
                format!("checkpoint saved until {}", expires_at.to_rfc3339())
            }
            PipelineEvent::PipelineComplete {
                completed_stages, ..
            } => format!("pipeline completed ({} stages)", completed_stages.len()),
            PipelineEvent::PipelineError { stage, message } => match stage {
                Some(stage) => format!("pipeline failed at '{}': {}", stage, message),
                None => format!("pipeline failed: {}", message),
            },
            PipelineEvent::PipelineCancelled { reason, .. } => {
                format!("pipeline cancelled: {}", reason)
            }
            PipelineEvent::Heartbeat { stage, elapsed_ms } => {
                format!("'{}' still running ({}ms)", stage, elapsed_ms)
            }
        }
    }
}
