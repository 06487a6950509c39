//! Pipeline state: the accumulated record of one execution.
//!
//! Only the orchestrator mutates a `PipelineState`, and only through the
//! methods here, which keep the completed-stage list strictly increasing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::request::ContentRequest;
use super::stage::{StageId, StageResult, TokenUsage};

/// How the orchestrator treats stage boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run every stage back to back
    Automatic,

    /// Suspend after each non-final stage awaiting an action
    Checkpoint,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Automatic
    }
}

/// Lifecycle status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    WaitingCheckpoint,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// No further stage will run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::WaitingCheckpoint => "waiting_checkpoint",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulated resource usage of an execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub usage: TokenUsage,
    pub total_duration_ms: u64,
    pub total_attempts: u32,
}

/// Where and why an execution failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub stage: Option<StageId>,
    pub message: String,
}

/// The state of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub execution_id: Uuid,

    /// Original request, immutable for the life of the execution
    pub request: ContentRequest,

    pub mode: ExecutionMode,

    /// Set once an approve_all action is applied; never cleared
    #[serde(default)]
    pub approve_all: bool,

    pub status: ExecutionStatus,

    /// Stage in flight, or the stage paused after while waiting
    pub current_stage: Option<StageId>,

    /// Completed stages in execution order
    pub completed_stages: Vec<StageId>,

    /// Output each completed stage hands downstream
    pub outputs: BTreeMap<StageId, serde_json::Value>,

    /// Full result records, including the computed output before any edit
    pub results: BTreeMap<StageId, StageResult>,

    /// Instructions to inject into the next stage's input, then clear
    #[serde(default)]
    pub pending_instructions: Option<String>,

    pub metrics: PipelineMetrics,

    #[serde(default)]
    pub failure: Option<FailureInfo>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineState {
    pub fn new(execution_id: Uuid, request: ContentRequest, mode: ExecutionMode) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            request,
            mode,
            approve_all: false,
            status: ExecutionStatus::Pending,
            current_stage: None,
            completed_stages: Vec::new(),
            outputs: BTreeMap::new(),
            results: BTreeMap::new(),
            pending_instructions: None,
            metrics: PipelineMetrics::default(),
            failure: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Last completed stage, if any
    pub fn last_completed(&self) -> Option<StageId> {
        self.completed_stages.last().copied()
    }

    pub fn is_completed(&self, stage: StageId) -> bool {
        self.outputs.contains_key(&stage)
    }

    /// Output a downstream stage will see for `stage`
    pub fn output(&self, stage: StageId) -> Option<&serde_json::Value> {
        self.outputs.get(&stage)
    }

    /// Mark `stage` as in flight
    pub fn begin_stage(&mut self, stage: StageId) {
        self.current_stage = Some(stage);
        self.status = ExecutionStatus::Running;
        self.touch();
    }

    /// Append a completed stage.
    ///
    /// Rejects a stage that does not come strictly after the last completed
    /// one, so a replayed or duplicated completion can never reorder state.
    pub fn record_stage(&mut self, result: StageResult) -> Result<(), String> {
        if let Some(last) = self.last_completed() {
            if result.stage <= last {
                return Err(format!(
                    "stage '{}' cannot complete after '{}'",
                    result.stage, last
                ));
            }
        }

        self.metrics.usage.add(&result.usage);
        self.metrics.total_duration_ms += result.duration_ms;
        self.metrics.total_attempts += result.attempts;

        self.completed_stages.push(result.stage);
        self.outputs.insert(result.stage, result.output.clone());
        self.results.insert(result.stage, result);
        self.touch();
        Ok(())
    }

    /// Substitute a caller-edited output for a completed stage
    pub fn replace_output(
        &mut self,
        stage: StageId,
        output: serde_json::Value,
    ) -> Result<(), String> {
        if !self.is_completed(stage) {
            return Err(format!("stage '{}' has not completed", stage));
        }
        self.outputs.insert(stage, output);
        self.touch();
        Ok(())
    }

    /// Latch approve_all and drop to automatic for the rest of the run
    pub fn approve_all(&mut self) {
        self.approve_all = true;
        self.mode = ExecutionMode::Automatic;
        self.touch();
    }

    /// Effective mode, honoring the approve_all latch
    pub fn effective_mode(&self) -> ExecutionMode {
        if self.approve_all {
            ExecutionMode::Automatic
        } else {
            self.mode
        }
    }

    pub fn wait_checkpoint(&mut self) {
        self.status = ExecutionStatus::WaitingCheckpoint;
        self.touch();
    }

    pub fn complete(&mut self) {
        self.status = ExecutionStatus::Completed;
        self.current_stage = None;
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    pub fn fail(&mut self, stage: Option<StageId>, message: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.failure = Some(FailureInfo {
            stage,
            message: message.into(),
        });
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    pub fn cancel(&mut self) {
        self.status = ExecutionStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    /// Take the pending instructions, clearing them
    pub fn take_instructions(&mut self) -> Option<String> {
        self.pending_instructions.take()
    }

    pub fn summary(&self, next_stage: Option<StageId>) -> StateSummary {
        StateSummary {
            execution_id: self.execution_id,
            status: self.status,
            mode: self.effective_mode(),
            completed_stages: self.completed_stages.clone(),
            next_stage,
            metrics: self.metrics,
            failure: self.failure.clone(),
        }
    }
}

/// Compact view of an execution returned from action submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSummary {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub mode: ExecutionMode,
    pub completed_stages: Vec<StageId>,
    pub next_stage: Option<StageId>,
    pub metrics: PipelineMetrics,
    pub failure: Option<FailureInfo>,
}
