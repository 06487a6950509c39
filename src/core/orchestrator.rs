//! Pipeline orchestrator - drives executions stage by stage.
//!
//! An execution is a linear walk over the registry. Each stage runs once,
//! under the executor's retry policy, and its output is recorded before
//! the next stage starts. In checkpoint mode the driver task ends after
//! every non-final stage, leaving a `CheckpointSession` behind; `resume`
//! rebuilds the state from that session's snapshot and spawns a new
//! driver. Nothing but the session store carries a paused execution, so
//! a paused execution survives a process restart.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::db::SqliteStore;
use super::emitter::{EmitterMetrics, EventEmitter, EventHub, EventStream};
use super::executor::StageExecutor;
use super::recorder::{ActivityRecorder, GuardedRecorder, NoopRecorder};
use super::registry::{StageDescriptor, StageRegistry};
use super::session_store::SessionStore;
use super::stages::StageInput;
use super::state_store::StateStore;
use crate::domain::{
    ActionKind, ActionRequest, CheckpointSession, ContentRequest, EventRecord, ExecutionMode,
    PipelineEvent, PipelineState, SessionScope, StageId, StageResult, StateSummary,
};
use crate::errors::PipelineError;

/// Timing and buffering knobs for an orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// How long a fresh checkpoint session stays resumable
    #[serde(with = "secs")]
    pub checkpoint_ttl: Duration,

    /// How long a saved session stays resumable
    #[serde(with = "secs")]
    pub saved_session_ttl: Duration,

    /// Per-attempt timeout for stages without their own
    #[serde(with = "secs")]
    pub default_step_timeout: Duration,

    /// Interval between heartbeats while a stage call is in flight
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,

    /// Live channel capacity per consumer
    pub event_buffer: usize,

    /// Bounded wait for a consumer to accept a closing event
    #[serde(with = "secs")]
    pub terminal_send_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            checkpoint_ttl: Duration::from_secs(24 * 60 * 60),
            saved_session_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            default_step_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(15),
            event_buffer: 256,
            terminal_send_timeout: Duration::from_secs(5),
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650))
}

/// A started execution
pub struct ExecutionHandle {
    pub execution_id: Uuid,

    /// Live events for this execution
    pub events: EventStream,

    task: JoinHandle<PipelineState>,
}

impl ExecutionHandle {
    /// Wait for the driver to stop (terminal, or suspended at a checkpoint)
    pub async fn wait(self) -> Result<PipelineState, PipelineError> {
        join_driver(self.task).await
    }

    /// Split into the live stream and the driver's join handle
    pub fn into_parts(self) -> (EventStream, JoinHandle<PipelineState>) {
        (self.events, self.task)
    }
}

/// Result of a checkpoint action
pub struct ActionOutcome {
    pub summary: StateSummary,

    /// The new driver for continuing actions
    task: Option<JoinHandle<PipelineState>>,
}

impl ActionOutcome {
    pub fn is_continuing(&self) -> bool {
        self.task.is_some()
    }

    /// Wait for the spawned driver, if any
    pub async fn wait(self) -> Result<Option<PipelineState>, PipelineError> {
        match self.task {
            Some(task) => join_driver(task).await.map(Some),
            None => Ok(None),
        }
    }
}

async fn join_driver(task: JoinHandle<PipelineState>) -> Result<PipelineState, PipelineError> {
    task.await
        .map_err(|e| PipelineError::Storage(anyhow::anyhow!("driver task failed: {}", e)))
}

/// Builder for `Orchestrator`
pub struct OrchestratorBuilder {
    registry: StageRegistry,
    home: PathBuf,
    settings: OrchestratorSettings,
    sessions: Option<Arc<dyn SessionStore>>,
    states: Option<Arc<dyn StateStore>>,
    recorder: Arc<dyn ActivityRecorder>,
}

impl OrchestratorBuilder {
    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.states = Some(store);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn ActivityRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Build, opening `{home}/longform.db` for any store not supplied
    pub fn build(self) -> anyhow::Result<Orchestrator> {
        let (sessions, states) = match (self.sessions, self.states) {
            (Some(sessions), Some(states)) => (sessions, states),
            (sessions, states) => {
                let db = SqliteStore::open(&self.home.join("longform.db"))
                    .context("Failed to open longform database")?;
                (
                    sessions.unwrap_or_else(|| Arc::new(db.clone())),
                    states.unwrap_or_else(|| Arc::new(db)),
                )
            }
        };

        let hub = EventHub::new(
            &self.home,
            self.settings.event_buffer,
            self.settings.terminal_send_timeout,
        );
        let executor = StageExecutor::new(
            GuardedRecorder::new(self.recorder),
            self.settings.default_step_timeout,
        );

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                registry: self.registry,
                executor,
                sessions,
                states,
                hub,
                settings: self.settings,
                cancellations: Mutex::new(HashSet::new()),
            }),
        })
    }
}

struct Inner {
    registry: StageRegistry,
    executor: StageExecutor,
    sessions: Arc<dyn SessionStore>,
    states: Arc<dyn StateStore>,
    hub: Arc<EventHub>,
    settings: OrchestratorSettings,

    /// Executions asked to stop at their next stage boundary
    cancellations: Mutex<HashSet<Uuid>>,
}

/// Checkpointable multi-stage pipeline orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Start building an orchestrator that keeps its files under `home`
    pub fn builder(registry: StageRegistry, home: impl AsRef<Path>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            home: home.as_ref().to_path_buf(),
            settings: OrchestratorSettings::default(),
            sessions: None,
            states: None,
            recorder: Arc::new(NoopRecorder),
        }
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub fn emitter_metrics(&self) -> &EmitterMetrics {
        self.inner.hub.metrics()
    }

    /// Start a new execution.
    ///
    /// The returned stream is subscribed before the first event is emitted.
    #[instrument(skip(self, request), fields(topic = %request.topic))]
    pub async fn start(
        &self,
        request: ContentRequest,
        mode: ExecutionMode,
    ) -> Result<ExecutionHandle, PipelineError> {
        request.validate()?;

        let execution_id = Uuid::new_v4();
        info!(%execution_id, "Starting execution");

        let state = PipelineState::new(execution_id, request, mode);
        self.inner.states.put(&state).await?;

        let events = self.inner.hub.subscribe(execution_id);
        let emitter = self.inner.hub.emitter(execution_id).await?;
        emitter
            .emit(PipelineEvent::PipelineStart {
                mode,
                topic: state.request.topic.clone(),
                stages: self.inner.registry.ids(),
            })
            .await?;

        let task = self.spawn_driver(state, emitter);
        Ok(ExecutionHandle {
            execution_id,
            events,
            task,
        })
    }

    /// Start an execution and wait for its driver to stop
    pub async fn run(
        &self,
        request: ContentRequest,
        mode: ExecutionMode,
    ) -> Result<PipelineState, PipelineError> {
        self.start(request, mode).await?.wait().await
    }

    /// Apply an action to a paused execution.
    ///
    /// Validation errors return before anything is consumed or written.
    /// Once the session is consumed the execution always ends up driven
    /// or finalized, even if persisting the action fails.
    #[instrument(skip(self, request), fields(session_id = %request.session_id, action = %request.action))]
    pub async fn resume(&self, request: ActionRequest) -> Result<ActionOutcome, PipelineError> {
        let session = self
            .inner
            .sessions
            .get(&request.session_id)
            .await?
            .ok_or_else(|| PipelineError::SessionNotFound(request.session_id.clone()))?;

        // An expired session can still be released by cancelling it
        if request.action != ActionKind::Cancel && session.is_expired(Utc::now()) {
            return Err(PipelineError::SessionExpired(session.session_id));
        }

        self.validate_action(&session, &request)?;

        let emitter = self.inner.hub.emitter(session.execution_id).await?;

        if request.action == ActionKind::Save {
            return self.save(session, request, emitter).await;
        }

        let session = self
            .inner
            .sessions
            .consume(&request.session_id)
            .await?
            .ok_or_else(|| PipelineError::ConcurrencyConflict(request.session_id.clone()))?;

        info!(
            execution_id = %session.execution_id,
            paused = %session.paused_stage,
            "Checkpoint resolved"
        );

        let next_stage = session.next_stage;
        let mut state = session.snapshot.clone();
        if let Err(e) = self
            .inner
            .apply_action(&mut state, &emitter, &session, request)
            .await
        {
            self.inner.abort(&mut state, &emitter, &e).await;
            return Err(PipelineError::Storage(e));
        }

        if state.status.is_terminal() {
            return Ok(ActionOutcome {
                summary: state.summary(None),
                task: None,
            });
        }

        let summary = state.summary(Some(next_stage));
        let task = self.spawn_driver(state, emitter);
        Ok(ActionOutcome {
            summary,
            task: Some(task),
        })
    }

    async fn save(
        &self,
        session: CheckpointSession,
        request: ActionRequest,
        emitter: EventEmitter,
    ) -> Result<ActionOutcome, PipelineError> {
        let saved = self
            .inner
            .sessions
            .mark_saved(
                &session.session_id,
                request.next_stage_instructions,
                chrono_ttl(self.inner.settings.saved_session_ttl),
            )
            .await?
            .ok_or_else(|| PipelineError::ConcurrencyConflict(session.session_id.clone()))?;

        info!(
            execution_id = %saved.execution_id,
            expires_at = %saved.expires_at,
            "Checkpoint saved"
        );

        emitter
            .emit(PipelineEvent::CheckpointResolved {
                session_id: saved.session_id.clone(),
                action: ActionKind::Save,
                edited: false,
            })
            .await?;
        emitter
            .emit(PipelineEvent::CheckpointSaved {
                session_id: saved.session_id.clone(),
                expires_at: saved.expires_at,
            })
            .await?;

        Ok(ActionOutcome {
            summary: saved.snapshot.summary(Some(saved.next_stage)),
            task: None,
        })
    }

    fn validate_action(
        &self,
        session: &CheckpointSession,
        request: &ActionRequest,
    ) -> Result<(), PipelineError> {
        let invalid = |reason: String| PipelineError::InvalidAction {
            action: request.action,
            reason,
        };

        match (&request.action, &request.edited_output) {
            (ActionKind::Edit, None) => {
                return Err(invalid("edit requires edited_output".to_string()));
            }
            (ActionKind::Edit, Some(edited)) => {
                if !session.snapshot.is_completed(session.paused_stage) {
                    return Err(invalid(format!(
                        "stage '{}' has no output to edit",
                        session.paused_stage
                    )));
                }
                let schema = self
                    .inner
                    .registry
                    .get(session.paused_stage)
                    .and_then(|d| d.handler.schema());
                if let Some(schema) = schema {
                    schema.validate(edited).map_err(|e| {
                        invalid(format!(
                            "edited output does not fit stage '{}': {}",
                            session.paused_stage, e
                        ))
                    })?;
                }
            }
            (_, Some(_)) => {
                return Err(invalid("edited_output is only accepted with edit".to_string()));
            }
            (_, None) => {}
        }

        if request.action == ActionKind::Save && session.is_saved() {
            return Err(invalid("session is already saved".to_string()));
        }

        Ok(())
    }

    /// Attach a new live consumer to an execution, replacing any previous one
    pub async fn subscribe(&self, execution_id: Uuid) -> Result<EventStream, PipelineError> {
        let state = self.status(execution_id).await?;
        let stream = self.inner.hub.subscribe(execution_id);
        if state.status.is_terminal() {
            // Nothing more will be emitted
            self.inner.hub.release(execution_id);
        }
        Ok(stream)
    }

    /// Request cancellation.
    ///
    /// A paused execution is cancelled immediately through its session; a
    /// running one stops at the next stage boundary.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: Uuid) -> Result<StateSummary, PipelineError> {
        let state = self.status(execution_id).await?;
        if state.status.is_terminal() {
            return Err(PipelineError::InvalidAction {
                action: ActionKind::Cancel,
                reason: format!("execution is already {}", state.status),
            });
        }

        if let Some(session) = self.inner.sessions.find_by_execution(execution_id).await? {
            return self.cancel_session(session).await;
        }

        info!(%execution_id, "Cancellation requested");
        self.inner.request_cancellation(execution_id);

        // The driver may have paused after the lookup above; whoever takes
        // the flag first is the one that cancels
        if let Some(session) = self.inner.sessions.find_by_execution(execution_id).await? {
            if self.inner.take_cancellation(execution_id) {
                return self.cancel_session(session).await;
            }
        }
        Ok(state.summary(None))
    }

    async fn cancel_session(&self, session: CheckpointSession) -> Result<StateSummary, PipelineError> {
        let outcome = self
            .resume(ActionRequest::new(session.session_id, ActionKind::Cancel))
            .await?;
        Ok(outcome.summary)
    }

    /// Durable state of an execution
    pub async fn status(&self, execution_id: Uuid) -> Result<PipelineState, PipelineError> {
        self.inner
            .states
            .get(execution_id)
            .await?
            .ok_or(PipelineError::ExecutionNotFound(execution_id))
    }

    /// Replay the durable event log of an execution
    pub async fn history(&self, execution_id: Uuid) -> Result<Vec<EventRecord>, PipelineError> {
        self.status(execution_id).await?;
        Ok(self.inner.hub.history(execution_id).await?)
    }

    /// Most recently updated executions
    pub async fn list_executions(&self, limit: usize) -> Result<Vec<PipelineState>, PipelineError> {
        Ok(self.inner.states.list(limit).await?)
    }

    /// Saved sessions in scope
    pub async fn list_saved(
        &self,
        scope: &SessionScope,
    ) -> Result<Vec<CheckpointSession>, PipelineError> {
        Ok(self.inner.sessions.list_saved(scope).await?)
    }

    /// The session an execution is paused on, if any
    pub async fn pending_session(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<CheckpointSession>, PipelineError> {
        Ok(self.inner.sessions.find_by_execution(execution_id).await?)
    }

    /// Drop sessions whose expiry has passed.
    ///
    /// Each execution left paused on a purged session is cancelled, since
    /// nothing can resume it any more. Returns the number of sessions
    /// purged.
    pub async fn purge_expired(&self) -> Result<usize, PipelineError> {
        let purged = self.inner.sessions.purge_expired(Utc::now()).await?;
        if purged.is_empty() {
            return Ok(0);
        }
        info!(purged = purged.len(), "Purged expired checkpoint sessions");

        for session in &purged {
            if let Err(e) = self.inner.expire(session).await {
                warn!(
                    execution_id = %session.execution_id,
                    error = %e,
                    "Failed to finalize expired execution"
                );
            }
        }
        Ok(purged.len())
    }

    fn spawn_driver(&self, state: PipelineState, emitter: EventEmitter) -> JoinHandle<PipelineState> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.drive(state, emitter).await })
    }
}

impl Inner {
    fn request_cancellation(&self, execution_id: Uuid) {
        self.cancellations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(execution_id);
    }

    /// Take a pending cancellation request
    fn take_cancellation(&self, execution_id: Uuid) -> bool {
        self.cancellations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&execution_id)
    }

    fn forget_cancellation(&self, execution_id: Uuid) {
        self.take_cancellation(execution_id);
    }

    /// Run stages until terminal or suspended; never fails.
    ///
    /// Storage errors mark the execution failed and are reported as a
    /// pipeline_error event.
    #[instrument(skip_all, fields(execution_id = %state.execution_id))]
    async fn drive(&self, mut state: PipelineState, emitter: EventEmitter) -> PipelineState {
        if let Err(e) = self.drive_stages(&mut state, &emitter).await {
            self.abort(&mut state, &emitter, &e).await;
        }
        state
    }

    /// Mark the execution failed after a storage error, best effort
    async fn abort(&self, state: &mut PipelineState, emitter: &EventEmitter, err: &anyhow::Error) {
        let message = format!("{:#}", err);
        error!(execution_id = %state.execution_id, %message, "Execution aborted");

        self.forget_cancellation(state.execution_id);
        state.fail(state.current_stage, message.clone());
        if let Err(e) = self.states.put(state).await {
            warn!(error = %e, "Failed to persist failed state");
        }

        let event = PipelineEvent::PipelineError {
            stage: state.current_stage,
            message,
        };
        if let Err(e) = emitter.emit(event).await {
            warn!(error = %e, "Failed to emit pipeline_error");
            self.hub.release(state.execution_id);
        }
    }

    /// Record a consumed checkpoint action against the snapshot state
    async fn apply_action(
        &self,
        state: &mut PipelineState,
        emitter: &EventEmitter,
        session: &CheckpointSession,
        request: ActionRequest,
    ) -> anyhow::Result<()> {
        emitter
            .emit(PipelineEvent::CheckpointResolved {
                session_id: session.session_id.clone(),
                action: request.action,
                edited: request.edited_output.is_some(),
            })
            .await?;

        if !request.action.continues() {
            self.forget_cancellation(state.execution_id);
            return self
                .finish_cancelled(state, emitter, Some(session.next_stage), "cancelled at checkpoint")
                .await;
        }

        if let Some(edited) = request.edited_output {
            state
                .replace_output(session.paused_stage, edited)
                .map_err(anyhow::Error::msg)?;
        }
        if request.action == ActionKind::ApproveAll {
            state.approve_all();
        }
        state.pending_instructions = request
            .next_stage_instructions
            .or_else(|| session.instructions.clone());

        self.states.put(state).await?;
        Ok(())
    }

    /// Cancel the execution behind a purged session if it is still paused
    async fn expire(&self, session: &CheckpointSession) -> anyhow::Result<()> {
        let mut state = match self.states.get(session.execution_id).await? {
            Some(state) => state,
            None => session.snapshot.clone(),
        };
        if state.status.is_terminal() {
            return Ok(());
        }

        self.forget_cancellation(state.execution_id);
        let emitter = self.hub.emitter(state.execution_id).await?;
        self.finish_cancelled(&mut state, &emitter, Some(session.next_stage), "session expired")
            .await
    }

    async fn drive_stages(
        &self,
        state: &mut PipelineState,
        emitter: &EventEmitter,
    ) -> anyhow::Result<()> {
        loop {
            let Some(descriptor) = self.registry.next_after(state.last_completed()) else {
                self.forget_cancellation(state.execution_id);
                return self.complete(state, emitter).await;
            };

            if self.take_cancellation(state.execution_id) {
                return self
                    .finish_cancelled(state, emitter, Some(descriptor.id), "cancelled by request")
                    .await;
            }

            let instructions = state.take_instructions();
            let input = match StageInput::build(state, descriptor, instructions) {
                Ok(input) => input,
                Err(reason) => return self.fail_stage(state, emitter, descriptor.id, reason).await,
            };

            state.begin_stage(descriptor.id);
            self.states.put(state).await?;

            info!(stage = %descriptor.id, index = descriptor.order, "Stage started");
            emitter
                .emit(PipelineEvent::StageStart {
                    stage: descriptor.id,
                    index: descriptor.order,
                    label: descriptor.label.clone(),
                })
                .await?;

            let result = match self.execute_with_heartbeats(descriptor, &input, emitter).await {
                Ok(result) => result,
                Err(PipelineError::StageFailure {
                    stage,
                    reason,
                    attempts,
                }) => {
                    let message = format!("failed after {} attempt(s): {}", attempts, reason);
                    return self.fail_stage(state, emitter, stage, message).await;
                }
                Err(other) => return Err(other.into()),
            };

            let stage = descriptor.id;
            self.record(state, emitter, result).await?;

            if self.registry.is_final(stage) {
                continue;
            }

            if state.effective_mode() == ExecutionMode::Checkpoint {
                return self.suspend(state, emitter, stage).await;
            }
        }
    }

    async fn execute_with_heartbeats(
        &self,
        descriptor: &StageDescriptor,
        input: &StageInput,
        emitter: &EventEmitter,
    ) -> Result<StageResult, PipelineError> {
        let started = tokio::time::Instant::now();
        let interval = self
            .settings
            .heartbeat_interval
            .max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(started + interval, interval);

        let execution = self.executor.execute(descriptor, input);
        tokio::pin!(execution);

        loop {
            tokio::select! {
                result = &mut execution => return result,
                _ = ticker.tick() => {
                    emitter.heartbeat(descriptor.id, started.elapsed()).await;
                }
            }
        }
    }

    async fn record(
        &self,
        state: &mut PipelineState,
        emitter: &EventEmitter,
        result: StageResult,
    ) -> anyhow::Result<()> {
        let event = PipelineEvent::StageComplete {
            stage: result.stage,
            duration_ms: result.duration_ms,
            usage: result.usage,
            attempts: result.attempts,
            grounding: result.grounding,
        };

        info!(
            stage = %result.stage,
            duration_ms = result.duration_ms,
            attempts = result.attempts,
            "Stage completed"
        );

        state.record_stage(result).map_err(anyhow::Error::msg)?;
        self.states.put(state).await?;
        emitter.emit(event).await?;
        Ok(())
    }

    async fn suspend(
        &self,
        state: &mut PipelineState,
        emitter: &EventEmitter,
        paused: StageId,
    ) -> anyhow::Result<()> {
        let next = self
            .registry
            .next_after(Some(paused))
            .map(|d| d.id)
            .context("checkpoint after the final stage")?;

        state.wait_checkpoint();
        self.states.put(state).await?;
        let session = CheckpointSession::new(
            state.clone(),
            paused,
            next,
            chrono_ttl(self.settings.checkpoint_ttl),
        );
        self.sessions.create(&session).await?;

        // A cancel that arrived while the session was being created left
        // only the flag behind
        if self.take_cancellation(state.execution_id) {
            if self.sessions.consume(&session.session_id).await?.is_some() {
                return self
                    .finish_cancelled(state, emitter, Some(next), "cancelled by request")
                    .await;
            }
            return Ok(());
        }

        info!(stage = %paused, next = %next, "Checkpoint reached");
        emitter
            .emit(PipelineEvent::CheckpointReached {
                stage: paused,
                next_stage: next,
                session_id: session.session_id,
                expires_at: session.expires_at,
            })
            .await?;
        Ok(())
    }

    async fn complete(&self, state: &mut PipelineState, emitter: &EventEmitter) -> anyhow::Result<()> {
        state.complete();
        self.states.put(state).await?;

        info!(
            stages = state.completed_stages.len(),
            tokens = state.metrics.usage.total_tokens(),
            "Execution completed"
        );
        emitter
            .emit(PipelineEvent::PipelineComplete {
                completed_stages: state.completed_stages.clone(),
                metrics: state.metrics,
            })
            .await?;
        Ok(())
    }

    async fn fail_stage(
        &self,
        state: &mut PipelineState,
        emitter: &EventEmitter,
        stage: StageId,
        message: String,
    ) -> anyhow::Result<()> {
        error!(%stage, %message, "Execution failed");
        state.fail(Some(stage), message.clone());
        self.states.put(state).await?;
        self.forget_cancellation(state.execution_id);
        emitter
            .emit(PipelineEvent::PipelineError {
                stage: Some(stage),
                message,
            })
            .await?;
        Ok(())
    }

    async fn finish_cancelled(
        &self,
        state: &mut PipelineState,
        emitter: &EventEmitter,
        stage: Option<StageId>,
        reason: &str,
    ) -> anyhow::Result<()> {
        debug!(?stage, reason, "Cancelling execution");
        state.cancel();
        self.states.put(state).await?;
        emitter
            .emit(PipelineEvent::PipelineCancelled {
                stage,
                reason: reason.to_string(),
            })
            .await?;
        Ok(())
    }
}
