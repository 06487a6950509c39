//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use longform::adapters::{
    GenerationClient, GenerationOptions, GenerationOutput, Passage, RetrievalClient,
    RetrievalScope,
};
use longform::core::{
    standard_stages, ActivityRecorder, GenerationDefaults, InMemorySessionStore,
    InMemoryStateStore, Orchestrator, OrchestratorSettings, RetryPolicy, SessionStore,
    StageInput, StageRegistry, StateStore,
};
use longform::domain::{
    CheckpointSession, ContentRequest, Identity, PipelineState, SessionScope, StageId,
    StageResult, TokenUsage,
};
use longform::errors::{GenerationError, RetrievalError};

/// Which stage a rendered prompt belongs to
pub fn stage_of(prompt: &str) -> StageId {
    let first = prompt.lines().next().unwrap_or_default();
    if first.starts_with("You are a research analyst") {
        StageId::Research
    } else if first.starts_with("You are an editor defining the voice") {
        StageId::ToneAnalysis
    } else if first.starts_with("You are outlining") {
        StageId::Outline
    } else if first.starts_with("Write the full article") {
        StageId::Draft
    } else if first.starts_with("Optimize the draft") {
        StageId::Optimization
    } else if first.starts_with("Review the article for originality") {
        StageId::OriginalityCheck
    } else {
        StageId::FinalPolish
    }
}

/// A valid payload for each standard stage
pub fn canned_output(stage: StageId) -> Value {
    match stage {
        StageId::Research => json!({
            "keywords": ["cloud migration", "roi", "tco"],
            "key_points": ["compute savings", "migration cost", "payback period"],
            "sources": []
        }),
        StageId::ToneAnalysis => json!({
            "tone": "authoritative",
            "voice_guidelines": ["lead with numbers", "avoid hype"]
        }),
        StageId::Outline => json!({
            "title": "Measuring the ROI of a Cloud Migration",
            "sections": [
                {"heading": "Where the money goes", "points": ["compute", "storage"]},
                {"heading": "Payback", "points": ["timeline"]}
            ]
        }),
        StageId::Draft => json!({
            "content": "Cloud migration pays back when compute savings outrun migration cost."
        }),
        StageId::Optimization => json!({
            "content": "A cloud migration pays back once compute savings outrun the one-off migration cost.",
            "changes": ["tightened opening"]
        }),
        StageId::OriginalityCheck => json!({
            "originality_score": 0.92,
            "flagged_passages": []
        }),
        StageId::FinalPolish => json!({
            "content": "A cloud migration pays for itself once compute savings outrun the one-off cost of moving.",
            "summary": "Migration ROI hinges on payback. Measure it."
        }),
    }
}

#[derive(Debug, Clone)]
pub struct GenerationCall {
    pub stage: StageId,
    pub prompt: String,
    pub identity: Identity,
}

/// Generation fake that answers every stage with a canned payload
#[derive(Default)]
pub struct ScriptedGenerator {
    calls: Mutex<Vec<GenerationCall>>,
    /// Remaining failing calls per stage
    failures: Mutex<HashMap<StageId, u32>>,
    /// Stages that answer with text no schema accepts
    garbage: Mutex<HashMap<StageId, u32>>,
    delays: HashMap<StageId, Duration>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls for `stage` with a transport error
    pub fn failing(self, stage: StageId, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(stage, times);
        self
    }

    /// Answer the next `times` calls for `stage` with invalid output
    pub fn invalid(self, stage: StageId, times: u32) -> Self {
        self.garbage.lock().unwrap().insert(stage, times);
        self
    }

    pub fn delayed(mut self, stage: StageId, delay: Duration) -> Self {
        self.delays.insert(stage, delay);
        self
    }

    pub fn calls(&self) -> Vec<GenerationCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, stage: StageId) -> Vec<GenerationCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.stage == stage)
            .collect()
    }

    fn take(map: &Mutex<HashMap<StageId, u32>>, stage: StageId) -> bool {
        let mut map = map.lock().unwrap();
        match map.get_mut(&stage) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl GenerationClient for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationOutput, GenerationError> {
        let stage = stage_of(prompt);
        self.calls.lock().unwrap().push(GenerationCall {
            stage,
            prompt: prompt.to_string(),
            identity: options.identity.clone(),
        });

        if let Some(delay) = self.delays.get(&stage) {
            tokio::time::sleep(*delay).await;
        }
        if Self::take(&self.failures, stage) {
            return Err(GenerationError::Transport("connection reset".to_string()));
        }
        if Self::take(&self.garbage, stage) {
            return Ok(GenerationOutput::new("I'd be happy to help with that!"));
        }

        let text = format!(
            "Here is the result:\n```json\n{}\n```",
            canned_output(stage)
        );
        Ok(GenerationOutput::new(text).with_usage(TokenUsage::new(100, 50)))
    }
}

/// Retrieval fake that returns fixed passages
pub struct StaticRetriever;

#[async_trait]
impl RetrievalClient for StaticRetriever {
    fn name(&self) -> &str {
        "static"
    }

    async fn retrieve(
        &self,
        query: &str,
        scope: &RetrievalScope,
    ) -> Result<Vec<Passage>, RetrievalError> {
        Ok((0..scope.limit.min(2))
            .map(|i| Passage {
                text: format!("passage {} about {}", i, query),
                source_id: format!("doc-{}", i),
                relevance_score: 1.0 - i as f64 * 0.1,
            })
            .collect())
    }
}

/// Retrieval fake that is always down
pub struct DownRetriever;

#[async_trait]
impl RetrievalClient for DownRetriever {
    fn name(&self) -> &str {
        "down"
    }

    async fn retrieve(
        &self,
        _query: &str,
        _scope: &RetrievalScope,
    ) -> Result<Vec<Passage>, RetrievalError> {
        Err(RetrievalError::Unavailable("index offline".to_string()))
    }
}

/// Recorder that keeps every stage it sees
#[derive(Default)]
pub struct CollectingRecorder {
    pub started: Mutex<Vec<(StageId, String)>>,
    pub inputs: Mutex<Vec<StageInput>>,
    pub completed: Mutex<Vec<StageId>>,
}

#[async_trait]
impl ActivityRecorder for CollectingRecorder {
    async fn stage_started(&self, input: &StageInput, fingerprint: &str) -> anyhow::Result<()> {
        self.started
            .lock()
            .unwrap()
            .push((input.stage, fingerprint.to_string()));
        self.inputs.lock().unwrap().push(input.clone());
        Ok(())
    }

    async fn stage_completed(
        &self,
        _execution_id: uuid::Uuid,
        result: &StageResult,
    ) -> anyhow::Result<()> {
        self.completed.lock().unwrap().push(result.stage);
        Ok(())
    }
}

/// Recorder whose every call fails
pub struct FailingRecorder;

#[async_trait]
impl ActivityRecorder for FailingRecorder {
    async fn stage_started(&self, _input: &StageInput, _fingerprint: &str) -> anyhow::Result<()> {
        anyhow::bail!("audit sink unavailable")
    }

    async fn stage_completed(
        &self,
        _execution_id: uuid::Uuid,
        _result: &StageResult,
    ) -> anyhow::Result<()> {
        anyhow::bail!("audit sink unavailable")
    }
}

/// State store whose next `put` fails once armed
#[derive(Default)]
pub struct FlakyStateStore {
    inner: InMemoryStateStore,
    fail_next_put: AtomicBool,
}

impl FlakyStateStore {
    pub fn arm(&self) {
        self.fail_next_put.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for FlakyStateStore {
    async fn put(&self, state: &PipelineState) -> anyhow::Result<()> {
        if self.fail_next_put.swap(false, Ordering::SeqCst) {
            anyhow::bail!("database is locked");
        }
        self.inner.put(state).await
    }

    async fn get(&self, execution_id: uuid::Uuid) -> anyhow::Result<Option<PipelineState>> {
        self.inner.get(execution_id).await
    }

    async fn list(&self, limit: usize) -> anyhow::Result<Vec<PipelineState>> {
        self.inner.list(limit).await
    }
}

/// Session store whose next lookup by execution misses once armed,
/// as if the session had not been created yet
#[derive(Default)]
pub struct LaggingSessionStore {
    inner: InMemorySessionStore,
    miss_next_lookup: AtomicBool,
}

impl LaggingSessionStore {
    pub fn arm(&self) {
        self.miss_next_lookup.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionStore for LaggingSessionStore {
    async fn create(&self, session: &CheckpointSession) -> anyhow::Result<()> {
        self.inner.create(session).await
    }

    async fn get(&self, session_id: &str) -> anyhow::Result<Option<CheckpointSession>> {
        self.inner.get(session_id).await
    }

    async fn consume(&self, session_id: &str) -> anyhow::Result<Option<CheckpointSession>> {
        self.inner.consume(session_id).await
    }

    async fn mark_saved(
        &self,
        session_id: &str,
        instructions: Option<String>,
        ttl: chrono::Duration,
    ) -> anyhow::Result<Option<CheckpointSession>> {
        self.inner.mark_saved(session_id, instructions, ttl).await
    }

    async fn find_by_execution(
        &self,
        execution_id: uuid::Uuid,
    ) -> anyhow::Result<Option<CheckpointSession>> {
        if self.miss_next_lookup.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.find_by_execution(execution_id).await
    }

    async fn list_saved(&self, scope: &SessionScope) -> anyhow::Result<Vec<CheckpointSession>> {
        self.inner.list_saved(scope).await
    }

    async fn purge_expired(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<Vec<CheckpointSession>> {
        self.inner.purge_expired(now).await
    }
}

pub fn request(topic: &str) -> ContentRequest {
    ContentRequest::new(topic, Identity::new("acme", "u1"))
        .with_keywords(["cloud", "roi"])
        .with_target_word_count(1500)
}

pub fn registry(
    generator: Arc<ScriptedGenerator>,
    retriever: Option<Arc<dyn RetrievalClient>>,
) -> StageRegistry {
    StageRegistry::new(standard_stages(
        generator,
        retriever,
        GenerationDefaults::default(),
    ))
    .unwrap()
    .with_retry_policy(RetryPolicy::immediate(3))
}

/// Settings short enough for tests
pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        default_step_timeout: Duration::from_secs(5),
        terminal_send_timeout: Duration::from_millis(200),
        ..OrchestratorSettings::default()
    }
}

/// Orchestrator with in-memory stores; event logs still go under `home`
pub fn in_memory(
    home: &Path,
    generator: Arc<ScriptedGenerator>,
    settings: OrchestratorSettings,
) -> Orchestrator {
    with_stores(
        home,
        generator,
        settings,
        Arc::new(InMemorySessionStore::new()),
        Arc::new(InMemoryStateStore::new()),
    )
}

pub fn with_stores(
    home: &Path,
    generator: Arc<ScriptedGenerator>,
    settings: OrchestratorSettings,
    sessions: Arc<dyn SessionStore>,
    states: Arc<dyn StateStore>,
) -> Orchestrator {
    Orchestrator::builder(registry(generator, Some(Arc::new(StaticRetriever))), home)
        .with_settings(settings)
        .with_session_store(sessions)
        .with_state_store(states)
        .build()
        .unwrap()
}

/// Orchestrator backed by `{home}/longform.db`
pub fn on_disk(home: &Path, generator: Arc<ScriptedGenerator>) -> Orchestrator {
    Orchestrator::builder(registry(generator, Some(Arc::new(StaticRetriever))), home)
        .with_settings(fast_settings())
        .build()
        .unwrap()
}
