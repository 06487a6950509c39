//! Activity recording.
//!
//! A recorder observes stage execution for auditing. It never influences
//! control flow: the orchestrator only ever talks to a `GuardedRecorder`,
//! which logs and discards every recorder failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::stages::StageInput;
use crate::domain::{ContentDiff, DecisionLogEntry, Grounding, StageId, StageResult};

/// Observer of stage activity
#[async_trait]
pub trait ActivityRecorder: Send + Sync {
    /// A stage is about to run with exactly this input
    async fn stage_started(&self, _input: &StageInput, _fingerprint: &str) -> Result<()> {
        Ok(())
    }

    async fn decision(
        &self,
        _execution_id: Uuid,
        _stage: StageId,
        _entry: &DecisionLogEntry,
    ) -> Result<()> {
        Ok(())
    }

    async fn retrieval_used(
        &self,
        _execution_id: Uuid,
        _stage: StageId,
        _grounding: Grounding,
        _passages: usize,
    ) -> Result<()> {
        Ok(())
    }

    async fn content_diff(
        &self,
        _execution_id: Uuid,
        _stage: StageId,
        _diff: &ContentDiff,
    ) -> Result<()> {
        Ok(())
    }

    async fn stage_completed(&self, _execution_id: Uuid, _result: &StageResult) -> Result<()> {
        Ok(())
    }
}

/// Records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl ActivityRecorder for NoopRecorder {}

/// Records activity as structured log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

#[async_trait]
impl ActivityRecorder for TracingRecorder {
    async fn stage_started(&self, input: &StageInput, fingerprint: &str) -> Result<()> {
        info!(
            execution_id = %input.execution_id,
            stage = %input.stage,
            fingerprint,
            prior = input.prior.len(),
            instructions = input.instructions.is_some(),
            "Stage input"
        );
        Ok(())
    }

    async fn decision(
        &self,
        execution_id: Uuid,
        stage: StageId,
        entry: &DecisionLogEntry,
    ) -> Result<()> {
        info!(%execution_id, %stage, decision = %entry.decision, rationale = %entry.rationale, "Decision");
        Ok(())
    }

    async fn retrieval_used(
        &self,
        execution_id: Uuid,
        stage: StageId,
        grounding: Grounding,
        passages: usize,
    ) -> Result<()> {
        info!(%execution_id, %stage, ?grounding, passages, "Retrieval");
        Ok(())
    }

    async fn content_diff(
        &self,
        execution_id: Uuid,
        stage: StageId,
        diff: &ContentDiff,
    ) -> Result<()> {
        info!(
            %execution_id,
            %stage,
            words_before = diff.words_before,
            words_after = diff.words_after,
            "Content diff"
        );
        Ok(())
    }

    async fn stage_completed(&self, execution_id: Uuid, result: &StageResult) -> Result<()> {
        info!(
            %execution_id,
            stage = %result.stage,
            duration_ms = result.duration_ms,
            attempts = result.attempts,
            tokens = result.usage.total_tokens(),
            badges_passed = result.badges.iter().filter(|b| b.passed).count(),
            badges = result.badges.len(),
            "Stage activity complete"
        );
        Ok(())
    }
}

/// One line of the activity audit log
#[derive(Debug, Serialize)]
struct ActivityLine<'a> {
    timestamp: DateTime<Utc>,
    execution_id: Uuid,
    stage: StageId,
    #[serde(flatten)]
    entry: ActivityEntry<'a>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ActivityEntry<'a> {
    StageStarted {
        fingerprint: &'a str,
        input: &'a StageInput,
    },
    Decision {
        entry: &'a DecisionLogEntry,
    },
    Retrieval {
        grounding: Grounding,
        passages: usize,
    },
    ContentDiff {
        diff: &'a ContentDiff,
    },
    StageCompleted {
        result: &'a StageResult,
    },
}

/// Append-only audit file per execution:
/// `{base}/executions/{execution_id}/activity.jsonl`
pub struct JsonlActivityRecorder {
    base_dir: PathBuf,
}

impl JsonlActivityRecorder {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Path of the activity log for an execution
    pub fn activity_path(base_dir: &Path, execution_id: Uuid) -> PathBuf {
        base_dir
            .join("executions")
            .join(execution_id.to_string())
            .join("activity.jsonl")
    }

    async fn write(&self, execution_id: Uuid, stage: StageId, entry: ActivityEntry<'_>) -> Result<()> {
        let path = Self::activity_path(&self.base_dir, execution_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let line = ActivityLine {
            timestamp: Utc::now(),
            execution_id,
            stage,
            entry,
        };
        let json = serde_json::to_string(&line).context("Failed to serialize activity")?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open activity log: {}", path.display()))?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write activity")?;
        file.flush().await.context("Failed to flush activity")?;
        Ok(())
    }
}

#[async_trait]
impl ActivityRecorder for JsonlActivityRecorder {
    async fn stage_started(&self, input: &StageInput, fingerprint: &str) -> Result<()> {
        self.write(
            input.execution_id,
            input.stage,
            ActivityEntry::StageStarted { fingerprint, input },
        )
        .await
    }

    async fn decision(
        &self,
        execution_id: Uuid,
        stage: StageId,
        entry: &DecisionLogEntry,
    ) -> Result<()> {
        self.write(execution_id, stage, ActivityEntry::Decision { entry })
            .await
    }

    async fn retrieval_used(
        &self,
        execution_id: Uuid,
        stage: StageId,
        grounding: Grounding,
        passages: usize,
    ) -> Result<()> {
        self.write(
            execution_id,
            stage,
            ActivityEntry::Retrieval {
                grounding,
                passages,
            },
        )
        .await
    }

    async fn content_diff(
        &self,
        execution_id: Uuid,
        stage: StageId,
        diff: &ContentDiff,
    ) -> Result<()> {
        self.write(execution_id, stage, ActivityEntry::ContentDiff { diff })
            .await
    }

    async fn stage_completed(&self, execution_id: Uuid, result: &StageResult) -> Result<()> {
        self.write(execution_id, result.stage, ActivityEntry::StageCompleted { result })
            .await
    }
}

const RECORDER_TIMEOUT: Duration = Duration::from_secs(5);

/// Wraps any recorder so its failures and stalls never reach the caller
#[derive(Clone)]
pub struct GuardedRecorder {
    inner: Arc<dyn ActivityRecorder>,
}

impl GuardedRecorder {
    pub fn new(inner: Arc<dyn ActivityRecorder>) -> Self {
        Self { inner }
    }

    async fn guard<F>(&self, what: &'static str, fut: F)
    where
        F: std::future::Future<Output = Result<()>>,
    {
        match tokio::time::timeout(RECORDER_TIMEOUT, fut).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(callback = what, error = %e, "Activity recorder failed"),
            Err(_) => warn!(callback = what, "Activity recorder timed out"),
        }
    }

    pub async fn stage_started(&self, input: &StageInput, fingerprint: &str) {
        self.guard("stage_started", self.inner.stage_started(input, fingerprint))
            .await
    }

    pub async fn decision(&self, execution_id: Uuid, stage: StageId, entry: &DecisionLogEntry) {
        self.guard("decision", self.inner.decision(execution_id, stage, entry))
            .await
    }

    pub async fn retrieval_used(
        &self,
        execution_id: Uuid,
        stage: StageId,
        grounding: Grounding,
        passages: usize,
    ) {
        self.guard(
            "retrieval_used",
            self.inner
                .retrieval_used(execution_id, stage, grounding, passages),
        )
        .await
    }

    pub async fn content_diff(&self, execution_id: Uuid, stage: StageId, diff: &ContentDiff) {
        self.guard("content_diff", self.inner.content_diff(execution_id, stage, diff))
            .await
    }

    pub async fn stage_completed(&self, execution_id: Uuid, result: &StageResult) {
        debug!(%execution_id, stage = %result.stage, "Recording stage completion");
        self.guard("stage_completed", self.inner.stage_completed(execution_id, result))
            .await
    }
}

impl Default for GuardedRecorder {
    fn default() -> Self {
        Self::new(Arc::new(NoopRecorder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContentRequest, Identity};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Broken;

    #[async_trait]
    impl ActivityRecorder for Broken {
        async fn stage_started(&self, _input: &StageInput, _fingerprint: &str) -> Result<()> {
            anyhow::bail!("disk full")
        }

        async fn stage_completed(&self, _execution_id: Uuid, _result: &StageResult) -> Result<()> {
            panic!("stage_completed must not be reached in this test")
        }
    }

    fn input(execution_id: Uuid) -> StageInput {
        StageInput {
            execution_id,
            stage: StageId::Research,
            request: ContentRequest::new("topic", Identity::new("acme", "u1")),
            prior: BTreeMap::new(),
            instructions: None,
        }
    }

    #[tokio::test]
    async fn test_guarded_recorder_swallows_errors() {
        let guarded = GuardedRecorder::new(Arc::new(Broken));
        guarded.stage_started(&input(Uuid::new_v4()), "fp").await;
    }

    #[tokio::test]
    async fn test_jsonl_recorder_appends_lines() {
        let temp = TempDir::new().unwrap();
        let recorder = JsonlActivityRecorder::new(temp.path());
        let execution_id = Uuid::new_v4();

        recorder
            .stage_started(&input(execution_id), "abc")
            .await
            .unwrap();
        recorder
            .decision(
                execution_id,
                StageId::Research,
                &DecisionLogEntry::new("skip retrieval", "no index"),
            )
            .await
            .unwrap();
        recorder
            .stage_completed(
                execution_id,
                &StageResult::new(StageId::Research, json!({"keywords": ["k"]})),
            )
            .await
            .unwrap();

        let path = JsonlActivityRecorder::activity_path(temp.path(), execution_id);
        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["kind"], "stage_started");
        assert_eq!(lines[0]["fingerprint"], "abc");
        assert_eq!(lines[1]["kind"], "decision");
        assert_eq!(lines[2]["kind"], "stage_completed");
        assert_eq!(lines[2]["stage"], "research");
    }
}
