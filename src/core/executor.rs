//! Stage executor: one stage invocation with timeout and retries.
//!
//! Retries happen here, inside a single stage start, so the event stream
//! sees one stage_start per stage no matter how many attempts it took.

use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use super::recorder::GuardedRecorder;
use super::registry::StageDescriptor;
use super::stages::{StageAttemptError, StageContext, StageInput, StageOutcome};
use crate::domain::{Grounding, StageResult};
use crate::errors::PipelineError;

/// Runs stages against their descriptors
#[derive(Clone)]
pub struct StageExecutor {
    recorder: GuardedRecorder,
    default_timeout: Duration,
}

impl StageExecutor {
    pub fn new(recorder: GuardedRecorder, default_timeout: Duration) -> Self {
        Self {
            recorder,
            default_timeout,
        }
    }

    pub fn recorder(&self) -> &GuardedRecorder {
        &self.recorder
    }

    /// Execute a stage with retry logic.
    ///
    /// Each attempt runs under the stage timeout. Timeouts, retryable
    /// handler errors and schema violations are retried per the stage's
    /// policy; anything else fails the stage immediately.
    pub async fn execute(
        &self,
        descriptor: &StageDescriptor,
        input: &StageInput,
    ) -> Result<StageResult, PipelineError> {
        let timeout = descriptor.timeout(self.default_timeout);
        let policy = &descriptor.retry_policy;
        let fingerprint = input.fingerprint();

        self.recorder.stage_started(input, &fingerprint).await;

        let stage_start = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let ctx = StageContext { attempt, timeout };
            debug!(stage = %descriptor.id, attempt, ?timeout, "Invoking stage");

            let result = match tokio::time::timeout(timeout, descriptor.handler.execute(input, &ctx))
                .await
            {
                Ok(result) => result.and_then(|outcome| self.check_schema(descriptor, outcome)),
                Err(_) => Err(StageAttemptError::retryable(format!(
                    "attempt timed out after {}s",
                    timeout.as_secs_f64()
                ))),
            };

            match result {
                Ok(outcome) => {
                    let duration_ms = stage_start.elapsed().as_millis() as u64;
                    let result = self.finish(input, outcome, duration_ms, attempt).await;
                    return Ok(result);
                }
                Err(e) => {
                    if e.retryable && policy.should_retry(attempt) {
                        let delay = policy.delay_for_attempt(attempt);
                        warn!(
                            stage = %descriptor.id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Stage failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    error!(
                        stage = %descriptor.id,
                        attempt,
                        error = %e,
                        "Stage failed permanently"
                    );
                    return Err(PipelineError::StageFailure {
                        stage: descriptor.id,
                        reason: e.reason,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    fn check_schema(
        &self,
        descriptor: &StageDescriptor,
        outcome: StageOutcome,
    ) -> Result<StageOutcome, StageAttemptError> {
        if let Some(schema) = descriptor.handler.schema() {
            schema
                .validate(&outcome.output)
                .map_err(|e| StageAttemptError::retryable(format!("invalid output: {}", e)))?;
        }
        Ok(outcome)
    }

    async fn finish(
        &self,
        input: &StageInput,
        outcome: StageOutcome,
        duration_ms: u64,
        attempts: u32,
    ) -> StageResult {
        let execution_id = input.execution_id;
        let stage = input.stage;

        for entry in &outcome.decisions {
            self.recorder.decision(execution_id, stage, entry).await;
        }
        if outcome.grounding != Grounding::None {
            self.recorder
                .retrieval_used(execution_id, stage, outcome.grounding, outcome.passages_used)
                .await;
        }
        for diff in &outcome.diffs {
            self.recorder.content_diff(execution_id, stage, diff).await;
        }

        let result = StageResult {
            stage,
            output: outcome.output,
            duration_ms,
            usage: outcome.usage,
            attempts,
            grounding: outcome.grounding,
            decisions: outcome.decisions,
            diffs: outcome.diffs,
            badges: outcome.badges,
        };

        self.recorder.stage_completed(execution_id, &result).await;
        result
    }
}
