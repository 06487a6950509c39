//! Stage registry: the fixed, ordered list of stages an execution runs.
//!
//! Each descriptor pairs a stage id with the prior stages it may read,
//! its retry/timeout policy, and the handler that does the work.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::stages::StageHandler;
use crate::domain::StageId;

/// Whether a stage consults the retrieval capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalRequirement {
    /// Never retrieves
    None,

    /// Retrieves when available; degrades without it
    Optional,

    /// Fails the attempt if retrieval is unavailable
    Mandatory,
}

impl Default for RetrievalRequirement {
    fn default() -> Self {
        Self::None
    }
}

/// One entry in the registry
#[derive(Clone)]
pub struct StageDescriptor {
    pub id: StageId,

    /// Position in the registry (0-based)
    pub order: usize,

    pub label: String,

    /// Prior stages whose outputs this stage may read
    pub reads: Vec<StageId>,

    pub retry_policy: RetryPolicy,

    /// Overrides the orchestrator's default step timeout
    pub timeout_seconds: Option<u64>,

    pub handler: Arc<dyn StageHandler>,
}

impl StageDescriptor {
    pub fn new(id: StageId, label: impl Into<String>, handler: Arc<dyn StageHandler>) -> Self {
        Self {
            id,
            order: 0,
            label: label.into(),
            reads: Vec::new(),
            retry_policy: RetryPolicy::default(),
            timeout_seconds: None,
            handler,
        }
    }

    pub fn reads(mut self, stages: &[StageId]) -> Self {
        self.reads = stages.to_vec();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Effective timeout for one executor invocation
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

impl fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("id", &self.id)
            .field("order", &self.order)
            .field("label", &self.label)
            .field("reads", &self.reads)
            .field("retry_policy", &self.retry_policy)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

/// Per-stage policy overrides, as loaded from config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOverride {
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Ordered, validated set of stage descriptors
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: Vec<StageDescriptor>,
}

impl StageRegistry {
    /// Build a registry, validating order and read dependencies
    pub fn new(mut stages: Vec<StageDescriptor>) -> Result<Self> {
        if stages.is_empty() {
            anyhow::bail!("Registry must have at least one stage");
        }

        let mut seen: HashSet<StageId> = HashSet::new();
        for (i, stage) in stages.iter_mut().enumerate() {
            stage.order = i;

            if !seen.insert(stage.id) {
                anyhow::bail!("Stage '{}' is registered twice", stage.id);
            }

            if stage.retry_policy.max_attempts == 0 {
                anyhow::bail!("Stage '{}' must allow at least one attempt", stage.id);
            }

            // Reads may only point at stages registered earlier
            for dep in &stage.reads {
                if *dep == stage.id || !seen.contains(dep) {
                    anyhow::bail!(
                        "Stage '{}' reads '{}', which is not an earlier stage",
                        stage.id,
                        dep
                    );
                }
            }
        }

        // Stage ids order the completed list, so registry order must agree
        if stages.windows(2).any(|w| w[0].id >= w[1].id) {
            anyhow::bail!("Stages must be registered in declared stage order");
        }

        Ok(Self { stages })
    }

    /// Apply retry/timeout overrides by stage id
    pub fn with_overrides(mut self, overrides: &HashMap<StageId, StageOverride>) -> Self {
        for stage in &mut self.stages {
            if let Some(o) = overrides.get(&stage.id) {
                if let Some(ref policy) = o.retry_policy {
                    if policy.max_attempts > 0 {
                        stage.retry_policy = policy.clone();
                    }
                }
                if o.timeout_seconds.is_some() {
                    stage.timeout_seconds = o.timeout_seconds;
                }
            }
        }
        self
    }

    /// Set one retry policy on every stage
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        for stage in &mut self.stages {
            stage.retry_policy = policy.clone();
        }
        self
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn get(&self, id: StageId) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn first(&self) -> Option<&StageDescriptor> {
        self.stages.first()
    }

    /// Stage that runs after `completed` (or the first one)
    pub fn next_after(&self, completed: Option<StageId>) -> Option<&StageDescriptor> {
        match completed {
            None => self.stages.first(),
            Some(id) => {
                let idx = self.stages.iter().position(|s| s.id == id)?;
                self.stages.get(idx + 1)
            }
        }
    }

    pub fn is_final(&self, id: StageId) -> bool {
        self.stages.last().map(|s| s.id) == Some(id)
    }
}

/// Retry policy for failed stage attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Retry without waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stages::testing::StaticHandler;
    use serde_json::json;

    fn descriptor(id: StageId) -> StageDescriptor {
        StageDescriptor::new(id, id.as_str(), Arc::new(StaticHandler(json!({}))))
    }

    #[test]
    fn test_registry_orders_and_navigates() {
        let registry = StageRegistry::new(vec![
            descriptor(StageId::Research),
            descriptor(StageId::Outline).reads(&[StageId::Research]),
            descriptor(StageId::Draft).reads(&[StageId::Outline]),
        ])
        .unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get(StageId::Draft).unwrap().order, 2);
        assert_eq!(registry.next_after(None).unwrap().id, StageId::Research);
        assert_eq!(
            registry.next_after(Some(StageId::Research)).unwrap().id,
            StageId::Outline
        );
        assert!(registry.next_after(Some(StageId::Draft)).is_none());
        assert!(registry.is_final(StageId::Draft));
        assert!(!registry.is_final(StageId::Outline));
    }

    #[test]
    fn test_forward_read_rejected() {
        let err = StageRegistry::new(vec![
            descriptor(StageId::Research).reads(&[StageId::Outline]),
            descriptor(StageId::Outline),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("not an earlier stage"));
    }

    #[test]
    fn test_out_of_order_registration_rejected() {
        assert!(StageRegistry::new(vec![
            descriptor(StageId::Draft),
            descriptor(StageId::Research),
        ])
        .is_err());
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        assert!(StageRegistry::new(vec![
            descriptor(StageId::Research),
            descriptor(StageId::Research),
        ])
        .is_err());
    }

    #[test]
    fn test_overrides_apply_by_id() {
        let mut overrides = HashMap::new();
        overrides.insert(
            StageId::Outline,
            StageOverride {
                retry_policy: Some(RetryPolicy::immediate(5)),
                timeout_seconds: Some(12),
            },
        );

        let registry = StageRegistry::new(vec![
            descriptor(StageId::Research),
            descriptor(StageId::Outline),
        ])
        .unwrap()
        .with_overrides(&overrides);

        let outline = registry.get(StageId::Outline).unwrap();
        assert_eq!(outline.retry_policy.max_attempts, 5);
        assert_eq!(outline.timeout(Duration::from_secs(300)), Duration::from_secs(12));

        let research = registry.get(StageId::Research).unwrap();
        assert_eq!(research.retry_policy, RetryPolicy::default());
        assert_eq!(research.timeout(Duration::from_secs(300)), Duration::from_secs(300));
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_immediate_policy() {
        let policy = RetryPolicy::immediate(2);
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[test]
    fn test_override_yaml_parsing() {
        let yaml = r#"
retry_policy:
  max_attempts: 4
  initial_delay_ms: 250
timeout_seconds: 90
"#;
        let parsed: StageOverride = serde_yaml::from_str(yaml).unwrap();
        let policy = parsed.retry_policy.unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.initial_delay_ms, 250);
        assert_eq!(policy.max_delay_ms, 30000);
        assert_eq!(parsed.timeout_seconds, Some(90));
    }
}
