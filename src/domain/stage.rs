//! Stage identities and the results they produce.
//!
//! A stage result is what a single stage hands back to the orchestrator:
//! the validated output payload plus the bookkeeping needed for auditing.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of one of the fixed generation stages.
///
/// Declaration order is execution order; `Ord` follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Research,
    ToneAnalysis,
    Outline,
    Draft,
    Optimization,
    OriginalityCheck,
    FinalPolish,
}

impl StageId {
    /// All stages in declared order
    pub const ALL: [StageId; 7] = [
        StageId::Research,
        StageId::ToneAnalysis,
        StageId::Outline,
        StageId::Draft,
        StageId::Optimization,
        StageId::OriginalityCheck,
        StageId::FinalPolish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Research => "research",
            StageId::ToneAnalysis => "tone_analysis",
            StageId::Outline => "outline",
            StageId::Draft => "draft",
            StageId::Optimization => "optimization",
            StageId::OriginalityCheck => "originality_check",
            StageId::FinalPolish => "final_polish",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Token accounting for one or more generation calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,

    /// Estimated cost in USD
    pub cost_usd: f64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            cost_usd: 0.0,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Fill in `cost_usd` from a per-1k-token price
    pub fn priced(mut self, cost_per_1k_tokens: f64) -> Self {
        self.cost_usd = self.total_tokens() as f64 / 1000.0 * cost_per_1k_tokens;
        self
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// How well a stage's generation was grounded by retrieval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grounding {
    /// Stage did not ask for retrieval
    None,

    /// Passages were retrieved and included
    Full,

    /// Retrieval was wanted but unavailable; stage proceeded without it
    Degraded,
}

impl Default for Grounding {
    fn default() -> Self {
        Self::None
    }
}

/// A decision the executor took while producing a stage result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub decision: String,
    pub rationale: String,
}

impl DecisionLogEntry {
    pub fn new(decision: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            decision: decision.into(),
            rationale: rationale.into(),
        }
    }
}

/// Before/after snapshot of content rewritten by a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentDiff {
    pub before: String,
    pub after: String,
    pub words_before: usize,
    pub words_after: usize,
}

impl ContentDiff {
    pub fn new(before: impl Into<String>, after: impl Into<String>) -> Self {
        let before = before.into();
        let after = after.into();
        Self {
            words_before: before.split_whitespace().count(),
            words_after: after.split_whitespace().count(),
            before,
            after,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        self.before == self.after
    }

    pub fn word_delta(&self) -> i64 {
        self.words_after as i64 - self.words_before as i64
    }
}

/// Quality marker attached to a stage result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityBadge {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl QualityBadge {
    pub fn new(name: impl Into<String>, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed,
            detail: detail.into(),
        }
    }
}

/// Output of one successfully executed stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageId,

    /// Validated output payload
    pub output: serde_json::Value,

    pub duration_ms: u64,
    pub usage: TokenUsage,

    /// Number of executor attempts it took (1 = first try)
    pub attempts: u32,

    #[serde(default)]
    pub grounding: Grounding,

    #[serde(default)]
    pub decisions: Vec<DecisionLogEntry>,

    #[serde(default)]
    pub diffs: Vec<ContentDiff>,

    #[serde(default)]
    pub badges: Vec<QualityBadge>,
}

impl StageResult {
    pub fn new(stage: StageId, output: serde_json::Value) -> Self {
        Self {
            stage,
            output,
            duration_ms: 0,
            usage: TokenUsage::default(),
            attempts: 1,
            grounding: Grounding::None,
            decisions: Vec::new(),
            diffs: Vec::new(),
            badges: Vec::new(),
        }
    }

    /// Main prose content, for stages that produce it
    pub fn content(&self) -> Option<&str> {
        self.output.get("content").and_then(|c| c.as_str())
    }
}
