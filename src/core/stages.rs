//! Stage contract and the seven generative stages.
//!
//! Every stage is a `StageHandler`. The standard stages are all the same
//! `GenerativeStage` type, differing only in data: prompt template, output
//! schema, retrieval requirement, and what to diff and badge.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::registry::{RetrievalRequirement, StageDescriptor};
use super::schema::{FieldKind, OutputSchema};
use crate::adapters::{
    estimate_tokens, GenerationClient, GenerationOptions, Passage, RetrievalClient, RetrievalScope,
};
use crate::domain::{
    ContentDiff, ContentRequest, DecisionLogEntry, Grounding, PipelineState, QualityBadge,
    StageId, TokenUsage,
};
use crate::errors::GenerationError;

const DEFAULT_WORD_COUNT: u32 = 1500;
const RETRIEVAL_LIMIT: usize = 5;
const ORIGINALITY_THRESHOLD: f64 = 0.85;

/// Everything a stage may see: the request, declared prior outputs, and
/// any instructions injected at the preceding checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInput {
    pub execution_id: Uuid,
    pub stage: StageId,
    pub request: ContentRequest,
    pub prior: BTreeMap<StageId, Value>,
    pub instructions: Option<String>,
}

impl StageInput {
    /// Assemble the input for `descriptor` from completed outputs.
    ///
    /// Only the stages the descriptor declares are visible.
    pub fn build(
        state: &PipelineState,
        descriptor: &StageDescriptor,
        instructions: Option<String>,
    ) -> Result<Self, String> {
        let mut prior = BTreeMap::new();
        for dep in &descriptor.reads {
            let output = state.output(*dep).ok_or_else(|| {
                format!(
                    "stage '{}' needs output of '{}', which has not completed",
                    descriptor.id, dep
                )
            })?;
            prior.insert(*dep, output.clone());
        }

        Ok(Self {
            execution_id: state.execution_id,
            stage: descriptor.id,
            request: state.request.clone(),
            prior,
            instructions,
        })
    }

    /// Output of a prior stage
    pub fn prior(&self, stage: StageId) -> Option<&Value> {
        self.prior.get(&stage)
    }

    /// `content` field of a prior stage's output
    pub fn prior_content(&self, stage: StageId) -> Option<&str> {
        self.prior(stage)
            .and_then(|v| v.get("content"))
            .and_then(Value::as_str)
    }

    /// Stable fingerprint: "{execution_id}:{stage}:{input_hash}"
    pub fn fingerprint(&self) -> String {
        let body = serde_json::to_string(&(&self.request, &self.prior, &self.instructions))
            .unwrap_or_default();
        format!("{}:{}:{}", self.execution_id, self.stage, hash_input(&body))
    }
}

/// Hash input content (first 16 hex chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

/// Per-attempt execution context
#[derive(Debug, Clone, Copy)]
pub struct StageContext {
    pub attempt: u32,
    pub timeout: Duration,
}

/// What a handler produces on success
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub output: Value,
    pub usage: TokenUsage,
    pub grounding: Grounding,
    pub passages_used: usize,
    pub decisions: Vec<DecisionLogEntry>,
    pub diffs: Vec<ContentDiff>,
    pub badges: Vec<QualityBadge>,
}

impl StageOutcome {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            usage: TokenUsage::default(),
            grounding: Grounding::None,
            passages_used: 0,
            decisions: Vec::new(),
            diffs: Vec::new(),
            badges: Vec::new(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// A failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageAttemptError {
    pub reason: String,

    /// Worth another attempt under the stage's retry policy
    pub retryable: bool,
}

impl StageAttemptError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

impl From<GenerationError> for StageAttemptError {
    fn from(err: GenerationError) -> Self {
        Self::retryable(err.to_string())
    }
}

impl std::fmt::Display for StageAttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Uniform contract for one stage
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn execute(
        &self,
        input: &StageInput,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageAttemptError>;

    /// Schema the stage's output must satisfy, used to check edits
    fn schema(&self) -> Option<&OutputSchema> {
        None
    }
}

/// Generation settings shared by all generative stages
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationDefaults {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub cost_per_1k_tokens: f64,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: None,
            temperature: None,
            cost_per_1k_tokens: 0.0,
        }
    }
}

type BadgeFn = fn(&Value, &StageInput) -> Vec<QualityBadge>;

/// A stage that renders a prompt, calls generation, and validates JSON
pub struct GenerativeStage {
    stage: StageId,
    template: &'static str,
    schema: OutputSchema,
    retrieval: RetrievalRequirement,

    /// Prior stage whose `content` this stage rewrites
    diff_against: Option<StageId>,

    badges: BadgeFn,
    generator: Arc<dyn GenerationClient>,
    retriever: Option<Arc<dyn RetrievalClient>>,
    defaults: GenerationDefaults,
}

impl GenerativeStage {
    pub fn new(
        stage: StageId,
        template: &'static str,
        schema: OutputSchema,
        generator: Arc<dyn GenerationClient>,
    ) -> Self {
        Self {
            stage,
            template,
            schema,
            retrieval: RetrievalRequirement::None,
            diff_against: None,
            badges: no_badges,
            generator,
            retriever: None,
            defaults: GenerationDefaults::default(),
        }
    }

    pub fn with_retrieval(
        mut self,
        requirement: RetrievalRequirement,
        retriever: Option<Arc<dyn RetrievalClient>>,
    ) -> Self {
        self.retrieval = requirement;
        self.retriever = retriever;
        self
    }

    pub fn diff_against(mut self, stage: StageId) -> Self {
        self.diff_against = Some(stage);
        self
    }

    pub fn with_badges(mut self, badges: BadgeFn) -> Self {
        self.badges = badges;
        self
    }

    pub fn with_defaults(mut self, defaults: GenerationDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    async fn gather_passages(
        &self,
        input: &StageInput,
        decisions: &mut Vec<DecisionLogEntry>,
    ) -> Result<(Vec<Passage>, Grounding), StageAttemptError> {
        if self.retrieval == RetrievalRequirement::None {
            return Ok((Vec::new(), Grounding::None));
        }

        let Some(ref retriever) = self.retriever else {
            if self.retrieval == RetrievalRequirement::Mandatory {
                return Err(StageAttemptError::fatal(format!(
                    "stage '{}' requires retrieval but none is configured",
                    self.stage
                )));
            }
            return Ok((Vec::new(), Grounding::None));
        };

        let mut query = input.request.topic.clone();
        if !input.request.keywords.is_empty() {
            query.push(' ');
            query.push_str(&input.request.keywords.join(" "));
        }
        let scope = RetrievalScope {
            identity: input.request.identity.clone(),
            limit: RETRIEVAL_LIMIT,
        };

        match retriever.retrieve(&query, &scope).await {
            Ok(passages) => {
                decisions.push(DecisionLogEntry::new(
                    format!("grounded with {} passage(s)", passages.len()),
                    format!("retrieval via '{}'", retriever.name()),
                ));
                Ok((passages, Grounding::Full))
            }
            Err(e) if self.retrieval == RetrievalRequirement::Mandatory => Err(
                StageAttemptError::retryable(format!("mandatory retrieval failed: {}", e)),
            ),
            Err(e) => {
                decisions.push(DecisionLogEntry::new(
                    "proceeding without retrieval",
                    e.to_string(),
                ));
                Ok((Vec::new(), Grounding::Degraded))
            }
        }
    }

    fn render(&self, input: &StageInput, passages: &[Passage]) -> String {
        let request = &input.request;
        let keywords = if request.keywords.is_empty() {
            "(none)".to_string()
        } else {
            request.keywords.join(", ")
        };
        let context = if input.prior.is_empty() {
            "(none)".to_string()
        } else {
            serde_json::to_string_pretty(&input.prior).unwrap_or_default()
        };
        let passages_text = if passages.is_empty() {
            "(none)".to_string()
        } else {
            passages
                .iter()
                .enumerate()
                .map(|(i, p)| format!("[{}] ({}) {}", i + 1, p.source_id, p.text))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let instructions = input
            .instructions
            .as_deref()
            .map(|i| format!("\nAdditional instructions from the editor:\n{}\n", i))
            .unwrap_or_default();

        let word_count = request
            .target_word_count
            .unwrap_or(DEFAULT_WORD_COUNT)
            .to_string();
        let body = fill_template(self.template, |name| match name {
            "topic" => Some(request.topic.as_str()),
            "audience" => Some(request.audience.as_deref().unwrap_or("general readers")),
            "tone" => Some(request.tone.as_deref().unwrap_or("not specified")),
            "keywords" => Some(keywords.as_str()),
            "word_count" => Some(word_count.as_str()),
            "brief" => Some(request.brief.as_deref().unwrap_or("(none)")),
            "context" => Some(context.as_str()),
            "passages" => Some(passages_text.as_str()),
            _ => None,
        });

        format!(
            "{}{}\n{}",
            body,
            instructions,
            describe_schema(&self.schema)
        )
    }
}

/// Substitute `{name}` placeholders in one pass over the template.
///
/// Substituted text is never scanned again, so values that themselves
/// contain braces pass through verbatim. Unknown placeholders are kept.
fn fill_template<'a>(template: &str, lookup: impl Fn(&str) -> Option<&'a str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after
            .find('}')
            .and_then(|close| lookup(&after[..close]).map(|v| (v, close)));
        match value {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[async_trait]
impl StageHandler for GenerativeStage {
    async fn execute(
        &self,
        input: &StageInput,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageAttemptError> {
        let mut decisions = Vec::new();
        let (passages, grounding) = self.gather_passages(input, &mut decisions).await?;
        let prompt = self.render(input, &passages);

        let mut options = GenerationOptions::new(input.request.identity.clone(), ctx.timeout);
        options.model = self.defaults.model.clone();
        options.max_tokens = self.defaults.max_tokens;
        options.temperature = self.defaults.temperature;

        let generated = self.generator.generate(&prompt, &options).await?;
        let usage = generated
            .usage
            .unwrap_or_else(|| {
                TokenUsage::new(estimate_tokens(&prompt), estimate_tokens(&generated.text))
            })
            .priced(self.defaults.cost_per_1k_tokens);

        let mut output = self
            .schema
            .parse(&generated.text)
            .map_err(|e| StageAttemptError::retryable(format!("invalid output: {}", e)))?;

        if grounding == Grounding::Degraded {
            if let Some(obj) = output.as_object_mut() {
                obj.insert("grounding_degraded".to_string(), Value::Bool(true));
            }
        }

        let mut diffs = Vec::new();
        if let Some(source) = self.diff_against {
            if let (Some(before), Some(after)) = (
                input.prior_content(source),
                output.get("content").and_then(Value::as_str),
            ) {
                diffs.push(ContentDiff::new(before, after));
            }
        }

        let badges = (self.badges)(&output, input);

        Ok(StageOutcome {
            output,
            usage,
            grounding,
            passages_used: passages.len(),
            decisions,
            diffs,
            badges,
        })
    }

    fn schema(&self) -> Option<&OutputSchema> {
        Some(&self.schema)
    }
}

fn describe_schema(schema: &OutputSchema) -> String {
    let fields = schema
        .fields()
        .iter()
        .map(|f| {
            format!(
                "  \"{}\": {:?}{}",
                f.name,
                f.kind,
                if f.required { "" } else { " (optional)" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("Respond with a single JSON object with these fields:\n{}", fields)
}

fn no_badges(_: &Value, _: &StageInput) -> Vec<QualityBadge> {
    Vec::new()
}

fn word_count_badge(output: &Value, input: &StageInput) -> Vec<QualityBadge> {
    let Some(content) = output.get("content").and_then(Value::as_str) else {
        return Vec::new();
    };
    let target = input.request.target_word_count.unwrap_or(DEFAULT_WORD_COUNT) as f64;
    let words = content.split_whitespace().count() as f64;
    let ratio = words / target;
    vec![QualityBadge::new(
        "word_count_target",
        (0.8..=1.2).contains(&ratio),
        format!("{} words against a target of {}", words, target),
    )]
}

fn originality_badge(output: &Value, _: &StageInput) -> Vec<QualityBadge> {
    let Some(score) = output.get("originality_score").and_then(Value::as_f64) else {
        return Vec::new();
    };
    vec![QualityBadge::new(
        "original",
        score >= ORIGINALITY_THRESHOLD,
        format!("originality score {:.2}", score),
    )]
}

const RESEARCH_TEMPLATE: &str = "\
You are a research analyst preparing material for a long-form article.
Topic: {topic}
Audience: {audience}
Seed keywords: {keywords}
Brief: {brief}

Supporting passages:
{passages}

Identify the search keywords to target, the key points the article must cover,
and the sources worth citing.";

const TONE_TEMPLATE: &str = "\
You are an editor defining the voice of an article.
Topic: {topic}
Audience: {audience}
Requested tone: {tone}

Research so far:
{context}

Describe the tone and give concrete voice guidelines.";

const OUTLINE_TEMPLATE: &str = "\
You are outlining a long-form article of about {word_count} words.
Topic: {topic}
Audience: {audience}

Research and voice guidance:
{context}

Produce a title and an ordered list of sections, each with a heading and the
points it covers.";

const DRAFT_TEMPLATE: &str = "\
Write the full article of about {word_count} words following the outline.
Topic: {topic}
Audience: {audience}

Research, voice guidance and outline:
{context}

Supporting passages:
{passages}

Return the article as markdown in the content field.";

const OPTIMIZATION_TEMPLATE: &str = "\
Optimize the draft for search and readability without changing its meaning.
Target keywords come from the research below.

Research and draft:
{context}

Return the revised article and a list of the changes you made.";

const ORIGINALITY_TEMPLATE: &str = "\
Review the article for originality. Score it from 0.0 (derivative) to 1.0
(fully original) and list any passages that read as copied or generic.

Article:
{context}";

const FINAL_POLISH_TEMPLATE: &str = "\
Give the article a final polish in the agreed voice. Rework any passages
flagged by the originality review. Keep it close to {word_count} words.

Voice guidance, optimized article and originality review:
{context}

Return the finished article and a two-sentence summary.";

/// Descriptors for the seven standard stages, in order
pub fn standard_stages(
    generator: Arc<dyn GenerationClient>,
    retriever: Option<Arc<dyn RetrievalClient>>,
    defaults: GenerationDefaults,
) -> Vec<StageDescriptor> {
    let stage = |id: StageId, template: &'static str, schema: OutputSchema| {
        GenerativeStage::new(id, template, schema, generator.clone())
            .with_defaults(defaults.clone())
    };

    let research = stage(
        StageId::Research,
        RESEARCH_TEMPLATE,
        OutputSchema::new()
            .require("keywords", FieldKind::StringArray)
            .require("key_points", FieldKind::StringArray)
            .optional("sources", FieldKind::Array),
    )
    .with_retrieval(RetrievalRequirement::Optional, retriever.clone());

    let tone = stage(
        StageId::ToneAnalysis,
        TONE_TEMPLATE,
        OutputSchema::new()
            .require("tone", FieldKind::String)
            .require("voice_guidelines", FieldKind::StringArray),
    );

    let outline = stage(
        StageId::Outline,
        OUTLINE_TEMPLATE,
        OutputSchema::new()
            .require("title", FieldKind::String)
            .require("sections", FieldKind::Array),
    );

    let draft = stage(
        StageId::Draft,
        DRAFT_TEMPLATE,
        OutputSchema::new().require("content", FieldKind::String),
    )
    .with_retrieval(RetrievalRequirement::Optional, retriever)
    .with_badges(word_count_badge);

    let optimization = stage(
        StageId::Optimization,
        OPTIMIZATION_TEMPLATE,
        OutputSchema::new()
            .require("content", FieldKind::String)
            .optional("changes", FieldKind::StringArray),
    )
    .diff_against(StageId::Draft);

    let originality = stage(
        StageId::OriginalityCheck,
        ORIGINALITY_TEMPLATE,
        OutputSchema::new()
            .require("originality_score", FieldKind::Number)
            .optional("flagged_passages", FieldKind::Array),
    )
    .with_badges(originality_badge);

    let polish = stage(
        StageId::FinalPolish,
        FINAL_POLISH_TEMPLATE,
        OutputSchema::new()
            .require("content", FieldKind::String)
            .optional("summary", FieldKind::String),
    )
    .diff_against(StageId::Optimization)
    .with_badges(word_count_badge);

    vec![
        StageDescriptor::new(StageId::Research, "Research", Arc::new(research)),
        StageDescriptor::new(StageId::ToneAnalysis, "Tone analysis", Arc::new(tone))
            .reads(&[StageId::Research]),
        StageDescriptor::new(StageId::Outline, "Outline", Arc::new(outline))
            .reads(&[StageId::Research, StageId::ToneAnalysis]),
        StageDescriptor::new(StageId::Draft, "Draft", Arc::new(draft)).reads(&[
            StageId::Research,
            StageId::ToneAnalysis,
            StageId::Outline,
        ]),
        StageDescriptor::new(StageId::Optimization, "Optimization", Arc::new(optimization))
            .reads(&[StageId::Research, StageId::Draft]),
        StageDescriptor::new(
            StageId::OriginalityCheck,
            "Originality check",
            Arc::new(originality),
        )
        .reads(&[StageId::Optimization]),
        StageDescriptor::new(StageId::FinalPolish, "Final polish", Arc::new(polish)).reads(&[
            StageId::ToneAnalysis,
            StageId::Optimization,
            StageId::OriginalityCheck,
        ]),
    ]
}
