//! Command-line interface for longform.
//!
//! Provides commands for starting executions, resolving checkpoints,
//! inspecting state and history, and managing saved sessions.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{
    CommandGenerator, GenerationClient, HttpGenerator, HttpRetriever, RetrievalClient,
};
use crate::config::{self, GenerationBackend, ResolvedConfig};
use crate::core::{
    standard_stages, GenerationDefaults, JsonlActivityRecorder, Orchestrator, StageRegistry,
};
use crate::domain::{
    ActionKind, ActionRequest, ContentRequest, EventRecord, ExecutionMode, ExecutionStatus,
    Identity, PipelineEvent, PipelineState, SessionScope, StageId,
};

/// longform - Checkpointable long-form content pipeline
#[derive(Parser, Debug)]
#[command(name = "longform")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a new execution
    Run {
        /// What the article is about
        topic: String,

        #[arg(long, env = "LONGFORM_TENANT")]
        tenant: String,

        #[arg(long, env = "LONGFORM_USER")]
        user: String,

        /// Seed keywords (comma separated)
        #[arg(long, value_delimiter = ',')]
        keywords: Vec<String>,

        #[arg(long)]
        audience: Option<String>,

        #[arg(long)]
        tone: Option<String>,

        /// Target word count for the finished article
        #[arg(long)]
        words: Option<u32>,

        /// Free-form brief
        #[arg(long)]
        brief: Option<String>,

        /// Pause after every stage for review
        #[arg(long)]
        checkpoint: bool,
    },

    /// Show the state of an execution
    Status {
        /// Execution ID (UUID)
        execution_id: String,

        /// Print the final article, if complete
        #[arg(long)]
        content: bool,
    },

    /// List recent executions
    Executions {
        /// Maximum number of executions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Replay the event log of an execution
    History {
        /// Execution ID (UUID)
        execution_id: String,
    },

    /// List saved checkpoint sessions
    Sessions {
        #[arg(long, env = "LONGFORM_TENANT")]
        tenant: String,

        /// Restrict to one user
        #[arg(long)]
        user: Option<String>,
    },

    /// Resolve a checkpoint: approve, edit, approve_all, cancel, save
    Resume {
        session_id: String,

        action: ActionKind,

        /// JSON file holding the replacement output (edit only)
        #[arg(long)]
        edited_file: Option<PathBuf>,

        /// Instructions injected into the next stage
        #[arg(long)]
        instructions: Option<String>,
    },

    /// Cancel a running or paused execution
    Cancel {
        /// Execution ID (UUID)
        execution_id: String,
    },

    /// Delete expired checkpoint sessions
    Purge,

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                topic,
                tenant,
                user,
                keywords,
                audience,
                tone,
                words,
                brief,
                checkpoint,
            } => {
                let mut request =
                    ContentRequest::new(topic, Identity::new(tenant, user)).with_keywords(keywords);
                request.audience = audience;
                request.tone = tone;
                request.target_word_count = words;
                request.brief = brief;
                let mode = if checkpoint {
                    ExecutionMode::Checkpoint
                } else {
                    ExecutionMode::Automatic
                };
                run_execution(request, mode).await
            }
            Commands::Status {
                execution_id,
                content,
            } => show_status(&execution_id, content).await,
            Commands::Executions { limit } => list_executions(limit).await,
            Commands::History { execution_id } => show_history(&execution_id).await,
            Commands::Sessions { tenant, user } => list_sessions(tenant, user).await,
            Commands::Resume {
                session_id,
                action,
                edited_file,
                instructions,
            } => resume_session(session_id, action, edited_file, instructions).await,
            Commands::Cancel { execution_id } => cancel_execution(&execution_id).await,
            Commands::Purge => purge_sessions().await,
            Commands::Config => show_config(),
        }
    }
}

/// Build the generation client the configuration selects
fn build_generator(config: &ResolvedConfig) -> Arc<dyn GenerationClient> {
    match &config.generation.backend {
        GenerationBackend::Http {
            endpoint,
            api_key,
            model,
        } => {
            let mut generator = HttpGenerator::new(endpoint.clone(), api_key.clone());
            if let Some(model) = model {
                generator = generator.with_model(model.clone());
            }
            Arc::new(generator)
        }
        GenerationBackend::Command { program, args } => {
            Arc::new(CommandGenerator::new(program.clone(), args.clone()))
        }
        GenerationBackend::Fabric { pattern } => Arc::new(CommandGenerator::fabric(pattern)),
    }
}

fn build_retriever(config: &ResolvedConfig) -> Option<Arc<dyn RetrievalClient>> {
    config.retrieval.as_ref().map(|retrieval| {
        Arc::new(HttpRetriever::new(
            retrieval.endpoint.clone(),
            retrieval.api_key.clone(),
        )) as Arc<dyn RetrievalClient>
    })
}

/// Wire the configured clients into the standard stage registry
pub fn build_registry(config: &ResolvedConfig) -> Result<StageRegistry> {
    let model = match &config.generation.backend {
        GenerationBackend::Http { model, .. } => model.clone(),
        _ => None,
    };
    let defaults = GenerationDefaults {
        model,
        max_tokens: config.generation.max_tokens,
        temperature: config.generation.temperature,
        cost_per_1k_tokens: config.generation.cost_per_1k_tokens,
    };

    let mut registry = StageRegistry::new(standard_stages(
        build_generator(config),
        build_retriever(config),
        defaults,
    ))?;
    if let Some(policy) = &config.retry {
        registry = registry.with_retry_policy(policy.clone());
    }
    Ok(registry.with_overrides(&config.stage_overrides))
}

/// Build an orchestrator from the resolved configuration
pub fn build_orchestrator(config: &ResolvedConfig) -> Result<Orchestrator> {
    let registry = build_registry(config)?;
    Orchestrator::builder(registry, &config.home)
        .with_settings(config.settings.clone())
        .with_recorder(Arc::new(JsonlActivityRecorder::new(&config.home)))
        .build()
}

fn orchestrator() -> Result<Orchestrator> {
    build_orchestrator(config::config()?)
}

fn parse_execution_id(execution_id: &str) -> Result<Uuid> {
    Uuid::parse_str(execution_id)
        .with_context(|| format!("Invalid execution ID: {}", execution_id))
}

fn print_event(record: &EventRecord) {
    eprintln!("[{:>3}] {}", record.seq, record.summary());
    if let PipelineEvent::CheckpointReached {
        session_id,
        expires_at,
        ..
    } = &record.event
    {
        eprintln!("      session: {}", session_id);
        eprintln!("      expires: {}", expires_at.to_rfc3339());
    }
}

/// Print the final article of a completed execution
fn print_content(state: &PipelineState) {
    let final_output = state.output(StageId::FinalPolish);
    match final_output.and_then(|o| o.get("content")).and_then(|c| c.as_str()) {
        Some(content) => println!("{}", content),
        None => {
            if let Some(output) = final_output {
                println!("{}", output);
            }
        }
    }
}

/// Report how a driver stopped; failures exit non-zero
fn report_outcome(state: &PipelineState) {
    match state.status {
        ExecutionStatus::Completed => {
            print_content(state);
            eprintln!(
                "\n[Execution {} completed: {} tokens, ${:.4}]",
                state.execution_id,
                state.metrics.usage.total_tokens(),
                state.metrics.usage.cost_usd
            );
        }
        ExecutionStatus::WaitingCheckpoint => {
            eprintln!(
                "\n[Execution {} paused after '{}'; resolve with `longform resume <session> <action>`]",
                state.execution_id,
                state
                    .current_stage
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        ExecutionStatus::Failed => {
            let message = state
                .failure
                .as_ref()
                .map(|f| f.message.clone())
                .unwrap_or_else(|| "unknown failure".to_string());
            eprintln!("\n[Execution {} failed: {}]", state.execution_id, message);
            std::process::exit(1);
        }
        _ => {
            eprintln!("\n[Execution {} in state: {}]", state.execution_id, state.status);
        }
    }
}

async fn run_execution(request: ContentRequest, mode: ExecutionMode) -> Result<()> {
    let orchestrator = orchestrator()?;
    let handle = orchestrator.start(request, mode).await?;
    eprintln!("Execution: {}", handle.execution_id);

    let (mut events, task) = handle.into_parts();
    while let Some(record) = events.recv().await {
        if matches!(record.event, PipelineEvent::Heartbeat { .. }) {
            continue;
        }
        print_event(&record);
        // The driver stops on a closing event or at a checkpoint
        if record.event.closes_stream()
            || matches!(record.event, PipelineEvent::CheckpointReached { .. })
        {
            break;
        }
    }

    let state = task.await.context("Execution driver panicked")?;
    report_outcome(&state);
    Ok(())
}

async fn resume_session(
    session_id: String,
    action: ActionKind,
    edited_file: Option<PathBuf>,
    instructions: Option<String>,
) -> Result<()> {
    let mut request = ActionRequest::new(session_id, action);
    if let Some(path) = edited_file {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read edited output: {}", path.display()))?;
        let edited: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("Edited output is not JSON: {}", path.display()))?;
        request.edited_output = Some(edited);
    }
    if let Some(instructions) = instructions {
        request = request.with_instructions(instructions);
    }

    let orchestrator = orchestrator()?;
    let outcome = orchestrator.resume(request).await?;
    let execution_id = outcome.summary.execution_id;

    let Some(state) = outcome.wait().await? else {
        let state = orchestrator.status(execution_id).await?;
        eprintln!("[Execution {} is {}]", execution_id, state.status);
        return Ok(());
    };

    let history = orchestrator.history(execution_id).await?;
    let resolved_at = history
        .iter()
        .rposition(|r| matches!(r.event, PipelineEvent::CheckpointResolved { .. }))
        .unwrap_or(0);
    for record in &history[resolved_at..] {
        print_event(record);
    }
    report_outcome(&state);
    Ok(())
}

async fn show_status(execution_id: &str, content: bool) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    let orchestrator = orchestrator()?;
    let state = orchestrator.status(execution_id).await?;

    println!("Execution ID: {}", state.execution_id);
    println!("Topic: {}", state.request.topic);
    println!(
        "Owner: {}/{}",
        state.request.identity.tenant_id, state.request.identity.user_id
    );
    println!("Mode: {:?}", state.effective_mode());
    println!("Status: {}", state.status);
    println!("Started: {}", state.created_at);
    if let Some(completed) = state.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(failure) = &state.failure {
        println!("Failure: {}", failure.message);
    }
    println!(
        "Usage: {} tokens, ${:.4}",
        state.metrics.usage.total_tokens(),
        state.metrics.usage.cost_usd
    );

    println!("\nStages:");
    for id in orchestrator.registry().ids() {
        let marker = match state.results.get(&id) {
            Some(result) => format!("done ({}ms, {} attempt(s))", result.duration_ms, result.attempts),
            None if state.current_stage == Some(id) => "in progress".to_string(),
            None => "pending".to_string(),
        };
        println!("  {:<18} {}", id, marker);
    }

    if let Some(session) = orchestrator.pending_session(execution_id).await? {
        println!("\nPaused after '{}'", session.paused_stage);
        println!("  session: {}", session.session_id);
        println!("  expires: {}", session.expires_at.to_rfc3339());
    }

    if content && state.status == ExecutionStatus::Completed {
        println!();
        print_content(&state);
    }

    Ok(())
}

async fn list_executions(limit: usize) -> Result<()> {
    let orchestrator = orchestrator()?;
    let states = orchestrator.list_executions(limit).await?;

    if states.is_empty() {
        println!("No executions found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<10} TOPIC", "EXECUTION ID", "STATUS", "STAGES");
    println!("{}", "-".repeat(90));

    for state in states {
        println!(
            "{:<38} {:<20} {:<10} {}",
            state.execution_id,
            state.status,
            format!("{}/{}", state.completed_stages.len(), orchestrator.registry().len()),
            state.request.topic
        );
    }

    Ok(())
}

async fn show_history(execution_id: &str) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    let orchestrator = orchestrator()?;

    for record in orchestrator.history(execution_id).await? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

async fn list_sessions(tenant: String, user: Option<String>) -> Result<()> {
    let scope = match user {
        Some(user) => SessionScope::user(tenant, user),
        None => SessionScope::tenant(tenant),
    };

    let orchestrator = orchestrator()?;
    let sessions = orchestrator.list_saved(&scope).await?;

    if sessions.is_empty() {
        println!("No saved sessions");
        return Ok(());
    }

    println!("{:<70} {:<18} {:<26} TOPIC", "SESSION", "NEXT STAGE", "EXPIRES");
    println!("{}", "-".repeat(130));
    for session in sessions {
        println!(
            "{:<70} {:<18} {:<26} {}",
            session.session_id,
            session.next_stage,
            session.expires_at.to_rfc3339(),
            session.snapshot.request.topic
        );
    }
    Ok(())
}

async fn cancel_execution(execution_id: &str) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    let orchestrator = orchestrator()?;
    let summary = orchestrator.cancel(execution_id).await?;
    eprintln!("[Execution {} is {}]", summary.execution_id, summary.status);
    Ok(())
}

async fn purge_sessions() -> Result<()> {
    let orchestrator = orchestrator()?;
    let purged = orchestrator.purge_expired().await?;
    println!("Purged {} expired session(s)", purged);
    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("longform configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:       {}", cfg.home.display());
    println!("  Database:   {}", cfg.database_path().display());
    println!("  Executions: {}", cfg.home.join("executions").display());
    println!();
    println!("Generation:");
    match &cfg.generation.backend {
        GenerationBackend::Http {
            endpoint, model, ..
        } => {
            println!("  Backend:  http");
            println!("  Endpoint: {}", endpoint);
            println!("  Model:    {}", model.as_deref().unwrap_or("(server default)"));
        }
        GenerationBackend::Command { program, args } => {
            println!("  Backend:  command");
            println!("  Program:  {} {}", program, args.join(" "));
        }
        GenerationBackend::Fabric { pattern } => {
            println!("  Backend:  fabric");
            println!("  Pattern:  {}", pattern);
        }
    }
    println!("  Cost:     ${}/1k tokens", cfg.generation.cost_per_1k_tokens);
    println!();
    match &cfg.retrieval {
        Some(retrieval) => println!("Retrieval: {}", retrieval.endpoint),
        None => println!("Retrieval: (not configured; grounding degrades)"),
    }
    println!();
    println!("Orchestrator:");
    println!("  Checkpoint TTL:    {}s", cfg.settings.checkpoint_ttl.as_secs());
    println!("  Saved session TTL: {}s", cfg.settings.saved_session_ttl.as_secs());
    println!("  Step timeout:      {}s", cfg.settings.default_step_timeout.as_secs());
    println!("  Heartbeat:         {}s", cfg.settings.heartbeat_interval.as_secs());
    println!("  Event buffer:      {}", cfg.settings.event_buffer);
    if !cfg.stage_overrides.is_empty() {
        println!();
        println!("Stage overrides:");
        for (stage, over) in &cfg.stage_overrides {
            println!("  {}: {:?}", stage, over);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_checkpoint() {
        let cli = Cli::try_parse_from([
            "longform",
            "run",
            "Cloud migration ROI",
            "--tenant",
            "acme",
            "--user",
            "u1",
            "--keywords",
            "cloud,roi",
            "--checkpoint",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                topic,
                keywords,
                checkpoint,
                ..
            } => {
                assert_eq!(topic, "Cloud migration ROI");
                assert_eq!(keywords, vec!["cloud", "roi"]);
                assert!(checkpoint);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_resume_action() {
        let cli = Cli::try_parse_from(["longform", "resume", "cs_abc", "approve-all"]).unwrap();
        match cli.command {
            Commands::Resume { action, .. } => assert_eq!(action, ActionKind::ApproveAll),
            other => panic!("unexpected command: {:?}", other),
        }

        assert!(Cli::try_parse_from(["longform", "resume", "cs_abc", "publish"]).is_err());
    }
}
