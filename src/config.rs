//! Configuration for longform.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (LONGFORM_HOME, LONGFORM_GENERATION_ENDPOINT,
//!    LONGFORM_API_KEY, LONGFORM_MODEL, LONGFORM_GENERATION_COMMAND,
//!    LONGFORM_RETRIEVAL_ENDPOINT, LONGFORM_RETRIEVAL_API_KEY)
//! 2. Config file (.longform/config.yaml)
//! 3. Defaults (~/.longform)
//!
//! Config file discovery:
//! - Searches current directory and parents for .longform/config.yaml
//! - `paths.home` is relative to the .longform/ directory

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{OrchestratorSettings, RetryPolicy, StageOverride};
use crate::domain::StageId;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const DEFAULT_FABRIC_PATTERN: &str = "raw_query";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: Option<RetrievalConfig>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub stages: HashMap<StageId, StageOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .longform/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationConfig {
    /// "http", "command" or "fabric"
    pub backend: Option<String>,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// Program and arguments for the command backend
    #[serde(default)]
    pub command: Vec<String>,
    pub pattern: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub cost_per_1k_tokens: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

/// Orchestrator settings; durations in seconds
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorConfig {
    pub checkpoint_ttl_seconds: Option<u64>,
    pub saved_session_ttl_seconds: Option<u64>,
    pub step_timeout_seconds: Option<u64>,
    pub heartbeat_seconds: Option<u64>,
    pub event_buffer: Option<usize>,
    pub terminal_send_timeout_seconds: Option<u64>,
}

impl OrchestratorConfig {
    fn apply(&self, mut settings: OrchestratorSettings) -> OrchestratorSettings {
        let secs = Duration::from_secs;
        if let Some(s) = self.checkpoint_ttl_seconds {
            settings.checkpoint_ttl = secs(s);
        }
        if let Some(s) = self.saved_session_ttl_seconds {
            settings.saved_session_ttl = secs(s);
        }
        if let Some(s) = self.step_timeout_seconds {
            settings.default_step_timeout = secs(s);
        }
        if let Some(s) = self.heartbeat_seconds {
            settings.heartbeat_interval = secs(s);
        }
        if let Some(n) = self.event_buffer {
            settings.event_buffer = n;
        }
        if let Some(s) = self.terminal_send_timeout_seconds {
            settings.terminal_send_timeout = secs(s);
        }
        settings
    }
}

/// Which generation capability to use
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum GenerationBackend {
    Http {
        endpoint: String,
        #[serde(skip_serializing)]
        api_key: Option<String>,
        model: Option<String>,
    },
    Command {
        program: String,
        args: Vec<String>,
    },
    Fabric {
        pattern: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationSettings {
    pub backend: GenerationBackend,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub cost_per_1k_tokens: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalSettings {
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to longform home (database, event logs)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub settings: OrchestratorSettings,
    pub generation: GenerationSettings,
    pub retrieval: Option<RetrievalSettings>,
    /// Applied to every stage before per-stage overrides
    pub retry: Option<RetryPolicy>,
    pub stage_overrides: HashMap<StageId, StageOverride>,
}

impl ResolvedConfig {
    pub fn database_path(&self) -> PathBuf {
        self.home.join("longform.db")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".longform").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn resolve_generation<E>(config: &GenerationConfig, env: &E) -> Result<GenerationSettings>
where
    E: Fn(&str) -> Option<String>,
{
    let endpoint = env("LONGFORM_GENERATION_ENDPOINT").or_else(|| config.endpoint.clone());
    let command = env("LONGFORM_GENERATION_COMMAND")
        .map(|c| c.split_whitespace().map(str::to_string).collect::<Vec<_>>())
        .unwrap_or_else(|| config.command.clone());

    // An explicit endpoint or command in the environment picks the backend
    let backend_name = if env("LONGFORM_GENERATION_ENDPOINT").is_some() {
        "http".to_string()
    } else if env("LONGFORM_GENERATION_COMMAND").is_some() {
        "command".to_string()
    } else {
        config.backend.clone().unwrap_or_else(|| {
            if endpoint.is_some() {
                "http".to_string()
            } else if !command.is_empty() {
                "command".to_string()
            } else {
                "fabric".to_string()
            }
        })
    };

    let backend = match backend_name.as_str() {
        "http" => GenerationBackend::Http {
            endpoint: endpoint.context("generation backend 'http' needs an endpoint")?,
            api_key: env("LONGFORM_API_KEY").or_else(|| config.api_key.clone()),
            model: env("LONGFORM_MODEL").or_else(|| config.model.clone()),
        },
        "command" => {
            let mut parts = command.into_iter();
            let program = parts
                .next()
                .context("generation backend 'command' needs a command")?;
            GenerationBackend::Command {
                program,
                args: parts.collect(),
            }
        }
        "fabric" => GenerationBackend::Fabric {
            pattern: config
                .pattern
                .clone()
                .unwrap_or_else(|| DEFAULT_FABRIC_PATTERN.to_string()),
        },
        other => anyhow::bail!("unknown generation backend '{}'", other),
    };

    Ok(GenerationSettings {
        backend,
        max_tokens: config.max_tokens,
        temperature: config.temperature,
        cost_per_1k_tokens: config.cost_per_1k_tokens.unwrap_or(0.0),
    })
}

/// Resolve configuration from a parsed file (if any) and an environment
fn resolve<E>(
    file: Option<(&Path, ConfigFile)>,
    env: E,
    default_home: PathBuf,
) -> Result<ResolvedConfig>
where
    E: Fn(&str) -> Option<String>,
{
    let (config_file, config) = match file {
        Some((path, config)) => (Some(path.to_path_buf()), config),
        None => (None, ConfigFile::default()),
    };

    let home = if let Some(env_home) = env("LONGFORM_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(path), Some(home_path)) = (&config_file, &config.paths.home) {
        // home is relative to .longform/ directory
        let longform_dir = path.parent().unwrap_or(Path::new("."));
        resolve_path(longform_dir, home_path)
    } else {
        default_home
    };

    let generation = resolve_generation(&config.generation, &env)?;

    let retrieval = match env("LONGFORM_RETRIEVAL_ENDPOINT") {
        Some(endpoint) => Some(RetrievalSettings {
            endpoint,
            api_key: env("LONGFORM_RETRIEVAL_API_KEY"),
        }),
        None => config.retrieval.map(|r| RetrievalSettings {
            endpoint: r.endpoint,
            api_key: env("LONGFORM_RETRIEVAL_API_KEY").or(r.api_key),
        }),
    };

    Ok(ResolvedConfig {
        home,
        config_file,
        settings: config.orchestrator.apply(OrchestratorSettings::default()),
        generation,
        retrieval,
        retry: config.retry,
        stage_overrides: config.stages,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".longform");

    let file = match find_config_file() {
        Some(path) => {
            let config = load_config_file(&path)?;
            Some((path, config))
        }
        None => None,
    };

    resolve(
        file.as_ref().map(|(p, c)| (p.as_path(), c.clone())),
        |key| std::env::var(key).ok(),
        default_home,
    )
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the longform home directory
pub fn longform_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}
