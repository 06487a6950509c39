//! Subprocess generation backend.
//!
//! Spawns a command (by default `fabric -p <pattern>`), writes the prompt
//! to stdin and reads the generated text from stdout.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{estimate_tokens, GenerationClient, GenerationOptions, GenerationOutput};
use crate::domain::TokenUsage;
use crate::errors::GenerationError;

/// Generation backend that shells out to a CLI
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `fabric -p <pattern>`, preferring the Homebrew `fabric-ai` name
    pub fn fabric(pattern: &str) -> Self {
        let program = if std::process::Command::new("fabric-ai")
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
        {
            "fabric-ai"
        } else {
            "fabric"
        };

        Self::new(program, vec!["-p".to_string(), pattern.to_string()])
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, GenerationError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("LONGFORM_TENANT_ID", &options.identity.tenant_id)
            .env("LONGFORM_USER_ID", &options.identity.user_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GenerationError::Transport(format!("failed to spawn '{}': {}", self.program, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| GenerationError::Transport(format!("failed to write prompt: {}", e)))?;
            // Dropping stdin signals EOF
        }

        let output = timeout(options.timeout, child.wait_with_output())
            .await
            .map_err(|_| GenerationError::Timeout(options.timeout))?
            .map_err(|e| GenerationError::Transport(format!("failed to wait for process: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(GenerationError::Transport(format!(
                "'{}' exited with code {}: {}",
                self.program,
                exit_code,
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|_| GenerationError::InvalidResponse("output is not valid UTF-8".to_string()))
    }
}

#[async_trait]
impl GenerationClient for CommandGenerator {
    fn name(&self) -> &str {
        "command"
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationOutput, GenerationError> {
        debug!(program = %self.program, prompt_chars = prompt.len(), "Spawning generator");
        let text = self.run(prompt, options).await?;
        let usage = TokenUsage::new(estimate_tokens(prompt), estimate_tokens(&text));
        Ok(GenerationOutput::new(text).with_usage(usage))
    }
}
