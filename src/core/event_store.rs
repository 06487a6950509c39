//! Append-only event log with file-based persistence.
//!
//! Each execution gets `{base}/executions/{execution_id}/events.jsonl`.
//! Events are stored as newline-delimited JSON so the log can be tailed
//! and inspected by hand.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::EventRecord;

/// File-based event log for one execution
#[derive(Debug, Clone)]
pub struct EventStore {
    execution_dir: PathBuf,
    events_path: PathBuf,
}

impl EventStore {
    /// Create or open the event log for an execution
    pub async fn open(base_dir: &Path, execution_id: Uuid) -> Result<Self> {
        let execution_dir = Self::executions_dir(base_dir).join(execution_id.to_string());

        fs::create_dir_all(&execution_dir).await.with_context(|| {
            format!(
                "Failed to create execution directory: {}",
                execution_dir.display()
            )
        })?;

        let events_path = execution_dir.join("events.jsonl");

        Ok(Self {
            execution_dir,
            events_path,
        })
    }

    pub fn executions_dir(base_dir: &Path) -> PathBuf {
        base_dir.join("executions")
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn execution_dir(&self) -> &Path {
        &self.execution_dir
    }

    /// Append an event to the log
    pub async fn append(&self, record: &EventRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        let json = serde_json::to_string(record).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<EventRecord>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut records = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: EventRecord = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            records.push(record);
        }

        Ok(records)
    }

    /// Sequence number of the last durable event (0 for an empty log)
    pub async fn last_seq(&self) -> Result<u64> {
        let records = self.replay().await?;
        Ok(records.last().map_or(0, |r| r.seq))
    }

    /// List all execution IDs that have a log under `base_dir`
    pub async fn list_executions(base_dir: &Path) -> Result<Vec<Uuid>> {
        let dir = Self::executions_dir(base_dir);

        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut executions = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        executions.push(uuid);
                    }
                }
            }
        }

        Ok(executions)
    }
}
