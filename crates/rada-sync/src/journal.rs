//! Persistent action journal shown on the dashboard.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use rada_core::ActionLogEntry;
use tokio::sync::Mutex;
use tracing::warn;

pub const MAX_LOG_ENTRIES: usize = 100;

/// JSON array of the most recent actions, oldest first.
#[derive(Debug)]
pub struct ActionLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ActionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn append(&self, action: &str, details: &str) -> Result<()> {
        let _held = self.write_lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.push(ActionLogEntry {
            timestamp: Utc::now(),
            action: action.to_string(),
            details: details.to_string(),
        });
        if entries.len() > MAX_LOG_ENTRIES {
            let excess = entries.len() - MAX_LOG_ENTRIES;
            entries.drain(..excess);
        }

        let text = serde_json::to_string_pretty(&entries).context("serializing action log")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming {} -> {}", tmp.display(), self.path.display()))
    }

    /// Last `n` entries, oldest first.
    pub async fn recent(&self, n: usize) -> Result<Vec<ActionLogEntry>> {
        let mut entries = self.read_all().await?;
        let skip = entries.len().saturating_sub(n);
        Ok(entries.split_off(skip))
    }

    async fn read_all(&self) -> Result<Vec<ActionLogEntry>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("reading {}", self.path.display())),
        };
        match serde_json::from_str(&text) {
            Ok(entries) => Ok(entries),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "unreadable action log; starting fresh");
                Ok(Vec::new())
            }
        }
    }
}
