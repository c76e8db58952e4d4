//! Durable archive store for evicted conversation turns.
//!
//! One JSONL file per conversation: each line is a JSON object with a
//! timestamp and the archived payload. Write failures are surfaced to the
//! caller for logging but must never block the live request path.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::warn;

use crate::utils::helpers::{ensure_dir, get_archive_path, safe_filename};

/// Append-only per-conversation archive on disk.
pub struct ArchiveStore {
    dir: PathBuf,
}

impl ArchiveStore {
    /// Create a store rooted at `dir`, creating it if needed.
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: ensure_dir(dir),
        }
    }

    /// Store rooted at the default location (`~/.sagebot/archive`).
    pub fn at_default_location() -> Self {
        Self {
            dir: get_archive_path(),
        }
    }

    /// Append one archived payload for a conversation.
    ///
    /// Returns the path of the archive file the payload landed in.
    pub fn write(
        &self,
        conversation_id: &str,
        timestamp: DateTime<Utc>,
        payload: &Value,
    ) -> Result<PathBuf> {
        let path = self.archive_path(conversation_id);
        let line = serde_json::to_string(&json!({
            "timestamp": timestamp.to_rfc3339(),
            "payload": payload,
        }))
        .context("serialize archive record")?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open archive file {}", path.display()))?;
        writeln!(file, "{}", line)
            .with_context(|| format!("append to archive file {}", path.display()))?;
        Ok(path)
    }

    /// Read back all archived records for a conversation, oldest first.
    ///
    /// Unreadable files or bad lines are skipped with a warning, never an
    /// error.
    pub fn read(&self, conversation_id: &str) -> Vec<Value> {
        let path = self.archive_path(conversation_id);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        let mut records = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(v) => records.push(v),
                Err(e) => {
                    warn!(
                        "Skipping bad archive line for conversation {}: {}",
                        conversation_id, e
                    );
                }
            }
        }
        records
    }

    fn archive_path(&self, conversation_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", safe_filename(conversation_id)))
    }
}
