//! Lightweight routing metrics.
//!
//! Atomic counters for cache hits, classification outcomes, circuit trips,
//! and retry attempts. The routing core only counts; emitting snapshots is
//! the embedding application's job, at whatever cadence suits it, via
//! [`emit`] (appends to `~/.sagebot/metrics.jsonl`) or [`emit_to`]. Emission
//! is best-effort, one JSON object per line, and never fails the caller.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::utils::helpers::{get_data_path, timestamp};

/// Write-only counter registry shared across the routing core.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub intent_heuristic: AtomicU64,
    pub intent_cached: AtomicU64,
    pub intent_llm: AtomicU64,
    pub intent_fallback: AtomicU64,
    pub circuit_rejections: AtomicU64,
    pub retry_attempts: AtomicU64,
    pub commands_blocked: AtomicU64,
    pub sessions_archived: AtomicU64,
}

/// Serializable point-in-time view of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub intent_heuristic: u64,
    pub intent_cached: u64,
    pub intent_llm: u64,
    pub intent_fallback: u64,
    pub circuit_rejections: u64,
    pub retry_attempts: u64,
    pub commands_blocked: u64,
    pub sessions_archived: u64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: timestamp(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            intent_heuristic: self.intent_heuristic.load(Ordering::Relaxed),
            intent_cached: self.intent_cached.load(Ordering::Relaxed),
            intent_llm: self.intent_llm.load(Ordering::Relaxed),
            intent_fallback: self.intent_fallback.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            commands_blocked: self.commands_blocked.load(Ordering::Relaxed),
            sessions_archived: self.sessions_archived.load(Ordering::Relaxed),
        }
    }
}

/// Return the metrics file path (`~/.sagebot/metrics.jsonl`).
pub fn metrics_path() -> PathBuf {
    get_data_path().join("metrics.jsonl")
}

/// Append a snapshot to the default JSONL file.
///
/// The core never calls this itself; embedders decide when to emit (on
/// shutdown, on a timer, after archival). Failures are silently ignored —
/// metrics must never affect the request path.
pub fn emit(snapshot: &MetricsSnapshot) {
    emit_to(snapshot, &metrics_path());
}

/// Append a snapshot to an arbitrary path. Same best-effort contract as
/// [`emit`].
pub fn emit_to(snapshot: &MetricsSnapshot, path: &Path) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let Ok(line) = serde_json::to_string(snapshot) else {
        return;
    };
    let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };
    let _ = writeln!(file, "{}", line);
}
