//! Normalized query → response cache.
//!
//! Semantically identical queries must hit the same entry, so keys are
//! normalized (case-folded, whitespace-collapsed, one trailing `?`
//! stripped). Capacity-bounded with LRU eviction; stale entries are treated
//! as misses and evicted lazily on access.
//!
//! Responses produced by side-effecting tools are never stored: replaying a
//! shell command's output as a cached answer would be wrong even when the
//! text matches.
//!
//! The cache can snapshot itself to a JSON file and reload on startup; a
//! missing or corrupt snapshot is treated as empty, never fatal.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::schema::QueryCacheConfig;

/// One cached response, as served on a hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub answer: String,
    pub tools_used: Vec<String>,
    pub token_count: u64,
}

struct CacheEntry {
    answer: String,
    tools_used: Vec<String>,
    token_count: u64,
    created_at: DateTime<Utc>,
    last_used: Instant,
}

/// Serialized snapshot format.
#[derive(Debug, Serialize, Deserialize, Default)]
struct SnapshotFile {
    entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotEntry {
    normalized_query: String,
    answer: String,
    tools_used: Vec<String>,
    token_count: u64,
    created_at: DateTime<Utc>,
}

/// Canonicalize a query so semantically identical forms share a cache key.
pub fn normalize(query: &str) -> String {
    static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
    let collapsed = WS_RE.replace_all(query.trim(), " ").to_string();
    let lower = collapsed.to_lowercase();
    lower.strip_suffix('?').unwrap_or(&lower).trim_end().to_string()
}

/// Bounded, TTL-aware query response cache. Thread-safe; writes are
/// last-writer-wins.
pub struct QueryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
    ttl: Duration,
    side_effect_tools: HashSet<String>,
}

impl QueryCache {
    pub fn new(config: &QueryCacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: config.max_entries.max(1),
            ttl: Duration::from_secs(config.ttl_secs),
            side_effect_tools: config.side_effect_tools.iter().cloned().collect(),
        }
    }

    /// Look up a query. A stale entry counts as a miss and is evicted.
    pub fn get(&self, query: &str) -> Option<CachedResponse> {
        let key = normalize(query);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match entries.get_mut(&key) {
            Some(entry) => {
                if Self::age_of(entry.created_at) < self.ttl {
                    entry.last_used = Instant::now();
                    return Some(CachedResponse {
                        answer: entry.answer.clone(),
                        tools_used: entry.tools_used.clone(),
                        token_count: entry.token_count,
                    });
                }
                true
            }
            None => false,
        };
        if expired {
            entries.remove(&key);
        }
        None
    }

    /// Store a response. A no-op (not an error) when `tools_used` includes a
    /// side-effecting tool.
    pub fn put(&self, query: &str, answer: &str, tools_used: &[String], token_count: u64) {
        if tools_used.iter().any(|t| self.side_effect_tools.contains(t)) {
            debug!("Not caching response produced by side-effecting tool");
            return;
        }

        let key = normalize(query);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            CacheEntry {
                answer: answer.to_string(),
                tools_used: tools_used.to_vec(),
                token_count,
                created_at: Utc::now(),
                last_used: Instant::now(),
            },
        );

        // LRU eviction on overflow.
        while entries.len() > self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    debug!("Query cache full, evicting LRU entry");
                    entries.remove(&k);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write a snapshot to `path`. Failures are logged, never fatal.
    pub fn save_snapshot(&self, path: &Path) {
        let snapshot = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            SnapshotFile {
                entries: entries
                    .iter()
                    .map(|(k, e)| SnapshotEntry {
                        normalized_query: k.clone(),
                        answer: e.answer.clone(),
                        tools_used: e.tools_used.clone(),
                        token_count: e.token_count,
                        created_at: e.created_at,
                    })
                    .collect(),
            }
        };

        let json = match serde_json::to_string_pretty(&snapshot) {
            Ok(j) => j,
            Err(e) => {
                warn!("Query cache snapshot serialization failed: {}", e);
                return;
            }
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(path, json) {
            warn!("Query cache snapshot write failed: {}", e);
        }
    }

    /// Load a snapshot from `path`, skipping entries that expired while on
    /// disk. Missing or corrupt files leave the cache empty.
    pub fn load_snapshot(&self, path: &Path) {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(_) => return,
        };
        let snapshot: SnapshotFile = match serde_json::from_str(&data) {
            Ok(s) => s,
            Err(e) => {
                warn!("Ignoring corrupt query cache snapshot: {}", e);
                return;
            }
        };

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for item in snapshot.entries {
            if Self::age_of(item.created_at) >= self.ttl {
                continue;
            }
            entries.insert(
                item.normalized_query,
                CacheEntry {
                    answer: item.answer,
                    tools_used: item.tools_used,
                    token_count: item.token_count,
                    created_at: item.created_at,
                    last_used: Instant::now(),
                },
            );
        }
    }

    fn age_of(created_at: DateTime<Utc>) -> Duration {
        Utc::now()
            .signed_duration_since(created_at)
            .to_std()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cache(max_entries: usize, ttl_secs: u64) -> QueryCache {
        QueryCache::new(&QueryCacheConfig {
            max_entries,
            ttl_secs,
            side_effect_tools: vec!["shell".to_string()],
        })
    }

    // ----- normalization -----

    #[test]
    fn test_normalize_equivalent_forms() {
        assert_eq!(normalize("What is Rust?"), normalize("what   is rust"));
        assert_eq!(normalize("  LS -LA "), "ls -la");
        assert_eq!(normalize("why?"), "why");
    }

    #[test]
    fn test_normalize_strips_only_one_question_mark() {
        assert_eq!(normalize("really??"), "really?");
    }

    // ----- get/put -----

    #[test]
    fn test_put_then_get_normalized_variant() {
        let cache = make_cache(10, 60);
        cache.put("What is Rust?", "A systems language.", &[], 30);

        let hit = cache.get("  what IS rust ").unwrap();
        assert_eq!(hit.answer, "A systems language.");
        assert_eq!(hit.token_count, 30);
    }

    #[test]
    fn test_miss_on_unknown_query() {
        let cache = make_cache(10, 60);
        assert!(cache.get("never seen").is_none());
    }

    #[test]
    fn test_side_effect_tool_not_cached() {
        let cache = make_cache(10, 60);
        cache.put("ls -la", "total 16 ...", &["shell".to_string()], 0);
        assert!(cache.get("ls -la").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_read_only_tool_is_cached() {
        let cache = make_cache(10, 60);
        cache.put(
            "latest attention papers",
            "Found 3 papers.",
            &["papers".to_string()],
            120,
        );
        let hit = cache.get("latest attention papers").unwrap();
        assert_eq!(hit.tools_used, vec!["papers".to_string()]);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = make_cache(2, 60);
        cache.put("q1", "a1", &[], 1);
        std::thread::sleep(Duration::from_millis(2));
        cache.put("q2", "a2", &[], 1);
        std::thread::sleep(Duration::from_millis(2));
        // Touch q1 so q2 becomes least recently used.
        assert!(cache.get("q1").is_some());
        std::thread::sleep(Duration::from_millis(2));
        cache.put("q3", "a3", &[], 1);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("q2").is_none());
        assert!(cache.get("q1").is_some());
        assert!(cache.get("q3").is_some());
    }

    #[test]
    fn test_ttl_expiry_is_lazy_miss() {
        let cache = make_cache(10, 0); // everything expires immediately
        cache.put("q", "a", &[], 1);
        assert!(cache.get("q").is_none());
        assert!(cache.is_empty(), "stale entry should be evicted on access");
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = make_cache(10, 60);
        cache.put("q", "first", &[], 1);
        cache.put("q", "second", &[], 2);
        assert_eq!(cache.get("q").unwrap().answer, "second");
    }

    // ----- snapshots -----

    #[test]
    fn test_snapshot_roundtrip_preserves_hits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let cache = make_cache(10, 3600);
        cache.put("What is Rust?", "A systems language.", &[], 30);
        cache.put("papers on ssm", "Found 2.", &["papers".to_string()], 50);
        cache.save_snapshot(&path);

        let reloaded = make_cache(10, 3600);
        reloaded.load_snapshot(&path);
        assert_eq!(reloaded.len(), 2);
        // Identical hit behavior for previously cached queries.
        assert_eq!(
            reloaded.get("what is rust").unwrap().answer,
            "A systems language."
        );
        assert_eq!(reloaded.get("papers on ssm").unwrap().token_count, 50);
    }

    #[test]
    fn test_missing_snapshot_is_empty() {
        let cache = make_cache(10, 60);
        cache.load_snapshot(Path::new("/tmp/sagebot_no_such_snapshot_1234.json"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_corrupt_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{broken json").unwrap();

        let cache = make_cache(10, 60);
        cache.load_snapshot(&path);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_snapshot_skips_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let cache = make_cache(10, 3600);
        cache.put("q", "a", &[], 1);
        cache.save_snapshot(&path);

        // Reload into a cache where everything is already stale.
        let strict = make_cache(10, 0);
        strict.load_snapshot(&path);
        assert!(strict.is_empty());
    }
}
