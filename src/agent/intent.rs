//! Intent classification for incoming queries.
//!
//! Resolution order: deterministic heuristics, then the TTL intent cache,
//! then one bounded LLM call. `classify` never fails — anything inconclusive
//! degrades to [`Intent::Conversation`], the safest routing.
//!
//! The heuristics live in an ordered rule table with documented precedence:
//! exact phrases, then command-syntax detection, then file read/search
//! patterns, then data-analysis keywords. A shell verb mentioned inside
//! natural language ("can you grep through my notes") must not match the
//! command rule; the filler-word check below encodes exactly that.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::agent::circuit_breaker::CircuitBreaker;
use crate::agent::metrics::MetricsRegistry;
use crate::config::schema::IntentConfig;
use crate::providers::base::LlmProvider;

/// Breaker key for the LLM backend.
pub const LLM_PROVIDER: &str = "llm";

/// Coarse category of a request, determining which collaborator handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    LocationQuery,
    FileSearch,
    FileRead,
    ShellExecution,
    DataAnalysis,
    BackendRequired,
    Conversation,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::LocationQuery => "location_query",
            Intent::FileSearch => "file_search",
            Intent::FileRead => "file_read",
            Intent::ShellExecution => "shell_execution",
            Intent::DataAnalysis => "data_analysis",
            Intent::BackendRequired => "backend_required",
            Intent::Conversation => "conversation",
        }
    }

    pub fn from_label(label: &str) -> Option<Intent> {
        match label {
            "location_query" => Some(Intent::LocationQuery),
            "file_search" => Some(Intent::FileSearch),
            "file_read" => Some(Intent::FileRead),
            "shell_execution" => Some(Intent::ShellExecution),
            "data_analysis" => Some(Intent::DataAnalysis),
            "backend_required" => Some(Intent::BackendRequired),
            "conversation" => Some(Intent::Conversation),
            _ => None,
        }
    }
}

/// Normalize a query for heuristic matching and cache keying.
pub fn normalize_query(query: &str) -> String {
    static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
    WS_RE
        .replace_all(query.trim(), " ")
        .to_string()
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// Heuristic rule table
// ---------------------------------------------------------------------------

/// One heuristic rule. Rules are evaluated in table order; the first match
/// wins.
pub struct IntentRule {
    pub name: &'static str,
    pub intent: Intent,
    matches: fn(&str) -> bool,
}

/// Ordered rule table. Precedence: exact location phrases, command-like
/// shell syntax, file read, file search, data analysis.
pub static RULES: &[IntentRule] = &[
    IntentRule {
        name: "location_exact",
        intent: Intent::LocationQuery,
        matches: match_location,
    },
    IntentRule {
        name: "shell_command",
        intent: Intent::ShellExecution,
        matches: match_shell_command,
    },
    IntentRule {
        name: "file_read",
        intent: Intent::FileRead,
        matches: match_file_read,
    },
    IntentRule {
        name: "file_search",
        intent: Intent::FileSearch,
        matches: match_file_search,
    },
    IntentRule {
        name: "data_analysis",
        intent: Intent::DataAnalysis,
        matches: match_data_analysis,
    },
];

const LOCATION_PHRASES: &[&str] = &[
    "where am i",
    "pwd",
    "what directory am i in",
    "current directory",
    "what folder am i in",
    "what is my current directory",
];

/// Leading verbs that mark a string as a shell command candidate.
const SHELL_VERBS: &[&str] = &[
    "ls", "cd", "cat", "grep", "find", "git", "docker", "pip", "pip3", "npm", "cargo", "curl",
    "wget", "chmod", "chown", "mkdir", "touch", "rm", "cp", "mv", "tar", "ps", "kill", "head",
    "tail", "df", "du", "echo", "sed", "awk", "make", "python", "python3", "ssh", "systemctl",
    "apt", "brew",
];

/// Natural-language filler that disqualifies a shell-verb-prefixed string
/// from being a command. "grep through my notes" is a sentence, not a
/// command.
const FILLER_WORDS: &[&str] = &[
    "you", "your", "my", "me", "the", "a", "an", "please", "can", "could", "would", "should",
    "through", "some", "that", "this", "these", "those", "what", "how", "why", "is", "are", "to",
    "of", "for", "about", "all",
];

fn match_location(q: &str) -> bool {
    LOCATION_PHRASES.contains(&q)
}

fn match_shell_command(q: &str) -> bool {
    let mut tokens = q.split_whitespace();
    let head = match tokens.next() {
        Some(h) => h,
        None => return false,
    };
    if !SHELL_VERBS.contains(&head) {
        return false;
    }
    // A bare verb is a command; a verb followed by natural-language filler
    // is a sentence.
    !tokens.any(|t| FILLER_WORDS.contains(&t))
}

static PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|\s)(~?/?[\w.-]+/[\w./-]+|[\w-]+\.(txt|md|csv|json|log|toml|yaml|yml|py|rs))")
        .unwrap()
});

fn match_file_read(q: &str) -> bool {
    const READ_VERBS: &[&str] = &["read", "open", "show", "display", "print"];
    let head = match q.split_whitespace().next() {
        Some(h) => h,
        None => return false,
    };
    READ_VERBS.contains(&head) && PATH_RE.is_match(q)
}

fn match_file_search(q: &str) -> bool {
    const SEARCH_VERBS: &[&str] = &["find", "search", "locate", "look", "where"];
    let head = match q.split_whitespace().next() {
        Some(h) => h,
        None => return false,
    };
    if !SEARCH_VERBS.contains(&head) {
        return false;
    }
    q.contains("file") || q.contains("folder") || q.contains("directory") || q.contains("named")
}

fn match_data_analysis(q: &str) -> bool {
    const KEYWORDS: &[&str] = &[
        "analyze", "analyse", "plot", "average", "mean", "median", "correlation", "statistics",
        "histogram", "csv",
    ];
    KEYWORDS.iter().any(|k| q.contains(k))
}

/// Run the heuristic table against a normalized query.
pub fn heuristic_intent(normalized: &str) -> Option<(Intent, &'static str)> {
    RULES
        .iter()
        .find(|rule| (rule.matches)(normalized))
        .map(|rule| (rule.intent, rule.name))
}

// ---------------------------------------------------------------------------
// Intent cache
// ---------------------------------------------------------------------------

/// TTL cache of query hash → resolved intent. Entries are tiny, so there is
/// no size cap; expiry is lazy on access.
pub struct IntentCache {
    entries: Mutex<HashMap<String, (Intent, Instant)>>,
    ttl: Duration,
}

impl IntentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn hash(normalized: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, normalized: &str) -> Option<Intent> {
        let key = Self::hash(normalized);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(&key) {
            Some((intent, created)) if created.elapsed() < self.ttl => Some(*intent),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, normalized: &str, intent: Intent) {
        let key = Self::hash(normalized);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, (intent, Instant::now()));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

const CLASSIFY_PROMPT: &str = "\
Classify the user query into exactly one intent label. Labels:
location_query, file_search, file_read, shell_execution, data_analysis,
backend_required, conversation.
Respond with the label only.

Query: ";

/// Maps a query to an [`Intent`].
///
/// Heuristics first, cache second, one bounded LLM call last. Degrades to
/// `Conversation` instead of failing.
pub struct IntentClassifier {
    provider: Arc<dyn LlmProvider>,
    breaker: Arc<CircuitBreaker>,
    cache: IntentCache,
    classify_timeout: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl IntentClassifier {
    pub fn new(
        config: &IntentConfig,
        provider: Arc<dyn LlmProvider>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            provider,
            breaker,
            cache: IntentCache::new(Duration::from_secs(config.cache_ttl_secs)),
            classify_timeout: Duration::from_millis(config.classify_timeout_ms),
            metrics,
        }
    }

    /// Classify a query. Never raises; empty or inconclusive input yields
    /// `Conversation`.
    pub async fn classify(&self, query: &str) -> Intent {
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return Intent::Conversation;
        }

        if let Some((intent, rule)) = heuristic_intent(&normalized) {
            debug!("Heuristic '{}' classified query as {}", rule, intent.as_str());
            MetricsRegistry::incr(&self.metrics.intent_heuristic);
            return intent;
        }

        if let Some(intent) = self.cache.get(&normalized) {
            MetricsRegistry::incr(&self.metrics.intent_cached);
            return intent;
        }

        // One bounded remote call, gated by the breaker. Any failure path
        // lands on the conversation default.
        if !self.breaker.allow_call(LLM_PROVIDER) {
            debug!("Circuit open for LLM backend, defaulting to conversation");
            MetricsRegistry::incr(&self.metrics.circuit_rejections);
            MetricsRegistry::incr(&self.metrics.intent_fallback);
            return Intent::Conversation;
        }

        let prompt = format!("{}{}", CLASSIFY_PROMPT, normalized);
        match tokio::time::timeout(self.classify_timeout, self.provider.complete(&prompt, 16)).await
        {
            Ok(Ok(completion)) => {
                self.breaker.record_success(LLM_PROVIDER);
                let intent = Self::parse_label(&completion.text);
                self.cache.put(&normalized, intent);
                MetricsRegistry::incr(&self.metrics.intent_llm);
                intent
            }
            Ok(Err(e)) => {
                warn!("LLM classification failed: {}", e);
                self.breaker.record_failure(LLM_PROVIDER);
                MetricsRegistry::incr(&self.metrics.intent_fallback);
                Intent::Conversation
            }
            Err(_) => {
                warn!(
                    "LLM classification timed out after {:?}",
                    self.classify_timeout
                );
                self.breaker.record_failure(LLM_PROVIDER);
                MetricsRegistry::incr(&self.metrics.intent_fallback);
                Intent::Conversation
            }
        }
    }

    /// Extract the first recognized label from the LLM's reply.
    fn parse_label(text: &str) -> Intent {
        let lower = text.to_lowercase();
        for word in lower.split(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
            if let Some(intent) = Intent::from_label(word) {
                return intent;
            }
        }
        Intent::Conversation
    }

    /// Cached entry count, for tests and diagnostics.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
