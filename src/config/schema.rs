//! Configuration schema for sagebot.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` so that the JSON config
//! file can use camelCase keys while Rust code uses snake_case fields.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Intent classification
// ---------------------------------------------------------------------------

/// Intent classifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentConfig {
    /// How long a cached classification stays valid.
    #[serde(default = "default_intent_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Wall-clock budget for the fallback LLM classification call.
    #[serde(default = "default_classify_timeout_ms")]
    pub classify_timeout_ms: u64,
}

fn default_intent_cache_ttl_secs() -> u64 {
    3600
}

fn default_classify_timeout_ms() -> u64 {
    2000
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_intent_cache_ttl_secs(),
            classify_timeout_ms: default_classify_timeout_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
    /// Seconds the circuit stays open before permitting a trial call.
    #[serde(default = "default_breaker_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    30
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry handler
// ---------------------------------------------------------------------------

/// Retry/timeout configuration for outbound calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each attempt (plus jitter).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Hard per-attempt wall-clock timeout.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Query cache
// ---------------------------------------------------------------------------

/// Query response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryCacheConfig {
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Tool names whose use excludes a response from caching.
    #[serde(default = "default_side_effect_tools")]
    pub side_effect_tools: Vec<String>,
}

fn default_cache_max_entries() -> usize {
    256
}

fn default_cache_ttl_secs() -> u64 {
    900
}

fn default_side_effect_tools() -> Vec<String> {
    vec!["shell".to_string(), "file_write".to_string()]
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            ttl_secs: default_cache_ttl_secs(),
            side_effect_tools: default_side_effect_tools(),
        }
    }
}

// ---------------------------------------------------------------------------
// Session memory
// ---------------------------------------------------------------------------

/// Session memory / archival configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    /// Message count above which a session becomes eligible for archival.
    #[serde(default = "default_archive_threshold")]
    pub archive_threshold: usize,
    /// Most recent turns kept verbatim when archiving.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    /// Max tokens for the archival summary call.
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
}

fn default_archive_threshold() -> usize {
    20
}

fn default_keep_recent() -> usize {
    2
}

fn default_summary_max_tokens() -> u32 {
    512
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            archive_threshold: default_archive_threshold(),
            keep_recent: default_keep_recent(),
            summary_max_tokens: default_summary_max_tokens(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub query_cache: QueryCacheConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}
