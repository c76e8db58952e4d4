//! End-to-end dispatch tests: routing scenarios, circuit behavior under
//! repeated backend failures, archival during live traffic, and shared-state
//! consistency under concurrent sessions.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use sagebot::agent::dispatcher::Dispatcher;
use sagebot::agent::protocol::Request;
use sagebot::config::schema::Config;
use sagebot::providers::base::{Completion, LlmProvider, ToolProvider};
use sagebot::store::archive::ArchiveStore;

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

struct ScriptedLlm {
    calls: AtomicU32,
}

impl ScriptedLlm {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = if prompt.starts_with("Classify") {
            "conversation".to_string()
        } else if prompt.starts_with("Summarize") {
            "User ran several commands and asked questions.".to_string()
        } else {
            format!("answer to: {}", prompt)
        };
        Ok(Completion {
            text,
            token_count: 25,
        })
    }
}

struct CountingShell {
    calls: AtomicU32,
}

#[async_trait]
impl ToolProvider for CountingShell {
    fn name(&self) -> &str {
        "shell"
    }

    async fn invoke(&self, args: &Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "result": format!("output of {}", args["command"].as_str().unwrap_or(""))
        }))
    }
}

struct BrokenSearch {
    calls: AtomicU32,
}

#[async_trait]
impl ToolProvider for BrokenSearch {
    fn name(&self) -> &str {
        "file_search"
    }

    async fn invoke(&self, _args: &Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("index unavailable"))
    }
}

fn base_config() -> Config {
    let mut config = Config::default();
    // Keep retries fast and deterministic for tests.
    config.retry.max_attempts = 1;
    config.retry.initial_delay_ms = 1;
    config.retry.attempt_timeout_ms = 1000;
    config
}

// ---------------------------------------------------------------------------
// Routing scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pwd_is_answered_locally() {
    init_tracing();
    let llm = ScriptedLlm::new();
    let tmp = tempfile::tempdir().unwrap();
    let dispatcher = Dispatcher::new(
        &base_config(),
        llm.clone(),
        Vec::new(),
        ArchiveStore::new(tmp.path()),
    );

    let mut request = Request::new("pwd", "u1", "c1");
    request
        .context
        .insert("cwd".to_string(), Value::String("/data/projects".to_string()));

    let response = dispatcher.handle(&request).await;
    assert_eq!(response.answer, "You are in /data/projects");
    // Heuristic-only: no LLM round trip at all.
    assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.metrics().snapshot().intent_heuristic, 1);
}

#[tokio::test]
async fn test_safe_command_executes_and_blocked_command_does_not() {
    init_tracing();
    let llm = ScriptedLlm::new();
    let shell = Arc::new(CountingShell {
        calls: AtomicU32::new(0),
    });
    let tmp = tempfile::tempdir().unwrap();
    let dispatcher = Dispatcher::new(
        &base_config(),
        llm,
        vec![shell.clone()],
        ArchiveStore::new(tmp.path()),
    );

    let ok = dispatcher.handle(&Request::new("ls -la", "u1", "c1")).await;
    assert!(!ok.is_error());
    assert_eq!(ok.answer, "output of ls -la");
    assert_eq!(shell.calls.load(Ordering::SeqCst), 1);

    let refused = dispatcher.handle(&Request::new("rm -rf /", "u1", "c1")).await;
    assert!(refused.is_error());
    assert_eq!(refused.error.as_deref(), Some("command_blocked"));
    // The blocked command never reached the tool.
    assert_eq!(shell.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_repeated_query_hits_cache_with_zero_tokens() {
    init_tracing();
    let llm = ScriptedLlm::new();
    let tmp = tempfile::tempdir().unwrap();
    let dispatcher = Dispatcher::new(
        &base_config(),
        llm.clone(),
        Vec::new(),
        ArchiveStore::new(tmp.path()),
    );

    let first = dispatcher
        .handle(&Request::new("What is Rust?", "u1", "c1"))
        .await;
    assert_eq!(first.token_count, 25);
    let calls_after_first = llm.calls.load(Ordering::SeqCst);

    // Same question, different surface form and session.
    let second = dispatcher
        .handle(&Request::new("  what   is rust ", "u2", "c2"))
        .await;
    assert_eq!(second.token_count, 0);
    assert_eq!(second.answer, first.answer);
    // No further outbound LLM calls for the repeat.
    assert_eq!(llm.calls.load(Ordering::SeqCst), calls_after_first);
    assert_eq!(dispatcher.metrics().snapshot().cache_hits, 1);
}

// ---------------------------------------------------------------------------
// Circuit behavior
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failing_tool_opens_circuit_and_sixth_call_is_refused() {
    init_tracing();
    let llm = ScriptedLlm::new();
    let search = Arc::new(BrokenSearch {
        calls: AtomicU32::new(0),
    });
    let mut config = base_config();
    config.circuit_breaker.threshold = 5;
    config.circuit_breaker.cooldown_secs = 3600;

    let tmp = tempfile::tempdir().unwrap();
    let dispatcher = Dispatcher::new(
        &config,
        llm,
        vec![search.clone()],
        ArchiveStore::new(tmp.path()),
    );

    // "find my thesis file" routes by heuristic, so only the tool is hit.
    for i in 0..5 {
        let response = dispatcher
            .handle(&Request::new("find my thesis file", "u1", &format!("c{}", i)))
            .await;
        assert!(response.is_error());
        assert_eq!(response.error.as_deref(), Some("unavailable"));
    }
    assert_eq!(search.calls.load(Ordering::SeqCst), 5);

    // Sixth call: circuit open, refused with no outbound attempt.
    let sixth = dispatcher
        .handle(&Request::new("find my thesis file", "u1", "c6"))
        .await;
    assert!(sixth.is_error());
    assert_eq!(sixth.error.as_deref(), Some("circuit_open"));
    assert_eq!(search.calls.load(Ordering::SeqCst), 5);
    assert!(dispatcher.metrics().snapshot().circuit_rejections >= 1);
}

#[tokio::test]
async fn test_degraded_responses_are_never_cached() {
    init_tracing();
    let llm = ScriptedLlm::new();
    let search = Arc::new(BrokenSearch {
        calls: AtomicU32::new(0),
    });
    let tmp = tempfile::tempdir().unwrap();
    let dispatcher = Dispatcher::new(
        &base_config(),
        llm,
        vec![search],
        ArchiveStore::new(tmp.path()),
    );

    let response = dispatcher
        .handle(&Request::new("find my thesis file", "u1", "c1"))
        .await;
    assert!(response.is_error());
    assert!(dispatcher.cache().is_empty());
}

// ---------------------------------------------------------------------------
// Session memory during live traffic
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_long_conversation_triggers_archival() {
    init_tracing();
    let llm = ScriptedLlm::new();
    let mut config = base_config();
    config.memory.archive_threshold = 4;
    config.memory.keep_recent = 2;

    let tmp = tempfile::tempdir().unwrap();
    let dispatcher = Dispatcher::new(
        &config,
        llm,
        Vec::new(),
        ArchiveStore::new(tmp.path()),
    );

    // Each request adds two turns (user + assistant).
    for i in 0..4 {
        dispatcher
            .handle(&Request::new(&format!("question number {}", i), "u1", "c1"))
            .await;
    }

    assert!(dispatcher.metrics().snapshot().sessions_archived >= 1);
    // Live memory stays bounded near the threshold.
    assert!(dispatcher.memory().resident_count("c1").await <= 4);
    // Evicted turns landed in the durable store.
    let store = ArchiveStore::new(tmp.path());
    assert!(!store.read("c1").is_empty());
    // Total message count keeps counting past what is resident.
    let record = dispatcher.memory().session_record("c1").await.unwrap();
    assert_eq!(record.message_count, 8);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_share_state_consistently() {
    init_tracing();
    let llm = ScriptedLlm::new();
    let shell = Arc::new(CountingShell {
        calls: AtomicU32::new(0),
    });
    let tmp = tempfile::tempdir().unwrap();
    let dispatcher = Arc::new(Dispatcher::new(
        &base_config(),
        llm,
        vec![shell],
        ArchiveStore::new(tmp.path()),
    ));

    let mut handles = Vec::new();
    for user in 0..8 {
        let dispatcher = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            let user_id = format!("u{}", user);
            let conv_id = format!("c{}", user);
            for round in 0..4 {
                let question = match round {
                    0 => "git status".to_string(),
                    1 => "what is ownership in rust".to_string(),
                    _ => format!("question {} from {}", round, user_id),
                };
                let response = dispatcher
                    .handle(&Request::new(&question, &user_id, &conv_id))
                    .await;
                assert!(!response.answer.is_empty());
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Every lookup was either a hit or a miss, nothing lost.
    let snap = dispatcher.metrics().snapshot();
    assert_eq!(snap.cache_hits + snap.cache_misses, 32);
    // Each conversation kept its own record.
    for user in 0..8 {
        let record = dispatcher
            .memory()
            .session_record(&format!("c{}", user))
            .await
            .unwrap();
        assert_eq!(record.user_id, format!("u{}", user));
        assert_eq!(record.message_count, 8);
    }
}
