//! Request dispatch: the control flow tying the routing core together.
//!
//! One inbound [`Request`] yields exactly one [`Response`]. The pipeline:
//! query cache check, intent classification, then routing — shell intents
//! pass through the safety classifier, and every outbound call to the LLM
//! or a tool provider goes through the circuit breaker plus retry handler.
//! Afterwards the response is cached (unless side-effecting) and session
//! memory is updated, archiving older turns when the threshold is crossed.
//!
//! No failure path raises: raw provider errors never reach the caller, only
//! short plain-language degraded messages with an error tag.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::agent::circuit_breaker::CircuitBreaker;
use crate::agent::intent::{Intent, IntentClassifier, LLM_PROVIDER};
use crate::agent::memory::SessionMemory;
use crate::agent::metrics::MetricsRegistry;
use crate::agent::protocol::{Request, Response};
use crate::agent::safety::{classify_command, CommandSafety};
use crate::cache::query::QueryCache;
use crate::config::schema::Config;
use crate::providers::base::{LlmProvider, ToolProvider};
use crate::providers::retry::{execute_with_breaker, FailureKind, RetryPolicy};
use crate::store::archive::ArchiveStore;

const ANSWER_MAX_TOKENS: u32 = 1024;

/// Routes requests to the LLM backend and tool providers with caching,
/// circuit breaking, retries, and session memory management.
pub struct Dispatcher {
    llm: Arc<dyn LlmProvider>,
    tools: HashMap<String, Arc<dyn ToolProvider>>,
    breaker: Arc<CircuitBreaker>,
    classifier: IntentClassifier,
    cache: QueryCache,
    memory: SessionMemory,
    metrics: Arc<MetricsRegistry>,
    retry_policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        llm: Arc<dyn LlmProvider>,
        tools: Vec<Arc<dyn ToolProvider>>,
        archive: ArchiveStore,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(&config.circuit_breaker));
        let metrics = Arc::new(MetricsRegistry::new());
        let classifier = IntentClassifier::new(
            &config.intent,
            llm.clone(),
            breaker.clone(),
            metrics.clone(),
        );
        let memory = SessionMemory::new(&config.memory, archive, llm.clone());
        let tools = tools
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect();

        Self {
            llm,
            tools,
            breaker,
            classifier,
            cache: QueryCache::new(&config.query_cache),
            memory,
            metrics,
            retry_policy: RetryPolicy::from_config(&config.retry),
        }
    }

    /// Handle one request end to end. Never fails; every failure path
    /// produces a degraded [`Response`].
    pub async fn handle(&self, request: &Request) -> Response {
        self.memory
            .update_activity(
                &request.user_id,
                &request.conversation_id,
                "user",
                &request.question,
                0,
            )
            .await;

        if let Some(hit) = self.cache.get(&request.question) {
            debug!("Query cache hit for conversation {}", request.conversation_id);
            MetricsRegistry::incr(&self.metrics.cache_hits);
            let response = Response::from_cache(hit.answer, hit.tools_used);
            self.finish(request, &response).await;
            return response;
        }
        MetricsRegistry::incr(&self.metrics.cache_misses);

        let intent = self.classifier.classify(&request.question).await;
        info!(
            "Routing conversation {} as {}",
            request.conversation_id,
            intent.as_str()
        );

        let response = match intent {
            Intent::LocationQuery => self.answer_location(request),
            Intent::ShellExecution => self.run_shell(request).await,
            Intent::FileSearch => self.run_tool(request, "file_search").await,
            Intent::FileRead => self.run_tool(request, "file_read").await,
            Intent::DataAnalysis => self.run_tool(request, "data_analysis").await,
            Intent::BackendRequired | Intent::Conversation => self.ask_llm(request).await,
        };

        // Location answers depend on the caller's environment; everything
        // else is cacheable (`put` itself skips side-effecting tools).
        if !response.is_error() && intent != Intent::LocationQuery {
            self.cache.put(
                &request.question,
                &response.answer,
                &response.tools_used,
                response.token_count,
            );
        }

        self.finish(request, &response).await;
        response
    }

    /// Record the assistant turn and archive the session if it grew past the
    /// threshold.
    async fn finish(&self, request: &Request, response: &Response) {
        self.memory
            .update_activity(
                &request.user_id,
                &request.conversation_id,
                "assistant",
                &response.answer,
                response.token_count,
            )
            .await;

        if self.memory.should_archive(&request.conversation_id).await {
            let result = self.memory.archive_session(&request.conversation_id).await;
            if result.archived_count > 0 {
                MetricsRegistry::incr(&self.metrics.sessions_archived);
            }
        }
    }

    /// Answered locally from request context; no backend round trip.
    fn answer_location(&self, request: &Request) -> Response {
        let cwd = request
            .context
            .get("cwd")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| {
                std::env::current_dir()
                    .ok()
                    .map(|p| p.display().to_string())
            });

        match cwd {
            Some(dir) => Response::answered(
                format!("You are in {}", dir),
                vec!["location".to_string()],
                0,
            ),
            None => Response::degraded(
                "I couldn't determine the current directory.",
                "location_unavailable",
            ),
        }
    }

    /// Shell execution: safety gate first, then the shell tool provider
    /// behind breaker and retries.
    async fn run_shell(&self, request: &Request) -> Response {
        let command = request.question.trim();
        match classify_command(command) {
            CommandSafety::Blocked => {
                warn!("Refusing blocked command");
                MetricsRegistry::incr(&self.metrics.commands_blocked);
                Response::degraded(
                    "That command is blocked because it could damage this system.",
                    "command_blocked",
                )
            }
            CommandSafety::Safe | CommandSafety::Write => {
                let args = json!({ "command": command });
                self.invoke_tool(request, "shell", &args).await
            }
        }
    }

    async fn run_tool(&self, request: &Request, tool_name: &str) -> Response {
        let args = json!({ "query": request.question });
        self.invoke_tool(request, tool_name, &args).await
    }

    /// Invoke a named tool provider behind the circuit breaker and retry
    /// handler. A missing tool falls back to the LLM conversation path.
    async fn invoke_tool(&self, request: &Request, tool_name: &str, args: &Value) -> Response {
        let tool = match self.tools.get(tool_name) {
            Some(t) => t.clone(),
            None => {
                debug!("No '{}' tool registered, falling back to LLM", tool_name);
                return self.ask_llm(request).await;
            }
        };

        let provider_key = format!("tool:{}", tool_name);
        let outcome = execute_with_breaker(&self.breaker, &provider_key, &self.retry_policy, || {
            let tool = tool.clone();
            let args = args.clone();
            async move { tool.invoke(&args).await }
        })
        .await;

        MetricsRegistry::add(&self.metrics.retry_attempts, outcome.attempts as u64);
        match outcome.result {
            Some(value) => Response::answered(
                Self::render_tool_result(&value),
                vec![tool_name.to_string()],
                0,
            ),
            None => self.degrade(&outcome.failure, outcome.attempts, tool_name),
        }
    }

    /// Conversation / backend-required path: one LLM completion behind
    /// breaker and retries.
    async fn ask_llm(&self, request: &Request) -> Response {
        let llm = self.llm.clone();
        let question = request.question.clone();
        let outcome = execute_with_breaker(&self.breaker, LLM_PROVIDER, &self.retry_policy, || {
            let llm = llm.clone();
            let question = question.clone();
            async move { llm.complete(&question, ANSWER_MAX_TOKENS).await }
        })
        .await;

        MetricsRegistry::add(&self.metrics.retry_attempts, outcome.attempts as u64);
        match outcome.result {
            Some(completion) => {
                Response::answered(completion.text, Vec::new(), completion.token_count)
            }
            None => self.degrade(&outcome.failure, outcome.attempts, "the assistant backend"),
        }
    }

    /// Map a failed outcome to a short plain-language degraded response.
    fn degrade(&self, failure: &Option<FailureKind>, attempts: u32, what: &str) -> Response {
        if attempts == 0 {
            // Refused by the breaker before any outbound attempt.
            MetricsRegistry::incr(&self.metrics.circuit_rejections);
            return Response::degraded(
                &format!(
                    "{} is temporarily unavailable; I'll try again once it recovers.",
                    capitalize(what)
                ),
                "circuit_open",
            );
        }
        match failure {
            Some(FailureKind::Timeout) => Response::degraded(
                &format!("{} took too long to respond. Please try again.", capitalize(what)),
                "timeout",
            ),
            Some(FailureKind::Exception) => Response::degraded(
                &format!("{} couldn't process that request.", capitalize(what)),
                "invalid_request",
            ),
            Some(FailureKind::Exhausted) | None => Response::degraded(
                &format!(
                    "{} isn't responding right now. Please try again shortly.",
                    capitalize(what)
                ),
                "unavailable",
            ),
        }
    }

    fn render_tool_result(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other
                .get("result")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| other.to_string()),
        }
    }

    // Accessors for embedding applications and tests.

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn memory(&self) -> &SessionMemory {
        &self.memory
    }

    /// Persist the query cache snapshot. Best-effort.
    pub fn save_cache_snapshot(&self, path: &std::path::Path) {
        self.cache.save_snapshot(path);
    }

    /// Reload the query cache snapshot, if one exists.
    pub fn load_cache_snapshot(&self, path: &std::path::Path) {
        self.cache.load_snapshot(path);
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
