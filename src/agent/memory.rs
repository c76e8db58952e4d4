//! Session memory management.
//!
//! Keeps a per-conversation record plus the live turn list, and bounds
//! memory growth by archiving: once a conversation exceeds the threshold,
//! older turns are replaced in live memory by a generated summary while the
//! most recent turns stay verbatim. The replaced turns go to the durable
//! archive store keyed by conversation and timestamp.
//!
//! Summarization is a bounded LLM call with a deterministic local fallback,
//! so archival never blocks on a sick backend. Archive store failures are
//! logged and left for a later retry; they never fail the live request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::schema::MemoryConfig;
use crate::providers::base::LlmProvider;
use crate::store::archive::ArchiveStore;
use crate::utils::helpers::truncate_string;

const SUMMARIZE_PROMPT: &str = "\
Summarize this conversation history concisely. Focus on:
- Key facts and questions from the user
- Current topic being discussed
- Any pending requests
Keep it under 200 words.";

/// Budget for the summarization call; archival must not hang on the backend.
const SUMMARY_TIMEOUT: Duration = Duration::from_secs(10);

/// One conversation turn held in live memory.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// True for the synthetic summary turn produced by archival.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub summary: bool,
}

/// Bookkeeping for one conversation.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub user_id: String,
    pub conversation_id: String,
    /// Total messages ever added; always >= messages resident in live memory.
    pub message_count: u64,
    pub token_count: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Outcome of one archival pass.
#[derive(Debug, Clone)]
pub struct ArchiveResult {
    pub archived_count: usize,
    pub kept_recent_messages: usize,
    pub summary_text: String,
    pub archive_location: Option<PathBuf>,
}

struct SessionState {
    record: SessionRecord,
    turns: Vec<Turn>,
}

/// Manages session records and archival across many concurrent
/// conversations. The map is mutex-protected; within one conversation
/// requests are sequential, so no finer locking is needed.
pub struct SessionMemory {
    sessions: Mutex<HashMap<String, SessionState>>,
    archive: ArchiveStore,
    summarizer: Arc<dyn LlmProvider>,
    threshold: usize,
    keep_recent: usize,
    summary_max_tokens: u32,
}

impl SessionMemory {
    pub fn new(config: &MemoryConfig, archive: ArchiveStore, summarizer: Arc<dyn LlmProvider>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            archive,
            summarizer,
            threshold: config.archive_threshold.max(1),
            keep_recent: config.keep_recent,
            summary_max_tokens: config.summary_max_tokens,
        }
    }

    /// Ensure a session record exists for this conversation.
    pub async fn register_session(&self, user_id: &str, conversation_id: &str) {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| Self::fresh_state(user_id, conversation_id));
    }

    /// Record one turn of activity, creating the session if needed.
    pub async fn update_activity(
        &self,
        user_id: &str,
        conversation_id: &str,
        role: &str,
        content: &str,
        tokens: u64,
    ) {
        let mut sessions = self.sessions.lock().await;
        let state = sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| Self::fresh_state(user_id, conversation_id));

        state.turns.push(Turn {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            summary: false,
        });
        state.record.message_count += 1;
        state.record.token_count += tokens;
        state.record.last_activity_at = Utc::now();
    }

    /// True once the conversation holds more live (non-summary) messages
    /// than the archive threshold.
    pub async fn should_archive(&self, conversation_id: &str) -> bool {
        let sessions = self.sessions.lock().await;
        match sessions.get(conversation_id) {
            Some(state) => Self::resident_messages(state) > self.threshold,
            None => false,
        }
    }

    /// Archive older turns: keep the most recent `keep_recent` verbatim,
    /// replace the rest with a summary, and write the replaced turns to the
    /// durable store.
    ///
    /// Idempotent — with nothing new to archive, returns
    /// `archived_count == 0` and leaves live memory untouched. Store
    /// failures keep the turns resident for a later retry.
    pub async fn archive_session(&self, conversation_id: &str) -> ArchiveResult {
        // Snapshot what must move, then release the map lock: the
        // summarization call below can run for seconds and must not stall
        // other conversations' activity updates.
        let (user_id, old_messages, prior_summary, split, total) = {
            let mut sessions = self.sessions.lock().await;
            let state = match sessions.get_mut(conversation_id) {
                Some(s) => s,
                None => {
                    return ArchiveResult {
                        archived_count: 0,
                        kept_recent_messages: 0,
                        summary_text: String::new(),
                        archive_location: None,
                    }
                }
            };

            let total = state.turns.len();
            let split = total.saturating_sub(self.keep_recent);
            let old_messages: Vec<Turn> = state.turns[..split]
                .iter()
                .filter(|t| !t.summary)
                .cloned()
                .collect();

            if old_messages.is_empty() {
                debug!("Nothing to archive for conversation {}", conversation_id);
                return ArchiveResult {
                    archived_count: 0,
                    kept_recent_messages: total.min(self.keep_recent),
                    summary_text: String::new(),
                    archive_location: None,
                };
            }

            // Fold any prior summary into the new one so context is not lost.
            let prior_summary = state.turns[..split]
                .iter()
                .find(|t| t.summary)
                .map(|t| t.content.clone());
            (
                state.record.user_id.clone(),
                old_messages,
                prior_summary,
                split,
                total,
            )
        };

        let summary_text = self.summarize(prior_summary.as_deref(), &old_messages).await;

        let timestamp = Utc::now();
        let payload = json!({
            "user_id": user_id,
            "summary": summary_text,
            "messages": old_messages,
        });
        let archive_location = match self.archive.write(conversation_id, timestamp, &payload) {
            Ok(path) => Some(path),
            Err(e) => {
                // Keep the turns resident so a later pass can retry.
                warn!(
                    "Archival failed for conversation {}: {} (will retry later)",
                    conversation_id, e
                );
                return ArchiveResult {
                    archived_count: 0,
                    kept_recent_messages: total.min(self.keep_recent),
                    summary_text,
                    archive_location: None,
                };
            }
        };

        // Splice the summary back in. Within one conversation requests are
        // sequential, so the first `split` turns are exactly the ones just
        // archived; anything appended while the lock was released sits at the
        // tail and is kept.
        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.get_mut(conversation_id) {
            if state.turns.len() >= split {
                let tail = state.turns.split_off(split);
                state.turns.clear();
                state.turns.push(Turn {
                    role: "system".to_string(),
                    content: format!("[Conversation summary: {}]", summary_text),
                    timestamp,
                    summary: true,
                });
                state.turns.extend(tail);
            }
        }

        debug!(
            "Archived {} turns for conversation {}, kept {} recent",
            old_messages.len(),
            conversation_id,
            total.min(self.keep_recent)
        );

        ArchiveResult {
            archived_count: old_messages.len(),
            kept_recent_messages: total.min(self.keep_recent),
            summary_text,
            archive_location,
        }
    }

    /// Snapshot of a session's record, for callers and tests.
    pub async fn session_record(&self, conversation_id: &str) -> Option<SessionRecord> {
        let sessions = self.sessions.lock().await;
        sessions.get(conversation_id).map(|s| s.record.clone())
    }

    /// Messages currently resident in live memory (excluding the synthetic
    /// summary turn).
    pub async fn resident_count(&self, conversation_id: &str) -> usize {
        let sessions = self.sessions.lock().await;
        sessions
            .get(conversation_id)
            .map(Self::resident_messages)
            .unwrap_or(0)
    }

    fn fresh_state(user_id: &str, conversation_id: &str) -> SessionState {
        let now = Utc::now();
        SessionState {
            record: SessionRecord {
                user_id: user_id.to_string(),
                conversation_id: conversation_id.to_string(),
                message_count: 0,
                token_count: 0,
                started_at: now,
                last_activity_at: now,
            },
            turns: Vec::new(),
        }
    }

    fn resident_messages(state: &SessionState) -> usize {
        state.turns.iter().filter(|t| !t.summary).count()
    }

    /// Summarize evicted turns via the LLM, falling back to a deterministic
    /// local digest when the backend is slow or down.
    async fn summarize(&self, prior_summary: Option<&str>, turns: &[Turn]) -> String {
        let mut transcript = String::new();
        if let Some(prior) = prior_summary {
            transcript.push_str(&format!("(earlier summary) {}\n", prior));
        }
        for turn in turns {
            transcript.push_str(&format!(
                "{}: {}\n",
                turn.role,
                truncate_string(&turn.content, 500)
            ));
        }

        let prompt = format!("{}\n\n{}", SUMMARIZE_PROMPT, transcript);
        match tokio::time::timeout(
            SUMMARY_TIMEOUT,
            self.summarizer.complete(&prompt, self.summary_max_tokens),
        )
        .await
        {
            Ok(Ok(completion)) if !completion.text.trim().is_empty() => {
                completion.text.trim().to_string()
            }
            Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                warn!("Summarization unavailable, using local digest");
                Self::local_digest(prior_summary, turns)
            }
        }
    }

    /// Cheap summary used when the backend can't provide one.
    fn local_digest(prior_summary: Option<&str>, turns: &[Turn]) -> String {
        let first_user = turns
            .iter()
            .find(|t| t.role == "user")
            .map(|t| truncate_string(&t.content, 80))
            .unwrap_or_default();
        let mut digest = format!(
            "{} earlier message(s) archived; conversation began with: {}",
            turns.len(),
            first_user
        );
        if let Some(prior) = prior_summary {
            digest.push_str(&format!(" (earlier: {})", truncate_string(prior, 120)));
        }
        digest
    }
}
