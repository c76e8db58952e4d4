//! Request/response types exchanged with the routing core.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One inbound user query. Immutable and ephemeral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub question: String,
    pub user_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

impl Request {
    pub fn new(question: &str, user_id: &str, conversation_id: &str) -> Self {
        Self {
            question: question.to_string(),
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            context: HashMap::new(),
        }
    }
}

/// One outbound answer. Exactly one per [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub answer: String,
    pub tools_used: Vec<String>,
    pub token_count: u64,
    /// Confidence in [0, 1].
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// A normal answer produced by a collaborator.
    pub fn answered(answer: String, tools_used: Vec<String>, token_count: u64) -> Self {
        Self {
            answer,
            tools_used,
            token_count,
            confidence: 0.9,
            error: None,
        }
    }

    /// A cache hit: no tokens spent, full confidence in the stored answer.
    pub fn from_cache(answer: String, tools_used: Vec<String>) -> Self {
        Self {
            answer,
            tools_used,
            token_count: 0,
            confidence: 1.0,
            error: None,
        }
    }

    /// A degraded response: short plain-language message describing what
    /// failed and what was done instead. Raw provider errors never reach the
    /// user.
    pub fn degraded(message: &str, error_tag: &str) -> Self {
        Self {
            answer: message.to_string(),
            tools_used: Vec::new(),
            token_count: 0,
            confidence: 0.1,
            error: Some(error_tag.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
