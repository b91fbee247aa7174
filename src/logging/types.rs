use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    CompletionsFinished,
    RateLimited,
    RequestBlocked,
    RequestRejected,
    UpstreamFailed,
    Unauthorized,
    ClientCanceled,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::CompletionsFinished => "completions_finished",
            EventName::RateLimited => "rate_limited",
            EventName::RequestBlocked => "request_blocked",
            EventName::RequestRejected => "request_rejected",
            EventName::UpstreamFailed => "upstream_failed",
            EventName::Unauthorized => "unauthorized",
            EventName::ClientCanceled => "client_canceled",
        }
    }
}

/// One usage/audit record per completion request.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub name: EventName,
    /// Actor source, or `anonymous` before authentication.
    pub source: String,
    /// Actor id, empty before authentication.
    pub identifier: String,
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Row read back from `completion_events`.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: i64,
    pub name: String,
    pub source: String,
    pub identifier: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub struct FlaggedPrompt {
    /// SHA-256 hex of the prompt.
    pub prompt_hash: String,
    pub prompt: String,
    pub recorded_at: DateTime<Utc>,
}
