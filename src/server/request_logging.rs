use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::actor::Actor;
use crate::flagging::FlaggingResult;
use crate::logging::{Event, EventLogger, EventName};
use crate::providers::UsageStats;

/// Accumulates metadata for the single event a completion request produces.
///
/// If the request future is dropped before [`CompletionEvent::emit`] (client
/// went away) the event is still written, as `client_canceled`.
pub struct CompletionEvent {
    logger: Arc<dyn EventLogger>,
    started: Instant,
    source: String,
    identifier: String,
    metadata: Map<String, Value>,
    emitted: bool,
}

impl CompletionEvent {
    pub fn new(logger: Arc<dyn EventLogger>, provider: &str, feature: &str, trace_id: &str) -> Self {
        let mut metadata = Map::new();
        metadata.insert("provider".into(), json!(provider));
        metadata.insert("feature".into(), json!(feature));
        metadata.insert("trace_id".into(), json!(trace_id));
        Self {
            logger,
            started: Instant::now(),
            source: "anonymous".to_string(),
            identifier: String::new(),
            metadata,
            emitted: false,
        }
    }

    pub fn set_actor(&mut self, actor: &Actor) {
        self.source = actor.source.clone();
        self.identifier = actor.id.clone();
        self.metadata.insert("dotcom".into(), json!(actor.dotcom));
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    pub fn extend(&mut self, extra: Map<String, Value>) {
        self.metadata.extend(extra);
    }

    pub fn set_flagging(&mut self, result: &FlaggingResult, dotcom: bool) {
        self.extend(result.metadata(dotcom));
    }

    pub fn set_usage(&mut self, prompt: UsageStats, completion: UsageStats) {
        self.set("prompt_character_count", json!(prompt.characters));
        self.set("prompt_usage", json!(prompt));
        self.set("completion_usage", json!(completion));
    }

    pub fn emit(mut self, name: EventName, status: StatusCode) {
        self.write(name, status);
    }

    fn write(&mut self, name: EventName, status: StatusCode) {
        if self.emitted {
            return;
        }
        self.emitted = true;
        self.metadata.insert("status".into(), json!(status.as_u16()));
        self.metadata.insert(
            "duration_ms".into(),
            json!(self.started.elapsed().as_millis() as u64),
        );
        let event = Event {
            name,
            source: std::mem::take(&mut self.source),
            identifier: std::mem::take(&mut self.identifier),
            metadata: std::mem::take(&mut self.metadata),
            timestamp: Utc::now(),
        };
        tracing::info!(
            event = name.as_str(),
            actor = %event.identifier,
            status = status.as_u16(),
            "completion request finished"
        );
        self.logger.log_event(event);
    }
}

impl Drop for CompletionEvent {
    fn drop(&mut self) {
        if !self.emitted {
            self.set("stream_completed", json!(false));
            // 499: client closed request
            let status = StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST);
            self.write(EventName::ClientCanceled, status);
        }
    }
}
