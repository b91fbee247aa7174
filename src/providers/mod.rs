//! Upstream provider adapters. Each adapter translates between the client
//! request shape and one provider API; the generic dispatcher in
//! `server::upstream` drives them.

pub mod anthropic;
pub mod fireworks;
pub mod google;
pub mod streaming;
pub mod usage;

use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::actor::Feature;
use crate::config::settings::ProviderConfig;
use crate::error::GatewayError;
use crate::flagging::{FlaggingConfig, FlaggingRequest, FlaggingResult};
use crate::tokenizer::{self, Tokenizer};

pub use anthropic::AnthropicAdapter;
pub use fireworks::FireworksAdapter;
pub use google::GoogleAdapter;

/// Token count is unknown or was not computed. Distinct from zero.
pub const UNKNOWN_TOKENS: i64 = -1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub characters: usize,
    /// Provider-reported count when available, otherwise the tokenizer count.
    pub tokens: i64,
    /// Count computed locally by the tokenizer.
    pub tokenizer_tokens: i64,
}

impl UsageStats {
    pub fn unknown_tokens(characters: usize) -> Self {
        Self {
            characters,
            tokens: UNKNOWN_TOKENS,
            tokenizer_tokens: UNKNOWN_TOKENS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamHandlerConfig {
    pub base_url: String,
    pub access_token: String,
    pub allowed_models: HashSet<String>,
    pub max_tokens_to_sample: u32,
    pub default_retry_after_seconds: u64,
    pub auto_flush_streaming_responses: bool,
    pub flagging: FlaggingConfig,
    /// Deprecated model alias -> replacement.
    pub model_rewrites: HashMap<String, String>,
}

impl UpstreamHandlerConfig {
    pub fn from_provider(cfg: &ProviderConfig, default_base_url: &str) -> Self {
        let base_url = cfg
            .base_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(default_base_url)
            .trim_end_matches('/')
            .to_string();
        Self {
            base_url,
            access_token: cfg.access_token.clone(),
            allowed_models: cfg.allowed_models.iter().cloned().collect(),
            max_tokens_to_sample: cfg.max_tokens_to_sample,
            default_retry_after_seconds: cfg.default_retry_after_seconds,
            auto_flush_streaming_responses: cfg.auto_flush_streaming_responses,
            flagging: FlaggingConfig::from_settings(&cfg.flagging),
            model_rewrites: cfg.model_rewrites.clone(),
        }
    }
}

/// Loads the tokenizer named by the provider config.
pub fn load_tokenizer(cfg: &ProviderConfig) -> Result<Option<Arc<dyn Tokenizer>>, GatewayError> {
    tokenizer::load(cfg.tokenizer.as_deref()).map_err(|e| GatewayError::Config(e.to_string()))
}

/// A parsed client request for one provider.
///
/// Implementations memoise the prompt token count in a `OnceCell`, so a
/// request is `Send` but not `Sync` and stays with the task that parsed it.
pub trait UpstreamRequest: DeserializeOwned + Serialize + FlaggingRequest + Send + 'static {
    fn should_stream(&self) -> bool;
}

pub trait ProviderAdapter: Send + Sync + 'static {
    type Request: UpstreamRequest;

    const NAME: &'static str;

    fn config(&self) -> &UpstreamHandlerConfig;

    fn tokenizer(&self) -> Option<&dyn Tokenizer>;

    /// Hard limits (400) followed by the flagging policy where it applies.
    fn validate_request(
        &self,
        feature: Feature,
        request: &Self::Request,
    ) -> Result<Option<FlaggingResult>, GatewayError>;

    /// Rewrites the body before it is forwarded. Caller identity fields are
    /// always replaced by `actor_id`.
    fn transform_body(&self, request: &mut Self::Request, actor_id: &str);

    fn get_request_metadata(&self, request: &Self::Request) -> (String, Map<String, Value>);

    /// Sets authentication and client identification headers.
    fn transform_request(&self, request: &mut reqwest::Request) -> Result<(), GatewayError>;

    fn get_api_url(&self, feature: Feature, request: &Self::Request) -> String;

    /// Returns `(prompt_usage, completion_usage)`. Never fails; undecodable
    /// bodies are logged and yield default usage.
    fn parse_response_and_usage(
        &self,
        request: &Self::Request,
        body: &mut dyn BufRead,
    ) -> (UsageStats, UsageStats);
}

pub(crate) fn user_agent() -> String {
    format!("completions-gateway/{}", env!("CARGO_PKG_VERSION"))
}

pub(crate) fn header_value(value: &str) -> Result<reqwest::header::HeaderValue, GatewayError> {
    reqwest::header::HeaderValue::from_str(value)
        .map_err(|e| GatewayError::Config(format!("invalid header value: {e}")))
}

/// Shared metadata every adapter reports.
pub(crate) fn base_metadata(model: &str, stream: bool) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("model".into(), Value::String(model.to_string()));
    m.insert("stream".into(), Value::Bool(stream));
    m
}
