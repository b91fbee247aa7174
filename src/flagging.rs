//! Abuse-detection policy applied to completion requests before they are
//! forwarded upstream.
//!
//! Evaluation is a pure function of the tokenizer, the request and the
//! [`FlaggingConfig`]; nothing here performs I/O or touches shared state.

use std::borrow::Cow;

use serde_json::{Map, Value, json};

use crate::config::settings::FlaggingSettings;
use crate::tokenizer::{Tokenizer, TokenizerError};

/// Maximum number of prompt bytes kept on a flagged result for logging.
pub const PROMPT_PREFIX_LENGTH: usize = 250;

pub const REASON_UNKNOWN_PROMPT: &str = "unknown_prompt";
pub const REASON_HIGH_MAX_TOKENS_TO_SAMPLE: &str = "high_max_tokens_to_sample";
pub const REASON_HIGH_PROMPT_TOKEN_COUNT: &str = "high_prompt_token_count";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlaggingConfig {
    /// Lower-cased; a prompt must contain at least one of these when non-empty.
    pub allowed_prompt_patterns: Vec<String>,
    /// Lower-cased; a flagged prompt containing one of these is blocked.
    pub blocked_prompt_patterns: Vec<String>,
    pub prompt_token_flagging_limit: usize,
    pub prompt_token_blocking_limit: usize,
    pub max_tokens_to_sample_flagging_limit: u32,
    pub response_token_blocking_limit: u32,
    pub request_blocking_enabled: bool,
}

impl FlaggingConfig {
    pub fn from_settings(settings: &FlaggingSettings) -> Self {
        Self {
            allowed_prompt_patterns: lowercase_all(&settings.allowed_prompt_patterns),
            blocked_prompt_patterns: lowercase_all(&settings.blocked_prompt_patterns),
            prompt_token_flagging_limit: settings.prompt_token_flagging_limit,
            prompt_token_blocking_limit: settings.prompt_token_blocking_limit,
            max_tokens_to_sample_flagging_limit: settings.max_tokens_to_sample_flagging_limit,
            response_token_blocking_limit: settings.response_token_blocking_limit,
            request_blocking_enabled: settings.request_blocking_enabled,
        }
    }
}

fn lowercase_all(patterns: &[String]) -> Vec<String> {
    patterns
        .iter()
        .map(|p| p.to_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}

/// The view of a completion request that the flagging policy needs.
pub trait FlaggingRequest {
    fn flattened_prompt(&self) -> Cow<'_, str>;

    fn max_tokens(&self) -> u32;

    /// Token count of the flattened prompt. Implementations memoise the result.
    fn prompt_token_count(&self, tokenizer: &dyn Tokenizer) -> Result<usize, TokenizerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlaggingResult {
    pub should_block: bool,
    pub blocked_phrase: Option<String>,
    pub reasons: Vec<String>,
    pub prompt_prefix: String,
    pub max_tokens_to_sample: u32,
    pub prompt_token_count: usize,
}

impl FlaggingResult {
    /// Event metadata describing this result. The prompt prefix is only
    /// attached for dotcom actors.
    pub fn metadata(&self, include_prompt_prefix: bool) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("flagged".into(), Value::Bool(true));
        m.insert("flagging_reasons".into(), json!(self.reasons));
        m.insert("blocked".into(), Value::Bool(self.should_block));
        m.insert("prompt_token_count".into(), json!(self.prompt_token_count));
        m.insert("max_tokens_to_sample".into(), json!(self.max_tokens_to_sample));
        if let Some(phrase) = &self.blocked_phrase {
            m.insert("blocked_phrase".into(), Value::String(phrase.clone()));
        }
        if include_prompt_prefix {
            m.insert(
                "prompt_prefix".into(),
                Value::String(self.prompt_prefix.clone()),
            );
        }
        m
    }
}

/// Returns `Ok(None)` when the request is not flagged.
///
/// The prompt token check only runs when a tokenizer is supplied; a
/// tokenizer failure is the only error.
pub fn is_flagged_request<R>(
    tokenizer: Option<&dyn Tokenizer>,
    request: &R,
    config: &FlaggingConfig,
) -> Result<Option<FlaggingResult>, TokenizerError>
where
    R: FlaggingRequest + ?Sized,
{
    let original = request.flattened_prompt();
    let prompt = original.to_lowercase();
    let max_tokens = request.max_tokens();
    let mut reasons: Vec<String> = Vec::new();

    if !config.allowed_prompt_patterns.is_empty()
        && contains_any(&prompt, &config.allowed_prompt_patterns).is_none()
    {
        reasons.push(REASON_UNKNOWN_PROMPT.into());
    }

    if max_tokens > config.max_tokens_to_sample_flagging_limit {
        reasons.push(REASON_HIGH_MAX_TOKENS_TO_SAMPLE.into());
    }

    let token_count = match tokenizer {
        Some(tk) => {
            let count = request.prompt_token_count(tk)?;
            if count > config.prompt_token_flagging_limit {
                reasons.push(REASON_HIGH_PROMPT_TOKEN_COUNT.into());
            }
            count
        }
        None => 0,
    };

    if reasons.is_empty() {
        return Ok(None);
    }

    let blocked_phrase = contains_any(&prompt, &config.blocked_prompt_patterns).map(str::to_string);
    let over_limits = token_count > config.prompt_token_blocking_limit
        || max_tokens > config.response_token_blocking_limit;

    Ok(Some(FlaggingResult {
        should_block: config.request_blocking_enabled && (over_limits || blocked_phrase.is_some()),
        blocked_phrase,
        reasons,
        prompt_prefix: truncate_at_char_boundary(&original, PROMPT_PREFIX_LENGTH).to_string(),
        max_tokens_to_sample: max_tokens,
        prompt_token_count: token_count,
    }))
}

/// Runs the policy, degrading to "not flagged" when the prompt cannot be tokenized.
pub fn check_request<R>(
    provider: &str,
    tokenizer: Option<&dyn Tokenizer>,
    request: &R,
    config: &FlaggingConfig,
) -> Option<FlaggingResult>
where
    R: FlaggingRequest + ?Sized,
{
    match is_flagged_request(tokenizer, request, config) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(
                provider,
                error = %e,
                "failed to check whether request is flagged, treating as not flagged"
            );
            None
        }
    }
}

fn contains_any<'a>(haystack: &str, patterns: &'a [String]) -> Option<&'a str> {
    patterns
        .iter()
        .find(|p| haystack.contains(p.as_str()))
        .map(String::as_str)
}

fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
