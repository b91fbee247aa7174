use std::borrow::Cow;
use std::cell::OnceCell;
use std::io::BufRead;
use std::sync::Arc;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::actor::Feature;
use crate::error::GatewayError;
use crate::flagging::{self, FlaggingRequest, FlaggingResult};
use crate::tokenizer::{Tokenizer, TokenizerError};

use super::streaming::Dialect;
use super::usage::{count_tokens, decode_body, drain_events, text_len};
use super::{
    ProviderAdapter, UNKNOWN_TOKENS, UpstreamHandlerConfig, UpstreamRequest, UsageStats,
    base_metadata, header_value, user_agent,
};

pub const DEFAULT_BASE_URL: &str = "https://api.fireworks.ai";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireworksMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FireworksRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<FireworksMessage>>,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(skip)]
    prompt_tokens: OnceCell<Result<usize, TokenizerError>>,
}

impl FireworksRequest {
    fn has_content(&self) -> bool {
        self.prompt.as_deref().is_some_and(|p| !p.is_empty())
            || self.messages.as_ref().is_some_and(|m| !m.is_empty())
    }
}

impl FlaggingRequest for FireworksRequest {
    fn flattened_prompt(&self) -> Cow<'_, str> {
        if let Some(messages) = &self.messages
            && !messages.is_empty()
        {
            return Cow::Owned(
                messages
                    .iter()
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
        }
        Cow::Borrowed(self.prompt.as_deref().unwrap_or_default())
    }

    fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or_default()
    }

    fn prompt_token_count(&self, tokenizer: &dyn Tokenizer) -> Result<usize, TokenizerError> {
        self.prompt_tokens
            .get_or_init(|| {
                tokenizer
                    .tokenize(&self.flattened_prompt())
                    .map(|t| t.len())
            })
            .clone()
    }
}

impl UpstreamRequest for FireworksRequest {
    fn should_stream(&self) -> bool {
        self.stream
    }
}

#[derive(Debug, Default, Deserialize)]
struct FireworksUsage {
    #[serde(default)]
    prompt_tokens: Option<i64>,
    #[serde(default)]
    completion_tokens: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FireworksChoice {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    message: Option<ChoiceMessage>,
    #[serde(default)]
    delta: Option<ChoiceMessage>,
}

impl FireworksChoice {
    fn into_text(self) -> String {
        self.text
            .or_else(|| self.message.and_then(|m| m.content))
            .or_else(|| self.delta.and_then(|d| d.content))
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
struct FireworksResponse {
    #[serde(default)]
    choices: Vec<FireworksChoice>,
    #[serde(default)]
    usage: Option<FireworksUsage>,
}

pub struct FireworksAdapter {
    config: UpstreamHandlerConfig,
    tokenizer: Option<Arc<dyn Tokenizer>>,
}

impl FireworksAdapter {
    pub fn new(config: UpstreamHandlerConfig, tokenizer: Option<Arc<dyn Tokenizer>>) -> Self {
        Self { config, tokenizer }
    }

    fn tokenizer_prompt_tokens(&self, request: &FireworksRequest) -> i64 {
        match self.tokenizer() {
            Some(tk) => request
                .prompt_token_count(tk)
                .map(|n| n as i64)
                .unwrap_or(UNKNOWN_TOKENS),
            None => UNKNOWN_TOKENS,
        }
    }
}

impl ProviderAdapter for FireworksAdapter {
    type Request = FireworksRequest;

    const NAME: &'static str = "fireworks";

    fn config(&self) -> &UpstreamHandlerConfig {
        &self.config
    }

    fn tokenizer(&self) -> Option<&dyn Tokenizer> {
        self.tokenizer.as_deref()
    }

    fn validate_request(
        &self,
        feature: Feature,
        request: &FireworksRequest,
    ) -> Result<Option<FlaggingResult>, GatewayError> {
        if !request.has_content() {
            return Err(GatewayError::Validation(
                "request must contain a prompt or messages".into(),
            ));
        }
        if let Some(max) = request.max_tokens
            && max > self.config.max_tokens_to_sample
        {
            return Err(GatewayError::Validation(format!(
                "max_tokens exceeds maximum allowed value of {}: {}",
                self.config.max_tokens_to_sample, max
            )));
        }
        // 只对聊天请求做标记
        if feature != Feature::ChatCompletions {
            return Ok(None);
        }
        Ok(flagging::check_request(
            Self::NAME,
            self.tokenizer(),
            request,
            &self.config.flagging,
        ))
    }

    fn transform_body(&self, request: &mut FireworksRequest, actor_id: &str) {
        if request.n.is_some_and(|n| n > 1) {
            request.n = Some(1);
        }
        request.user = Some(actor_id.to_string());
        if let Some(replacement) = self.config.model_rewrites.get(&request.model) {
            tracing::info!(
                provider = Self::NAME,
                from = %request.model,
                to = %replacement,
                "rewriting deprecated model"
            );
            request.model = replacement.clone();
        }
    }

    fn get_request_metadata(&self, request: &FireworksRequest) -> (String, Map<String, Value>) {
        let mut m = base_metadata(&request.model, request.stream);
        if let Some(max) = request.max_tokens {
            m.insert("max_tokens".into(), json!(max));
        }
        (request.model.clone(), m)
    }

    fn transform_request(&self, request: &mut reqwest::Request) -> Result<(), GatewayError> {
        let headers = request.headers_mut();
        headers.insert(CONTENT_TYPE, header_value("application/json")?);
        headers.insert(
            AUTHORIZATION,
            header_value(&format!("Bearer {}", self.config.access_token))?,
        );
        headers.insert(USER_AGENT, header_value(&user_agent())?);
        Ok(())
    }

    fn get_api_url(&self, feature: Feature, _request: &FireworksRequest) -> String {
        match feature {
            Feature::ChatCompletions => {
                format!("{}/inference/v1/chat/completions", self.config.base_url)
            }
            Feature::CodeCompletions => format!("{}/inference/v1/completions", self.config.base_url),
        }
    }

    fn parse_response_and_usage(
        &self,
        request: &FireworksRequest,
        body: &mut dyn BufRead,
    ) -> (UsageStats, UsageStats) {
        let prompt_chars = text_len(&request.flattened_prompt());
        let tokenizer_prompt_tokens = self.tokenizer_prompt_tokens(request);

        if !request.stream {
            let Some(resp) = decode_body::<FireworksResponse>(Self::NAME, body) else {
                return (
                    UsageStats {
                        characters: prompt_chars,
                        tokens: tokenizer_prompt_tokens,
                        tokenizer_tokens: tokenizer_prompt_tokens,
                    },
                    UsageStats::default(),
                );
            };
            let usage = resp.usage.unwrap_or_default();
            let text = resp
                .choices
                .into_iter()
                .next()
                .map(FireworksChoice::into_text)
                .unwrap_or_default();
            let completion_tokenizer = count_tokens(Self::NAME, self.tokenizer(), &text);
            return (
                UsageStats {
                    characters: prompt_chars,
                    tokens: usage.prompt_tokens.unwrap_or(tokenizer_prompt_tokens),
                    tokenizer_tokens: tokenizer_prompt_tokens,
                },
                UsageStats {
                    characters: text_len(&text),
                    tokens: usage.completion_tokens.unwrap_or(completion_tokenizer),
                    tokenizer_tokens: completion_tokenizer,
                },
            );
        }

        let mut completion = String::new();
        let mut reported = FireworksUsage::default();
        drain_events::<FireworksResponse, _>(Self::NAME, body, Dialect::DoneTerminated, |ev| {
            if let Some(u) = ev.usage {
                reported.prompt_tokens = u.prompt_tokens.or(reported.prompt_tokens);
                reported.completion_tokens = u.completion_tokens.or(reported.completion_tokens);
            }
            if let Some(choice) = ev.choices.into_iter().next() {
                completion = choice.into_text();
            }
        });

        // 流式响应只信任上游上报的用量，不做本地分词回退
        (
            UsageStats {
                characters: prompt_chars,
                tokens: reported.prompt_tokens.unwrap_or(UNKNOWN_TOKENS),
                tokenizer_tokens: tokenizer_prompt_tokens,
            },
            UsageStats {
                characters: text_len(&completion),
                tokens: reported.completion_tokens.unwrap_or(UNKNOWN_TOKENS),
                tokenizer_tokens: UNKNOWN_TOKENS,
            },
        )
    }
}
