use std::io::BufRead;
use std::sync::Arc;

use reqwest::header::{CONTENT_TYPE, HeaderName, USER_AGENT};
use serde_json::{Map, Value, json};

use crate::actor::Feature;
use crate::error::GatewayError;
use crate::flagging::{self, FlaggingRequest, FlaggingResult};
use crate::tokenizer::Tokenizer;

use super::streaming::Dialect;
use super::usage::{count_tokens, decode_body, drain_events, text_len};
use super::{
    ProviderAdapter, UNKNOWN_TOKENS, UpstreamHandlerConfig, UsageStats, base_metadata,
    header_value, user_agent,
};

mod request;
mod response;

pub use request::{AnthropicMetadata, AnthropicRequest};
use response::AnthropicCompletion;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const API_VERSION: &str = "2023-01-01";

pub struct AnthropicAdapter {
    config: UpstreamHandlerConfig,
    tokenizer: Option<Arc<dyn Tokenizer>>,
}

impl AnthropicAdapter {
    pub fn new(config: UpstreamHandlerConfig, tokenizer: Option<Arc<dyn Tokenizer>>) -> Self {
        Self { config, tokenizer }
    }

    fn prompt_usage(&self, request: &AnthropicRequest) -> UsageStats {
        let tokens = match self.tokenizer() {
            Some(tk) => match request.prompt_token_count(tk) {
                Ok(n) => n as i64,
                Err(e) => {
                    tracing::warn!(provider = Self::NAME, error = %e, "failed to count prompt tokens");
                    UNKNOWN_TOKENS
                }
            },
            None => UNKNOWN_TOKENS,
        };
        UsageStats {
            characters: text_len(&request.prompt),
            tokens,
            tokenizer_tokens: tokens,
        }
    }

    fn completion_usage(&self, completion: &str) -> UsageStats {
        let tokens = count_tokens(Self::NAME, self.tokenizer(), completion);
        UsageStats {
            characters: text_len(completion),
            tokens,
            tokenizer_tokens: tokens,
        }
    }
}

impl ProviderAdapter for AnthropicAdapter {
    type Request = AnthropicRequest;

    const NAME: &'static str = "anthropic";

    fn config(&self) -> &UpstreamHandlerConfig {
        &self.config
    }

    fn tokenizer(&self) -> Option<&dyn Tokenizer> {
        self.tokenizer.as_deref()
    }

    fn validate_request(
        &self,
        _feature: Feature,
        request: &AnthropicRequest,
    ) -> Result<Option<FlaggingResult>, GatewayError> {
        if request.max_tokens_to_sample > self.config.max_tokens_to_sample {
            return Err(GatewayError::Validation(format!(
                "max_tokens_to_sample exceeds maximum allowed value of {}: {}",
                self.config.max_tokens_to_sample, request.max_tokens_to_sample
            )));
        }
        Ok(flagging::check_request(
            Self::NAME,
            self.tokenizer(),
            request,
            &self.config.flagging,
        ))
    }

    fn transform_body(&self, request: &mut AnthropicRequest, actor_id: &str) {
        request.metadata = Some(AnthropicMetadata {
            user_id: actor_id.to_string(),
        });
    }

    fn get_request_metadata(&self, request: &AnthropicRequest) -> (String, Map<String, Value>) {
        let mut m = base_metadata(&request.model, request.stream);
        m.insert(
            "max_tokens_to_sample".into(),
            json!(request.max_tokens_to_sample),
        );
        (request.model.clone(), m)
    }

    fn transform_request(&self, request: &mut reqwest::Request) -> Result<(), GatewayError> {
        let headers = request.headers_mut();
        headers.insert(CONTENT_TYPE, header_value("application/json")?);
        headers.insert(
            HeaderName::from_static("x-api-key"),
            header_value(&self.config.access_token)?,
        );
        headers.insert(
            HeaderName::from_static("anthropic-version"),
            header_value(API_VERSION)?,
        );
        headers.insert(USER_AGENT, header_value(&user_agent())?);
        Ok(())
    }

    fn get_api_url(&self, _feature: Feature, _request: &AnthropicRequest) -> String {
        format!("{}/v1/complete", self.config.base_url)
    }

    fn parse_response_and_usage(
        &self,
        request: &AnthropicRequest,
        body: &mut dyn BufRead,
    ) -> (UsageStats, UsageStats) {
        let prompt = self.prompt_usage(request);

        if !request.stream {
            return match decode_body::<AnthropicCompletion>(Self::NAME, body) {
                Some(resp) => (prompt, self.completion_usage(&resp.completion)),
                None => (prompt, UsageStats::default()),
            };
        }

        let mut last = String::new();
        drain_events::<AnthropicCompletion, _>(
            Self::NAME,
            body,
            Dialect::DoneTerminated,
            |ev| last = ev.completion,
        );
        (prompt, self.completion_usage(&last))
    }
}
