use std::borrow::Cow;
use std::cell::OnceCell;
use std::io::BufRead;
use std::sync::Arc;

use reqwest::header::{CONTENT_TYPE, USER_AGENT};
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

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GooglePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// inlineData, functionCall and friends are forwarded untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoogleContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<GooglePart>,
}

impl GoogleContent {
    fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

/// `model` and `stream` come from the client body but travel in the URL.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleRequest {
    #[serde(default, skip_serializing)]
    pub model: String,
    #[serde(default, skip_serializing)]
    pub stream: bool,
    #[serde(default)]
    pub contents: Vec<GoogleContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safety_settings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GoogleContent>,

    #[serde(skip)]
    prompt_tokens: OnceCell<Result<usize, TokenizerError>>,
}

impl FlaggingRequest for GoogleRequest {
    fn flattened_prompt(&self) -> Cow<'_, str> {
        let texts: Vec<String> = self
            .system_instruction
            .iter()
            .chain(self.contents.iter())
            .map(GoogleContent::text)
            .filter(|t| !t.is_empty())
            .collect();
        Cow::Owned(texts.join("\n"))
    }

    fn max_tokens(&self) -> u32 {
        self.generation_config
            .as_ref()
            .and_then(|g| g.max_output_tokens)
            .unwrap_or_default()
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

impl UpstreamRequest for GoogleRequest {
    fn should_stream(&self) -> bool {
        self.stream
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<i64>,
    #[serde(default)]
    candidates_token_count: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: GoogleContent,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

impl GoogleResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .map(|c| c.content.text())
            .unwrap_or_default()
    }
}

pub struct GoogleAdapter {
    config: UpstreamHandlerConfig,
    tokenizer: Option<Arc<dyn Tokenizer>>,
}

impl GoogleAdapter {
    pub fn new(config: UpstreamHandlerConfig, tokenizer: Option<Arc<dyn Tokenizer>>) -> Self {
        Self { config, tokenizer }
    }

    fn usage(&self, request: &GoogleRequest, text: &str, reported: UsageMetadata) -> (UsageStats, UsageStats) {
        let prompt_tokenizer = match self.tokenizer() {
            Some(tk) => request
                .prompt_token_count(tk)
                .map(|n| n as i64)
                .unwrap_or(UNKNOWN_TOKENS),
            None => UNKNOWN_TOKENS,
        };
        let completion_tokenizer = count_tokens(Self::NAME, self.tokenizer(), text);
        (
            UsageStats {
                characters: text_len(&request.flattened_prompt()),
                tokens: reported.prompt_token_count.unwrap_or(prompt_tokenizer),
                tokenizer_tokens: prompt_tokenizer,
            },
            UsageStats {
                characters: text_len(text),
                tokens: reported.candidates_token_count.unwrap_or(completion_tokenizer),
                tokenizer_tokens: completion_tokenizer,
            },
        )
    }
}

impl ProviderAdapter for GoogleAdapter {
    type Request = GoogleRequest;

    const NAME: &'static str = "google";

    fn config(&self) -> &UpstreamHandlerConfig {
        &self.config
    }

    fn tokenizer(&self) -> Option<&dyn Tokenizer> {
        self.tokenizer.as_deref()
    }

    fn validate_request(
        &self,
        feature: Feature,
        request: &GoogleRequest,
    ) -> Result<Option<FlaggingResult>, GatewayError> {
        if request.contents.is_empty() {
            return Err(GatewayError::Validation("contents must not be empty".into()));
        }
        let max = request.max_tokens();
        if max > self.config.max_tokens_to_sample {
            return Err(GatewayError::Validation(format!(
                "maxOutputTokens exceeds maximum allowed value of {}: {}",
                self.config.max_tokens_to_sample, max
            )));
        }
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

    // Gemini 请求体没有调用方身份字段，这里只限制候选数
    fn transform_body(&self, request: &mut GoogleRequest, _actor_id: &str) {
        if let Some(cfg) = request.generation_config.as_mut()
            && cfg.candidate_count.is_some_and(|n| n > 1)
        {
            cfg.candidate_count = Some(1);
        }
    }

    fn get_request_metadata(&self, request: &GoogleRequest) -> (String, Map<String, Value>) {
        let mut m = base_metadata(&request.model, request.stream);
        if let Some(max) = request.generation_config.as_ref().and_then(|g| g.max_output_tokens) {
            m.insert("max_tokens".into(), json!(max));
        }
        (request.model.clone(), m)
    }

    fn transform_request(&self, request: &mut reqwest::Request) -> Result<(), GatewayError> {
        let headers = request.headers_mut();
        headers.insert(CONTENT_TYPE, header_value("application/json")?);
        headers.insert(USER_AGENT, header_value(&user_agent())?);
        Ok(())
    }

    /// Contains the API key; must never be logged.
    fn get_api_url(&self, _feature: Feature, request: &GoogleRequest) -> String {
        let base = &self.config.base_url;
        let model = &request.model;
        let key = &self.config.access_token;
        if request.stream {
            format!("{base}/v1beta/models/{model}:streamGenerateContent?key={key}&alt=sse")
        } else {
            format!("{base}/v1beta/models/{model}:generateContent?key={key}")
        }
    }

    fn parse_response_and_usage(
        &self,
        request: &GoogleRequest,
        body: &mut dyn BufRead,
    ) -> (UsageStats, UsageStats) {
        if !request.stream {
            return match decode_body::<GoogleResponse>(Self::NAME, body) {
                Some(resp) => {
                    let text = resp.text();
                    self.usage(request, &text, resp.usage_metadata.unwrap_or_default())
                }
                None => {
                    let (prompt, _) = self.usage(request, "", UsageMetadata::default());
                    (prompt, UsageStats::default())
                }
            };
        }

        let mut completion = String::new();
        let mut reported = UsageMetadata::default();
        drain_events::<GoogleResponse, _>(Self::NAME, body, Dialect::Plain, |ev| {
            if let Some(u) = &ev.usage_metadata {
                reported.prompt_token_count = u.prompt_token_count.or(reported.prompt_token_count);
                reported.candidates_token_count =
                    u.candidates_token_count.or(reported.candidates_token_count);
            }
            if !ev.candidates.is_empty() {
                completion = ev.text();
            }
        });
        self.usage(request, &completion, reported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::ProviderConfig;
    use crate::tokenizer::testing::WhitespaceTokenizer;

    fn adapter(tokenizer: Option<Arc<dyn Tokenizer>>) -> GoogleAdapter {
        let cfg: ProviderConfig = toml::from_str(
            r#"
access_token = "g-key"
allowed_models = ["gemini-pro"]
max_tokens_to_sample = 1000
"#,
        )
        .unwrap();
        GoogleAdapter::new(UpstreamHandlerConfig::from_provider(&cfg, DEFAULT_BASE_URL), tokenizer)
    }

    const BODY: &str = r#"{"model":"gemini-pro","stream":true,"contents":[{"role":"user","parts":[{"text":"hi there"}]}],"generationConfig":{"maxOutputTokens":100,"candidateCount":3},"systemInstruction":{"parts":[{"text":"be brief"}]}}"#;

    fn request(body: &str) -> GoogleRequest {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn model_and_stream_stay_out_of_the_body() {
        let a = adapter(None);
        let mut req = request(BODY);
        a.transform_body(&mut req, "actor-1");
        let body = serde_json::to_value(&req).unwrap();
        assert!(body.get("model").is_none());
        assert!(body.get("stream").is_none());
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 100);
        assert_eq!(body["generationConfig"]["candidateCount"], 1);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
    }

    #[test]
    fn url_selects_streaming_endpoint() {
        let a = adapter(None);
        let mut req = request(BODY);
        assert_eq!(
            a.get_api_url(Feature::ChatCompletions, &req),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:streamGenerateContent?key=g-key&alt=sse"
        );
        req.stream = false;
        assert!(a.get_api_url(Feature::ChatCompletions, &req).ends_with(":generateContent?key=g-key"));
    }

    #[test]
    fn flattened_prompt_includes_system_instruction() {
        let req = request(BODY);
        assert_eq!(req.flattened_prompt(), "be brief\nhi there");
        assert_eq!(req.max_tokens(), 100);
    }

    #[test]
    fn rejects_high_max_output_tokens() {
        let req = request(
            r#"{"model":"gemini-pro","contents":[{"parts":[{"text":"x"}]}],"generationConfig":{"maxOutputTokens":5000}}"#,
        );
        assert!(matches!(
            adapter(None).validate_request(Feature::ChatCompletions, &req),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn streaming_usage_uses_reported_counts() {
        let a = adapter(None);
        let req = request(BODY);
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo!\"}]}}],\"usageMetadata\":{\"promptTokenCount\":4,\"candidatesTokenCount\":2}}\r\n\r\n",
        );
        let (p, c) = a.parse_response_and_usage(&req, &mut body.as_bytes());
        assert_eq!(p.tokens, 4);
        assert_eq!(p.tokenizer_tokens, UNKNOWN_TOKENS);
        assert_eq!(c.characters, 3);
        assert_eq!(c.tokens, 2);
    }

    #[test]
    fn buffered_usage_falls_back_to_tokenizer() {
        let a = adapter(Some(Arc::new(WhitespaceTokenizer::default())));
        let mut req = request(BODY);
        req.stream = false;
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"a b c"}]}}]}"#;
        let (p, c) = a.parse_response_and_usage(&req, &mut body.as_bytes());
        assert_eq!(p.tokens, 4);
        assert_eq!(c.tokens, 3);
        assert_eq!(c.characters, 5);
    }
}
