use std::borrow::Cow;
use std::cell::OnceCell;

use serde::{Deserialize, Serialize};

use crate::flagging::FlaggingRequest;
use crate::providers::UpstreamRequest;
use crate::tokenizer::{Tokenizer, TokenizerError};

/// Legacy text-completions request (`/v1/complete`).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AnthropicRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub max_tokens_to_sample: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AnthropicMetadata>,

    #[serde(skip)]
    prompt_tokens: OnceCell<Result<usize, TokenizerError>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnthropicMetadata {
    #[serde(default)]
    pub user_id: String,
}

impl FlaggingRequest for AnthropicRequest {
    fn flattened_prompt(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.prompt)
    }

    fn max_tokens(&self) -> u32 {
        self.max_tokens_to_sample
    }

    fn prompt_token_count(&self, tokenizer: &dyn Tokenizer) -> Result<usize, TokenizerError> {
        self.prompt_tokens
            .get_or_init(|| tokenizer.tokenize(&self.prompt).map(|t| t.len()))
            .clone()
    }
}

impl UpstreamRequest for AnthropicRequest {
    fn should_stream(&self) -> bool {
        self.stream
    }
}
