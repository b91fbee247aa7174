use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TokenizerError {
    #[error("failed to load tokenizer {name}: {reason}")]
    Load { name: String, reason: String },

    #[cfg(test)]
    #[error("failed to tokenize text: {0}")]
    Encode(String),
}

/// Provider-specific tokenizer. Only the token count is ever used by the gateway.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>, TokenizerError>;
}

pub struct TiktokenTokenizer {
    bpe: tiktoken_rs::CoreBPE,
}

impl TiktokenTokenizer {
    pub fn cl100k_base() -> Result<Self, TokenizerError> {
        tiktoken_rs::cl100k_base()
            .map(|bpe| Self { bpe })
            .map_err(|e| TokenizerError::Load {
                name: "cl100k_base".into(),
                reason: e.to_string(),
            })
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>, TokenizerError> {
        Ok(self
            .bpe
            .encode_with_special_tokens(text)
            .into_iter()
            .map(|t| t as u32)
            .collect())
    }
}

/// Resolves a tokenizer by its configured name.
pub fn load(name: Option<&str>) -> Result<Option<Arc<dyn Tokenizer>>, TokenizerError> {
    match name.map(str::trim) {
        None | Some("") | Some("none") => Ok(None),
        Some("cl100k_base") => Ok(Some(Arc::new(TiktokenTokenizer::cl100k_base()?))),
        Some(other) => Err(TokenizerError::Load {
            name: other.to_string(),
            reason: "unsupported tokenizer".into(),
        }),
    }
}
