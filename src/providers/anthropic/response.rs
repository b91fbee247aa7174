use serde::Deserialize;

/// Buffered body and every streaming event share this shape. Streaming
/// events carry the cumulative completion so far.
#[derive(Debug, Deserialize)]
pub struct AnthropicCompletion {
    #[serde(default)]
    pub completion: String,
}
