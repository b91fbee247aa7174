use std::io::BufRead;

use serde::de::DeserializeOwned;

use super::UNKNOWN_TOKENS;
use super::streaming::{Decoder, Dialect};
use crate::tokenizer::Tokenizer;

/// Character count in Unicode scalar values.
pub fn text_len(text: &str) -> usize {
    text.chars().count()
}

/// Tokenizer count for `text`, or [`UNKNOWN_TOKENS`] when no tokenizer is
/// configured or tokenization fails.
pub fn count_tokens(provider: &str, tokenizer: Option<&dyn Tokenizer>, text: &str) -> i64 {
    let Some(tk) = tokenizer else {
        return UNKNOWN_TOKENS;
    };
    match tk.tokenize(text) {
        Ok(tokens) => tokens.len() as i64,
        Err(e) => {
            tracing::warn!(provider, error = %e, "failed to count tokens");
            UNKNOWN_TOKENS
        }
    }
}

/// Drains an SSE body, handing every JSON frame that parses as `T` to
/// `on_event`. Noise frames are skipped; parse failures are logged and
/// skipped. Returns the number of events delivered.
pub fn drain_events<T, F>(
    provider: &str,
    reader: &mut dyn BufRead,
    dialect: Dialect,
    mut on_event: F,
) -> usize
where
    T: DeserializeOwned,
    F: FnMut(T),
{
    let mut decoder = Decoder::new(reader, dialect);
    let mut delivered = 0;
    while decoder.scan() {
        let data = decoder.data();
        if !data.starts_with(b"{") {
            continue;
        }
        match serde_json::from_slice::<T>(data) {
            Ok(event) => {
                on_event(event);
                delivered += 1;
            }
            Err(e) => {
                tracing::warn!(provider, error = %e, "failed to decode streaming event");
            }
        }
    }
    if let Some(e) = decoder.err() {
        tracing::error!(provider, error = %e, "failed to read streaming response");
    }
    delivered
}

/// Decodes a buffered JSON body, logging and returning `None` on failure.
pub fn decode_body<T: DeserializeOwned>(provider: &str, reader: &mut dyn BufRead) -> Option<T> {
    let mut body = Vec::new();
    if let Err(e) = reader.read_to_end(&mut body) {
        tracing::error!(provider, error = %e, "failed to read response body");
        return None;
    }
    match serde_json::from_slice(&body) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::error!(provider, error = %e, "failed to decode response body");
            None
        }
    }
}
