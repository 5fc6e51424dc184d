//! Speculative-decoding verification.
//!
//! A fast draft model proposes tokens; a peer running the target model
//! accepts the longest prefix that matches its own greedy continuation
//! (the stronger semantics; first-token-only comparison is the documented
//! simpler alternative).  On a mismatch the response carries the index of
//! the first rejected draft token and the target's token as a fallback.

use std::sync::Arc;

use elio_agent::{AgentError, Backend, GenerationSettings};
use tracing::debug;

use crate::protocol::{InferencePayload, SpecVerifyRequest, SpecVerifyResponse};
use crate::server::{NullSink, payload_to_messages};

/// Responder side: generate the target continuation and compare.
pub(crate) async fn handle_verify(
    backend: &Arc<dyn Backend>,
    request: SpecVerifyRequest,
) -> SpecVerifyResponse {
    let target_text = match generate_target(backend, &request.payload).await {
        Ok(text) => text,
        Err(err) => {
            debug!(error = %err, "target generation failed; rejecting all draft tokens");
            return SpecVerifyResponse {
                request_id: request.request_id,
                accepted_tokens: Vec::new(),
                rejected_index: Some(0),
                fallback_token: None,
            };
        }
    };

    let (accepted, rejected_index, fallback) = greedy_prefix(&target_text, &request.draft_tokens);
    SpecVerifyResponse {
        request_id: request.request_id,
        accepted_tokens: accepted,
        rejected_index,
        fallback_token: fallback,
    }
}

async fn generate_target(
    backend: &Arc<dyn Backend>,
    payload: &InferencePayload,
) -> Result<String, AgentError> {
    let messages = payload_to_messages(payload);
    let settings = GenerationSettings {
        max_tokens: payload.settings.max_tokens,
        temperature: payload.settings.temperature,
    };
    backend
        .generate(
            &messages,
            payload.system_prompt.as_deref().unwrap_or(""),
            &settings,
            &NullSink,
        )
        .await
}

/// Accepts draft tokens while their concatenation is a prefix of the target
/// text.  Returns `(accepted, rejected_index, fallback_token)`.
fn greedy_prefix(
    target: &str,
    draft_tokens: &[String],
) -> (Vec<String>, Option<usize>, Option<String>) {
    let mut consumed = 0;
    let mut accepted = Vec::new();
    for token in draft_tokens {
        if target[consumed..].starts_with(token.as_str()) {
            consumed += token.len();
            accepted.push(token.clone());
        } else {
            break;
        }
    }
    if accepted.len() == draft_tokens.len() {
        return (accepted, None, None);
    }
    let rejected_index = Some(accepted.len());
    let fallback = next_token(&target[consumed..]);
    (accepted, rejected_index, fallback)
}

/// The target's next token: leading whitespace, one run of non-whitespace,
/// and the whitespace that follows it (so accepted + fallback remains a
/// prefix of the target text).
fn next_token(rest: &str) -> Option<String> {
    if rest.is_empty() {
        return None;
    }
    let mut end = 0;
    let mut seen_word = false;
    for (i, c) in rest.char_indices() {
        if c.is_whitespace() {
            end = i + c.len_utf8();
        } else {
            // A second word begins; the token ends at the whitespace run.
            if seen_word && rest[..i].ends_with(char::is_whitespace) {
                break;
            }
            seen_word = true;
            end = i + c.len_utf8();
        }
    }
    Some(rest[..end].to_string())
}

/// Splits text into tokens whose concatenation reproduces the text: each
/// token is one non-whitespace run plus its trailing whitespace.
pub fn draft_tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_trailing_ws = false;
    for c in text.chars() {
        if c.is_whitespace() {
            in_trailing_ws = !current.is_empty();
            current.push(c);
            if !in_trailing_ws {
                // Leading whitespace sticks to the next token.
                continue;
            }
        } else {
            if in_trailing_ws {
                tokens.push(std::mem::take(&mut current));
                in_trailing_ws = false;
            }
            current.push(c);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_acceptance() {
        let (accepted, rejected, fallback) = greedy_prefix(
            "the quick brown fox",
            &["the ".to_string(), "quick ".to_string()],
        );
        assert_eq!(accepted, ["the ", "quick "]);
        assert_eq!(rejected, None);
        assert_eq!(fallback, None);
    }

    #[test]
    fn mismatch_returns_index_and_fallback() {
        let (accepted, rejected, fallback) = greedy_prefix(
            "the quick brown fox",
            &[
                "the ".to_string(),
                "quick ".to_string(),
                "clown ".to_string(),
            ],
        );
        assert_eq!(accepted, ["the ", "quick "]);
        assert_eq!(rejected, Some(2));
        assert_eq!(fallback.as_deref(), Some("brown "));
    }

    #[test]
    fn first_token_mismatch_yields_empty_accept_set() {
        let (accepted, rejected, fallback) =
            greedy_prefix("hello world", &["goodbye ".to_string()]);
        assert!(accepted.is_empty());
        assert_eq!(rejected, Some(0));
        assert_eq!(fallback.as_deref(), Some("hello "));
    }

    #[test]
    fn tokenize_concatenates_back_to_the_input() {
        for text in ["the quick brown fox", "  leading", "trailing  ", "one"] {
            let tokens = draft_tokenize(text);
            assert_eq!(tokens.concat(), text);
        }
    }

    #[test]
    fn tokenize_splits_on_word_boundaries() {
        assert_eq!(draft_tokenize("a b c"), ["a ", "b ", "c"]);
        assert_eq!(draft_tokenize("a  b"), ["a  ", "b"]);
    }
}
