//! Local token counting with tiktoken encodings.
//!
//! The encoding is picked from the model name the same way OpenAI's
//! `tiktoken` does. Names it does not know fall back to `o200k_base`.

use tiktoken_rs::tokenizer::{get_tokenizer, Tokenizer};
use tiktoken_rs::CoreBPE;

use crate::gateway::ChatMessage;
use crate::Error;

pub const FALLBACK_ENCODING: Tokenizer = Tokenizer::O200kBase;

/// Overhead the chat format adds around every message.
const TOKENS_PER_MESSAGE: usize = 3;
/// Extra token for a message carrying a `name`.
const TOKENS_PER_NAME: usize = 1;
/// Every reply is primed with `<|start|>assistant<|message|>`.
const REPLY_PRIMING_TOKENS: usize = 3;

/// Counts tokens for one model.
///
/// Holds only the immutable BPE tables; counting never changes its state.
pub struct TokenCounter {
    model: String,
    encoding: Tokenizer,
    bpe: CoreBPE,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("model", &self.model)
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

impl TokenCounter {
    pub fn for_model(model: &str) -> Result<Self, Error> {
        let encoding = get_tokenizer(model).unwrap_or_else(|| {
            tracing::warn!(
                "model `{}` not recognised, using {:?} encoding",
                model,
                FALLBACK_ENCODING
            );
            FALLBACK_ENCODING
        });
        let bpe = tiktoken_rs::get_bpe_from_tokenizer(encoding)
            .map_err(|e| encoding_error(encoding, e))?;
        tracing::debug!("counting tokens for `{}` with {:?}", model, encoding);

        Ok(Self {
            model: model.to_owned(),
            encoding,
            bpe,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn encoding(&self) -> Tokenizer {
        self.encoding
    }

    /// Number of tokens in `text`. Special-token markup is counted as plain text.
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    /// Like [`Self::count`] for raw bytes, which must be UTF-8.
    pub fn count_bytes(&self, bytes: &[u8]) -> Result<usize, Error> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::InvalidInput(format!("text is not valid UTF-8: {e}")))?;
        Ok(self.count(text))
    }

    /// Tokens a chat request's messages occupy in the prompt, including the
    /// per-message framing and reply priming.
    pub fn count_messages(&self, messages: &[ChatMessage]) -> usize {
        let mut tokens = 0;
        for message in messages {
            tokens += TOKENS_PER_MESSAGE;
            tokens += self.count(&message.role);
            tokens += self.count(&message.content);
            if let Some(name) = &message.name {
                tokens += self.count(name) + TOKENS_PER_NAME;
            }
        }
        tokens + REPLY_PRIMING_TOKENS
    }
}

fn encoding_error(encoding: Tokenizer, reason: impl std::fmt::Display) -> Error {
    Error::Encoding {
        encoding: format!("{encoding:?}"),
        reason: reason.to_string(),
    }
}

/// One-off count of `text` under the encoding for `model`.
pub fn count_tokens(text: &str, model: &str) -> Result<usize, Error> {
    Ok(TokenCounter::for_model(model)?.count(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_encoding_by_model() {
        let counter = TokenCounter::for_model("gpt-4o-mini-2024-07-18").unwrap();
        assert_eq!(counter.encoding(), Tokenizer::O200kBase);

        let counter = TokenCounter::for_model("gpt-4").unwrap();
        assert_eq!(counter.encoding(), Tokenizer::Cl100kBase);
    }

    #[test]
    fn unknown_model_falls_back() {
        let counter = TokenCounter::for_model("my-private-finetune").unwrap();
        assert_eq!(counter.encoding(), FALLBACK_ENCODING);
        assert!(counter.count("hello world") > 0);
    }

    #[test]
    fn counting_is_deterministic() {
        let text = "Hello, Bonjour, Hola";
        let first = count_tokens(text, "gpt-4o").unwrap();
        let second = count_tokens(text, "gpt-4o").unwrap();
        assert_eq!(first, second);

        let counter = TokenCounter::for_model("gpt-4o").unwrap();
        assert_eq!(counter.count(text), first);
        assert_eq!(counter.count(text), counter.count(text));
    }

    #[test]
    fn counts_known_text() {
        let counter = TokenCounter::for_model("gpt-4o").unwrap();
        assert_eq!(counter.count(""), 0);
        assert_eq!(counter.count("hello world"), 2);
    }

    #[test]
    fn special_token_markup_is_plain_text() {
        let counter = TokenCounter::for_model("gpt-4").unwrap();
        assert!(counter.count("<|endoftext|>") > 1);
    }

    #[test]
    fn rejects_invalid_utf8() {
        let counter = TokenCounter::for_model("gpt-4o").unwrap();
        assert!(matches!(
            counter.count_bytes(&[0x66, 0xff, 0x6f]),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(counter.count_bytes(b"hello world").unwrap(), 2);
    }

    #[test]
    fn encoding_load_failure_is_not_invalid_input() {
        let error = encoding_error(Tokenizer::O200kBase, "tables unavailable");
        assert!(matches!(error, Error::Encoding { .. }));
        assert_eq!(
            error.to_string(),
            "failed to load the O200kBase token encoding: tables unavailable"
        );
    }

    #[test]
    fn message_overhead() {
        let counter = TokenCounter::for_model("gpt-4o").unwrap();
        let messages = [ChatMessage::system("hello world"), ChatMessage::user("")];
        let expected = 3 + counter.count("system") + 2 + 3 + counter.count("user") + 3;
        assert_eq!(counter.count_messages(&messages), expected);

        let named = [ChatMessage::user("hello world").with_name("ana")];
        let expected = 3 + counter.count("user") + 2 + counter.count("ana") + 1 + 3;
        assert_eq!(counter.count_messages(&named), expected);
    }
}
