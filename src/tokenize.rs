//! Text tokeniser wrapping the model repo's `tokenizer.json`.
//!
//! The exported embedder shares one id space between text tokens and speech
//! tokens: ids at or above the start-of-speech id are speech tokens and carry
//! position 0, text tokens are numbered from -1 upwards (the leading
//! start-of-text token gets -1).

use std::path::Path;

use anyhow::{anyhow, bail, Result};
use tokenizers::Tokenizer;

/// Token ids plus the matching position ids, both `[1, seq_len]` row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextTokens {
    pub input_ids: Vec<i64>,
    pub position_ids: Vec<i64>,
}

impl TextTokens {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Position ids for a token sequence (see module docs).
pub fn position_ids(input_ids: &[i64], start_speech_token: i64) -> Vec<i64> {
    input_ids
        .iter()
        .enumerate()
        .map(|(i, &id)| if id >= start_speech_token { 0 } else { i as i64 - 1 })
        .collect()
}

pub struct TextTokenizer {
    inner: Tokenizer,
    start_speech_token: i64,
}

impl TextTokenizer {
    pub fn from_file(path: &Path, start_speech_token: i64) -> Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Cannot load tokenizer {}: {}", path.display(), e))?;
        Ok(Self { inner, start_speech_token })
    }

    /// Tokenise `text` (special tokens added by the tokenizer's template).
    pub fn encode(&self, text: &str) -> Result<TextTokens> {
        let text = text.trim();
        if text.is_empty() {
            bail!("Input text is empty");
        }
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenisation failed for {:?}: {}", text, e))?;
        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if input_ids.is_empty() {
            bail!("Tokeniser produced no tokens for {:?}", text);
        }
        let position_ids = position_ids(&input_ids, self.start_speech_token);
        Ok(TextTokens { input_ids, position_ids })
    }
}
