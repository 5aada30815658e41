//! Sentence segmentation of the streaming LLM token output.
//!
//! TTS engines produce much better prosody on complete sentences than on
//! raw token fragments, so tokens are buffered and flushed at sentence
//! boundaries. The buffer also flushes unconditionally past a maximum
//! length so a rambling, punctuation-free response still starts playing.

use crate::config::SentenceConfig;

/// Punctuation that ends a speakable chunk.
const TERMINALS: [char; 5] = ['.', '!', '?', ':', ';'];

/// Accumulates LLM tokens and emits sentence-sized chunks for TTS.
#[derive(Debug)]
pub struct SentenceSplitter {
    buffer: String,
    min_chars: usize,
    max_chars: usize,
}

impl SentenceSplitter {
    pub fn new(config: &SentenceConfig) -> Self {
        Self {
            buffer: String::new(),
            min_chars: config.min_chars,
            max_chars: config.max_chars,
        }
    }

    /// Push a token fragment; returns a chunk when one is ready.
    pub fn push(&mut self, token: &str) -> Option<String> {
        self.buffer.push_str(token);

        let trimmed = self.buffer.trim();
        if trimmed.is_empty() {
            return None;
        }

        let ends_terminal = trimmed.chars().next_back().is_some_and(|c| TERMINALS.contains(&c));
        if self.buffer.len() >= self.max_chars || (self.buffer.len() >= self.min_chars && ends_terminal)
        {
            let chunk = trimmed.to_owned();
            self.buffer.clear();
            return Some(chunk);
        }
        None
    }

    /// End of stream: flush the trailing fragment if non-empty.
    pub fn finish(&mut self) -> Option<String> {
        let trimmed = self.buffer.trim();
        if trimmed.is_empty() {
            self.buffer.clear();
            return None;
        }
        let chunk = trimmed.to_owned();
        self.buffer.clear();
        Some(chunk)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.trim().is_empty()
    }
}
