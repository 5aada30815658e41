//! Echo filtering: rejecting STT output that is the agent hearing itself.
//!
//! Telephony loopback routinely feeds agent speech back into the caller
//! leg, and the STT engine dutifully transcribes it. Each agent utterance
//! is recorded in a bounded register; incoming transcripts that match a
//! recent entry (substring either way, or high token overlap) are dropped
//! before they can start a turn.

use crate::config::EchoConfig;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Filter decision for one incoming transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoVerdict {
    Pass,
    /// Matches a recently spoken agent utterance.
    Echo,
    /// Degenerate output (empty, or implausibly short during playback).
    Corrupt,
}

#[derive(Debug)]
struct EchoEntry {
    normalized: String,
    emitted_at: Instant,
}

/// Bounded register of recent agent utterances.
#[derive(Debug)]
pub struct EchoRegister {
    entries: VecDeque<EchoEntry>,
    window: Duration,
    max_entries: usize,
    overlap_threshold: f32,
    min_len_during_playback: usize,
}

impl EchoRegister {
    pub fn new(config: &EchoConfig) -> Self {
        Self {
            entries: VecDeque::with_capacity(config.max_entries),
            window: Duration::from_secs(config.window_secs),
            max_entries: config.max_entries,
            overlap_threshold: config.overlap_threshold,
            min_len_during_playback: config.min_len_during_playback,
        }
    }

    /// Record an agent utterance at its emission time.
    pub fn record(&mut self, text: &str, emitted_at: Instant) {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return;
        }
        self.entries.push_back(EchoEntry {
            normalized,
            emitted_at,
        });
        while self.entries.len() > self.max_entries {
            let _ = self.entries.pop_front();
        }
    }

    /// Judge an incoming STT result.
    pub fn verdict(&self, text: &str, now: Instant, playback_active: bool) -> EchoVerdict {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return EchoVerdict::Corrupt;
        }
        if playback_active && normalized.len() < self.min_len_during_playback {
            return EchoVerdict::Corrupt;
        }

        let tokens: Vec<&str> = normalized.split_whitespace().collect();
        for entry in &self.entries {
            if now.saturating_duration_since(entry.emitted_at) > self.window {
                continue;
            }
            if entry.normalized == normalized
                || entry.normalized.contains(&normalized)
                || normalized.contains(&entry.normalized)
            {
                return EchoVerdict::Echo;
            }
            if token_overlap(&tokens, &entry.normalized) >= self.overlap_threshold {
                return EchoVerdict::Echo;
            }
        }
        EchoVerdict::Pass
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lowercase and strip everything but alphanumerics and single spaces.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Overlap coefficient: shared tokens over the smaller token set.
///
/// Stronger than the substring check for reordered or partially garbled
/// echo ("thirty dollars our plans start at").
fn token_overlap(tokens: &[&str], entry: &str) -> f32 {
    if tokens.is_empty() {
        return 0.0;
    }
    let entry_tokens: Vec<&str> = entry.split_whitespace().collect();
    if entry_tokens.is_empty() {
        return 0.0;
    }
    let shared = tokens.iter().filter(|t| entry_tokens.contains(*t)).count();
    shared as f32 / tokens.len().min(entry_tokens.len()) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register() -> EchoRegister {
        EchoRegister::new(&EchoConfig::default())
    }

    #[test]
    fn exact_echo_is_dropped() {
        let mut reg = register();
        let now = Instant::now();
        reg.record("Our plans start at thirty dollars.", now);
        let verdict = reg.verdict("our plans start at thirty dollars", now + Duration::from_secs(2), false);
        assert_eq!(verdict, EchoVerdict::Echo);
    }

    #[test]
    fn normalization_ignores_case_and_punctuation() {
        let mut reg = register();
        let now = Instant::now();
        reg.record("Sure — I can help with that!", now);
        assert_eq!(
            reg.verdict("sure, i can help with that", now, false),
            EchoVerdict::Echo
        );
    }

    #[test]
    fn substring_and_superstring_match() {
        let mut reg = register();
        let now = Instant::now();
        reg.record("Our plans start at thirty dollars a month.", now);
        assert_eq!(
            reg.verdict("plans start at thirty", now, false),
            EchoVerdict::Echo
        );
        assert_eq!(
            reg.verdict("um our plans start at thirty dollars a month", now, false),
            EchoVerdict::Echo
        );
    }

    #[test]
    fn high_token_overlap_matches_reordered_echo() {
        let mut reg = register();
        let now = Instant::now();
        reg.record("Our plans start at thirty dollars.", now);
        assert_eq!(
            reg.verdict("thirty dollars our plans start", now, false),
            EchoVerdict::Echo
        );
    }

    #[test]
    fn structurally_different_text_passes() {
        let mut reg = register();
        let now = Instant::now();
        reg.record("Our plans start at thirty dollars.", now);
        assert_eq!(
            reg.verdict("actually I just need support", now, false),
            EchoVerdict::Pass
        );
    }

    #[test]
    fn entries_outside_window_no_longer_match() {
        let mut reg = register();
        let t0 = Instant::now();
        reg.record("our plans start at thirty dollars", t0);
        let later = t0 + Duration::from_secs(30);
        assert_eq!(
            reg.verdict("our plans start at thirty dollars", later, false),
            EchoVerdict::Pass
        );
    }

    #[test]
    fn register_is_bounded() {
        let mut reg = register();
        let now = Instant::now();
        for i in 0..100 {
            reg.record(&format!("utterance number {i} in a long call"), now);
        }
        assert_eq!(reg.len(), EchoConfig::default().max_entries);
    }

    #[test]
    fn empty_transcript_is_corrupt() {
        let reg = register();
        assert_eq!(reg.verdict("  ...  ", Instant::now(), false), EchoVerdict::Corrupt);
    }

    #[test]
    fn tiny_transcript_during_playback_is_corrupt() {
        let reg = register();
        assert_eq!(reg.verdict("mm", Instant::now(), true), EchoVerdict::Corrupt);
        // The same text is fine when nothing is playing.
        assert_eq!(reg.verdict("mm", Instant::now(), false), EchoVerdict::Pass);
    }
}
