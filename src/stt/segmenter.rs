//! Energy-gap utterance segmentation for batch-only STT adapters.
//!
//! Streaming STT providers detect voice activity themselves; batch
//! providers need complete utterances. This segmenter buffers inbound
//! wire audio while frame energy stays above the speech threshold and
//! emits the buffered utterance once a silence gap closes it.

use crate::config::{AudioConfig, SegmenterConfig};
use std::collections::VecDeque;

/// Accumulates wire audio into utterances on energy gaps.
#[derive(Debug)]
pub struct UtteranceSegmenter {
    /// Pre-roll kept so speech onset isn't clipped.
    pre_roll: VecDeque<u8>,
    pre_roll_max: usize,
    buffer: Vec<u8>,
    in_speech: bool,
    silence_bytes: usize,
    silence_bytes_threshold: usize,
    min_speech_bytes: usize,
    speech_rms_threshold: f32,
}

impl UtteranceSegmenter {
    pub fn new(config: &SegmenterConfig, audio: &AudioConfig) -> Self {
        let bytes_per_ms = audio.bytes_per_second as usize / 1_000;
        Self {
            pre_roll: VecDeque::new(),
            pre_roll_max: config.pre_roll_ms as usize * bytes_per_ms,
            buffer: Vec::new(),
            in_speech: false,
            silence_bytes: 0,
            silence_bytes_threshold: config.silence_gap_ms as usize * bytes_per_ms,
            min_speech_bytes: config.min_speech_ms as usize * bytes_per_ms,
            speech_rms_threshold: config.speech_rms_threshold,
        }
    }

    /// Feed one inbound frame with its precomputed RMS. Returns a complete
    /// utterance when a silence gap ends one.
    pub fn push_frame(&mut self, frame: &[u8], rms: f32) -> Option<Vec<u8>> {
        let is_speech = rms > self.speech_rms_threshold;

        if self.pre_roll_max > 0 && !self.in_speech {
            self.pre_roll.extend(frame.iter().copied());
            while self.pre_roll.len() > self.pre_roll_max {
                let _ = self.pre_roll.pop_front();
            }
        }

        if is_speech {
            if !self.in_speech {
                self.in_speech = true;
                self.buffer.clear();
                self.buffer.extend(self.pre_roll.iter().copied());
                self.pre_roll.clear();
            }
            self.silence_bytes = 0;
            self.buffer.extend_from_slice(frame);
            return None;
        }

        if !self.in_speech {
            return None;
        }

        // Silence within tolerance still belongs to the utterance.
        self.silence_bytes = self.silence_bytes.saturating_add(frame.len());
        self.buffer.extend_from_slice(frame);

        if self.silence_bytes < self.silence_bytes_threshold {
            return None;
        }

        self.in_speech = false;
        self.silence_bytes = 0;
        let utterance = std::mem::take(&mut self.buffer);
        (utterance.len() >= self.min_speech_bytes).then_some(utterance)
    }

    /// Flush whatever is buffered (call teardown).
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        self.in_speech = false;
        self.silence_bytes = 0;
        let utterance = std::mem::take(&mut self.buffer);
        (utterance.len() >= self.min_speech_bytes).then_some(utterance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmenter() -> UtteranceSegmenter {
        UtteranceSegmenter::new(&SegmenterConfig::default(), &AudioConfig::default())
    }

    const FRAME: usize = 160; // 20ms at 8kB/s

    #[test]
    fn speech_then_gap_emits_utterance() {
        let mut seg = segmenter();
        let speech = vec![0x20_u8; FRAME];
        let silence = vec![0xFF_u8; FRAME];

        // 400ms of speech.
        for _ in 0..20 {
            assert!(seg.push_frame(&speech, 0.5).is_none());
        }
        // 600ms of silence closes the utterance on the final frame.
        let mut emitted = None;
        for _ in 0..30 {
            if let Some(u) = seg.push_frame(&silence, 0.0) {
                emitted = Some(u);
            }
        }
        let utterance = emitted.expect("utterance after silence gap");
        // Speech plus trailing silence, at least the spoken 400ms.
        assert!(utterance.len() >= 20 * FRAME);
    }

    #[test]
    fn short_burst_is_discarded() {
        let mut seg = segmenter();
        let speech = vec![0x20_u8; FRAME];

        // A 60ms click is far below the 250ms minimum.
        for _ in 0..3 {
            assert!(seg.push_frame(&speech, 0.5).is_none());
        }
        assert!(seg.flush().is_none());
    }

    #[test]
    fn silence_only_never_emits() {
        let mut seg = segmenter();
        let silence = vec![0xFF_u8; FRAME];
        for _ in 0..100 {
            assert!(seg.push_frame(&silence, 0.0).is_none());
        }
        assert!(seg.flush().is_none());
    }

    #[test]
    fn pre_roll_is_prepended() {
        let mut seg = segmenter();
        let quiet = vec![0xFF_u8; FRAME];
        let speech = vec![0x20_u8; FRAME];

        // Fill pre-roll with quiet audio, then speak.
        for _ in 0..10 {
            seg.push_frame(&quiet, 0.0);
        }
        for _ in 0..20 {
            seg.push_frame(&speech, 0.5);
        }
        let utterance = seg.flush().expect("utterance");
        // 120ms pre-roll plus 400ms speech.
        assert_eq!(utterance.len(), 6 * FRAME + 20 * FRAME);
    }

    #[test]
    fn mid_utterance_pause_does_not_split() {
        let mut seg = segmenter();
        let speech = vec![0x20_u8; FRAME];
        let silence = vec![0xFF_u8; FRAME];

        for _ in 0..20 {
            seg.push_frame(&speech, 0.5);
        }
        // 200ms pause, below the 600ms gap.
        for _ in 0..10 {
            assert!(seg.push_frame(&silence, 0.0).is_none());
        }
        for _ in 0..20 {
            assert!(seg.push_frame(&speech, 0.5).is_none());
        }
        let utterance = seg.flush().expect("one merged utterance");
        assert_eq!(utterance.len(), 50 * FRAME);
    }
}
