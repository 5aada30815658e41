//! Barge-in detection: deciding that the caller is interrupting.
//!
//! Two independent triggers feed the decision:
//! - an energy trigger on every inbound frame, gated by a grace period
//!   that masks speaker warm-up echo, and
//! - a transcript trigger for any final STT result during active playback,
//!   which is strictly stronger evidence and bypasses the grace period.
//!
//! The detector itself never produces audio. Feedback tones during
//! barge-in cascade (the agent hears itself react) and are deliberately
//! absent.

use crate::config::BargeInConfig;
use crate::pipeline::messages::BargeInTrigger;
use crate::pipeline::playback::PlaybackClock;
use crate::pipeline::turn::TurnFlags;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Decides whether inbound activity counts as a caller interrupt.
#[derive(Debug)]
pub struct BargeInDetector {
    clock: Arc<PlaybackClock>,
    flags: TurnFlags,
    energy_enabled: bool,
    rms_threshold: f32,
    grace: Duration,
}

impl BargeInDetector {
    pub fn new(config: &BargeInConfig, clock: Arc<PlaybackClock>, flags: TurnFlags) -> Self {
        Self {
            clock,
            flags,
            energy_enabled: config.enabled,
            rms_threshold: config.rms_threshold,
            grace: Duration::from_millis(config.grace_ms),
        }
    }

    /// Energy trigger: inbound frame RMS during active playback.
    pub fn check_energy(&self, rms: f32, now: Instant) -> Option<BargeInTrigger> {
        if !self.energy_enabled || self.flags.greeting_active() {
            return None;
        }
        // Fillers and acknowledgments keep the clock busy without marking
        // playback; caller speech over them is a continuation, not an
        // interrupt, and cancelling them would cascade.
        if !self.flags.playback_started() || !self.clock.is_active(now) {
            return None;
        }
        // Grace period after playback start masks self-echo.
        let within_grace = self
            .clock
            .elapsed_since_start(now)
            .is_none_or(|elapsed| elapsed <= self.grace);
        if within_grace {
            return None;
        }
        (rms > self.rms_threshold).then_some(BargeInTrigger::Energy)
    }

    /// Transcript trigger: a final STT result during active playback.
    pub fn check_final_transcript(&self, now: Instant) -> Option<BargeInTrigger> {
        if self.flags.greeting_active() || !self.flags.playback_started() {
            return None;
        }
        self.clock
            .is_active(now)
            .then_some(BargeInTrigger::Transcript)
    }

    /// Apply the in-process effects of a barge-in: flag the turn for
    /// cancellation and zero the playback timers. The caller drains the
    /// TTS queue and clears the telephony egress buffer.
    pub fn fire(&self) {
        self.flags.request_cancel();
        self.clock.clear();
    }
}
