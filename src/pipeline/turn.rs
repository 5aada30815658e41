//! Turn lifecycle state machine.
//!
//! A turn is one user utterance plus the agent response to it. At most one
//! turn per session is ever in `Generating` or `Speaking`; the orchestrator
//! drives exactly one [`Turn`] value at a time, so the invariant holds by
//! construction and every transition is still validated here to catch
//! coordination bugs early.

use crate::error::{CallError, Result};
use crate::pipeline::metrics::TurnMetricsLog;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Phase of a turn's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    /// Collecting and debouncing transcription results.
    Aggregating,
    /// The LLM is producing a response.
    Generating,
    /// Agent audio for this turn is being emitted.
    Speaking,
    Cancelled,
    Done,
}

/// Why a turn was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    /// The caller resumed speaking before playback started; the turn is
    /// restarted with the merged utterance.
    Continuation,
    /// The caller interrupted audible playback.
    BargeIn,
}

/// State for a single turn.
#[derive(Debug)]
pub struct Turn {
    pub id: String,
    phase: TurnPhase,
    /// The very first agent utterance of the call; barge-in is disabled.
    pub is_greeting: bool,
    /// Once true, cancellation is no longer cheap (see `can_cancel_cheaply`).
    pub playback_started: bool,
    pub metrics: TurnMetricsLog,
    pub error: Option<String>,
}

impl Turn {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            phase: TurnPhase::Idle,
            is_greeting: false,
            playback_started: false,
            metrics: TurnMetricsLog::new(),
            error: None,
        }
    }

    pub fn greeting() -> Self {
        Self {
            is_greeting: true,
            ..Self::new()
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// Whether the turn occupies the session's single active slot.
    pub fn is_active(&self) -> bool {
        matches!(self.phase, TurnPhase::Generating | TurnPhase::Speaking)
    }

    /// A continuation can cancel cheaply only before audible playback.
    pub fn can_cancel_cheaply(&self) -> bool {
        self.phase == TurnPhase::Generating && !self.playback_started
    }

    /// First non-empty transcript arrived.
    pub fn begin_aggregating(&mut self) -> Result<()> {
        self.transition(TurnPhase::Idle, TurnPhase::Aggregating)
    }

    /// Debounce fired with a consolidated utterance.
    pub fn begin_generating(&mut self) -> Result<()> {
        self.transition(TurnPhase::Aggregating, TurnPhase::Generating)
    }

    /// First TTS byte for this turn was handed to playback.
    pub fn begin_speaking(&mut self) -> Result<()> {
        self.playback_started = true;
        self.transition(TurnPhase::Generating, TurnPhase::Speaking)
    }

    /// The TTS queue drained and the playback estimate reached now.
    pub fn complete(&mut self) -> Result<()> {
        self.transition(TurnPhase::Speaking, TurnPhase::Done)
    }

    /// A turn whose response produced no audio at all ends directly from
    /// `Generating` (empty LLM output, or every sentence failed closed).
    pub fn complete_silent(&mut self) -> Result<()> {
        self.transition(TurnPhase::Generating, TurnPhase::Done)
    }

    /// Cancel from any in-flight phase.
    pub fn cancel(&mut self) -> Result<()> {
        match self.phase {
            TurnPhase::Aggregating | TurnPhase::Generating | TurnPhase::Speaking => {
                self.phase = TurnPhase::Cancelled;
                Ok(())
            }
            other => Err(CallError::Session(format!(
                "turn {} cannot be cancelled from {other:?}",
                self.id
            ))),
        }
    }

    /// Cleanup after cancellation finished.
    pub fn finish_cancelled(&mut self) -> Result<()> {
        self.transition(TurnPhase::Cancelled, TurnPhase::Done)
    }

    /// Record an error from the LLM or TTS and end the turn. The session
    /// stays live; the next utterance starts a fresh turn.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.phase = TurnPhase::Done;
    }

    fn transition(&mut self, from: TurnPhase, to: TurnPhase) -> Result<()> {
        if self.phase != from {
            return Err(CallError::Session(format!(
                "turn {}: invalid transition {:?} -> {to:?} (expected {from:?})",
                self.id, self.phase
            )));
        }
        self.phase = to;
        Ok(())
    }
}

impl Default for Turn {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared flag cluster observed across the session's tasks.
///
/// One explicit record instead of scattered booleans: the turn task writes,
/// the speech and inbound tasks read (and the detector writes
/// `should_cancel`).
#[derive(Debug, Clone, Default)]
pub struct TurnFlags {
    should_cancel: Arc<AtomicBool>,
    playback_started: Arc<AtomicBool>,
    generating: Arc<AtomicBool>,
    greeting_active: Arc<AtomicBool>,
}

impl TurnFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset per-turn flags when a new turn begins. The greeting flag is
    /// session-scoped and survives.
    pub fn reset_for_turn(&self) {
        self.should_cancel.store(false, Ordering::Relaxed);
        self.playback_started.store(false, Ordering::Relaxed);
        self.generating.store(false, Ordering::Relaxed);
    }

    pub fn request_cancel(&self) {
        self.should_cancel.store(true, Ordering::Relaxed);
    }

    pub fn cancel_requested(&self) -> bool {
        self.should_cancel.load(Ordering::Relaxed)
    }

    pub fn set_playback_started(&self) {
        self.playback_started.store(true, Ordering::Relaxed);
    }

    pub fn playback_started(&self) -> bool {
        self.playback_started.load(Ordering::Relaxed)
    }

    pub fn set_generating(&self, active: bool) {
        self.generating.store(active, Ordering::Relaxed);
    }

    pub fn generating(&self) -> bool {
        self.generating.load(Ordering::Relaxed)
    }

    pub fn set_greeting_active(&self, active: bool) {
        self.greeting_active.store(active, Ordering::Relaxed);
    }

    pub fn greeting_active(&self) -> bool {
        self.greeting_active.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut turn = Turn::new();
        assert_eq!(turn.phase(), TurnPhase::Idle);
        turn.begin_aggregating().expect("idle -> aggregating");
        turn.begin_generating().expect("aggregating -> generating");
        assert!(turn.is_active());
        turn.begin_speaking().expect("generating -> speaking");
        assert!(turn.playback_started);
        assert!(turn.is_active());
        turn.complete().expect("speaking -> done");
        assert_eq!(turn.phase(), TurnPhase::Done);
        assert!(!turn.is_active());
    }

    #[test]
    fn cancel_is_legal_from_all_in_flight_phases() {
        for advance in 1..=3 {
            let mut turn = Turn::new();
            turn.begin_aggregating().expect("aggregating");
            if advance >= 2 {
                turn.begin_generating().expect("generating");
            }
            if advance >= 3 {
                turn.begin_speaking().expect("speaking");
            }
            turn.cancel().expect("cancel in flight");
            assert_eq!(turn.phase(), TurnPhase::Cancelled);
            turn.finish_cancelled().expect("cleanup");
            assert_eq!(turn.phase(), TurnPhase::Done);
        }
    }

    #[test]
    fn cancel_from_idle_is_rejected() {
        let mut turn = Turn::new();
        assert!(turn.cancel().is_err());
    }

    #[test]
    fn skipping_phases_is_rejected() {
        let mut turn = Turn::new();
        assert!(turn.begin_generating().is_err());
        assert!(turn.begin_speaking().is_err());
    }

    #[test]
    fn cheap_cancel_window_closes_on_first_audio() {
        let mut turn = Turn::new();
        turn.begin_aggregating().expect("aggregating");
        turn.begin_generating().expect("generating");
        assert!(turn.can_cancel_cheaply());
        turn.begin_speaking().expect("speaking");
        assert!(!turn.can_cancel_cheaply());
    }

    #[test]
    fn fail_ends_turn_with_error_recorded() {
        let mut turn = Turn::new();
        turn.begin_aggregating().expect("aggregating");
        turn.begin_generating().expect("generating");
        turn.fail("LLM error: timeout");
        assert_eq!(turn.phase(), TurnPhase::Done);
        assert!(turn.error.as_deref().unwrap_or("").contains("timeout"));
        assert!(!turn.is_active());
    }

    #[test]
    fn flags_reset_preserves_greeting() {
        let flags = TurnFlags::new();
        flags.set_greeting_active(true);
        flags.request_cancel();
        flags.set_playback_started();
        flags.reset_for_turn();
        assert!(!flags.cancel_requested());
        assert!(!flags.playback_started());
        assert!(flags.greeting_active());
    }
}
