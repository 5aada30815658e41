//! Transcription aggregation: debouncing, merging and continuation
//! detection for partial/final STT results.
//!
//! The aggregator is pure state + time arithmetic; the orchestrator task
//! owns the actual debounce timer and feeds events in arrival order.

use crate::config::AggregatorConfig;
use std::time::{Duration, Instant};

/// Turn-phase context the aggregator needs to classify a partial.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregatorContext {
    /// A response is currently being generated for an earlier utterance.
    pub generating: bool,
    /// Agent audio for the current turn has started playing.
    pub playback_started: bool,
    /// The greeting is still playing; caller speech is deferred.
    pub greeting_active: bool,
}

/// Outcome of feeding a partial result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialOutcome {
    /// Nothing to do (empty, duplicate, or below the continuation minimum).
    Ignored,
    /// The caller is still speaking; the turn task should cancel cheaply
    /// (when generating) and emit an acknowledgment.
    Continuation { partial: String },
    /// Buffered for later use (barge-in slot or greeting deferral).
    Stored,
}

/// Outcome of feeding a final result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalOutcome {
    /// Empty or whitespace: pending untouched, debounce not reset.
    Ignored,
    /// Stored in the greeting deferral buffer; no debounce.
    Deferred,
    /// Appended to pending; the debounce timer must be (re)armed.
    Armed { deadline: Instant },
}

/// A consolidated utterance emitted when the debounce fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub text: String,
    /// When the first contributing transcription of this cycle arrived.
    pub started_at: Instant,
}

/// Debounces and merges STT results into consolidated utterances.
#[derive(Debug)]
pub struct TranscriptAggregator {
    debounce: Duration,
    min_continuation_chars: usize,
    /// Space-joined final results awaiting the debounce.
    pending: String,
    /// First transcription activity of the current cycle.
    started_at: Option<Instant>,
    /// Last partial seen, for duplicate suppression.
    last_partial: Option<String>,
    /// One continuation signal per aggregation cycle.
    continuation_signalled: bool,
    /// Last partial captured during active playback, usable if the caller
    /// hangs up before STT finalises.
    pending_barge_in: Option<String>,
    /// Caller speech transcribed while the greeting played.
    greeting_buffer: String,
}

impl TranscriptAggregator {
    /// Create an aggregator for one session.
    ///
    /// The debounce interval is adaptive: short when the STT engine streams
    /// partials (voice-activity detection happens upstream), long when it
    /// is batch-only.
    pub fn new(config: &AggregatorConfig, stt_has_partials: bool) -> Self {
        let debounce = if stt_has_partials {
            Duration::from_millis(config.partial_debounce_ms)
        } else {
            Duration::from_millis(config.batch_debounce_ms)
        };
        Self {
            debounce,
            min_continuation_chars: config.min_continuation_chars,
            pending: String::new(),
            started_at: None,
            last_partial: None,
            continuation_signalled: false,
            pending_barge_in: None,
            greeting_buffer: String::new(),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Feed a partial transcription result.
    pub fn on_partial(
        &mut self,
        text: &str,
        ctx: &AggregatorContext,
        now: Instant,
    ) -> PartialOutcome {
        let text = text.trim();
        if text.is_empty() {
            return PartialOutcome::Ignored;
        }

        // Duplicate suppression: the same partial twice in a row must not
        // produce two events.
        if self.last_partial.as_deref() == Some(text) {
            return PartialOutcome::Ignored;
        }
        self.last_partial = Some(text.to_owned());

        if ctx.greeting_active {
            return PartialOutcome::Stored;
        }

        if ctx.playback_started {
            self.store_barge_in_partial(text);
            return PartialOutcome::Stored;
        }

        let cycle_started = self.started_at.is_some();
        if !cycle_started && !ctx.generating {
            // First speech of a fresh cycle.
            self.started_at = Some(now);
            return PartialOutcome::Ignored;
        }

        if self.started_at.is_none() {
            self.started_at = Some(now);
        }

        if text.len() > self.min_continuation_chars && !self.continuation_signalled {
            self.continuation_signalled = true;
            return PartialOutcome::Continuation {
                partial: text.to_owned(),
            };
        }

        PartialOutcome::Ignored
    }

    /// Feed a final transcription result.
    pub fn on_final(&mut self, text: &str, ctx: &AggregatorContext, now: Instant) -> FinalOutcome {
        let text = text.trim();
        if text.is_empty() {
            return FinalOutcome::Ignored;
        }
        self.last_partial = None;

        if ctx.greeting_active {
            append_with_space(&mut self.greeting_buffer, text);
            return FinalOutcome::Deferred;
        }

        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        append_with_space(&mut self.pending, text);
        FinalOutcome::Armed {
            deadline: now + self.debounce,
        }
    }

    /// Debounce fired: emit the consolidated utterance and reset the cycle.
    ///
    /// Returns `None` when nothing is pending (spurious fire).
    pub fn fire(&mut self, now: Instant) -> Option<Utterance> {
        if self.pending.is_empty() {
            return None;
        }
        let mut text = std::mem::take(&mut self.greeting_buffer);
        append_with_space(&mut text, &std::mem::take(&mut self.pending));
        let started_at = self.started_at.take().unwrap_or(now);
        self.continuation_signalled = false;
        self.last_partial = None;
        Some(Utterance { text, started_at })
    }

    /// Re-enter aggregation after a continuation cancelled a turn: the
    /// consumed utterance text is merged back in front of whatever has
    /// accumulated since.
    pub fn merge_for_restart(&mut self, earlier: &Utterance) {
        let mut merged = earlier.text.clone();
        append_with_space(&mut merged, &self.pending);
        self.pending = merged;
        self.started_at = Some(
            self.started_at
                .map_or(earlier.started_at, |s| s.min(earlier.started_at)),
        );
        self.continuation_signalled = false;
    }

    /// Take the last partial captured during playback, if any.
    pub fn take_pending_barge_in(&mut self) -> Option<String> {
        self.pending_barge_in.take()
    }

    /// Whether the greeting deferral buffer holds text.
    pub fn has_greeting_buffer(&self) -> bool {
        !self.greeting_buffer.is_empty()
    }

    fn store_barge_in_partial(&mut self, text: &str) {
        // Replace only with a longer, prefix-compatible partial so a
        // mid-word STT reset never shrinks the usable text.
        match &self.pending_barge_in {
            Some(existing) if !(text.len() > existing.len() && text.starts_with(existing.as_str())) => {}
            _ => self.pending_barge_in = Some(text.to_owned()),
        }
    }
}

fn append_with_space(base: &mut String, next: &str) {
    let next = next.trim();
    if next.is_empty() {
        return;
    }
    if !base.is_empty() {
        base.push(' ');
    }
    base.push_str(next);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> TranscriptAggregator {
        TranscriptAggregator::new(&AggregatorConfig::default(), true)
    }

    fn idle_ctx() -> AggregatorContext {
        AggregatorContext::default()
    }

    #[test]
    fn adaptive_debounce_interval() {
        let config = AggregatorConfig::default();
        assert_eq!(
            TranscriptAggregator::new(&config, true).debounce(),
            Duration::from_millis(150)
        );
        assert_eq!(
            TranscriptAggregator::new(&config, false).debounce(),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn finals_merge_with_single_spaces() {
        let mut agg = aggregator();
        let now = Instant::now();
        agg.on_final("  what's the price ", &idle_ctx(), now);
        agg.on_final("for the basic plan", &idle_ctx(), now);
        let utterance = agg.fire(now).expect("pending should fire");
        assert_eq!(utterance.text, "what's the price for the basic plan");
        assert!(!agg.has_pending());
    }

    #[test]
    fn empty_final_does_not_arm_or_clear() {
        let mut agg = aggregator();
        let now = Instant::now();
        agg.on_final("hello", &idle_ctx(), now);
        assert_eq!(agg.on_final("   ", &idle_ctx(), now), FinalOutcome::Ignored);
        assert!(agg.has_pending());
    }

    #[test]
    fn final_rearms_debounce() {
        let mut agg = aggregator();
        let t0 = Instant::now();
        let FinalOutcome::Armed { deadline: d1 } = agg.on_final("one", &idle_ctx(), t0) else {
            panic!("expected armed");
        };
        let t1 = t0 + Duration::from_millis(100);
        let FinalOutcome::Armed { deadline: d2 } = agg.on_final("two", &idle_ctx(), t1) else {
            panic!("expected armed");
        };
        assert_eq!(d1, t0 + Duration::from_millis(150));
        assert_eq!(d2, t1 + Duration::from_millis(150));
    }

    #[test]
    fn spurious_fire_returns_none() {
        let mut agg = aggregator();
        assert!(agg.fire(Instant::now()).is_none());
    }

    #[test]
    fn duplicate_partial_is_suppressed() {
        let mut agg = aggregator();
        let now = Instant::now();
        let ctx = AggregatorContext {
            generating: true,
            ..Default::default()
        };
        let first = agg.on_partial("what's the price", &ctx, now);
        assert!(matches!(first, PartialOutcome::Continuation { .. }));
        let second = agg.on_partial("what's the price", &ctx, now);
        assert_eq!(second, PartialOutcome::Ignored);
    }

    #[test]
    fn continuation_fires_once_per_cycle() {
        let mut agg = aggregator();
        let now = Instant::now();
        // First partial of a fresh cycle just starts the clock.
        assert_eq!(
            agg.on_partial("what's the", &idle_ctx(), now),
            PartialOutcome::Ignored
        );
        // Later, longer partials signal a single continuation.
        assert!(matches!(
            agg.on_partial("what's the price", &idle_ctx(), now),
            PartialOutcome::Continuation { .. }
        ));
        assert_eq!(
            agg.on_partial("what's the price for the basic plan", &idle_ctx(), now),
            PartialOutcome::Ignored
        );
    }

    #[test]
    fn continuation_during_generation() {
        let mut agg = aggregator();
        let now = Instant::now();
        let ctx = AggregatorContext {
            generating: true,
            ..Default::default()
        };
        let outcome = agg.on_partial("and one more thing", &ctx, now);
        assert_eq!(
            outcome,
            PartialOutcome::Continuation {
                partial: "and one more thing".to_owned()
            }
        );
    }

    #[test]
    fn short_partial_never_signals_continuation() {
        let mut agg = aggregator();
        let now = Instant::now();
        let ctx = AggregatorContext {
            generating: true,
            ..Default::default()
        };
        assert_eq!(agg.on_partial("uh", &ctx, now), PartialOutcome::Ignored);
    }

    #[test]
    fn partial_during_playback_fills_barge_in_slot() {
        let mut agg = aggregator();
        let now = Instant::now();
        let ctx = AggregatorContext {
            playback_started: true,
            ..Default::default()
        };
        agg.on_partial("actually", &ctx, now);
        agg.on_partial("actually I need", &ctx, now);
        // Non-prefix-compatible replacement is rejected.
        agg.on_partial("nope", &ctx, now);
        assert_eq!(agg.take_pending_barge_in().as_deref(), Some("actually I need"));
        assert!(agg.take_pending_barge_in().is_none());
    }

    #[test]
    fn greeting_transcripts_are_deferred_and_prepended() {
        let mut agg = aggregator();
        let now = Instant::now();
        let greeting_ctx = AggregatorContext {
            greeting_active: true,
            ..Default::default()
        };
        assert_eq!(
            agg.on_final("Hello?", &greeting_ctx, now),
            FinalOutcome::Deferred
        );
        assert!(agg.has_greeting_buffer());
        assert!(!agg.has_pending());

        // Greeting over; the next real utterance carries the buffer.
        agg.on_final("Yes, I want info.", &idle_ctx(), now);
        let utterance = agg.fire(now).expect("utterance");
        assert_eq!(utterance.text, "Hello? Yes, I want info.");
        assert!(!agg.has_greeting_buffer());
    }

    #[test]
    fn merge_for_restart_prepends_cancelled_text() {
        let mut agg = aggregator();
        let t0 = Instant::now();
        agg.on_final("what's the price", &idle_ctx(), t0);
        let first = agg.fire(t0).expect("first utterance");

        // Continuation arrives; earlier text merges back in front.
        let t1 = t0 + Duration::from_millis(500);
        agg.merge_for_restart(&first);
        agg.on_final("for the basic plan", &idle_ctx(), t1);
        let merged = agg.fire(t1).expect("merged utterance");
        assert_eq!(merged.text, "what's the price for the basic plan");
        assert_eq!(merged.started_at, t0);
    }

    #[test]
    fn utterance_keeps_first_activity_timestamp() {
        let mut agg = aggregator();
        let t0 = Instant::now();
        agg.on_partial("hey", &idle_ctx(), t0);
        let t1 = t0 + Duration::from_millis(400);
        agg.on_final("hey there", &idle_ctx(), t1);
        let utterance = agg.fire(t1 + Duration::from_millis(150)).expect("utterance");
        assert_eq!(utterance.started_at, t0);
    }
}
