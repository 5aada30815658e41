//! Per-turn latency recording and per-session rolling statistics.
//!
//! Each turn appends `(stage, timestamp)` events to a log which is consumed
//! once at turn end to derive a [`LatencyBreakdown`]. The session keeps
//! rolling averages and peaks, and configurable thresholds label the
//! dominant bottleneck.

use crate::config::MetricsConfig;
use std::time::{Duration, Instant};

/// Pipeline stages recorded per turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStage {
    /// First transcription activity for the utterance.
    SttStart,
    /// Consolidated utterance accepted.
    SttEnd,
    LlmStart,
    LlmEnd,
    TtsStart,
    TtsEnd,
    /// Pre-synthesised filler handed to telephony.
    FillerStart,
    /// First byte of real (non-filler) agent audio handed to telephony.
    FirstAudio,
}

/// Append-only event log for one turn.
#[derive(Debug, Default)]
pub struct TurnMetricsLog {
    events: Vec<(TurnStage, Instant)>,
}

impl TurnMetricsLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage event at the given instant.
    pub fn mark_at(&mut self, stage: TurnStage, at: Instant) {
        self.events.push((stage, at));
    }

    /// Append a stage event timestamped now.
    pub fn mark(&mut self, stage: TurnStage) {
        self.mark_at(stage, Instant::now());
    }

    /// First recorded timestamp for a stage.
    pub fn at(&self, stage: TurnStage) -> Option<Instant> {
        self.events
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, t)| *t)
    }

    /// Derive the latency breakdown from the recorded events.
    ///
    /// Missing stage pairs yield zero durations; a missing `stt_start`
    /// yields an all-zero breakdown (nothing meaningful was measured).
    pub fn breakdown(&self) -> LatencyBreakdown {
        let span = |start: TurnStage, end: TurnStage| -> Duration {
            match (self.at(start), self.at(end)) {
                (Some(s), Some(e)) if e >= s => e - s,
                _ => Duration::ZERO,
            }
        };

        let stt_start = self.at(TurnStage::SttStart);
        let first_audible = self.at(TurnStage::FillerStart).or(self.at(TurnStage::FirstAudio));
        let time_to_first_audio = match (stt_start, first_audible) {
            (Some(s), Some(f)) if f >= s => Some(f - s),
            _ => None,
        };

        LatencyBreakdown {
            stt: span(TurnStage::SttStart, TurnStage::SttEnd),
            llm: span(TurnStage::LlmStart, TurnStage::LlmEnd),
            tts: span(TurnStage::TtsStart, TurnStage::TtsEnd),
            total: span(TurnStage::SttStart, TurnStage::TtsEnd),
            time_to_first_audio,
        }
    }
}

/// Derived per-turn latencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatencyBreakdown {
    pub stt: Duration,
    pub llm: Duration,
    pub tts: Duration,
    /// `tts_end - stt_start`.
    pub total: Duration,
    /// Elapsed from `stt_start` until the caller could hear anything
    /// (filler counts). `None` when no audio was produced.
    pub time_to_first_audio: Option<Duration>,
}

/// Which stage dominates a slow turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bottleneck {
    Stt,
    Llm,
    Tts,
    #[default]
    None,
}

/// Label the largest component exceeding its configured target.
pub fn bottleneck(breakdown: &LatencyBreakdown, config: &MetricsConfig) -> Bottleneck {
    let over = [
        (
            Bottleneck::Stt,
            breakdown.stt,
            Duration::from_millis(config.stt_target_ms),
        ),
        (
            Bottleneck::Llm,
            breakdown.llm,
            Duration::from_millis(config.llm_target_ms),
        ),
        (
            Bottleneck::Tts,
            breakdown.tts,
            Duration::from_millis(config.tts_target_ms),
        ),
    ];

    over.iter()
        .filter(|(_, actual, target)| actual > target)
        .max_by_key(|(_, actual, _)| *actual)
        .map_or(Bottleneck::None, |(label, _, _)| *label)
}

/// Rolling average + peak for one latency component.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingStat {
    sum: Duration,
    peak: Duration,
    count: u32,
}

impl RollingStat {
    pub fn record(&mut self, value: Duration) {
        self.sum += value;
        self.peak = self.peak.max(value);
        self.count += 1;
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.sum / self.count
        }
    }

    pub fn peak(&self) -> Duration {
        self.peak
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Aggregate metrics for one session.
#[derive(Debug, Clone, Default)]
pub struct SessionMetrics {
    pub stt: RollingStat,
    pub llm: RollingStat,
    pub tts: RollingStat,
    pub total: RollingStat,
    pub time_to_first_audio: RollingStat,
    pub turns_completed: u32,
    pub turns_cancelled: u32,
    pub turns_failed: u32,
    pub transcription_errors: u32,
}

impl SessionMetrics {
    /// Fold a completed turn's breakdown into the rolling stats.
    pub fn record_turn(&mut self, breakdown: &LatencyBreakdown) {
        self.stt.record(breakdown.stt);
        self.llm.record(breakdown.llm);
        self.tts.record(breakdown.tts);
        self.total.record(breakdown.total);
        if let Some(ttfa) = breakdown.time_to_first_audio {
            self.time_to_first_audio.record(ttfa);
        }
        self.turns_completed += 1;
    }
}
