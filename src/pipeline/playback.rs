//! Outbound playback timeline estimation.
//!
//! The orchestrator never hears the caller's speaker; it estimates when
//! queued outbound audio finishes playing from byte counts and the wire
//! byte rate. The estimate is deliberately conservative: it may overrun
//! slightly when network buffers flush early, which only makes barge-in
//! detection more cautious.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free playback estimate shared between the speech task (writer)
/// and the inbound-audio task (reader, for barge-in).
///
/// Times are stored as microsecond offsets from a per-session epoch;
/// offset `0` is the "cleared" sentinel.
#[derive(Debug)]
pub struct PlaybackClock {
    epoch: Instant,
    bytes_per_second: u32,
    /// Estimated end of queued playback. 0 = nothing queued.
    end_us: AtomicU64,
    /// When the current turn's first chunk was emitted. 0 = not started.
    started_us: AtomicU64,
    /// Bytes emitted for the current turn.
    bytes_emitted: AtomicU64,
}

impl PlaybackClock {
    pub fn new(bytes_per_second: u32) -> Self {
        Self {
            epoch: Instant::now(),
            bytes_per_second,
            end_us: AtomicU64::new(0),
            started_us: AtomicU64::new(0),
            bytes_emitted: AtomicU64::new(0),
        }
    }

    /// Reset per-turn state (first-chunk marker and byte counter).
    pub fn begin_turn(&self) {
        self.started_us.store(0, Ordering::Relaxed);
        self.bytes_emitted.store(0, Ordering::Relaxed);
    }

    /// Account for a chunk handed to the telephony adapter at `now`.
    ///
    /// The estimate advances by the chunk duration from `max(now, prior
    /// end)`, so it never runs behind the true last-byte-sent time.
    /// Returns the new estimated end.
    pub fn extend(&self, chunk_bytes: usize, now: Instant) -> Instant {
        let now_off = self.offset(now);
        let chunk_us = if self.bytes_per_second == 0 {
            0
        } else {
            chunk_bytes as u64 * 1_000_000 / u64::from(self.bytes_per_second)
        };

        let prior = self.end_us.load(Ordering::Acquire);
        let base = prior.max(now_off);
        let end = base + chunk_us;
        self.end_us.store(end, Ordering::Release);

        self.bytes_emitted
            .fetch_add(chunk_bytes as u64, Ordering::Relaxed);
        let _ = self
            .started_us
            .compare_exchange(0, now_off, Ordering::AcqRel, Ordering::Relaxed);

        self.instant_of(end)
    }

    /// Whether queued audio is still estimated to be playing at `now`.
    pub fn is_active(&self, now: Instant) -> bool {
        let end = self.end_us.load(Ordering::Acquire);
        end != 0 && end > self.offset(now)
    }

    /// Remaining playback at `now` (zero when inactive).
    pub fn remaining(&self, now: Instant) -> Duration {
        let end = self.end_us.load(Ordering::Acquire);
        let now_off = self.offset(now);
        if end == 0 || end <= now_off {
            Duration::ZERO
        } else {
            Duration::from_micros(end - now_off)
        }
    }

    /// Estimated end of playback, if any audio has been queued.
    pub fn end_estimate(&self) -> Option<Instant> {
        match self.end_us.load(Ordering::Acquire) {
            0 => None,
            end => Some(self.instant_of(end)),
        }
    }

    /// How long ago this turn's first chunk was emitted.
    pub fn elapsed_since_start(&self, now: Instant) -> Option<Duration> {
        match self.started_us.load(Ordering::Acquire) {
            0 => None,
            started => Some(Duration::from_micros(
                self.offset(now).saturating_sub(started),
            )),
        }
    }

    pub fn bytes_emitted(&self) -> u64 {
        self.bytes_emitted.load(Ordering::Relaxed)
    }

    /// Zero the playback timers (barge-in).
    pub fn clear(&self) {
        self.end_us.store(0, Ordering::Release);
        self.started_us.store(0, Ordering::Release);
    }

    fn offset(&self, t: Instant) -> u64 {
        // +1 keeps 0 free as the cleared sentinel.
        t.saturating_duration_since(self.epoch).as_micros() as u64 + 1
    }

    fn instant_of(&self, offset: u64) -> Instant {
        self.epoch + Duration::from_micros(offset.saturating_sub(1))
    }
}
