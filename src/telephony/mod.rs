//! Telephony adapter boundary.
//!
//! The transport owns all wire framing; the orchestrator sees opaque
//! audio bytes plus a small event stream. Inbound traffic arrives on an
//! event channel handed out at connect time; outbound operations are the
//! four methods of [`TelephonyAdapter`].

mod media_ws;

pub use media_ws::MediaStreamAdapter;

use crate::error::Result;
use crate::session::CallId;
use async_trait::async_trait;
use bytes::Bytes;

/// Inbound events from the telephony provider.
#[derive(Debug, Clone)]
pub enum TelephonyEvent {
    /// Media for a call has started flowing.
    CallStarted { call: CallId, caller: String },
    /// One frame of caller audio.
    InboundAudio { call: CallId, audio: Bytes },
    /// The call hung up (either side).
    CallEnded { call: CallId },
}

/// Telephony provider adapter.
#[async_trait]
pub trait TelephonyAdapter: Send + Sync {
    /// Place an outbound call; media events follow on the event channel.
    async fn make_call(&self, phone: &str) -> Result<CallId>;

    /// Hang up.
    async fn end_call(&self, call: &CallId) -> Result<()>;

    /// Queue outbound audio for the caller.
    async fn send_audio(&self, call: &CallId, audio: Bytes) -> Result<()>;

    /// Drop all audio queued provider-side but not yet played (barge-in).
    async fn clear_egress_buffer(&self, call: &CallId) -> Result<()>;
}
