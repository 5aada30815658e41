//! The turn-taking pipeline: aggregation, turn state machine, playback
//! timeline, barge-in, echo filtering, fillers and per-turn metrics.

pub mod aggregator;
pub mod barge_in;
pub mod coordinator;
pub mod echo;
pub mod filler;
pub mod messages;
pub mod metrics;
pub mod playback;
pub mod sentence;
pub mod turn;
