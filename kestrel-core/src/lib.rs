//! Receive-side pipeline for a live H.264 video stream delivered over RTP.
//!
//! The crate accepts depacketized NAL units one at a time (as produced by an
//! RTP receiver), groups them into access units, conceals packet loss by
//! synthesizing skipped-P slices, decodes the per-frame telemetry carried in
//! vendor SEI messages, and hands fully formed access units to a consumer
//! through the [`AuConsumer`] callbacks.

pub mod error;
pub mod fifo;
pub mod stats;
pub mod telemetry;

mod config;
pub use config::*;

mod filter;
pub use filter::InputNalu;

mod receiver;
pub use receiver::*;

pub use error::{ConsumerError, ReceiverError};
pub use fifo::AuSyncType;
pub use stats::ReceiverStats;
