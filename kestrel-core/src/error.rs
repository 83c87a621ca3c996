use thiserror::Error;

/// Errors surfaced by the receiver's public API.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReceiverError {
    #[error("Invalid parameters: {0}")]
    BadParameters(&'static str),

    #[error("Receiver is busy, stop it first")]
    Busy,

    #[error("Operation is not valid in the current state")]
    InvalidState,

    #[error("SPS/PPS have not been received yet")]
    WaitingForSync,

    #[error("Pool exhausted, dropped the input")]
    QueueFull,

    #[error("No resource available")]
    ResourceUnavailable,

    #[error("Unsupported: {0}")]
    Unsupported(&'static str),
}

/// Return codes a consumer can use to steer the pipeline from its callbacks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsumerError {
    /// A downstream decoding error occurred; the receiver should behave as if
    /// sync was just reached again (and re-seed a gray IDR if configured).
    #[error("Consumer requested a resync")]
    ResyncRequired,

    /// No output buffer is available right now; the access unit is dropped
    /// and the pipeline keeps running.
    #[error("Consumer has no buffer available")]
    ResourceUnavailable,
}
