//! Pre-allocated descriptor pools and the access-unit fan-out FIFO.
//!
//! Descriptors live in fixed-size arenas; the free and queued lists are
//! intrusive doubly-linked lists whose "pointers" are indices into the arena,
//! so acquiring or releasing an item never touches the allocator. The pools
//! are not internally synchronized: the receiver guards them with its single
//! coarse mutex.

use thiserror::Error;

pub use au::{
    AU_MIN_REALLOC_SIZE, AccessUnit, AuBuffer, AuFifo, AuFifoConfig, AuItemId, AuSyncType,
    BufferId, MbStatus, QueueId,
};
pub use nalu::{NaluDescriptor, NaluFifo, NaluItemId, NaluList};

mod au;
mod nalu;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FifoError {
    #[error("Item pool exhausted")]
    PoolExhausted,

    #[error("Queue is full")]
    QueueFull,

    #[error("Queue is not registered")]
    UnknownQueue,
}
