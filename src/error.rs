// src/error.rs — memtree error taxonomy

use crate::storage::Vid;
use thiserror::Error;

/// Transport-level failures. Anything here is terminal for the caller:
/// the world is gone, a peer vanished, or a payload did not decode.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("world aborted")]
    Aborted,

    #[error("channel to rank {0} is closed")]
    Closed(usize),

    #[error("payload codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error("logbook io: {0}")]
    Io(#[from] std::io::Error),
}

/// Allocator-node failures. All of these are fatal for the node that
/// observes them: it logs, flags stop, and aborts the world.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("vid {0:?} is not resident on its owner rank {1}")]
    VidNotResident(Vid, usize),

    #[error("index runs {remaining} cells past the end of the chain at {vid:?}")]
    IndexOutOfRange { vid: Vid, remaining: usize },

    #[error("indexed access required for the array at {0:?}")]
    IndexRequired(Vid),

    #[error("no route from rank {from} toward rank {to}")]
    NoRoute { from: usize, to: usize },

    #[error("memory census: {0}")]
    Census(String),

    #[error("transport: {0}")]
    Comm(#[from] CommError),
}

/// Application-side failures surfaced to the launch harness as a scenario
/// verdict rather than a crash.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Failed(String),

    #[error("transport: {0}")]
    Comm(#[from] CommError),
}

impl AppError {
    pub fn failed(msg: impl Into<String>) -> Self {
        AppError::Failed(msg.into())
    }
}
