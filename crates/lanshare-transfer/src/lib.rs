//! The transfer engine: per-peer file send pipelines with cork/uncork flow
//! control against the session layer, the receive state machine with atomic
//! delivery, and progress accounting.

pub mod paths;
pub mod worker;

use thiserror::Error;

pub use worker::{spawn, TransferConfig, TransferHandle};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Batches are one level deep on purpose; nested input is refused
    /// before anything touches the network.
    #[error("directory contains subdirectories")]
    NestedDirectory,
    #[error("unsafe file name {0:?}")]
    UnsafeName(String),
    #[error("can't create a destination file after 20 attempts")]
    TooManyCollisions,
}
