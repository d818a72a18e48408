//! Platform errors

use core_types::{Code, VpeId};
use thiserror::Error;

/// Why the platform could not boot or run a program
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("kernel refused: {0}")]
    Kernel(#[from] Code),

    #[error("cannot start thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("{0} panicked")]
    Panicked(VpeId),
}
