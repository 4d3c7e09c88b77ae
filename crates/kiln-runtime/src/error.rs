//! Runtime error types.

use std::path::PathBuf;

use thiserror::Error;

pub use crate::config::{ConfigError, ConfigResult};

/// Errors that can occur while running a bot or supervising a worker.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A plugin failed to load.
    #[error(transparent)]
    Load(#[from] kiln_framework::LoadError),

    /// The file watcher could not be created or attached.
    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// The transport stopped with an error.
    #[error(transparent)]
    Transport(#[from] kiln_core::TransportError),

    /// The worker process could not be started.
    #[error("failed to spawn worker {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Talking to the supervisor or the worker failed.
    #[error("supervisor protocol error: {0}")]
    Protocol(String),

    /// A supervisor message could not be encoded.
    #[error("invalid supervisor message: {0}")]
    Message(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
