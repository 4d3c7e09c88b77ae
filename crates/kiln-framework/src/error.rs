//! Error types for the Kiln framework.
//!
//! Two families exist:
//!
//! - [`DefinitionError`]: raised synchronously while a plugin defines its
//!   commands and options. These abort the plugin's setup.
//! - [`LoadError`]: raised by the host while resolving and instantiating a
//!   plugin.
//!
//! Failures inside command callbacks and middlewares at dispatch time are
//! plain [`BoxError`]s; the host logs them and moves on.

use std::path::PathBuf;

use thiserror::Error;
pub use tower::BoxError;

/// Errors raised while a plugin defines its surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// A live plugin already uses this name.
    #[error("plugin \"{0}\" is already registered")]
    DuplicatePlugin(String),

    /// Another option of the same command already uses this name.
    #[error("command \"{command}\" already has an option named \"{name}\"")]
    DuplicateOption { command: String, name: String },

    /// Another option of the same command already uses this short name.
    #[error("command \"{command}\" already has an option with short name \"{short}\"")]
    DuplicateShortName { command: String, short: String },

    /// A command with this name is already defined in the plugin.
    #[error("command \"{0}\" is already defined")]
    DuplicateCommand(String),

    /// A slash-separated definition named a parent that does not exist.
    #[error("cannot find parent command:{0}")]
    ParentNotFound(String),

    /// A declaration string could not be parsed.
    #[error("invalid declaration \"{source_text}\": {reason}")]
    InvalidDeclaration { source_text: String, reason: String },

    /// The plugin context was already disposed.
    #[error("plugin \"{0}\" has been disposed")]
    Disposed(String),
}

impl DefinitionError {
    pub(crate) fn invalid(source_text: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDeclaration {
            source_text: source_text.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while loading a plugin.
#[derive(Debug, Error)]
pub enum LoadError {
    /// No registered loader could resolve the requested name.
    #[error("cannot resolve plugin \"{0}\"")]
    NotFound(String),

    /// The plugin's setup defined something invalid.
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// Reading a plugin file failed.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A plugin manifest was malformed.
    #[error("invalid plugin manifest {}: {reason}", path.display())]
    Manifest { path: PathBuf, reason: String },

    /// The plugin's setup function returned an error.
    #[error("setup of plugin \"{plugin}\" failed: {source}")]
    Setup {
        plugin: String,
        #[source]
        source: BoxError,
    },

    /// The host was dropped while the plugin was loading.
    #[error("bot host is no longer alive")]
    HostGone,
}

/// Returned to a caller whose middleware invoked `next` twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("next() called multiple times")]
pub struct NextCalledTwice;

/// Result type for definition operations.
pub type FrameworkResult<T> = Result<T, DefinitionError>;

/// Result type for load operations.
pub type LoadResult<T> = Result<T, LoadError>;
