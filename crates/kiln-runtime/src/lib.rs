//! Kiln Runtime - the process around the plugin host.
//!
//! This crate provides:
//! - Configuration loading (`kiln.yaml` / `kiln.toml` / `KILN_*`)
//! - Logging setup
//! - Plugin loaders for TOML manifests and native Rust plugins
//! - Hot reload driven by file system notifications
//! - The supervisor/worker process pair and its relaunch protocol
//! - The built-in `help` plugin
//!
//! ```ignore
//! use kiln_runtime::KilnRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = MyTransport::connect().await?;
//!     let runtime = KilnRuntime::builder().build(transport)?;
//!     let code = runtime.run().await?;
//!     std::process::exit(code);
//! }
//! ```
//!
//! # Plugin directory
//!
//! Every `<name>.toml` and `<name>/index.toml` under `plugin_dir` is a
//! manifest plugin. Editing one restarts that plugin only; editing a file it
//! includes restarts every plugin that includes it. Native plugins declared
//! with `define_plugin!` are loaded after the manifests.

pub mod config;
pub mod error;
pub mod help;
pub mod loader;
pub mod logging;
pub mod reload;
pub mod runtime;
pub mod supervisor;

// Re-exports
pub use config::{ConfigError, ConfigLoader, ConfigResult, KilnConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use help::HELP_PLUGIN;
pub use loader::{ManifestLoader, NativeLoader};
pub use logging::{LoggingBuilder, SpanEvents};
pub use reload::{
    CONFIG_CHANGE_SIGNAL, ConfigAction, FileWatcher, ReloadOrchestrator, ReloadOutcome,
};
pub use runtime::{
    CONFIG_SERVICE, KilnRuntime, RUNTIME_SERVICE, RuntimeBuilder, RuntimeHandle,
    SUPERVISOR_SEND_SIGNAL,
};
pub use supervisor::{RELAUNCH_CODE, Supervisor, WORKER_LINK_SERVICE, WorkerLink, is_worker};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Prelude module for convenient imports.
///
/// This provides the commonly used logging macros:
/// - `trace!`, `debug!`, `info!`, `warn!`, `error!`
/// - `span`, `event`
/// - `instrument` attribute
/// - `Level` for span creation
pub mod prelude {
    pub use tracing::{Level, debug, error, event, info, instrument, span, trace, warn};
}
