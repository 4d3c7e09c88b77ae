//! # Kiln
//!
//! A plugin runtime for chat bots. Plugins register commands, middlewares,
//! timers and signal listeners against a shared host, and can be added,
//! edited or removed while the bot keeps running.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────┐     ┌────────────────────────────────┐
//! │  Transport  │────▶│ BotHost  │────▶│ plugin "greet" (own context)   │
//! │  (external) │     │          │────▶│ plugin "help"  (own context)   │
//! └─────────────┘     └──────────┘     └────────────────────────────────┘
//!                          ▲
//!                          │ restart / unload / scan
//!                ┌─────────┴──────────┐
//!                │ ReloadOrchestrator │◀── file changes
//!                └────────────────────┘
//! ```
//!
//! - **Transport**: the chat network, behind the [`core::Transport`] trait
//! - **Host**: owns plugin contexts and dispatches messages through them
//! - **Plugins**: TOML manifests in the plugin directory, or Rust code
//!   registered with [`define_plugin!`](prelude::define_plugin)
//! - **Runtime**: config, logging, loaders, hot reload and supervision
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kiln::prelude::*;
//!
//! fn setup(ctx: &Arc<PluginContext>) -> Result<(), BoxError> {
//!     ctx.command("ping", None)?.action(|_| async { "pong" });
//!     Ok(())
//! }
//!
//! define_plugin! {
//!     static PING = { name: "ping", setup: setup };
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = KilnRuntime::builder().build(my_transport())?;
//!     std::process::exit(runtime.run().await?);
//! }
//! ```
//!
//! ## Features
//!
//! - `yaml-config`, `toml-config`: config file formats (both default)
//! - `json-log`: JSON log output
//! - `testing`: the recording transport from `kiln_framework::testing`

pub use kiln_core as core;
pub use kiln_framework as framework;
pub use kiln_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use kiln::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use kiln_runtime::{KilnRuntime, RuntimeHandle, Supervisor, WorkerLink};

    // Plugin authoring
    pub use kiln_framework::prelude::*;

    // Transport seam
    pub use kiln_core::{BoxedTransport, EventSender, InboundEvent, Transport};
}
