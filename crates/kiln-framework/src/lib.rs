//! # Kiln Framework
//!
//! Plugin authoring and hosting for the Kiln runtime.
//!
//! A plugin receives a [`PluginContext`] and uses it to define commands,
//! middlewares, signal listeners and timers. Every registration is undone
//! when the context is disposed, which is what makes hot reload safe.
//!
//! ```rust,ignore
//! use kiln_framework::prelude::*;
//!
//! fn setup(ctx: &Arc<PluginContext>) -> Result<(), BoxError> {
//!     ctx.command("greet <name:string> [--loud]", None)?
//!         .desc("say hello")
//!         .action(|argv: Argv| async move {
//!             let name = argv.arg_str(0).unwrap_or_default().to_string();
//!             if argv.flag("loud") { name.to_uppercase() } else { name }
//!         });
//!     ctx.on("bot.ready", |_| async { tracing::info!("ready") });
//!     Ok(())
//! }
//!
//! define_plugin! {
//!     static GREETER = { name: "greeter", setup: setup };
//! }
//! ```
//!
//! ## Modules
//!
//! - [`declaration`]: the `<arg:type>` / `[arg]` / `-flag` mini-language
//! - [`argv`]: tokenizing and the per-invocation [`Argv`]
//! - [`command`]: the command tree, options, shortcuts and help output
//! - [`middleware`]: `(event, next)` stages and [`compose`]
//! - [`context`]: [`PluginContext`] and its disposal ledger
//! - [`host`]: [`BotHost`], dispatch, loading and restarting plugins
//! - [`module`]: the [`ModuleCache`] of loaded files
//! - [`plugin`]: identities, native descriptors and the loader seam

pub mod argv;
pub mod command;
pub mod context;
pub mod declaration;
pub mod error;
pub mod host;
pub mod middleware;
pub mod module;
pub mod plugin;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use argv::{Argv, shell_split};
pub use command::{
    Command, CommandOutcome, HelpOptions, IntoOutcome, OptionConfig, OptionSettings, Reply,
    Shortcut, ShortcutTrigger,
};
pub use context::{DISPOSE_SIGNAL, PluginContext};
pub use declaration::{ArgType, Declaration, parse_declarations};
pub use error::{
    BoxError, DefinitionError, FrameworkResult, LoadError, LoadResult, NextCalledTwice,
};
pub use host::{BOT_READY, BOT_START, BotHost};
pub use middleware::{Composed, Middleware, MiddlewareFuture, Next, compose};
pub use module::ModuleCache;
pub use plugin::{PLUGINS, PluginDescriptor, PluginIdentity, PluginLoader, SetupFn};

/// Re-exports used by [`define_plugin!`].
#[doc(hidden)]
pub mod __private {
    pub use linkme;
}

/// Everything a plugin usually needs.
pub mod prelude {
    pub use std::sync::Arc;

    pub use kiln_core::{ChannelId, ChannelKind, MessageEvent, Signal};

    pub use crate::define_plugin;
    pub use crate::{
        Argv, BoxError, Command, HelpOptions, Middleware, Next, OptionSettings, PluginContext,
        Reply, Shortcut,
    };
}
