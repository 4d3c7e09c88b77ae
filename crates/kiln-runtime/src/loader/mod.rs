//! Plugin loaders.
//!
//! Both loaders resolve a plugin name to an entry file, record the files the
//! plugin pulls in with the host's module cache, and create the plugin's
//! context through [`BotHost::define`](kiln_framework::BotHost::define).
//!
//! - [`ManifestLoader`]: TOML manifests under the plugin directory.
//! - [`NativeLoader`]: Rust plugins registered with `define_plugin!`.
//!
//! The runtime registers the manifest loader first, so a manifest shadows a
//! native plugin of the same name.

pub mod manifest;
pub mod native;

pub use manifest::ManifestLoader;
pub use native::NativeLoader;
