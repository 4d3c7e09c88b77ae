//! Plugin identity, descriptors and the loader seam.
//!
//! - [`PluginIdentity`] names a plugin and its entry file. Loaders build one
//!   and hand it to [`BotHost::create_context`](crate::host::BotHost::create_context).
//! - [`PluginDescriptor`] is a native plugin compiled into the binary. The
//!   [`define_plugin!`](crate::define_plugin) macro places descriptors into
//!   the [`PLUGINS`] distributed slice so they are discovered without an
//!   explicit registration call.
//! - [`PluginLoader`] resolves plugin names to entry files and instantiates
//!   them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use linkme::distributed_slice;

use crate::context::PluginContext;
use crate::error::{BoxError, LoadResult};
use crate::host::BotHost;

// ─── Identity ───────────────────────────────────────────────────────────────

/// Entry-file stems that name their parent directory instead of themselves.
const INDEX_STEMS: &[&str] = &["index", "mod", "lib", "main"];

/// The name and entry file of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PluginIdentity {
    pub name: String,
    pub main_file: PathBuf,
}

impl PluginIdentity {
    /// An explicitly named plugin. Path separators in `name` are replaced so
    /// the result is a single identifier.
    pub fn new(name: impl AsRef<str>, main_file: impl Into<PathBuf>) -> Self {
        Self {
            name: normalize_name(name.as_ref()),
            main_file: main_file.into(),
        }
    }

    /// Derives the name from the entry path: `plugins/weather.toml` is
    /// `weather`, `plugins/todo/index.toml` is `todo`.
    pub fn from_path(main_file: impl Into<PathBuf>) -> Self {
        let main_file = main_file.into();
        Self {
            name: name_from_path(&main_file),
            main_file,
        }
    }
}

/// Derives a plugin name from an entry path.
pub fn name_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if INDEX_STEMS.contains(&stem.as_str()) {
        if let Some(dir) = path.parent().and_then(Path::file_name) {
            return normalize_name(&dir.to_string_lossy());
        }
    }
    normalize_name(&stem)
}

fn normalize_name(raw: &str) -> String {
    raw.trim()
        .trim_matches(['/', '\\'])
        .replace(['/', '\\'], "-")
}

// ─── Native descriptors ─────────────────────────────────────────────────────

/// Setup entry point of a native plugin.
pub type SetupFn = fn(&Arc<PluginContext>) -> Result<(), BoxError>;

/// A plugin compiled into the binary.
#[derive(Debug, Clone, Copy)]
pub struct PluginDescriptor {
    pub name: &'static str,
    /// Source file that defined the plugin, as given by `file!()`.
    pub main_file: &'static str,
    /// Extra files the plugin reads, relative to `main_file`'s directory.
    /// They are tracked as dependencies for hot reload.
    pub imports: &'static [&'static str],
    pub setup: SetupFn,
}

impl PluginDescriptor {
    pub fn identity(&self) -> PluginIdentity {
        PluginIdentity::new(self.name, self.main_file)
    }
}

/// Every native plugin registered with [`define_plugin!`](crate::define_plugin).
#[distributed_slice]
pub static PLUGINS: [PluginDescriptor];

/// Looks up a native plugin by name.
pub fn find_native(name: &str) -> Option<&'static PluginDescriptor> {
    PLUGINS.iter().find(|d| d.name == name)
}

/// Registers a native plugin.
///
/// ```rust,ignore
/// fn setup(ctx: &Arc<PluginContext>) -> Result<(), BoxError> {
///     ctx.command("ping", None)?.action(|_| async { "pong" });
///     Ok(())
/// }
///
/// kiln_framework::define_plugin! {
///     static PING = { name: "ping", setup: setup };
/// }
/// ```
#[macro_export]
macro_rules! define_plugin {
    (
        $(#[$meta:meta])*
        $vis:vis static $ident:ident = {
            name: $name:expr,
            $(imports: [$($import:expr),* $(,)?],)?
            setup: $setup:expr $(,)?
        };
    ) => {
        $(#[$meta])*
        #[$crate::__private::linkme::distributed_slice($crate::plugin::PLUGINS)]
        #[linkme(crate = $crate::__private::linkme)]
        $vis static $ident: $crate::plugin::PluginDescriptor = $crate::plugin::PluginDescriptor {
            name: $name,
            main_file: file!(),
            imports: &[$($($import),*)?],
            setup: $setup,
        };
    };
}

// ─── Loader seam ────────────────────────────────────────────────────────────

/// Resolves plugin names and instantiates plugins.
///
/// A loader creates its contexts through
/// [`BotHost::define`](crate::host::BotHost::define), which disposes a
/// half-built context when setup fails.
#[async_trait]
pub trait PluginLoader: Send + Sync + 'static {
    /// Short name for logs.
    fn kind(&self) -> &'static str;

    /// Entry file of plugin `name`, if this loader provides it.
    fn resolve(&self, name: &str) -> Option<PathBuf>;

    /// Names of every plugin this loader can currently provide.
    fn discover(&self) -> Vec<String>;

    /// Instantiates plugin `name` from `entry`.
    async fn load(
        &self,
        host: &Arc<BotHost>,
        name: &str,
        entry: &Path,
    ) -> LoadResult<Arc<PluginContext>>;
}
