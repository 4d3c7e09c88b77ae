//! Native plugins: Rust setup functions collected at link time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kiln_framework::{
    BotHost, LoadError, LoadResult, PLUGINS, PluginContext, PluginDescriptor, PluginIdentity,
    PluginLoader,
};
use tracing::debug;

/// Loads the plugins registered with `define_plugin!`, plus any descriptors
/// added with [`NativeLoader::with`].
///
/// A descriptor's `main_file` is the `file!()` path of its source, resolved
/// against the source root (the working directory by default) so that
/// editing the source of a plugin running from `cargo run` is noticed.
pub struct NativeLoader {
    extra: Vec<&'static PluginDescriptor>,
    source_root: PathBuf,
}

impl Default for NativeLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeLoader {
    pub fn new() -> Self {
        Self {
            extra: Vec::new(),
            source_root: std::env::current_dir().unwrap_or_default(),
        }
    }

    /// Adds a descriptor that is not in the link-time registry. Added
    /// descriptors shadow registered ones of the same name.
    pub fn with(mut self, descriptor: &'static PluginDescriptor) -> Self {
        self.extra.push(descriptor);
        self
    }

    pub fn source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = root.into();
        self
    }

    fn descriptors(&self) -> impl Iterator<Item = &'static PluginDescriptor> + '_ {
        self.extra.iter().copied().chain(PLUGINS.iter())
    }

    fn find(&self, name: &str) -> Option<&'static PluginDescriptor> {
        self.descriptors().find(|d| d.name == name)
    }

    fn locate(&self, file: &str) -> PathBuf {
        absolutize(&self.source_root.join(file))
    }
}

/// Canonical form of `path` when it exists, the path itself otherwise.
fn absolutize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[async_trait]
impl PluginLoader for NativeLoader {
    fn kind(&self) -> &'static str {
        "native"
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.find(name).map(|d| self.locate(d.main_file))
    }

    fn discover(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.descriptors()
            .map(|d| d.name.to_string())
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    async fn load(
        &self,
        host: &Arc<BotHost>,
        name: &str,
        entry: &Path,
    ) -> LoadResult<Arc<PluginContext>> {
        let descriptor = self
            .find(name)
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;

        let modules = host.modules();
        modules.insert(entry);
        let base = entry.parent().unwrap_or(&self.source_root);
        for import in descriptor.imports {
            let child = absolutize(&base.join(import));
            debug!(plugin = %name, import = %child.display(), "Recording native import");
            modules.record(entry, &child);
        }

        let identity = PluginIdentity::new(descriptor.name, entry);
        host.define(identity, descriptor.setup).await
    }
}
