//! Hot reload.
//!
//! [`FileWatcher`] turns file system notifications into paths on a channel;
//! [`ReloadOrchestrator`] decides what each changed path means:
//!
//! 1. a plugin's main file: that plugin is restarted, or unloaded if the
//!    file is gone;
//! 2. a recorded dependency: every plugin depending on it is restarted;
//! 3. anything else under the plugin directory: the directory is scanned
//!    and new plugins are loaded;
//! 4. the config file: see [`ConfigAction`].
//!
//! Paths outside all of these are ignored.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_core::Signal;
use kiln_framework::BotHost;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigLoader, KilnConfig, validate_config};
use crate::error::RuntimeResult;

/// Signal emitted when the `plugins` section of the config file changes.
pub const CONFIG_CHANGE_SIGNAL: &str = "plugin.config.change";

/// What a config file change requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
    /// Only settings outside `plugins` changed; the process must relaunch.
    Relaunch,
    /// Plugin sections changed and were applied live.
    PluginsUpdated,
}

/// What handling one changed path did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// These plugins were disposed and loaded again.
    Restarted(Vec<String>),
    /// This plugin's main file disappeared and the plugin was disposed.
    Unloaded(String),
    /// A directory scan loaded these new plugins.
    Scanned(Vec<String>),
    /// The config file changed.
    Config(ConfigAction),
    /// Nothing depends on the path.
    Ignored,
}

/// Maps changed files to plugin restarts.
pub struct ReloadOrchestrator {
    host: Arc<BotHost>,
    plugin_root: PathBuf,
    config_file: Option<PathBuf>,
    config_loader: ConfigLoader,
    config: Mutex<KilnConfig>,
}

impl ReloadOrchestrator {
    pub fn new(host: Arc<BotHost>, plugin_root: impl Into<PathBuf>, config: KilnConfig) -> Self {
        Self {
            host,
            plugin_root: canonical(plugin_root.into()),
            config_file: None,
            config_loader: ConfigLoader::new(),
            config: Mutex::new(config),
        }
    }

    /// Watches `path` as the config file the current config came from.
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(canonical(path.into()));
        self
    }

    /// Re-reads config changes through `loader`, keeping its profile,
    /// search paths, programmatic merges and environment setting.
    pub fn config_loader(mut self, loader: ConfigLoader) -> Self {
        self.config_loader = loader;
        self
    }

    pub fn plugin_root(&self) -> &Path {
        &self.plugin_root
    }

    /// The configuration as of the last applied change.
    pub fn current_config(&self) -> KilnConfig {
        self.config.lock().clone()
    }

    /// Every file that can trigger a reload, plus the plugin root and the
    /// config file.
    pub fn watch_set(&self) -> BTreeSet<PathBuf> {
        let mut paths = self.host.watch_set();
        paths.insert(self.plugin_root.clone());
        if let Some(config_file) = &self.config_file {
            paths.insert(config_file.clone());
        }
        paths
    }

    /// Handles one changed path. Reload failures are logged; the plugins
    /// involved stay unloaded.
    ///
    /// The whole change is handled in a single host turn.
    pub async fn handle_change(&self, path: &Path) -> ReloadOutcome {
        let path = canonical(path.to_path_buf());
        self.host.in_turn(self.handle_change_in_turn(path)).await
    }

    async fn handle_change_in_turn(&self, path: PathBuf) -> ReloadOutcome {
        if self.config_file.as_deref() == Some(path.as_path()) {
            return self.reload_config(&path).await;
        }

        if let Some(ctx) = self.host.plugin_by_main_file(&path) {
            let name = ctx.name().to_string();
            if !path.exists() {
                info!(plugin = %name, path = %path.display(), "Plugin main file removed, unloading");
                self.host.unload_plugin(&name).await;
                return ReloadOutcome::Unloaded(name);
            }
            info!(plugin = %name, path = %path.display(), "Plugin changed, restarting");
            return ReloadOutcome::Restarted(self.restart(vec![name], &path).await);
        }

        let dependents: Vec<String> = self
            .host
            .dependents_of(&path)
            .iter()
            .map(|ctx| ctx.name().to_string())
            .collect();
        if !dependents.is_empty() {
            info!(
                path = %path.display(),
                plugins = ?dependents,
                "Plugin dependency changed, restarting dependents"
            );
            return ReloadOutcome::Restarted(self.restart(dependents, &path).await);
        }

        if path.starts_with(&self.plugin_root) && path.exists() {
            let loaded = self.host.load_all().await;
            if !loaded.is_empty() {
                info!(plugins = ?loaded, "New plugins loaded");
                return ReloadOutcome::Scanned(loaded);
            }
        }

        debug!(path = %path.display(), "Untracked file changed");
        ReloadOutcome::Ignored
    }

    async fn restart(&self, names: Vec<String>, changed: &Path) -> Vec<String> {
        let mut restarted = Vec::with_capacity(names.len());
        for name in names {
            match self.host.restart_plugin(&name, changed).await {
                Ok(_) => restarted.push(name),
                Err(e) => error!(plugin = %name, error = %e, "Failed to restart plugin"),
            }
        }
        restarted
    }

    async fn reload_config(&self, path: &Path) -> ReloadOutcome {
        let loader = self.config_loader.clone();
        let loader = match loader.locate() {
            Some(found) if canonical(found.clone()).as_path() == path => loader,
            _ => loader.file(path),
        };
        let loaded = loader
            .load()
            .and_then(|config| validate_config(&config).map(|_| config));
        match loaded {
            Ok(config) => ReloadOutcome::Config(self.apply_config(config).await),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable config change");
                ReloadOutcome::Ignored
            }
        }
    }

    /// Compares the `plugins` sections of `new` and the current config.
    ///
    /// Equal sections mean something else changed and the process has to
    /// relaunch. Otherwise the new sections are handed to the host and
    /// every plugin receives [`CONFIG_CHANGE_SIGNAL`] with `{new, old}`.
    pub async fn apply_config(&self, new: KilnConfig) -> ConfigAction {
        let new_plugins = Value::Object(new.plugins.clone());
        let old = std::mem::replace(&mut *self.config.lock(), new);
        let old_plugins = Value::Object(old.plugins);

        if new_plugins == old_plugins {
            info!("Configuration changed, relaunch required");
            return ConfigAction::Relaunch;
        }

        if let Value::Object(sections) = &new_plugins {
            self.host.set_plugin_configs(sections.clone());
        }
        info!("Plugin configuration changed");
        self.host
            .emit(Signal::with_payload(
                CONFIG_CHANGE_SIGNAL,
                json!({ "new": new_plugins, "old": old_plugins }),
            ))
            .await;
        ConfigAction::PluginsUpdated
    }
}

/// Canonical form of `path` when it exists. A removed file keeps the path
/// it was reported with, so its parent is canonicalised instead.
fn canonical(path: PathBuf) -> PathBuf {
    if let Ok(found) = path.canonicalize() {
        return found;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|parent| parent.join(name))
            .unwrap_or(path),
        _ => path,
    }
}

// =============================================================================
// File watching
// =============================================================================

/// Debounced file watcher reporting changed paths on a channel.
pub struct FileWatcher {
    debouncer: Debouncer<RecommendedWatcher>,
    watched: HashSet<PathBuf>,
}

impl FileWatcher {
    pub fn new(debounce: Duration, tx: mpsc::UnboundedSender<PathBuf>) -> RuntimeResult<Self> {
        let debouncer = new_debouncer(debounce, move |result: DebounceEventResult| match result {
            Ok(events) => {
                for event in events {
                    if tx.send(event.path).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "File watch error"),
        })?;
        Ok(Self {
            debouncer,
            watched: HashSet::new(),
        })
    }

    /// Watches exactly the directories needed to observe `paths`.
    ///
    /// Directories are watched recursively. A file is observed through its
    /// parent directory, so editors that save by renaming are still seen.
    /// Paths already covered by a recursive watch are skipped.
    pub fn sync(&mut self, paths: &BTreeSet<PathBuf>) {
        let mut wanted: Vec<(PathBuf, RecursiveMode)> = Vec::new();
        for path in paths {
            if path.is_dir() {
                wanted.push((path.clone(), RecursiveMode::Recursive));
            } else if let Some(parent) = path.parent().filter(|p| p.is_dir()) {
                wanted.push((parent.to_path_buf(), RecursiveMode::NonRecursive));
            }
        }
        let recursive: Vec<PathBuf> = wanted
            .iter()
            .filter(|(_, mode)| *mode == RecursiveMode::Recursive)
            .map(|(path, _)| path.clone())
            .collect();
        wanted.retain(|(path, mode)| {
            *mode == RecursiveMode::Recursive
                || !recursive.iter().any(|root| path.starts_with(root))
        });

        let targets: HashSet<PathBuf> = wanted.iter().map(|(path, _)| path.clone()).collect();
        let watcher = self.debouncer.watcher();

        for stale in self.watched.difference(&targets) {
            if let Err(e) = watcher.unwatch(stale) {
                debug!(path = %stale.display(), error = %e, "Failed to unwatch");
            }
        }
        self.watched.retain(|path| targets.contains(path));

        for (path, mode) in wanted {
            if self.watched.contains(&path) {
                continue;
            }
            match watcher.watch(&path, mode) {
                Ok(()) => {
                    debug!(path = %path.display(), ?mode, "Watching");
                    self.watched.insert(path);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to watch"),
            }
        }
    }

    pub fn watched(&self) -> &HashSet<PathBuf> {
        &self.watched
    }
}
