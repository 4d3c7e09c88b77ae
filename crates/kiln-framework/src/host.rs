//! The bot host: owner of every plugin context.
//!
//! [`BotHost`] is created once per process and shared as `Arc<BotHost>`. It:
//!
//! - keeps plugin contexts in insertion order and guarantees unique names;
//! - dispatches each message to every enabled context, one after another;
//! - emits named signals (`bot.start`, `plugin.<name>.mounted`, ...);
//! - resolves plugin names through its [`PluginLoader`]s and restarts plugins
//!   whose files changed;
//! - acts as a string-keyed service locator shared by all plugins.
//!
//! Dispatch, signal emission, plugin transitions and timer callbacks each run
//! inside a *turn* (see [`BotHost::in_turn`]). Only one turn runs at a time,
//! so plugin code never runs in parallel with other plugin code, whatever
//! runtime flavor the host lives on. Handlers still interleave at their
//! await points inside a turn.

use std::any::Any;
use std::future::Future;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use kiln_core::{ApiResult, BoxedTransport, ChannelId, InboundEvent, MessageEvent, Signal};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{error, info, info_span, warn, Instrument};

use crate::command::Command;
use crate::context::PluginContext;
use crate::error::{BoxError, DefinitionError, FrameworkResult, LoadError, LoadResult};
use crate::module::ModuleCache;
use crate::plugin::{PluginIdentity, PluginLoader};

/// Emitted once before the bot is considered started.
pub const BOT_START: &str = "bot.start";
/// Emitted once after `bot.start` listeners have run.
pub const BOT_READY: &str = "bot.ready";

tokio::task_local! {
    /// Address of the host whose turn the current task holds.
    static TURN_HOLDER: usize;
}

/// A type-erased service.
pub type ServiceArc = Arc<dyn Any + Send + Sync>;

/// Owner of all plugin contexts.
pub struct BotHost {
    this: Weak<BotHost>,
    transport: BoxedTransport,
    plugins: RwLock<Vec<Arc<PluginContext>>>,
    services: RwLock<HashMap<String, ServiceArc>>,
    plugin_configs: RwLock<Map<String, Value>>,
    disabled: RwLock<HashSet<String>>,
    modules: ModuleCache,
    loaders: RwLock<Vec<Arc<dyn PluginLoader>>>,
    started: AtomicBool,
    ready: AtomicBool,
    turn: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for BotHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotHost")
            .field("bot_id", &self.transport.id())
            .field("plugins", &self.plugin_names())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

impl BotHost {
    pub fn new(transport: BoxedTransport) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            transport,
            plugins: RwLock::new(Vec::new()),
            services: RwLock::new(HashMap::new()),
            plugin_configs: RwLock::new(Map::new()),
            disabled: RwLock::new(HashSet::new()),
            modules: ModuleCache::new(),
            loaders: RwLock::new(Vec::new()),
            started: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            turn: tokio::sync::Mutex::new(()),
        })
    }

    /// Runs `work` once no other turn is running on this host.
    ///
    /// A task that already holds the turn (a listener emitting another
    /// signal, a command unloading a plugin) runs `work` directly.
    pub async fn in_turn<F: Future>(&self, work: F) -> F::Output {
        let me = self as *const Self as usize;
        if TURN_HOLDER.try_with(|holder| *holder == me).unwrap_or(false) {
            return work.await;
        }
        let _turn = self.turn.lock().await;
        TURN_HOLDER.scope(me, work).await
    }

    pub fn transport(&self) -> &BoxedTransport {
        &self.transport
    }

    /// The bot account id reported by the transport.
    pub fn bot_id(&self) -> &str {
        self.transport.id()
    }

    pub fn modules(&self) -> &ModuleCache {
        &self.modules
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    // ─── Configuration ──────────────────────────────────────────────────

    /// Replaces the per-plugin config sections, returning the old ones.
    pub fn set_plugin_configs(&self, configs: Map<String, Value>) -> Map<String, Value> {
        std::mem::replace(&mut *self.plugin_configs.write(), configs)
    }

    /// The config section of plugin `name`, or `Null`.
    pub fn plugin_config(&self, name: &str) -> Value {
        self.plugin_configs
            .read()
            .get(name)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Plugins created with one of these names start disabled.
    pub fn set_disabled_plugins(&self, names: impl IntoIterator<Item = String>) {
        *self.disabled.write() = names.into_iter().collect();
    }

    // ─── Services ───────────────────────────────────────────────────────

    pub fn provide<T: Send + Sync + 'static>(&self, key: impl Into<String>, service: Arc<T>) {
        let key = key.into();
        if self.services.write().insert(key.clone(), service).is_some() {
            warn!(service = %key, "Service replaced");
        }
    }

    pub fn service<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let service = self.services.read().get(key).cloned()?;
        service.downcast::<T>().ok()
    }

    pub fn remove_service(&self, key: &str) -> bool {
        self.services.write().remove(key).is_some()
    }

    // ─── Contexts ───────────────────────────────────────────────────────

    /// Creates and registers a context for `identity`.
    ///
    /// The context's dependencies are the files recorded under its main file
    /// in the module cache, stopping at other plugins' main files.
    pub fn create_context(&self, identity: PluginIdentity) -> FrameworkResult<Arc<PluginContext>> {
        let mut plugins = self.plugins.write();
        if plugins.iter().any(|p| p.name() == identity.name) {
            return Err(DefinitionError::DuplicatePlugin(identity.name));
        }

        let boundaries: HashSet<PathBuf> = plugins
            .iter()
            .map(|p| p.main_file().to_path_buf())
            .collect();
        let dependencies = self
            .modules
            .dependencies_of(&identity.main_file, &boundaries);
        let disabled = self.disabled.read().contains(&identity.name);

        let ctx = PluginContext::new(identity, dependencies, self.this.clone());
        if disabled {
            ctx.disable();
        }
        plugins.push(ctx.clone());
        info!(
            plugin = %ctx.name(),
            main_file = %ctx.main_file().display(),
            dependencies = ctx.dependencies().len(),
            "Plugin context created"
        );
        Ok(ctx)
    }

    /// Creates a context and runs `setup` on it. If setup fails the context
    /// is disposed before the error is returned.
    pub async fn define<F>(&self, identity: PluginIdentity, setup: F) -> LoadResult<Arc<PluginContext>>
    where
        F: FnOnce(&Arc<PluginContext>) -> Result<(), BoxError> + Send,
    {
        let ctx = self.create_context(identity)?;
        if let Err(source) = setup(&ctx) {
            ctx.dispose().await;
            return Err(match source.downcast::<DefinitionError>() {
                Ok(definition) => LoadError::Definition(*definition),
                Err(source) => LoadError::Setup {
                    plugin: ctx.name().to_string(),
                    source,
                },
            });
        }
        Ok(ctx)
    }

    pub(crate) fn detach(&self, ctx: &PluginContext) {
        self.plugins
            .write()
            .retain(|p| !std::ptr::eq(Arc::as_ptr(p), ctx));
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<PluginContext>> {
        self.plugins.read().iter().find(|p| p.name() == name).cloned()
    }

    /// Every live context, in insertion order.
    pub fn plugins(&self) -> Vec<Arc<PluginContext>> {
        self.plugins.read().clone()
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    fn enabled_plugins(&self) -> Vec<Arc<PluginContext>> {
        self.plugins
            .read()
            .iter()
            .filter(|p| !p.is_disabled())
            .cloned()
            .collect()
    }

    /// Commands of every enabled plugin.
    pub fn command_list(&self) -> Vec<Arc<Command>> {
        self.enabled_plugins()
            .iter()
            .flat_map(|p| p.commands())
            .collect()
    }

    /// Every file a reload watcher has to observe: main files and their
    /// dependencies.
    pub fn watch_set(&self) -> BTreeSet<PathBuf> {
        self.plugins
            .read()
            .iter()
            .flat_map(|p| {
                std::iter::once(p.main_file().to_path_buf()).chain(p.dependencies().iter().cloned())
            })
            .collect()
    }

    /// The context whose main file is `path`.
    pub fn plugin_by_main_file(&self, path: &Path) -> Option<Arc<PluginContext>> {
        self.plugins
            .read()
            .iter()
            .find(|p| p.main_file() == path)
            .cloned()
    }

    /// Contexts that list `path` among their dependencies.
    pub fn dependents_of(&self, path: &Path) -> Vec<Arc<PluginContext>> {
        self.plugins
            .read()
            .iter()
            .filter(|p| p.dependencies().iter().any(|d| d == path))
            .cloned()
            .collect()
    }

    // ─── Loading ────────────────────────────────────────────────────────

    pub fn add_loader(&self, loader: Arc<dyn PluginLoader>) {
        self.loaders.write().push(loader);
    }

    /// Names every loader can provide, first loader first, without
    /// duplicates.
    pub fn discover(&self) -> Vec<String> {
        let loaders = self.loaders.read().clone();
        let mut seen = HashSet::new();
        loaders
            .iter()
            .flat_map(|loader| loader.discover())
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    /// Resolves and loads plugin `name`.
    ///
    /// Emits `plugin.<name>.mounted`; if the bot is already started the new
    /// plugin also receives `bot.start` and `bot.ready`.
    pub async fn load_plugin(&self, name: &str) -> LoadResult<Arc<PluginContext>> {
        self.in_turn(self.load_plugin_in_turn(name)).await
    }

    async fn load_plugin_in_turn(&self, name: &str) -> LoadResult<Arc<PluginContext>> {
        let host = self.this.upgrade().ok_or(LoadError::HostGone)?;
        let loaders = self.loaders.read().clone();
        for loader in loaders {
            let Some(entry) = loader.resolve(name) else {
                continue;
            };
            let ctx = loader.load(&host, name, &entry).await?;
            info!(plugin = %ctx.name(), loader = loader.kind(), "Plugin loaded");

            self.emit(Signal::new(format!("plugin.{}.mounted", ctx.name())))
                .await;
            if self.is_started() {
                ctx.trip(Signal::new(BOT_START)).await;
            }
            if self.is_ready() {
                ctx.trip(Signal::new(BOT_READY)).await;
            }
            return Ok(ctx);
        }
        Err(LoadError::NotFound(name.to_string()))
    }

    /// Loads every discoverable plugin that is not loaded yet.
    ///
    /// Failures are logged and skipped. Returns the names that loaded.
    pub async fn load_all(&self) -> Vec<String> {
        let mut loaded = Vec::new();
        for name in self.discover() {
            if self.plugin(&name).is_some() {
                continue;
            }
            match self.load_plugin(&name).await {
                Ok(ctx) => loaded.push(ctx.name().to_string()),
                Err(e) => error!(plugin = %name, error = %e, "Failed to load plugin"),
            }
        }
        loaded
    }

    /// Disposes plugin `name`. Returns whether it was loaded.
    pub async fn unload_plugin(&self, name: &str) -> bool {
        let Some(ctx) = self.plugin(name) else {
            return false;
        };
        self.in_turn(ctx.dispose()).await;
        true
    }

    /// Disposes plugin `name`, forgets its cached files and loads it again.
    pub async fn restart_plugin(&self, name: &str, changed: &Path) -> LoadResult<Arc<PluginContext>> {
        self.in_turn(async {
            if let Some(ctx) = self.plugin(name) {
                ctx.dispose().await;
                self.modules.invalidate(ctx.main_file());
            }
            self.modules.invalidate(changed);
            let ctx = self.load_plugin_in_turn(name).await?;
            info!(plugin = %name, changed = %changed.display(), "Plugin restarted");
            Ok(ctx)
        })
        .await
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    pub async fn dispatch(&self, event: InboundEvent) {
        match event {
            InboundEvent::Message(message) => self.dispatch_message(message).await,
            InboundEvent::Signal(signal) => self.emit(signal).await,
        }
    }

    /// Runs `event` through every enabled context in insertion order.
    pub async fn dispatch_message(&self, event: MessageEvent) {
        let event = Arc::new(event);
        self.in_turn(async {
            for ctx in self.enabled_plugins() {
                let span = info_span!("plugin", plugin = %ctx.name());
                if let Err(e) = ctx.handle_message(event.clone()).instrument(span).await {
                    error!(plugin = %ctx.name(), error = %e, "Middleware chain failed");
                }
            }
        })
        .await
    }

    /// Delivers `signal` to the listeners of every enabled context.
    pub async fn emit(&self, signal: Signal) {
        self.in_turn(async {
            for ctx in self.enabled_plugins() {
                ctx.trip(signal.clone()).await;
            }
        })
        .await
    }

    /// Emits `bot.start` then `bot.ready`, marking each stage as reached.
    pub async fn start(&self) {
        self.in_turn(async {
            self.emit(Signal::new(BOT_START)).await;
            self.started.store(true, Ordering::Release);
            self.emit(Signal::new(BOT_READY)).await;
            self.ready.store(true, Ordering::Release);
        })
        .await;
        info!(bot_id = %self.bot_id(), plugins = self.plugins.read().len(), "Bot ready");
    }

    /// Disposes every plugin, newest first.
    pub async fn shutdown(&self) {
        let plugins = self.plugins();
        self.in_turn(async {
            for ctx in plugins.iter().rev() {
                ctx.dispose().await;
            }
        })
        .await
    }

    /// Sends `message` to a `<kind>:<id>` channel.
    pub async fn send_msg(&self, channel: &str, message: &str) -> ApiResult<String> {
        let channel: ChannelId = channel.parse()?;
        self.transport.send_to(&channel, message).await
    }
}

#[cfg(test)]
mod tests;
