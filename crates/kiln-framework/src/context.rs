//! Plugin contexts.
//!
//! A [`PluginContext`] is a plugin's handle on the bot. Everything a plugin
//! registers through it (middlewares, commands, listeners, timers) records an
//! undo callback; [`dispose`](PluginContext::dispose) runs them all so that a
//! plugin can be unloaded and loaded again without leaving anything behind.
//!
//! Contexts are created only by
//! [`BotHost::create_context`](crate::host::BotHost::create_context).
//!
//! # Lifecycle
//!
//! ```text
//! create_context ──► active ◄──► disabled
//!                      │
//!                   dispose ──► disposed (removed from the host)
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use kiln_core::{ApiError, ApiResult, ChannelKind, MessageEvent, Signal};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::argv::Argv;
use crate::command::{Command, Reply, command_path};
use crate::error::{BoxError, DefinitionError, FrameworkResult};
use crate::host::BotHost;
use crate::middleware::{Middleware, MiddlewareFuture, Next, compose};
use crate::plugin::PluginIdentity;

/// An undo callback.
pub type Disposer = Box<dyn FnOnce() + Send>;

/// A signal listener.
pub type Listener = Arc<dyn Fn(Signal) -> BoxFuture<'static, ()> + Send + Sync>;

/// Name of the signal a context emits to itself just before it is torn down.
pub const DISPOSE_SIGNAL: &str = "dispose";

/// A plugin's handle on the bot.
pub struct PluginContext {
    name: String,
    main_file: PathBuf,
    dependencies: Vec<PathBuf>,
    host: Weak<BotHost>,
    this: Weak<PluginContext>,
    disabled: AtomicBool,
    disposed: AtomicBool,
    next_id: AtomicU64,
    middlewares: RwLock<Vec<(u64, Arc<dyn Middleware>)>>,
    commands: RwLock<Vec<Arc<Command>>>,
    listeners: RwLock<Vec<(u64, String, Listener)>>,
    disposes: Mutex<VecDeque<(u64, Disposer)>>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("name", &self.name)
            .field("main_file", &self.main_file)
            .field("dependencies", &self.dependencies)
            .field("disabled", &self.is_disabled())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl PluginContext {
    pub(crate) fn new(
        identity: PluginIdentity,
        dependencies: Vec<PathBuf>,
        host: Weak<BotHost>,
    ) -> Arc<Self> {
        let ctx = Arc::new_cyclic(|this| Self {
            name: identity.name,
            main_file: identity.main_file,
            dependencies,
            host,
            this: this.clone(),
            disabled: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            middlewares: RwLock::new(Vec::new()),
            commands: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            disposes: Mutex::new(VecDeque::new()),
        });
        ctx.middleware(CommandDispatch {
            ctx: Arc::downgrade(&ctx),
        });
        ctx
    }

    // ─── Identity & state ───────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn main_file(&self) -> &Path {
        &self.main_file
    }

    /// Files this plugin's main file pulled in when it was loaded.
    pub fn dependencies(&self) -> &[PathBuf] {
        &self.dependencies
    }

    pub fn host(&self) -> Option<Arc<BotHost>> {
        self.host.upgrade()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn enable(&self) {
        self.disabled.store(false, Ordering::Release);
        info!(plugin = %self.name, "Plugin enabled");
    }

    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
        info!(plugin = %self.name, "Plugin disabled");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    // ─── Disposers ──────────────────────────────────────────────────────

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers an undo callback and returns its id.
    ///
    /// On an already disposed context the callback runs immediately.
    pub fn on_dispose(&self, disposer: impl FnOnce() + Send + 'static) -> u64 {
        let id = self.next_id();
        self.push_disposer(id, Box::new(disposer));
        id
    }

    fn push_disposer(&self, id: u64, disposer: Disposer) {
        if self.is_disposed() {
            disposer();
            return;
        }
        self.disposes.lock().push_back((id, disposer));
    }

    fn take_disposer(&self, id: u64) -> Option<Disposer> {
        let mut disposes = self.disposes.lock();
        let index = disposes.iter().position(|(i, _)| *i == id)?;
        disposes.remove(index).map(|(_, disposer)| disposer)
    }

    /// Undoes one registration (a middleware, listener or timer) early.
    ///
    /// Returns `false` if `id` is unknown or already undone.
    pub fn cancel(&self, id: u64) -> bool {
        match self.take_disposer(id) {
            Some(disposer) => {
                disposer();
                true
            }
            None => false,
        }
    }

    /// Number of registrations that are still live.
    pub fn pending_disposers(&self) -> usize {
        self.disposes.lock().len()
    }

    /// Tears the plugin down.
    ///
    /// Marks the context disposed, emits [`DISPOSE_SIGNAL`] to its listeners,
    /// runs every undo callback in registration order and detaches the
    /// context from the host. Only the first call does anything, even when
    /// a dispose listener calls it again.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.trip(Signal::new(DISPOSE_SIGNAL)).await;
        let mut drained = 0usize;
        loop {
            let next = self.disposes.lock().pop_front();
            let Some((_, disposer)) = next else {
                break;
            };
            disposer();
            drained += 1;
        }
        if let Some(host) = self.host.upgrade() {
            host.detach(self);
        }
        info!(plugin = %self.name, effects = drained, "Plugin disposed");
    }

    // ─── Registration ───────────────────────────────────────────────────

    /// Appends a middleware to this context's chain.
    pub fn middleware(&self, middleware: impl Middleware) -> u64 {
        let id = self.next_id();
        self.middlewares.write().push((id, Arc::new(middleware)));
        let this = self.this.clone();
        self.push_disposer(
            id,
            Box::new(move || {
                if let Some(ctx) = this.upgrade() {
                    ctx.middlewares.write().retain(|(i, _)| *i != id);
                }
            }),
        );
        id
    }

    /// Defines a command.
    ///
    /// `signature` is `name <arg:type> [opt:type] -flag`; a name of the form
    /// `parent/child` attaches the command under an existing one.
    pub fn command(
        &self,
        signature: &str,
        trigger: Option<ChannelKind>,
    ) -> FrameworkResult<Arc<Command>> {
        if self.is_disposed() {
            return Err(DefinitionError::Disposed(self.name.clone()));
        }
        let path = command_path(signature);
        let segments: Vec<&str> = path.split('/').collect();
        let (name, parents) = segments
            .split_last()
            .ok_or_else(|| DefinitionError::invalid(signature, "missing command name"))?;

        let mut parent = None;
        for (depth, segment) in parents.iter().enumerate() {
            match self.find_command(segment) {
                Some(found) => parent = Some(found),
                None => {
                    return Err(DefinitionError::ParentNotFound(
                        parents[..=depth].join("/"),
                    ));
                }
            }
        }
        if self.find_command(name).is_some() {
            return Err(DefinitionError::DuplicateCommand(name.to_string()));
        }

        let command = Command::new(signature, trigger, parent.as_ref())?;
        if let Some(parent) = &parent {
            parent.add_child(command.clone());
        }
        self.commands.write().push(command.clone());

        let id = self.next_id();
        let this = self.this.clone();
        let registered = Arc::downgrade(&command);
        self.push_disposer(
            id,
            Box::new(move || {
                if let (Some(ctx), Some(command)) = (this.upgrade(), registered.upgrade()) {
                    ctx.remove_command(&command);
                }
            }),
        );
        debug!(plugin = %self.name, command = %command.name(), "Command defined");
        Ok(command)
    }

    /// Removes `command` and its descendants.
    fn remove_command(&self, command: &Arc<Command>) {
        let mut doomed = vec![command.clone()];
        let mut index = 0;
        while index < doomed.len() {
            let children = doomed[index].children();
            doomed.extend(children);
            index += 1;
        }
        self.commands
            .write()
            .retain(|c| !doomed.iter().any(|d| Arc::ptr_eq(c, d)));
        if let Some(parent) = command.parent() {
            parent.remove_child(command);
        }
    }

    /// Finds a command of this plugin by its own name.
    pub fn find_command(&self, name: &str) -> Option<Arc<Command>> {
        self.commands
            .read()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// This plugin's commands in definition order, children included.
    pub fn commands(&self) -> Vec<Arc<Command>> {
        self.commands.read().clone()
    }

    /// Subscribes to a named signal.
    pub fn on<F, Fut>(&self, signal: impl Into<String>, listener: F) -> u64
    where
        F: Fn(Signal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id();
        let listener: Listener = Arc::new(move |signal| listener(signal).boxed());
        self.listeners.write().push((id, signal.into(), listener));
        let this = self.this.clone();
        self.push_disposer(
            id,
            Box::new(move || {
                if let Some(ctx) = this.upgrade() {
                    ctx.listeners.write().retain(|(i, _, _)| *i != id);
                }
            }),
        );
        id
    }

    /// Runs this context's listeners for `signal`, in registration order.
    pub async fn trip(&self, signal: Signal) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .filter(|(_, name, _)| *name == signal.name)
            .map(|(_, _, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(signal.clone()).await;
        }
    }

    /// Runs `task` once after `delay`.
    ///
    /// The timer is cancelled if the plugin is disposed first; once it has
    /// fired it no longer counts as a live registration. `task` runs inside a
    /// host turn, never alongside a dispatch.
    pub fn set_timeout<F, Fut>(&self, delay: Duration, task: F) -> u64
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id();
        let token = CancellationToken::new();
        let guard = token.clone();
        self.push_disposer(id, Box::new(move || token.cancel()));

        let this = self.this.clone();
        let host = self.host.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let Some(host) = host.upgrade() else {
                        return;
                    };
                    host.in_turn(async {
                        // Disposed while waiting for the turn.
                        if guard.is_cancelled() {
                            return;
                        }
                        if let Some(ctx) = this.upgrade() {
                            ctx.take_disposer(id);
                        }
                        task().await;
                    })
                    .await;
                }
            }
        });
        id
    }

    /// Runs `task` every `period`, starting one period from now.
    pub fn set_interval<F, Fut>(&self, period: Duration, task: F) -> u64
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id();
        let token = CancellationToken::new();
        let guard = token.clone();
        self.push_disposer(id, Box::new(move || token.cancel()));

        let plugin = self.name.clone();
        let host = self.host.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = guard.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(host) = host.upgrade() else {
                            break;
                        };
                        host.in_turn(async {
                            if !guard.is_cancelled() {
                                task().await;
                            }
                        })
                        .await;
                    }
                }
            }
            debug!(plugin = %plugin, timer = id, "Interval stopped");
        });
        id
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Runs this context's middleware chain for `event`.
    pub async fn handle_message(&self, event: Arc<MessageEvent>) -> Result<(), BoxError> {
        let stages: Vec<Arc<dyn Middleware>> = self
            .middlewares
            .read()
            .iter()
            .map(|(_, middleware)| middleware.clone())
            .collect();
        compose(stages).oneshot(event).await
    }

    /// Finds the command `event` invokes, if any.
    fn route(&self, event: &Arc<MessageEvent>) -> Option<(Arc<Command>, Argv)> {
        let commands = self.commands();

        if let Some(mut argv) = Argv::from_event(event.clone()) {
            let found = commands
                .iter()
                .find(|c| c.accepts(&argv.name) && c.matches(event))
                .cloned();
            if let Some(mut command) = found {
                // `admin ban bob` descends into `admin`'s child `ban`.
                loop {
                    let Some(token) = argv.tokens.front().cloned() else {
                        break;
                    };
                    let Some(child) = command
                        .children()
                        .into_iter()
                        .find(|c| c.accepts(&token) && c.matches(event))
                    else {
                        break;
                    };
                    argv.tokens.pop_front();
                    argv.name = token;
                    command = child;
                }
                return Some((command, argv));
            }
        }

        commands
            .iter()
            .filter(|c| c.matches(event))
            .find_map(|command| {
                let hit = command.lookup_shortcut(&event.text)?;
                let name = hit.name.unwrap_or_else(|| command.name().to_string());
                Some((command.clone(), Argv::new(event.clone(), name, hit.tokens)))
            })
    }

    // ─── Host delegation ────────────────────────────────────────────────

    fn require_host(&self) -> ApiResult<Arc<BotHost>> {
        self.host.upgrade().ok_or(ApiError::NotConnected)
    }

    /// Sends `message` to `channel` (`private:<id>` or `group:<id>`).
    pub async fn send_msg(&self, channel: &str, message: &str) -> ApiResult<String> {
        self.require_host()?.send_msg(channel, message).await
    }

    /// Replies on the channel `event` came from.
    pub async fn reply(&self, event: &MessageEvent, message: &str) -> ApiResult<String> {
        self.require_host()?
            .transport()
            .send_to(&event.channel, message)
            .await
    }

    /// Looks up a service registered on the host.
    pub fn service<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.host.upgrade()?.service(key)
    }

    /// Deserializes this plugin's config section. A missing section reads
    /// as an empty object.
    pub fn config<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        let section = self
            .host
            .upgrade()
            .map(|host| host.plugin_config(&self.name))
            .unwrap_or(Value::Null);
        let section = match section {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        serde_json::from_value(section)
    }

    /// Commands of every enabled plugin.
    pub fn command_list(&self) -> Vec<Arc<Command>> {
        self.host
            .upgrade()
            .map(|host| host.command_list())
            .unwrap_or_default()
    }

    /// Emits `signal` to every enabled plugin.
    pub async fn emit(&self, signal: Signal) {
        if let Some(host) = self.host.upgrade() {
            host.emit(signal).await;
        }
    }
}

// ============================================================================
// Bootstrap middleware
// ============================================================================

/// First stage of every context: runs the command the message invokes and
/// sends its reply. Messages that invoke nothing, or whose command produced
/// no text, continue down the chain.
struct CommandDispatch {
    ctx: Weak<PluginContext>,
}

impl Middleware for CommandDispatch {
    fn handle(&self, event: Arc<MessageEvent>, next: Next) -> MiddlewareFuture {
        let ctx = self.ctx.clone();
        async move {
            let Some(ctx) = ctx.upgrade() else {
                return next.run(event).await;
            };
            let Some((command, argv)) = ctx.route(&event) else {
                return next.run(event).await;
            };

            match command.execute(argv).await {
                Ok(Some(Reply::Message(text))) => {
                    if let Err(e) = ctx.reply(&event, &text).await {
                        error!(
                            plugin = %ctx.name,
                            command = %command.name(),
                            error = %e,
                            "Failed to send command reply"
                        );
                    }
                    return Ok(());
                }
                Ok(Some(Reply::Handled)) | Ok(None) => {}
                Err(e) => warn!(
                    plugin = %ctx.name,
                    command = %command.name(),
                    error = %e,
                    "Command failed"
                ),
            }
            next.run(event).await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests;
