//! Runtime orchestration.
//!
//! [`KilnRuntime`] wires a transport to a [`BotHost`], loads the plugins of
//! the configured plugin directory (plus native plugins), and then runs one
//! loop that takes inbound events, file changes and control requests one at
//! a time, so a reload never interleaves with a dispatch.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use kiln_runtime::KilnRuntime;
//!
//! // Loads kiln.yaml from the current directory, or KILN_CONFIG if set.
//! let runtime = KilnRuntime::builder().build(transport)?;
//! let code = runtime.run().await?;
//! std::process::exit(code);
//! ```
//!
//! Under a [`Supervisor`](crate::supervisor::Supervisor), call
//! [`KilnRuntime::attach_supervisor`] before running so the worker reports
//! its start and receives queued payloads.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_core::{BoxedTransport, Signal, event_channel};
use kiln_framework::BotHost;
use serde_json::Value;
use tokio::io::{AsyncRead, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigLoader, KilnConfig, validate_config};
use crate::error::RuntimeResult;
use crate::help::HELP_PLUGIN;
use crate::loader::{ManifestLoader, NativeLoader};
use crate::logging;
use crate::reload::{ConfigAction, FileWatcher, ReloadOrchestrator, ReloadOutcome};
use crate::supervisor::{
    CONFIG_ENV, RELAUNCH_CODE, SupervisorMessage, WORKER_LINK_SERVICE, WorkerLink, read_messages,
};

/// Service key of the [`RuntimeHandle`].
pub const RUNTIME_SERVICE: &str = "runtime";

/// Service key of the loaded [`KilnConfig`].
pub const CONFIG_SERVICE: &str = "config";

/// Signal carrying a payload the supervisor kept across a relaunch.
pub const SUPERVISOR_SEND_SIGNAL: &str = "supervisor.send";

#[derive(Debug)]
enum Control {
    Shutdown,
    Relaunch,
    Deliver(Value),
}

impl From<SupervisorMessage> for Control {
    fn from(message: SupervisorMessage) -> Self {
        match message {
            SupervisorMessage::Send(body) => Self::Deliver(body),
            SupervisorMessage::Shutdown => Self::Shutdown,
        }
    }
}

/// Asks a running [`KilnRuntime`] to stop.
///
/// Plugins reach it as the `runtime` service.
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl RuntimeHandle {
    /// Stops the runtime with exit code 0. Returns `false` if it already
    /// stopped.
    pub fn shutdown(&self) -> bool {
        self.tx.send(Control::Shutdown).is_ok()
    }

    /// Stops the runtime with [`RELAUNCH_CODE`].
    pub fn relaunch(&self) -> bool {
        self.tx.send(Control::Relaunch).is_ok()
    }
}

/// The Kiln runtime.
pub struct KilnRuntime {
    config: KilnConfig,
    host: Arc<BotHost>,
    orchestrator: ReloadOrchestrator,
    link: Option<Arc<WorkerLink>>,
    supervisor_input: Option<Box<dyn AsyncRead + Send + Unpin>>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl KilnRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a runtime from an already loaded configuration.
    ///
    /// Initialises logging, creates the plugin directory if it is missing
    /// and registers the manifest loader followed by the native loader.
    /// `config_file` is watched for changes when given.
    pub fn from_config(
        config: KilnConfig,
        config_file: Option<PathBuf>,
        transport: BoxedTransport,
    ) -> Self {
        Self::assemble(config, config_file, ConfigLoader::new(), transport)
    }

    fn assemble(
        config: KilnConfig,
        config_file: Option<PathBuf>,
        config_loader: ConfigLoader,
        transport: BoxedTransport,
    ) -> Self {
        logging::init_from_config(&config.logging);

        if let Err(e) = std::fs::create_dir_all(&config.plugin_dir) {
            warn!(
                path = %config.plugin_dir.display(),
                error = %e,
                "Failed to create plugin directory"
            );
        }

        let host = BotHost::new(transport);
        host.set_plugin_configs(config.plugins.clone());
        host.set_disabled_plugins(config.disabled_plugins.iter().cloned());

        host.add_loader(Arc::new(ManifestLoader::new(&config.plugin_dir)));
        let mut native = NativeLoader::new();
        if config.help {
            native = native.with(&HELP_PLUGIN);
        }
        host.add_loader(Arc::new(native));

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        host.provide(
            RUNTIME_SERVICE,
            Arc::new(RuntimeHandle {
                tx: control_tx.clone(),
            }),
        );
        host.provide(CONFIG_SERVICE, Arc::new(config.clone()));

        let mut orchestrator =
            ReloadOrchestrator::new(host.clone(), &config.plugin_dir, config.clone())
                .config_loader(config_loader);
        if let Some(path) = &config_file {
            orchestrator = orchestrator.config_file(path);
        }

        info!(
            bot_id = %host.bot_id(),
            plugin_dir = %config.plugin_dir.display(),
            config_file = ?config_file,
            log_level = %config.logging.level,
            "Runtime initialized from configuration"
        );

        Self {
            config,
            host,
            orchestrator,
            link: None,
            supervisor_input: None,
            control_tx,
            control_rx,
        }
    }

    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<BotHost> {
        &self.host
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// Talks to a supervisor over this process's stdin and stdout.
    pub fn attach_supervisor(self) -> Self {
        self.worker(WorkerLink::stdout(), tokio::io::stdin())
    }

    /// Runs as a worker: `link` reports to the supervisor and supervisor
    /// messages are read from `input`.
    pub fn worker(
        mut self,
        link: WorkerLink,
        input: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        let link = Arc::new(link);
        self.host.provide(WORKER_LINK_SERVICE, link.clone());
        self.link = Some(link);
        self.supervisor_input = Some(Box::new(input));
        self
    }

    /// Runs until Ctrl+C, SIGTERM, a shutdown request or the end of the
    /// transport. Returns the process exit code.
    pub async fn run(self) -> RuntimeResult<i32> {
        self.run_until(wait_for_signal()).await
    }

    /// Runs until `shutdown` completes or the runtime stops by itself.
    ///
    /// The exit code is [`RELAUNCH_CODE`] when a relaunch was requested,
    /// either through [`RuntimeHandle::relaunch`] or by a config change
    /// outside the `plugins` section, and 0 otherwise.
    pub async fn run_until<F>(mut self, shutdown: F) -> RuntimeResult<i32>
    where
        F: Future<Output = ()>,
    {
        let loaded = self.host.load_all().await;
        info!(plugins = ?loaded, "Plugins loaded");

        let (events, mut inbound) = event_channel();
        let transport = self.host.transport().clone();
        let transport_task = tokio::spawn(async move { transport.run(events).await });

        self.host.start().await;

        if let Some(link) = &self.link {
            link.started(self.config.auto_restart)?;
        }
        if let Some(input) = self.supervisor_input.take() {
            tokio::spawn(read_messages(BufReader::new(input), self.control_tx.clone()));
        }

        let (watch_tx, mut watch_rx) = mpsc::unbounded_channel();
        let mut watcher = if self.config.watch.enabled {
            let debounce = Duration::from_millis(self.config.watch.debounce_ms);
            let mut watcher = FileWatcher::new(debounce, watch_tx.clone())?;
            watcher.sync(&self.orchestrator.watch_set());
            info!(paths = watcher.watched().len(), "Watching for changes");
            Some(watcher)
        } else {
            None
        };

        tokio::pin!(shutdown);
        let code = loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.host.dispatch(event).await,
                    None => {
                        info!("Transport closed");
                        break 0;
                    }
                },
                Some(path) = watch_rx.recv() => {
                    match self.orchestrator.handle_change(&path).await {
                        ReloadOutcome::Config(ConfigAction::Relaunch) => break RELAUNCH_CODE,
                        ReloadOutcome::Ignored => {}
                        outcome => {
                            debug!(?outcome, "Reload handled");
                            if let Some(watcher) = watcher.as_mut() {
                                watcher.sync(&self.orchestrator.watch_set());
                            }
                        }
                    }
                }
                Some(control) = self.control_rx.recv() => match control {
                    Control::Shutdown => {
                        info!("Shutdown requested");
                        break 0;
                    }
                    Control::Relaunch => {
                        info!("Relaunch requested");
                        break RELAUNCH_CODE;
                    }
                    Control::Deliver(body) => {
                        self.host.in_turn(deliver(&self.host, body)).await
                    }
                },
                () = &mut shutdown => break 0,
            }
        };

        drop(watcher);
        self.host.shutdown().await;

        if transport_task.is_finished() {
            match transport_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Transport failed");
                    return Err(e.into());
                }
                Err(e) => error!(error = %e, "Transport task panicked"),
            }
        } else {
            transport_task.abort();
        }

        info!(code, "Runtime stopped");
        Ok(code)
    }
}

/// Hands a supervisor payload to the plugins. A payload of the form
/// `{"channel": "<kind>:<id>", "message": "..."}` is also sent as a message.
async fn deliver(host: &BotHost, body: Value) {
    let channel = body.get("channel").and_then(Value::as_str);
    let message = body.get("message").and_then(Value::as_str);
    if let (Some(channel), Some(message)) = (channel, message)
        && let Err(e) = host.send_msg(channel, message).await
    {
        warn!(channel, error = %e, "Failed to send queued message");
    }
    host.emit(Signal::with_payload(SUPERVISOR_SEND_SIGNAL, body))
        .await;
}

/// Waits for Ctrl+C or SIGTERM. A signal that cannot be listened for never
/// fires.
async fn wait_for_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, shutting down");
            }
            Err(e) => {
                error!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a [`KilnRuntime`] with custom configuration loading.
///
/// ```rust,ignore
/// let runtime = KilnRuntime::builder()
///     .config_file("bot/kiln.yaml")
///     .profile("production")
///     .build(transport)?;
/// ```
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
}

impl RuntimeBuilder {
    /// Searches the current directory, unless [`CONFIG_ENV`] names a file.
    pub fn new() -> Self {
        let config_loader = match std::env::var_os(CONFIG_ENV) {
            Some(path) => ConfigLoader::new().file(PathBuf::from(path)),
            None => ConfigLoader::new().with_current_dir(),
        };
        Self { config_loader }
    }

    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    pub fn merge(mut self, config: KilnConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Loads and validates the configuration, then builds the runtime.
    ///
    /// Later edits of the config file are re-read with the same loader.
    pub fn build(self, transport: BoxedTransport) -> RuntimeResult<KilnRuntime> {
        let config_file = self.config_loader.locate();
        let config = self.config_loader.clone().load()?;
        validate_config(&config)?;
        Ok(KilnRuntime::assemble(
            config,
            config_file,
            self.config_loader,
            transport,
        ))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use kiln_core::{ChannelId, MessageEvent};
    use kiln_framework::testing::RecordingTransport;
    use kiln_framework::{BoxError, PluginIdentity};
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::supervisor::WorkerMessage;

    fn setup(help: bool) -> (TempDir, KilnRuntime, Arc<RecordingTransport>) {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        fs::create_dir_all(&plugins).unwrap();
        fs::write(
            plugins.join("greet.toml"),
            "[[commands]]\nsignature = \"greet <name:string>\"\nreply = \"hi {name}\"\n",
        )
        .unwrap();

        let mut config = KilnConfig {
            plugin_dir: plugins,
            help,
            ..Default::default()
        };
        config.watch.enabled = false;

        let transport = RecordingTransport::new();
        let runtime = KilnRuntime::from_config(config, None, transport.clone() as BoxedTransport);
        (dir, runtime, transport)
    }

    async fn eventually(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_runs_plugins_until_shutdown() {
        let (_dir, runtime, transport) = setup(true);
        let host = runtime.host().clone();
        let handle = runtime.handle();
        let task = tokio::spawn(runtime.run_until(std::future::pending()));

        eventually(|| transport.push(MessageEvent::private("1", "greet Ann")).is_ok()).await;
        eventually(|| !transport.texts().is_empty()).await;
        assert_eq!(transport.texts(), vec!["hi Ann"]);
        assert_eq!(host.plugin_names(), vec!["greet", "help"]);

        assert!(handle.shutdown());
        assert_eq!(task.await.unwrap().unwrap(), 0);
        assert!(host.plugin_names().is_empty());
    }

    #[tokio::test]
    async fn test_help_is_optional() {
        let (_dir, runtime, _transport) = setup(false);
        assert_eq!(runtime.host().load_all().await, vec!["greet"]);

        let (_dir, runtime, _transport) = setup(true);
        assert_eq!(runtime.host().load_all().await, vec!["greet", "help"]);
    }

    #[tokio::test]
    async fn test_relaunch_request_sets_exit_code() {
        let (_dir, runtime, _transport) = setup(false);
        let handle = runtime
            .host()
            .service::<RuntimeHandle>(RUNTIME_SERVICE)
            .unwrap();
        assert!(handle.relaunch());

        let code = runtime.run_until(std::future::pending()).await.unwrap();
        assert_eq!(code, RELAUNCH_CODE);
    }

    #[tokio::test]
    async fn test_closed_transport_stops_runtime() {
        let (_dir, runtime, transport) = setup(false);
        transport.close();
        let code = runtime.run_until(std::future::pending()).await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_shutdown_future_stops_runtime() {
        let (_dir, runtime, _transport) = setup(false);
        let code = runtime.run_until(async {}).await.unwrap();
        assert_eq!(code, 0);
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_worker_delivers_queued_payload() {
        let (_dir, runtime, transport) = setup(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        runtime
            .host()
            .define(
                PluginIdentity::new("listener", "/virtual/listener.rs"),
                move |ctx| -> Result<(), BoxError> {
                    ctx.on(SUPERVISOR_SEND_SIGNAL, move |signal: Signal| {
                        let sink = sink.clone();
                        async move { sink.lock().push(signal.payload) }
                    });
                    Ok(())
                },
            )
            .await
            .unwrap();

        let out = SharedBuf::default();
        let input = tokio_test::io::Builder::new()
            .read(b"\x1ekiln {\"type\":\"send\",\"body\":{\"channel\":\"group:7\",\"message\":\"back\"}}\n")
            .read(b"\x1ekiln {\"type\":\"shutdown\"}\n")
            .build();
        let code = runtime
            .worker(WorkerLink::new(out.clone()), input)
            .run_until(std::future::pending())
            .await
            .unwrap();

        assert_eq!(code, 0);
        assert_eq!(
            transport.sent(),
            vec![(ChannelId::group("7"), "back".to_string())]
        );
        assert_eq!(
            *seen.lock(),
            vec![json!({ "channel": "group:7", "message": "back" })]
        );
        let reported = String::from_utf8(out.0.lock().clone()).unwrap();
        assert_eq!(
            WorkerMessage::decode_line(reported.trim_end()).unwrap().unwrap(),
            WorkerMessage::Start { auto_restart: false }
        );
    }
}
