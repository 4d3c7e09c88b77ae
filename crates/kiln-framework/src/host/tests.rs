use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

use async_trait::async_trait;
use kiln_core::{MessageEvent, Signal};
use parking_lot::Mutex;

use super::*;
use crate::argv::Argv;
use crate::testing::RecordingTransport;

type Setup = Arc<dyn Fn(&Arc<PluginContext>) -> Result<(), BoxError> + Send + Sync>;

/// Loader over a fixed table of in-memory plugins.
#[derive(Default)]
struct TableLoader {
    entries: Mutex<Vec<(String, PathBuf, Setup)>>,
    loads: AtomicUsize,
}

impl TableLoader {
    fn with(
        self,
        name: &str,
        setup: impl Fn(&Arc<PluginContext>) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.entries.lock().push((
            name.to_string(),
            PathBuf::from(format!("/bot/plugins/{name}.toml")),
            Arc::new(setup),
        ));
        self
    }
}

#[async_trait]
impl PluginLoader for TableLoader {
    fn kind(&self) -> &'static str {
        "table"
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.entries
            .lock()
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, path, _)| path.clone())
    }

    fn discover(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(n, _, _)| n.clone()).collect()
    }

    async fn load(
        &self,
        host: &Arc<BotHost>,
        name: &str,
        entry: &Path,
    ) -> LoadResult<Arc<PluginContext>> {
        let setup = self
            .entries
            .lock()
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, setup)| setup.clone())
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;
        self.loads.fetch_add(1, SeqCst);
        host.define(PluginIdentity::new(name, entry), move |ctx| setup(ctx))
            .await
    }
}

fn ping(ctx: &Arc<PluginContext>) -> Result<(), BoxError> {
    ctx.command("ping", None)?
        .action(|_argv: Argv| async { "pong" });
    Ok(())
}

fn host_with(loader: TableLoader) -> (Arc<BotHost>, Arc<RecordingTransport>, Arc<TableLoader>) {
    let transport = RecordingTransport::new();
    let host = BotHost::new(transport.clone());
    let loader = Arc::new(loader);
    host.add_loader(loader.clone());
    (host, transport, loader)
}

#[tokio::test]
async fn test_unknown_plugin_is_not_found() {
    let (host, _, _) = host_with(TableLoader::default());
    let err = host.load_plugin("ghost").await.unwrap_err();
    assert!(matches!(err, LoadError::NotFound(name) if name == "ghost"));
}

#[tokio::test]
async fn test_duplicate_plugin_name() {
    let (host, _, _) = host_with(TableLoader::default());
    host.create_context(PluginIdentity::new("dup", "/a.toml"))
        .unwrap();
    let err = host
        .create_context(PluginIdentity::new("dup", "/b.toml"))
        .unwrap_err();
    assert_eq!(err, DefinitionError::DuplicatePlugin("dup".into()));
}

#[tokio::test]
async fn test_failed_setup_leaves_nothing_behind() {
    let loader = TableLoader::default().with("broken", |ctx| {
        ctx.command("twice", None)?;
        ctx.command("twice", None)?;
        Ok(())
    });
    let (host, _, _) = host_with(loader);

    let err = host.load_plugin("broken").await.unwrap_err();
    assert!(matches!(
        err,
        LoadError::Definition(DefinitionError::DuplicateCommand(ref name)) if name == "twice"
    ));
    assert!(host.plugin("broken").is_none());
    assert!(host.command_list().is_empty());
}

#[tokio::test]
async fn test_setup_error_is_wrapped() {
    let loader = TableLoader::default().with("sad", |_ctx| Err("no database".into()));
    let (host, _, _) = host_with(loader);
    let err = host.load_plugin("sad").await.unwrap_err();
    assert!(matches!(err, LoadError::Setup { ref plugin, .. } if plugin == "sad"));
}

#[tokio::test]
async fn test_lifecycle_signals() {
    let starts = Arc::new(AtomicUsize::new(0));
    let counter = starts.clone();
    let loader = TableLoader::default().with("late", move |ctx| {
        for signal in [BOT_START, BOT_READY] {
            let counter = counter.clone();
            ctx.on(signal, move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, SeqCst);
                }
            });
        }
        Ok(())
    });
    let (host, _, _) = host_with(loader);

    let mounted = Arc::new(Mutex::new(Vec::new()));
    let watcher = host
        .create_context(PluginIdentity::new("watcher", "/watcher.toml"))
        .unwrap();
    let log = mounted.clone();
    watcher.on("plugin.late.mounted", move |signal: Signal| {
        let log = log.clone();
        async move {
            log.lock().push(signal.name);
        }
    });

    host.start().await;
    assert!(host.is_started() && host.is_ready());

    host.load_plugin("late").await.unwrap();
    assert_eq!(*mounted.lock(), vec!["plugin.late.mounted"]);
    assert_eq!(starts.load(SeqCst), 2);
}

#[tokio::test]
async fn test_restart_replaces_context() {
    let (host, transport, loader) = host_with(TableLoader::default().with("ping", ping));
    let main = PathBuf::from("/bot/plugins/ping.toml");
    let helper = PathBuf::from("/bot/plugins/shared/words.toml");
    host.modules().record(&main, &helper);

    let first = host.load_plugin("ping").await.unwrap();
    assert_eq!(first.dependencies(), &[helper.clone()]);
    assert_eq!(host.dependents_of(&helper).len(), 1);
    assert!(host.plugin_by_main_file(&main).is_some());
    assert!(host.watch_set().contains(&helper));

    let second = host.restart_plugin("ping", &helper).await.unwrap();
    assert!(first.is_disposed());
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(loader.loads.load(SeqCst), 2);
    assert!(!host.modules().contains(&helper));
    assert_eq!(host.plugin_names(), vec!["ping"]);

    host.dispatch_message(MessageEvent::private("1", "ping")).await;
    assert_eq!(transport.texts(), vec!["pong"]);
}

#[tokio::test]
async fn test_dependencies_stop_at_other_plugins() {
    let (host, _, _) = host_with(TableLoader::default());
    let a = PathBuf::from("/p/a.toml");
    let b = PathBuf::from("/p/b.toml");
    let shared = PathBuf::from("/p/lib/shared.toml");
    host.modules().record(&a, &b);
    host.modules().record(&b, &shared);
    host.modules().record(&a, &shared);

    host.create_context(PluginIdentity::from_path(&b)).unwrap();
    let ctx_a = host.create_context(PluginIdentity::from_path(&a)).unwrap();
    assert_eq!(ctx_a.dependencies(), &[shared.clone()]);
    assert_eq!(host.dependents_of(&shared).len(), 2);
}

#[tokio::test]
async fn test_load_all_skips_failures() {
    let loader = TableLoader::default()
        .with("ping", ping)
        .with("sad", |_ctx| Err("nope".into()))
        .with("quiet", |_ctx| Ok(()));
    let (host, _, _) = host_with(loader);
    host.set_disabled_plugins(["quiet".to_string()]);

    let loaded = host.load_all().await;
    assert_eq!(loaded, vec!["ping", "quiet"]);
    assert!(host.plugin("quiet").unwrap().is_disabled());
    assert!(host.load_all().await.is_empty());
}

#[tokio::test]
async fn test_contexts_dispatch_in_insertion_order() {
    let (host, _, _) = host_with(TableLoader::default());
    let order = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second", "third"] {
        let ctx = host
            .create_context(PluginIdentity::new(name, format!("/{name}.toml")))
            .unwrap();
        let order = order.clone();
        ctx.middleware(move |event: Arc<MessageEvent>, next: crate::middleware::Next| {
            let order = order.clone();
            async move {
                order.lock().push(name);
                next.run(event).await
            }
        });
    }
    host.dispatch(InboundEvent::Message(MessageEvent::private("1", "hi")))
        .await;
    assert_eq!(*order.lock(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_services() {
    struct Counter(AtomicUsize);

    let (host, _, _) = host_with(TableLoader::default());
    host.provide("counter", Arc::new(Counter(AtomicUsize::new(3))));
    let ctx = host
        .create_context(PluginIdentity::new("user", "/user.toml"))
        .unwrap();

    let counter = ctx.service::<Counter>("counter").unwrap();
    assert_eq!(counter.0.load(SeqCst), 3);
    assert!(ctx.service::<String>("counter").is_none());
    assert!(host.remove_service("counter"));
    assert!(ctx.service::<Counter>("counter").is_none());
}

#[tokio::test]
async fn test_shutdown_disposes_everything() {
    let (host, _, _) = host_with(TableLoader::default().with("ping", ping));
    let ctx = host.load_plugin("ping").await.unwrap();
    host.shutdown().await;
    assert!(ctx.is_disposed());
    assert!(host.plugins().is_empty());
}
