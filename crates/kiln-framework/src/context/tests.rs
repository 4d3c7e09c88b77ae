use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::time::Duration;

use kiln_core::{ChannelId, ChannelKind, MessageEvent, Signal};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use super::*;
use crate::command::{OptionSettings, Shortcut};
use crate::testing::RecordingTransport;

fn host() -> (Arc<BotHost>, Arc<RecordingTransport>) {
    let transport = RecordingTransport::new();
    (BotHost::new(transport.clone()), transport)
}

fn identity(name: &str) -> PluginIdentity {
    PluginIdentity::new(name, format!("/bot/plugins/{name}.toml"))
}

fn counter_middleware(seen: &Arc<Mutex<Vec<String>>>) -> impl Middleware {
    let seen = seen.clone();
    move |event: Arc<MessageEvent>, next: Next| {
        let seen = seen.clone();
        async move {
            seen.lock().push(event.text.clone());
            next.run(event).await
        }
    }
}

#[tokio::test]
async fn test_greet_command_replies_on_origin_channel() {
    let (host, transport) = host();
    let ctx = host.create_context(identity("greeter")).unwrap();
    ctx.command("greet <name:string> [--loud]", None)
        .unwrap()
        .action(|argv: Argv| async move {
            let name = argv.arg_str(0).unwrap_or_default().to_string();
            if argv.flag("loud") {
                format!("HELLO {}!", name.to_uppercase())
            } else {
                format!("hello {name}")
            }
        });

    host.dispatch_message(MessageEvent::private("42", "greet Alice --loud"))
        .await;
    host.dispatch_message(MessageEvent::group("7", "42", "greet Bob"))
        .await;
    host.dispatch_message(MessageEvent::private("42", "greet")).await;

    assert_eq!(
        transport.sent(),
        vec![
            (ChannelId::private("42"), "HELLO ALICE!".to_string()),
            (ChannelId::group("7"), "hello Bob".to_string()),
            (
                ChannelId::private("42"),
                "argument name is required".to_string()
            ),
        ]
    );
}

#[tokio::test]
async fn test_reply_stops_chain_and_silence_continues_it() {
    let (host, transport) = host();
    let ctx = host.create_context(identity("chain")).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    ctx.command("ping", None)
        .unwrap()
        .action(|_argv: Argv| async { "pong" });
    ctx.command("mark", None)
        .unwrap()
        .action(|_argv: Argv| async { true });
    ctx.command("fail", None)
        .unwrap()
        .action(|_argv: Argv| async { Err::<(), _>("broken") });
    ctx.middleware(counter_middleware(&seen));

    for text in ["ping", "hello", "mark", "fail"] {
        host.dispatch_message(MessageEvent::private("1", text)).await;
    }

    assert_eq!(transport.texts(), vec!["pong"]);
    assert_eq!(*seen.lock(), vec!["hello", "mark", "fail"]);
}

#[tokio::test]
async fn test_trigger_restricts_routing() {
    let (host, transport) = host();
    let ctx = host.create_context(identity("admin")).unwrap();
    ctx.command("kick <who>", Some(ChannelKind::Group))
        .unwrap()
        .action(|argv: Argv| async move { format!("kicked {}", argv.arg_str(0).unwrap_or("?")) });

    host.dispatch_message(MessageEvent::private("1", "kick bob")).await;
    assert!(transport.sent().is_empty());

    host.dispatch_message(MessageEvent::group("9", "1", "kick bob")).await;
    assert_eq!(transport.texts(), vec!["kicked bob"]);
}

#[tokio::test]
async fn test_subcommands_by_path_and_by_name() {
    let (host, transport) = host();
    let ctx = host.create_context(identity("mod")).unwrap();

    let err = ctx.command("admin/ban <user>", None).unwrap_err();
    assert_eq!(err, DefinitionError::ParentNotFound("admin".into()));
    assert_eq!(err.to_string(), "cannot find parent command:admin");

    ctx.command("admin", None).unwrap().desc("administration");
    let ban = ctx.command("admin/ban <user>", None).unwrap();
    ban.action(|argv: Argv| async move { format!("banned {}", argv.arg_str(0).unwrap_or("?")) });
    assert_eq!(ban.parent().map(|p| p.name().to_string()).as_deref(), Some("admin"));
    assert_eq!(
        ctx.command("ban", None).unwrap_err(),
        DefinitionError::DuplicateCommand("ban".into())
    );

    host.dispatch_message(MessageEvent::private("1", "admin ban bob")).await;
    host.dispatch_message(MessageEvent::private("1", "ban carol")).await;
    assert_eq!(transport.texts(), vec!["banned bob", "banned carol"]);
}

#[tokio::test]
async fn test_shortcuts_route_messages() {
    let (host, transport) = host();
    let ctx = host.create_context(identity("daily")).unwrap();
    ctx.command("sign [who]", None)
        .unwrap()
        .option("mode", "-m <mode>", OptionSettings::default())
        .unwrap()
        .shortcut(
            Shortcut::regex(r"^(\S+)签到$")
                .unwrap()
                .arg("$1")
                .option("mode", "daily"),
        )
        .action(|argv: Argv| async move {
            format!(
                "{} signed ({})",
                argv.arg_str(0).unwrap_or("?"),
                argv.option("mode").and_then(|v| v.as_str()).unwrap_or("-")
            )
        });
    ctx.command("lookup [topic]", None)
        .unwrap()
        .shortcut(Shortcut::literal("查询").fuzzy())
        .action(|argv: Argv| async move { format!("topic={}", argv.arg_str(0).unwrap_or("none")) });

    host.dispatch_message(MessageEvent::private("1", "小明签到")).await;
    host.dispatch_message(MessageEvent::private("1", "查询 weather")).await;
    host.dispatch_message(MessageEvent::private("1", "查询")).await;

    assert_eq!(
        transport.texts(),
        vec!["小明 signed (daily)", "topic=weather", "topic=none"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_dispose_undoes_every_registration() {
    let (host, transport) = host();
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let ctx = host.create_context(identity("echo")).unwrap();

    ctx.middleware(counter_middleware(&seen));
    ctx.command("ping", None)
        .unwrap()
        .action(|_argv: Argv| async { "pong" });
    let counter = hits.clone();
    ctx.on("tick", move |_signal| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, SeqCst);
        }
    });
    let counter = hits.clone();
    ctx.set_interval(Duration::from_secs(1), move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, SeqCst);
        }
    });
    ctx.set_timeout(Duration::from_secs(5), || async {});

    // bootstrap, middleware, command, listener, interval, timeout
    assert_eq!(ctx.pending_disposers(), 6);
    ctx.dispose().await;

    assert!(ctx.is_disposed());
    assert_eq!(ctx.pending_disposers(), 0);
    assert!(ctx.commands().is_empty());
    assert!(host.plugin("echo").is_none());

    host.dispatch_message(MessageEvent::private("1", "ping")).await;
    host.emit(Signal::new("tick")).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(hits.load(SeqCst), 0);
    assert!(seen.lock().is_empty());
    assert!(transport.sent().is_empty());

    let again = host.create_context(identity("echo")).unwrap();
    assert!(!again.is_disposed());
    ctx.dispose().await;
    assert!(host.plugin("echo").is_some());
}

#[tokio::test]
async fn test_registration_after_dispose_is_undone_immediately() {
    let (host, _) = host();
    let ctx = host.create_context(identity("late")).unwrap();
    ctx.dispose().await;

    assert_eq!(
        ctx.command("ping", None).unwrap_err(),
        DefinitionError::Disposed("late".into())
    );
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    ctx.on_dispose(move || {
        counter.fetch_add(1, SeqCst);
    });
    assert_eq!(ran.load(SeqCst), 1);
    assert_eq!(ctx.pending_disposers(), 0);
}

#[tokio::test]
async fn test_dispose_drains_reentrant_additions_in_order() {
    let (host, _) = host();
    let ctx = host.create_context(identity("nested")).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let weak = Arc::downgrade(&ctx);
    let log = order.clone();
    ctx.on_dispose(move || {
        log.lock().push("outer");
        if let Some(ctx) = weak.upgrade() {
            let log = log.clone();
            ctx.on_dispose(move || log.lock().push("inner"));
        }
    });
    let log = order.clone();
    ctx.on_dispose(move || log.lock().push("second"));

    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    ctx.on(DISPOSE_SIGNAL, move |_signal| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, SeqCst);
        }
    });

    ctx.dispose().await;
    assert_eq!(*order.lock(), vec!["outer", "inner", "second"]);
    assert_eq!(notified.load(SeqCst), 1);
    assert_eq!(ctx.pending_disposers(), 0);
}

#[tokio::test]
async fn test_dispose_listener_redisposing_is_ignored() {
    let (host, _) = host();
    let ctx = host.create_context(identity("twice")).unwrap();
    let notified = Arc::new(AtomicUsize::new(0));
    let drained = Arc::new(AtomicUsize::new(0));

    let weak = Arc::downgrade(&ctx);
    let counter = notified.clone();
    ctx.on(DISPOSE_SIGNAL, move |_signal| {
        let weak = weak.clone();
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, SeqCst);
            if let Some(ctx) = weak.upgrade() {
                assert!(ctx.is_disposed());
                ctx.dispose().await;
            }
        }
    });
    let counter = drained.clone();
    ctx.on_dispose(move || {
        counter.fetch_add(1, SeqCst);
    });

    tokio::join!(ctx.dispose(), ctx.dispose());
    assert_eq!(notified.load(SeqCst), 1);
    assert_eq!(drained.load(SeqCst), 1);
    assert!(host.plugin("twice").is_none());
}

#[tokio::test]
async fn test_disposing_parent_command_removes_children() {
    let (host, _) = host();
    let ctx = host.create_context(identity("tree")).unwrap();
    let admin = ctx.command("admin", None).unwrap();
    ctx.command("admin/ban", None).unwrap();
    ctx.command("other", None).unwrap();

    ctx.remove_command(&admin);
    let names: Vec<String> = ctx.commands().iter().map(|c| c.name().to_string()).collect();
    assert_eq!(names, vec!["other"]);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fires_once_and_releases_its_disposer() {
    let (host, _) = host();
    let ctx = host.create_context(identity("timer")).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let before = ctx.pending_disposers();

    let counter = fired.clone();
    ctx.set_timeout(Duration::from_millis(50), move || async move {
        counter.fetch_add(1, SeqCst);
    });
    assert_eq!(ctx.pending_disposers(), before + 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fired.load(SeqCst), 1);
    assert_eq!(ctx.pending_disposers(), before);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_timeout_never_fires() {
    let (host, _) = host();
    let ctx = host.create_context(identity("timer")).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = fired.clone();
    let id = ctx.set_timeout(Duration::from_millis(50), move || async move {
        counter.fetch_add(1, SeqCst);
    });
    assert!(ctx.cancel(id));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(fired.load(SeqCst), 0);
    assert!(!ctx.cancel(id));
}

#[tokio::test(start_paused = true)]
async fn test_interval_repeats_until_disposed() {
    let (host, _) = host();
    let ctx = host.create_context(identity("ticker")).unwrap();
    let ticks = Arc::new(AtomicUsize::new(0));

    let counter = ticks.clone();
    ctx.set_interval(Duration::from_millis(10), move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, SeqCst);
        }
    });
    tokio::time::sleep(Duration::from_millis(35)).await;
    assert_eq!(ticks.load(SeqCst), 3);

    ctx.dispose().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ticks.load(SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_timer_waits_for_running_dispatch() {
    let (host, _) = host();
    let ctx = host.create_context(identity("slow")).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let log = order.clone();
    ctx.command("slow", None)
        .unwrap()
        .action(move |_argv: Argv| {
            let log = log.clone();
            async move {
                log.lock().push("action start");
                tokio::time::sleep(Duration::from_millis(100)).await;
                log.lock().push("action end");
            }
        });
    let log = order.clone();
    ctx.set_timeout(Duration::from_millis(10), move || async move {
        log.lock().push("timer");
    });

    host.dispatch_message(MessageEvent::private("1", "slow")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*order.lock(), vec!["action start", "action end", "timer"]);
}

#[tokio::test]
async fn test_nested_emit_inside_a_turn() {
    let (host, _) = host();
    let ctx = host.create_context(identity("relay")).unwrap();
    let relayed = Arc::new(AtomicUsize::new(0));

    let weak = Arc::downgrade(&host);
    ctx.on("first", move |_signal| {
        let weak = weak.clone();
        async move {
            if let Some(host) = weak.upgrade() {
                host.emit(Signal::new("second")).await;
            }
        }
    });
    let counter = relayed.clone();
    ctx.on("second", move |_signal| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, SeqCst);
        }
    });

    host.emit(Signal::new("first")).await;
    assert_eq!(relayed.load(SeqCst), 1);
}

#[tokio::test]
async fn test_disabled_context_is_skipped() {
    let (host, transport) = host();
    let ctx = host.create_context(identity("quiet")).unwrap();
    ctx.command("ping", None)
        .unwrap()
        .action(|_argv: Argv| async { "pong" });

    ctx.disable();
    host.dispatch_message(MessageEvent::private("1", "ping")).await;
    assert!(transport.sent().is_empty());
    assert!(host.command_list().is_empty());

    ctx.enable();
    host.dispatch_message(MessageEvent::private("1", "ping")).await;
    assert_eq!(transport.texts(), vec!["pong"]);
    assert_eq!(ctx.command_list().len(), 1);
}

#[derive(Debug, Deserialize)]
struct GreetConfig {
    #[serde(default = "default_greeting")]
    greeting: String,
}

fn default_greeting() -> String {
    "hello".to_string()
}

#[tokio::test]
async fn test_config_section() {
    let (host, _) = host();
    let configs = json!({ "greeter": { "greeting": "hey" } });
    host.set_plugin_configs(configs.as_object().cloned().unwrap());

    let greeter = host.create_context(identity("greeter")).unwrap();
    let other = host.create_context(identity("other")).unwrap();
    assert_eq!(greeter.config::<GreetConfig>().unwrap().greeting, "hey");
    assert_eq!(other.config::<GreetConfig>().unwrap().greeting, "hello");
}

#[tokio::test]
async fn test_send_msg_routes_by_kind() {
    let (host, transport) = host();
    let ctx = host.create_context(identity("notify")).unwrap();

    ctx.send_msg("group:123", "hi all").await.unwrap();
    ctx.send_msg("private:9", "hi you").await.unwrap();
    assert!(matches!(
        ctx.send_msg("channel:1", "nope").await,
        Err(ApiError::UnknownChannelKind(_))
    ));

    assert_eq!(
        transport.sent(),
        vec![
            (ChannelId::group("123"), "hi all".to_string()),
            (ChannelId::private("9"), "hi you".to_string()),
        ]
    );
}
