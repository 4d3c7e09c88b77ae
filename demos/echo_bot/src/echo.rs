//! The echo plugin: a small native plugin showing commands, options,
//! middleware, config sections and the relaunch handshake.

use kiln::framework::BOT_READY;
use kiln::prelude::*;
use kiln::runtime::{CONFIG_SERVICE, KilnConfig, RUNTIME_SERVICE, WORKER_LINK_SERVICE};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// `plugins.echo` section of the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct EchoConfig {
    /// Prepended to every echoed message.
    prefix: String,
    /// Sent to the channel that asked for a restart once the bot is back.
    back_message: Option<String>,
}

define_plugin! {
    pub static ECHO = {
        name: "echo",
        setup: setup,
    };
}

fn setup(ctx: &Arc<PluginContext>) -> Result<(), BoxError> {
    let config: EchoConfig = ctx.config()?;

    ctx.middleware(|event: Arc<MessageEvent>, next: Next| async move {
        info!(
            channel = %event.channel,
            sender = %event.sender_id,
            text = %event.text,
            "Message received"
        );
        next.run(event).await
    });

    ctx.on(BOT_READY, |_signal: Signal| async {
        info!("Echo plugin ready");
    });

    let prefix = config.prefix.clone();
    ctx.command("echo <text:text>", None)?
        .desc("repeat the text")
        .example("echo -u hello")
        .option("upper", "-u send it in upper case", OptionSettings::default())?
        .action(move |argv: Argv| {
            let prefix = prefix.clone();
            async move {
                let text = argv.arg_str(0)?;
                let text = if argv.flag("upper") {
                    text.to_uppercase()
                } else {
                    text.to_string()
                };
                Some(format!("{prefix}{text}"))
            }
        });

    ctx.command("ping", None)?
        .desc("check the bot is alive")
        .shortcut(Shortcut::regex(r"^(?i)are you there\??$")?)
        .action(|_argv: Argv| async { "pong" });

    let this = Arc::downgrade(ctx);
    let back_message = config.back_message.unwrap_or_else(|| "I'm back.".to_string());
    ctx.command("restart", None)?
        .desc("relaunch the bot process")
        .check({
            let this = this.clone();
            move |argv: Argv| {
                let this = this.clone();
                async move {
                    let config = this.upgrade()?.service::<KilnConfig>(CONFIG_SERVICE)?;
                    (!config.is_admin(&argv.event.sender_id)).then_some("only admins can do that")
                }
            }
        })
        .action(move |argv: Argv| {
            let this = this.clone();
            let back_message = back_message.clone();
            async move {
                let Some(ctx) = this.upgrade() else {
                    return Ok::<_, BoxError>(None);
                };
                let (Some(link), Some(runtime)) = (
                    ctx.service::<WorkerLink>(WORKER_LINK_SERVICE),
                    ctx.service::<RuntimeHandle>(RUNTIME_SERVICE),
                ) else {
                    return Ok(Some("not running under a supervisor"));
                };
                link.queue(json!({
                    "channel": argv.event.channel.to_string(),
                    "message": back_message,
                }))?;
                runtime.relaunch();
                Ok::<_, BoxError>(Some("restarting"))
            }
        });

    Ok(())
}
