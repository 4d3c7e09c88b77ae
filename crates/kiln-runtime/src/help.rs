//! The built-in `help` plugin, loaded when `help: true` is configured.
//!
//! `help` lists every top-level command in one line each; `help <command>`
//! prints that command's full help. `-H` includes hidden options and `-A`
//! shows which channel kind each command is restricted to.

use std::sync::Arc;

use kiln_framework::{
    Argv, BoxError, HelpOptions, OptionSettings, PluginContext, PluginDescriptor, Shortcut,
};

const FOOTER: &str = "Reply \"help <command>\" to see that command's help.";

/// Descriptor of the help plugin. It is not in the link-time registry; the
/// runtime adds it to its native loader when help is enabled.
pub static HELP_PLUGIN: PluginDescriptor = PluginDescriptor {
    name: "help",
    main_file: file!(),
    imports: &[],
    setup,
};

fn setup(ctx: &Arc<PluginContext>) -> Result<(), BoxError> {
    let this = Arc::downgrade(ctx);
    ctx.command("help [command:string]", None)?
        .desc("show help for commands")
        .shortcut(Shortcut::literal("help").fuzzy())
        .option("show_hidden", "-H show hidden options", OptionSettings::default())?
        .option("show_auth", "-A show trigger restrictions", OptionSettings::default())?
        .action(move |argv: Argv| {
            let this = this.clone();
            async move { this.upgrade().and_then(|ctx| render(&ctx, &argv)) }
        });
    Ok(())
}

/// `None` when the target is unknown or not usable on the message's
/// channel, so the message continues down the chain unanswered.
fn render(ctx: &PluginContext, argv: &Argv) -> Option<String> {
    let mut options = HelpOptions {
        show_hidden: argv.flag("show_hidden"),
        show_auth: argv.flag("show_auth"),
        ..HelpOptions::default()
    };
    let commands = ctx.command_list();

    let mut output = match argv.arg_str(0) {
        None => {
            options.simple = true;
            options.depth = 0;
            commands
                .iter()
                .filter(|command| command.parent().is_none())
                .flat_map(|command| command.help(&options))
                .collect::<Vec<_>>()
        }
        Some(target) => {
            let command = commands.iter().find(|command| command.accepts(target))?;
            if !command.matches(&argv.event) {
                return None;
            }
            command.help(&options)
        }
    };
    output.push(FOOTER.to_string());
    Some(output.join("\n"))
}

#[cfg(test)]
mod tests {
    use kiln_core::{BoxedTransport, ChannelKind, MessageEvent};
    use kiln_framework::testing::RecordingTransport;
    use kiln_framework::{BotHost, PluginIdentity};

    use super::*;
    use crate::loader::NativeLoader;

    async fn host() -> (Arc<BotHost>, Arc<RecordingTransport>) {
        let transport = RecordingTransport::new();
        let host = BotHost::new(transport.clone() as BoxedTransport);
        host.add_loader(Arc::new(NativeLoader::new().with(&HELP_PLUGIN)));
        host.load_plugin("help").await.unwrap();
        host.define(
            PluginIdentity::new("tools", "/virtual/tools.rs"),
            |ctx| -> Result<(), BoxError> {
                ctx.command("greet <name:string>", None)?
                    .desc("say hello")
                    .option("shout", "-s shout it", OptionSettings::default())?
                    .option("secret", "-x", OptionSettings::default().hidden())?;
                ctx.command("admin", Some(ChannelKind::Group))?
                    .desc("group admin");
                ctx.command("admin/ban <user:string>", None)?
                    .desc("ban a user");
                Ok(())
            },
        )
        .await
        .unwrap();
        (host, transport)
    }

    async fn ask(host: &BotHost, transport: &RecordingTransport, event: MessageEvent) -> Vec<String> {
        transport.clear();
        host.dispatch_message(event).await;
        transport.texts()
    }

    #[tokio::test]
    async fn test_lists_top_level_commands() {
        let (host, transport) = host().await;
        let texts = ask(&host, &transport, MessageEvent::private("1", "help")).await;
        assert_eq!(
            texts,
            vec![
                [
                    "help [command:string] show help for commands",
                    "greet <name:string> say hello",
                    "admin group admin",
                    FOOTER,
                ]
                .join("\n")
            ]
        );
    }

    #[tokio::test]
    async fn test_command_help_hides_hidden_options() {
        let (host, transport) = host().await;

        let texts = ask(&host, &transport, MessageEvent::private("1", "help greet")).await;
        let lines: Vec<&str> = texts[0].lines().collect();
        assert_eq!(lines[0], "greet <name:string> say hello");
        assert!(lines.iter().any(|line| line.contains("-s") && line.ends_with("shout it")));
        assert!(!texts[0].contains("-x"));
        assert_eq!(lines.last(), Some(&FOOTER));

        let texts = ask(&host, &transport, MessageEvent::private("1", "help greet -H")).await;
        assert!(texts[0].contains("-x"));
    }

    #[tokio::test]
    async fn test_restricted_command_needs_matching_channel() {
        let (host, transport) = host().await;

        let texts = ask(&host, &transport, MessageEvent::private("1", "help admin")).await;
        assert!(texts.is_empty());

        let texts = ask(
            &host,
            &transport,
            MessageEvent::group("100", "1", "help admin -A"),
        )
        .await;
        assert!(texts[0].contains(" trigger:group"));
        assert!(texts[0].contains("  ban <user:string> ban a user"));
    }

    #[tokio::test]
    async fn test_unknown_command_gets_no_reply() {
        let (host, transport) = host().await;
        let texts = ask(&host, &transport, MessageEvent::private("1", "help nothing")).await;
        assert!(texts.is_empty());
    }
}
