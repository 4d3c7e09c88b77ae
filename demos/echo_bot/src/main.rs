//! Echo Bot Example
//!
//! A console bot showing the Kiln runtime end to end: manifest plugins from
//! `plugins/`, the native `echo` plugin, the built-in `help` plugin, hot
//! reload and the supervisor/worker pair.
//!
//! # Usage
//!
//! ```bash
//! cd demos/echo_bot
//! cargo run -p echo-bot -- supervise
//! nc 127.0.0.1 7878
//! ```
//!
//! Then type `help`, `echo -u hi`, `greet kiln` or `[group:100] ping` into
//! the `nc` session. Editing `plugins/greet.toml` reloads that plugin, and
//! `restart` (from an admin) relaunches the worker process.

mod echo;
mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kiln::prelude::*;
use kiln::runtime::supervisor::{BOT_ID_ENV, CONFIG_ENV};

use crate::transport::LineTransport;

#[derive(Debug, Parser)]
#[command(name = "echo-bot", version, about = "A console echo bot built on Kiln")]
struct Cli {
    /// Config file. Searched for in the working directory when omitted.
    #[arg(short, long, env = CONFIG_ENV, global = true)]
    config: Option<PathBuf>,

    /// Account id the bot runs as.
    #[arg(long, env = BOT_ID_ENV, default_value = "10000", global = true)]
    bot_id: String,

    /// Address the console transport listens on.
    #[arg(long, default_value = "127.0.0.1:7878", global = true)]
    listen: SocketAddr,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Debug, Clone, Copy, Default, Subcommand)]
enum Mode {
    /// Run the bot in this process.
    #[default]
    Run,
    /// Run the bot in a worker process and relaunch it on request.
    Supervise,
    /// Worker side of `supervise`. Not meant to be started by hand.
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let code = match cli.mode.unwrap_or_default() {
        Mode::Run => run_bot(&cli, false).await?,
        Mode::Worker => run_bot(&cli, true).await?,
        Mode::Supervise => {
            let mut supervisor = Supervisor::current_exe(cli.bot_id.clone())?
                .arg("--listen")
                .arg(cli.listen.to_string())
                .arg("worker");
            if let Some(config) = &cli.config {
                supervisor = supervisor.config(config);
            }
            supervisor.run().await?
        }
    };

    std::process::exit(code);
}

async fn run_bot(cli: &Cli, worker: bool) -> Result<i32> {
    let transport = Arc::new(LineTransport::new(cli.bot_id.clone(), cli.listen));

    let mut builder = KilnRuntime::builder();
    if let Some(config) = &cli.config {
        builder = builder.config_file(config);
    }
    let mut runtime = builder.build(transport)?;
    if worker {
        runtime = runtime.attach_supervisor();
    }

    Ok(runtime.run().await?)
}
