//! Supervisor and worker processes.
//!
//! A [`Supervisor`] runs the bot as a child process (the worker) and keeps it
//! running: a worker that exits with [`RELAUNCH_CODE`] is spawned again, and
//! one that announced `auto_restart` is spawned again whatever its code.
//!
//! The two processes talk over the worker's standard streams. Protocol lines
//! start with [`PROTOCOL_PREFIX`] followed by one JSON object; any other line
//! the worker prints is passed through to the supervisor's stdout.
//!
//! ```text
//! worker → supervisor   {"type":"start","body":{"auto_restart":false}}
//!                       {"type":"queue","body":<payload>}
//! supervisor → worker   {"type":"send","body":<payload>}
//!                       {"type":"shutdown"}
//! ```
//!
//! A queued payload survives the relaunch: the supervisor keeps it and hands
//! it to the next worker as soon as that worker reports `start`.

use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::{RuntimeError, RuntimeResult};

/// Exit code a worker uses to ask for a relaunch.
pub const RELAUNCH_CODE: i32 = 51;

/// Environment variable carrying the bot account id into the worker.
pub const BOT_ID_ENV: &str = "KILN_BOT_ID";

/// Environment variable carrying the config file path into the worker.
pub const CONFIG_ENV: &str = "KILN_CONFIG";

/// Marks a protocol line. The record separator keeps ordinary output from
/// being mistaken for a message.
pub const PROTOCOL_PREFIX: &str = "\x1ekiln ";

/// Service key under which a worker's [`WorkerLink`] is provided.
pub const WORKER_LINK_SERVICE: &str = "supervisor";

/// Messages a worker sends to its supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The worker is up. With `auto_restart` it is relaunched on any exit.
    Start { auto_restart: bool },
    /// Keep this payload and hand it to the next worker that starts.
    Queue(Value),
}

/// Messages a supervisor sends to its worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum SupervisorMessage {
    /// A payload queued by an earlier worker.
    Send(Value),
    /// The supervisor was interrupted; the worker should shut down.
    Shutdown,
}

impl WorkerMessage {
    pub fn encode(&self) -> serde_json::Result<String> {
        encode(self)
    }

    /// `None` if `line` is not a protocol line.
    pub fn decode_line(line: &str) -> Option<serde_json::Result<Self>> {
        decode(line)
    }
}

impl SupervisorMessage {
    pub fn encode(&self) -> serde_json::Result<String> {
        encode(self)
    }

    /// `None` if `line` is not a protocol line.
    pub fn decode_line(line: &str) -> Option<serde_json::Result<Self>> {
        decode(line)
    }
}

fn encode<T: Serialize>(message: &T) -> serde_json::Result<String> {
    Ok(format!("{PROTOCOL_PREFIX}{}\n", serde_json::to_string(message)?))
}

fn decode<T: DeserializeOwned>(line: &str) -> Option<serde_json::Result<T>> {
    line.trim_end_matches('\r')
        .strip_prefix(PROTOCOL_PREFIX)
        .map(serde_json::from_str)
}

// =============================================================================
// Supervisor side
// =============================================================================

/// How one worker run ended.
#[derive(Debug, Clone, Copy)]
struct WorkerExit {
    code: i32,
    auto_restart: bool,
    interrupted: bool,
}

/// Spawns the worker and relaunches it when asked to.
///
/// ```rust,ignore
/// let code = Supervisor::current_exe("10001")?
///     .arg("worker")
///     .config("bot/kiln.yaml")
///     .run()
///     .await?;
/// std::process::exit(code);
/// ```
#[derive(Debug)]
pub struct Supervisor {
    program: PathBuf,
    args: Vec<OsString>,
    bot_id: String,
    config: Option<PathBuf>,
    queued: Option<Value>,
}

impl Supervisor {
    pub fn new(program: impl Into<PathBuf>, bot_id: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            bot_id: bot_id.into(),
            config: None,
            queued: None,
        }
    }

    /// Supervises another instance of the running executable.
    pub fn current_exe(bot_id: impl Into<String>) -> RuntimeResult<Self> {
        Ok(Self::new(std::env::current_exe()?, bot_id))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Config file passed to the worker through [`CONFIG_ENV`].
    pub fn config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = Some(path.into());
        self
    }

    /// Queues a payload for the next worker that starts.
    pub fn queue(&mut self, body: Value) {
        self.queued = Some(body);
    }

    pub fn queued(&self) -> Option<&Value> {
        self.queued.as_ref()
    }

    /// Runs workers until one exits without asking for a relaunch, and
    /// returns that worker's exit code.
    pub async fn run(&mut self) -> RuntimeResult<i32> {
        loop {
            let exit = self.run_worker().await?;
            if exit.interrupted {
                info!(code = exit.code, "Worker stopped after interrupt");
                return Ok(exit.code);
            }
            if exit.code == RELAUNCH_CODE || exit.auto_restart {
                info!(code = exit.code, "Relaunching worker");
                continue;
            }
            info!(code = exit.code, "Worker exited");
            return Ok(exit.code);
        }
    }

    async fn run_worker(&mut self) -> RuntimeResult<WorkerExit> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(BOT_ID_ENV, &self.bot_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        if let Some(config) = &self.config {
            command.env(CONFIG_ENV, config);
        }

        let mut child = command.spawn().map_err(|source| RuntimeError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        info!(program = %self.program.display(), pid = ?child.id(), "Worker spawned");

        let mut stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Protocol("worker stdout is not piped".into()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut out = tokio::io::stdout();

        let mut auto_restart = false;
        let mut interrupted = false;
        let ctrl_c = signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let status = loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => {
                        self.handle_line(&line, &mut stdin, &mut auto_restart, &mut out)
                            .await?;
                    }
                    None => break child.wait().await?,
                },
                status = child.wait() => break status?,
                result = &mut ctrl_c, if !interrupted => {
                    interrupted = true;
                    if let Err(e) = result {
                        warn!(error = %e, "Failed to listen for interrupt");
                        continue;
                    }
                    info!("Interrupted, asking worker to shut down");
                    if !send(&mut stdin, &SupervisorMessage::Shutdown).await {
                        child.start_kill()?;
                    }
                }
            }
        };

        // Output written right before exiting.
        while let Some(line) = lines.next_line().await? {
            self.handle_line(&line, &mut stdin, &mut auto_restart, &mut out)
                .await?;
        }

        Ok(WorkerExit {
            code: status.code().unwrap_or(1),
            auto_restart,
            interrupted,
        })
    }

    async fn handle_line(
        &mut self,
        line: &str,
        stdin: &mut Option<ChildStdin>,
        auto_restart: &mut bool,
        out: &mut tokio::io::Stdout,
    ) -> RuntimeResult<()> {
        match WorkerMessage::decode_line(line) {
            Some(Ok(WorkerMessage::Start { auto_restart: enabled })) => {
                debug!(auto_restart = enabled, "Worker started");
                *auto_restart = enabled;
                if let Some(body) = self.queued.take() {
                    send(stdin, &SupervisorMessage::Send(body)).await;
                }
            }
            Some(Ok(WorkerMessage::Queue(body))) => {
                debug!("Worker queued a payload");
                self.queued = Some(body);
            }
            Some(Err(e)) => warn!(error = %e, "Malformed worker message"),
            None => {
                out.write_all(line.as_bytes()).await?;
                out.write_all(b"\n").await?;
                out.flush().await?;
            }
        }
        Ok(())
    }
}

/// Writes `message` to the worker. A worker that stopped reading is
/// forgotten; returns whether the message was written.
async fn send(stdin: &mut Option<ChildStdin>, message: &SupervisorMessage) -> bool {
    let Some(pipe) = stdin.as_mut() else {
        return false;
    };
    let line = match message.encode() {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "Failed to encode supervisor message");
            return false;
        }
    };
    let written = async {
        pipe.write_all(line.as_bytes()).await?;
        pipe.flush().await
    }
    .await;
    if let Err(e) = written {
        debug!(error = %e, "Worker stdin closed");
        stdin.take();
        return false;
    }
    true
}

// =============================================================================
// Worker side
// =============================================================================

/// Whether this process was spawned by a [`Supervisor`].
pub fn is_worker() -> bool {
    std::env::var_os(BOT_ID_ENV).is_some()
}

/// The worker's end of the protocol.
///
/// The runtime provides it to plugins under [`WORKER_LINK_SERVICE`], so a
/// plugin can queue a payload before asking for a relaunch.
pub struct WorkerLink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for WorkerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLink").finish_non_exhaustive()
    }
}

impl WorkerLink {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    /// A link over this process's stdout.
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn started(&self, auto_restart: bool) -> RuntimeResult<()> {
        self.send(&WorkerMessage::Start { auto_restart })
    }

    pub fn queue(&self, body: Value) -> RuntimeResult<()> {
        self.send(&WorkerMessage::Queue(body))
    }

    fn send(&self, message: &WorkerMessage) -> RuntimeResult<()> {
        let line = message.encode()?;
        let mut out = self.out.lock();
        out.write_all(line.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

/// Reads supervisor messages from `reader` until it closes, forwarding each
/// one to `tx`. Lines that are not protocol lines are skipped.
pub async fn read_messages<R, T>(reader: R, tx: mpsc::UnboundedSender<T>)
where
    R: AsyncBufRead + Unpin,
    T: From<SupervisorMessage>,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match SupervisorMessage::decode_line(&line) {
                Some(Ok(message)) => {
                    if tx.send(message.into()).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => warn!(error = %e, "Malformed supervisor message"),
                None => trace!(line = %line, "Ignoring input"),
            },
            Ok(None) => {
                debug!("Supervisor closed the pipe");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read from supervisor");
                break;
            }
        }
    }
}
