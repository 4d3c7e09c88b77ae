//! A line-based TCP transport for trying the bot with `nc`.
//!
//! Every connected client is a console. A line is a message:
//!
//! ```text
//! ping                      private message from user "console"
//! [group:100] ping          group 100, sender "console"
//! [private:42] ping         private message from user 42
//! ```
//!
//! Everything the bot sends is written to all clients as
//! `<kind>:<id> <text>`, one line per message line.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use kiln::core::{
    ApiResult, ChannelId, ChannelKind, EventSender, InboundEvent, MessageEvent, Transport,
    TransportResult,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const CONSOLE_USER: &str = "console";

pub struct LineTransport {
    id: String,
    addr: SocketAddr,
    outbound: broadcast::Sender<String>,
    next_message_id: AtomicU64,
}

impl LineTransport {
    pub fn new(id: impl Into<String>, addr: SocketAddr) -> Self {
        let (outbound, _) = broadcast::channel(256);
        Self {
            id: id.into(),
            addr,
            outbound,
            next_message_id: AtomicU64::new(1),
        }
    }

    fn deliver(&self, channel: ChannelId, message: &str) -> String {
        for line in message.lines() {
            // No console connected is not an error.
            let _ = self.outbound.send(format!("{channel} {line}"));
        }
        self.next_message_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string()
    }
}

/// Parses one console line into a message.
pub fn parse_line(line: &str, message_id: String) -> Option<MessageEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (channel, text) = match line
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
    {
        Some((channel, text)) => (channel.parse::<ChannelId>().ok()?, text.trim()),
        None => (ChannelId::private(CONSOLE_USER), line),
    };
    let sender = match channel.kind {
        ChannelKind::Private => channel.id.clone(),
        ChannelKind::Group => CONSOLE_USER.to_string(),
    };
    Some(MessageEvent::new(message_id, sender, channel, text))
}

#[async_trait]
impl Transport for LineTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, events: EventSender) -> TransportResult<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Console transport listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            info!(%peer, "Console connected");
            let events = events.clone();
            let outbound = self.outbound.subscribe();
            tokio::spawn(async move {
                serve(stream, events, outbound).await;
                info!(%peer, "Console disconnected");
            });
        }
    }

    async fn send_private(&self, user_id: &str, message: &str) -> ApiResult<String> {
        Ok(self.deliver(ChannelId::private(user_id), message))
    }

    async fn send_group(&self, group_id: &str, message: &str) -> ApiResult<String> {
        Ok(self.deliver(ChannelId::group(group_id), message))
    }
}

async fn serve(
    stream: TcpStream,
    events: EventSender,
    mut outbound: broadcast::Receiver<String>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut received = 0u64;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    received += 1;
                    let Some(event) = parse_line(&line, received.to_string()) else {
                        debug!(line = %line, "Ignoring console line");
                        continue;
                    };
                    if events.send(InboundEvent::Message(event)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Console read failed");
                    break;
                }
            },
            sent = outbound.recv() => match sent {
                Ok(text) => {
                    if writer.write_all(format!("{text}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Console fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let event = parse_line("ping", "1".into()).unwrap();
        assert_eq!(event.channel, ChannelId::private("console"));
        assert_eq!(event.text, "ping");

        let event = parse_line("[group:100] echo hi", "2".into()).unwrap();
        assert_eq!(event.kind(), ChannelKind::Group);
        assert_eq!(event.sender_id, "console");
        assert_eq!(event.text, "echo hi");

        let event = parse_line("[private:42] ping", "3".into()).unwrap();
        assert_eq!(event.sender_id, "42");

        assert!(parse_line("   ", "4".into()).is_none());
        assert!(parse_line("[lobby:1] hi", "5".into()).is_none());
    }

    #[tokio::test]
    async fn test_sends_reach_console() {
        let transport = LineTransport::new("demo", "127.0.0.1:0".parse().unwrap());
        let mut console = transport.outbound.subscribe();

        transport.send_group("100", "one\ntwo").await.unwrap();
        assert_eq!(console.recv().await.unwrap(), "group:100 one");
        assert_eq!(console.recv().await.unwrap(), "group:100 two");
    }
}
