//! Transport trait and related types.
//!
//! A [`Transport`] is the external collaborator that connects Kiln to a chat
//! network. It is consumed in exactly two ways:
//!
//! - as an **event source**: [`Transport::run`] pushes [`InboundEvent`]s into
//!   the [`EventSender`] handed to it by the runtime;
//! - as a **send sink**: the per-kind send operations used when a plugin
//!   replies or calls `send_msg("<kind>:<id>", ...)`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ApiResult, TransportError, TransportResult};
use crate::event::{ChannelId, ChannelKind, InboundEvent};

/// Sending half of the runtime's inbound event queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<InboundEvent>,
}

impl EventSender {
    /// Queues an event for dispatch.
    ///
    /// Fails once the runtime has shut down and dropped the receiver.
    pub fn send(&self, event: InboundEvent) -> TransportResult<()> {
        self.tx
            .send(event)
            .map_err(|_| TransportError::ChannelClosed)
    }
}

/// Creates the inbound event queue shared by a transport and the runtime.
pub fn event_channel() -> (EventSender, mpsc::UnboundedReceiver<InboundEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

/// The transport seam.
///
/// Implementations own the connection, authentication and message encoding.
/// Kiln only needs the operations below.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Returns the identity of the bot account this transport drives.
    fn id(&self) -> &str;

    /// Runs the transport until it disconnects, forwarding every received
    /// event into `events`.
    async fn run(&self, events: EventSender) -> TransportResult<()>;

    /// Sends a message to a user.
    ///
    /// Returns the message ID on success.
    async fn send_private(&self, user_id: &str, message: &str) -> ApiResult<String>;

    /// Sends a message to a group.
    async fn send_group(&self, group_id: &str, message: &str) -> ApiResult<String>;

    /// Routes `message` to the per-kind send operation for `channel`.
    async fn send_to(&self, channel: &ChannelId, message: &str) -> ApiResult<String> {
        match channel.kind {
            ChannelKind::Private => self.send_private(&channel.id, message).await,
            ChannelKind::Group => self.send_group(&channel.id, message).await,
        }
    }
}

/// A shared transport trait object.
pub type BoxedTransport = Arc<dyn Transport>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MessageEvent;

    #[tokio::test]
    async fn test_event_channel_delivers_in_order() {
        let (tx, mut rx) = event_channel();
        tx.send(InboundEvent::Message(MessageEvent::private("1", "a")))
            .unwrap();
        tx.send(InboundEvent::Message(MessageEvent::private("1", "b")))
            .unwrap();

        let texts: Vec<String> = [rx.recv().await, rx.recv().await]
            .into_iter()
            .flatten()
            .filter_map(|e| match e {
                InboundEvent::Message(m) => Some(m.text),
                InboundEvent::Signal(_) => None,
            })
            .collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[test]
    fn test_event_channel_closed() {
        let (tx, rx) = event_channel();
        drop(rx);
        assert!(matches!(
            tx.send(InboundEvent::Message(MessageEvent::private("1", "a"))),
            Err(TransportError::ChannelClosed)
        ));
    }
}
