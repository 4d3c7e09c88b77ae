//! Test doubles.
//!
//! [`RecordingTransport`] stands in for a chat network: it records every
//! outbound message and lets a test push inbound events once
//! [`Transport::run`] has been called.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use kiln_core::{
    ApiResult, ChannelId, EventSender, InboundEvent, MessageEvent, Transport, TransportError,
    TransportResult,
};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// A transport that records what it is asked to send.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(ChannelId, String)>>,
    events: Mutex<Option<EventSender>>,
    next_message_id: AtomicU64,
    closed: Notify,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything sent so far, oldest first.
    pub fn sent(&self) -> Vec<(ChannelId, String)> {
        self.sent.lock().clone()
    }

    /// Only the texts of everything sent so far.
    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, text)| text.clone()).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Pushes an inbound message into a running transport.
    pub fn push(&self, event: MessageEvent) -> TransportResult<()> {
        let events = self.events.lock().clone();
        events
            .ok_or(TransportError::ChannelClosed)?
            .send(InboundEvent::Message(event))
    }

    /// Makes [`Transport::run`] return.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    fn record(&self, channel: ChannelId, message: &str) -> String {
        self.sent.lock().push((channel, message.to_string()));
        self.next_message_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn id(&self) -> &str {
        "test-bot"
    }

    async fn run(&self, events: EventSender) -> TransportResult<()> {
        *self.events.lock() = Some(events);
        self.closed.notified().await;
        self.events.lock().take();
        Ok(())
    }

    async fn send_private(&self, user_id: &str, message: &str) -> ApiResult<String> {
        Ok(self.record(ChannelId::private(user_id), message))
    }

    async fn send_group(&self, group_id: &str, message: &str) -> ApiResult<String> {
        Ok(self.record(ChannelId::group(group_id), message))
    }
}
