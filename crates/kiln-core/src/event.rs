//! Event model for the Kiln runtime.
//!
//! Transports deliver [`InboundEvent`]s. Message events carry enough shape to
//! route a reply ([`ChannelId`]) and to gate commands on the channel kind;
//! everything else travels as a named [`Signal`] with a JSON payload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

// ============================================================================
// Channel addressing
// ============================================================================

/// The kind of conversation a message was sent in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// One-to-one conversation with a user.
    Private,
    /// Group conversation.
    Group,
}

impl ChannelKind {
    /// Returns the lowercase wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Self::Private),
            "group" => Ok(Self::Group),
            other => Err(ApiError::UnknownChannelKind(other.to_string())),
        }
    }
}

/// A channel address of the form `<kind>:<id>`, e.g. `group:123456`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    pub kind: ChannelKind,
    pub id: String,
}

impl ChannelId {
    pub fn new(kind: ChannelKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn private(id: impl Into<String>) -> Self {
        Self::new(ChannelKind::Private, id)
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::new(ChannelKind::Group, id)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for ChannelId {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ApiError::MalformedChannel(s.to_string()))?;
        if id.is_empty() {
            return Err(ApiError::MalformedChannel(s.to_string()));
        }
        Ok(Self::new(kind.parse()?, id))
    }
}

// ============================================================================
// Events
// ============================================================================

/// A chat message delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Transport-assigned message identifier.
    pub message_id: String,
    /// Identifier of the user who sent the message.
    pub sender_id: String,
    /// Where the message was sent; replies go back here.
    pub channel: ChannelId,
    /// Raw message text.
    pub text: String,
}

impl MessageEvent {
    pub fn new(
        message_id: impl Into<String>,
        sender_id: impl Into<String>,
        channel: ChannelId,
        text: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            sender_id: sender_id.into(),
            channel,
            text: text.into(),
        }
    }

    /// Shorthand for a private message whose channel is the sender itself.
    pub fn private(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        let sender_id = sender_id.into();
        Self::new("", sender_id.clone(), ChannelId::private(sender_id), text)
    }

    /// Shorthand for a group message.
    pub fn group(
        group_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new("", sender_id, ChannelId::group(group_id), text)
    }

    /// The kind of channel this message arrived on.
    pub fn kind(&self) -> ChannelKind {
        self.channel.kind
    }
}

/// A named lifecycle or transport notification, e.g. `bot.ready` or
/// `plugin.config.change`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl Signal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Everything a transport can push into the runtime.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Message(MessageEvent),
    Signal(Signal),
}

impl InboundEvent {
    /// A short name for logging spans.
    pub fn event_name(&self) -> &str {
        match self {
            Self::Message(_) => "message",
            Self::Signal(signal) => &signal.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_roundtrip() {
        let channel: ChannelId = "group:42".parse().unwrap();
        assert_eq!(channel, ChannelId::group("42"));
        assert_eq!(channel.to_string(), "group:42");
    }

    #[test]
    fn test_channel_id_keeps_colons_in_id() {
        let channel: ChannelId = "private:a:b".parse().unwrap();
        assert_eq!(channel.id, "a:b");
    }

    #[test]
    fn test_channel_id_unknown_kind() {
        let err = "guild:1".parse::<ChannelId>().unwrap_err();
        assert!(matches!(err, ApiError::UnknownChannelKind(kind) if kind == "guild"));
    }

    #[test]
    fn test_channel_id_malformed() {
        assert!(matches!(
            "private".parse::<ChannelId>(),
            Err(ApiError::MalformedChannel(_))
        ));
        assert!(matches!(
            "private:".parse::<ChannelId>(),
            Err(ApiError::MalformedChannel(_))
        ));
    }

    #[test]
    fn test_private_shorthand_routes_to_sender() {
        let event = MessageEvent::private("7", "hi");
        assert_eq!(event.kind(), ChannelKind::Private);
        assert_eq!(event.channel.id, "7");
    }
}
