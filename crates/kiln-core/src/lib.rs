//! # Kiln Core
//!
//! The smallest layer of the Kiln plugin runtime. It owns the types shared by
//! every other crate:
//!
//! - **Event model**: [`MessageEvent`], [`ChannelId`], [`ChannelKind`] and
//!   named [`Signal`]s, wrapped into [`InboundEvent`] by the transport.
//! - **Transport seam**: the [`Transport`] trait, the only way Kiln talks to
//!   a chat network. Kiln never implements a protocol itself.
//! - **Errors**: [`TransportError`] and [`ApiError`] with their result aliases.
//!
//! ```text
//! ┌─────────────┐  InboundEvent   ┌──────────┐  MessageEvent  ┌────────────────┐
//! │  Transport  │────────────────▶│ BotHost  │───────────────▶│ PluginContext  │
//! │  (external) │◀────────────────│          │◀───────────────│ (middlewares)  │
//! └─────────────┘  send_private / └──────────┘   send_msg     └────────────────┘
//!                  send_group
//! ```

pub mod error;
pub mod event;
pub mod transport;

pub use error::{ApiError, ApiResult, TransportError, TransportResult};
pub use event::{ChannelId, ChannelKind, InboundEvent, MessageEvent, Signal};
pub use transport::{BoxedTransport, EventSender, Transport, event_channel};
