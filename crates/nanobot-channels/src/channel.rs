use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use nanobot_core::types::OutboundMessage;

use crate::error::ChannelError;

/// Runtime connection state of a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Connected,
    Connecting,
    Disconnected,
    Error(String),
}

/// Common interface implemented by every channel adapter.
///
/// An adapter owns its transport loop: it translates platform events into
/// `InboundMessage`s published on the bus (enforcing its allowlist first),
/// and delivers `OutboundMessage`s handed to [`Channel::send`].
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable lowercase identifier (e.g. `"telegram"`), unique per manager.
    fn name(&self) -> &str;

    /// Establish the connection and start the inbound loop.
    async fn connect(&mut self) -> Result<(), ChannelError>;

    /// Stop accepting inbound traffic and close the connection.
    async fn disconnect(&mut self) -> Result<(), ChannelError>;

    /// Deliver one outbound message. `&self` so a connected adapter can send
    /// from multiple tasks concurrently.
    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError>;

    /// Current status without blocking.
    fn status(&self) -> ChannelStatus;
}
