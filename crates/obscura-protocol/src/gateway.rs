//! The bidirectional message gateway, as the core sees it.
//!
//! The server pushes envelope frames; the client answers with ACKs once a
//! message is fully routed and persisted. Reconnects back off from one
//! second to thirty, forever, until an explicit disconnect clears the flag.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProtocolError;
use crate::wire::GatewayFrame;

/// One live gateway connection.
#[async_trait]
pub trait GatewayConnection: Send {
    /// Receive the next frame; `None` means the server closed the stream.
    async fn next_frame(&mut self) -> Result<Option<GatewayFrame>, ProtocolError>;

    /// Acknowledge a fully processed envelope by its server id.
    async fn send_ack(&mut self, message_id: &str) -> Result<(), ProtocolError>;
}

/// Connection factory, injected at core construction.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn GatewayConnection>, ProtocolError>;
}

/// Exponential backoff state for gateway reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ReconnectPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to sleep before the next attempt; doubles up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Back to the floor after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(30_000))
    }
}
