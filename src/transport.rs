//! The duplex, message-oriented channel to one client (spec §2's
//! `MessageStream`). Framing (WebSocket / TCP / in-process) is out of scope
//! (spec §1); this module only fixes the trait the [`Agent`] needs and
//! supplies an in-process, channel-backed implementation suitable both for
//! tests and as a template for a real transport adapter.
//!
//! [`Agent`]: crate::agent::Agent

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// A message as delivered by the transport: either already parsed, or raw
/// text that the agent must parse as JSON itself (spec §4.2).
#[derive(Debug, Clone)]
pub enum Incoming {
    Parsed(Value),
    Text(String),
}

#[derive(Debug, thiserror::Error)]
#[error("transport send failed: {0}")]
pub struct TransportError(pub String);

/// A duplex channel to one client.
#[async_trait]
pub trait MessageStream: Send {
    /// Waits for the next message, or `None` once the stream has ended.
    async fn recv(&mut self) -> Option<Incoming>;

    /// Sends a server message to the client.
    async fn send(&mut self, message: Value) -> Result<(), TransportError>;

    /// Signals an error to the remote end, then ends the stream (spec
    /// §4.13's `close(err)`).
    async fn close_with_error(&mut self, message: String);
}

/// An in-process [`MessageStream`] backed by `tokio::sync::mpsc` channels.
///
/// Used by this crate's own tests and scenarios, and as the template a real
/// WebSocket/TCP adapter would follow: `recv` pulls from an inbound channel,
/// `send` pushes onto an outbound one.
pub struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<Incoming>,
    outbound: mpsc::UnboundedSender<Value>,
}

/// The test/peer-facing half of a [`ChannelTransport`] pair.
pub struct ChannelPeer {
    pub inbound: mpsc::UnboundedSender<Incoming>,
    pub outbound: mpsc::UnboundedReceiver<Value>,
}

impl ChannelTransport {
    /// Builds a connected `(transport, peer)` pair: the peer drives the
    /// transport the way a real client connection would.
    pub fn pair() -> (Self, ChannelPeer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            Self {
                inbound: in_rx,
                outbound: out_tx,
            },
            ChannelPeer {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }
}

#[async_trait]
impl MessageStream for ChannelTransport {
    async fn recv(&mut self) -> Option<Incoming> {
        self.inbound.recv().await
    }

    async fn send(&mut self, message: Value) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .map_err(|e| TransportError(e.to_string()))
    }

    async fn close_with_error(&mut self, message: String) {
        tracing::warn!(%message, "closing agent transport with error");
        self.inbound.close();
    }
}
