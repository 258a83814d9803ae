//! Outbound side of a client connection, as seen by a room.
//!
//! A room never touches the transport. The collaborator hands it a
//! [`MessageSink`] per connection and the room only ever calls
//! [`MessageSink::send`]. Sends must not block: the server's sink pushes into
//! a bounded per-connection queue that a writer task drains to the socket.

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Opaque handle identifying one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a send to one member failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("Connection closed")]
    Closed,
    #[error("Outbound queue full")]
    Full,
}

/// Send capability for one connection.
pub trait MessageSink: Send + Sync {
    /// Queue a text frame for delivery. Must not block.
    fn send(&self, text: String) -> Result<(), SendError>;
}

/// [`MessageSink`] backed by a bounded tokio channel.
///
/// A slow reader fills its own queue and then starts dropping frames
/// (`SendError::Full`) instead of stalling the room.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl MessageSink for ChannelSink {
    fn send(&self, text: String) -> Result<(), SendError> {
        self.tx.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }
}
