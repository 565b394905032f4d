//! Transport layer for the agent.
//!
//! The listener runs on tokio tasks and never touches host state. It turns
//! sockets into [`TransportEvent`]s on an unbounded channel that the agent
//! drains from the frame loop, and carries responses back through a
//! per-connection outbound sender.

pub mod listener;

use tokio::sync::mpsc;

use crate::bridge::protocol::Response;

pub use listener::{Listener, bind};

/// Identifies one accepted controller connection. Monotonically increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the transport reports to the agent.
#[derive(Debug)]
pub enum TransportEvent {
    /// A new peer was accepted. It supersedes any earlier connection.
    Connected {
        connection: ConnectionId,
        outbound: mpsc::UnboundedSender<Response>,
    },
    /// One complete text message from the peer.
    Message {
        connection: ConnectionId,
        text: String,
    },
    /// A line that could not be read as text. The session stays open.
    Malformed {
        connection: ConnectionId,
        reason: String,
    },
    /// The peer went away, was superseded or sent an oversized frame.
    Closed { connection: ConnectionId },
}

impl TransportEvent {
    pub fn connection(&self) -> ConnectionId {
        match self {
            Self::Connected { connection, .. }
            | Self::Message { connection, .. }
            | Self::Malformed { connection, .. }
            | Self::Closed { connection } => *connection,
        }
    }
}
