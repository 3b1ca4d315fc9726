//! The transport seam.
//!
//! The dispatcher only needs to send opaque text replies on the connection a
//! request arrived on. Transports implement [`Connection`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of one client connection. UUID v7, so ids sort by accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
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

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Failure to deliver a reply.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("transport error: {0}")]
    Transport(String),
}

/// A client connection able to carry text replies.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Sends one reply. Replies on one connection keep their send order.
    fn send(&self, message: &str) -> Result<(), ConnectionError>;
}
