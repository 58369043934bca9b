//! Addressing for worker nodes.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// A (host, port) address identifying one worker node.
///
/// `Endpoint` doubles as the deduplication key the coordinator uses to
/// recognize repeat deliveries of an at-least-once message (see
/// [`loadforge_transport`](../loadforge_transport/index.html)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    addr: SocketAddr,
}

impl Endpoint {
    /// Build an endpoint from a socket address.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// The underlying socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}
