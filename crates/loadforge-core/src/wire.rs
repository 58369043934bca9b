//! The message envelope exchanged between the coordinator and worker nodes.

use serde::{Deserialize, Serialize};

/// The closed set of message types the coordinator protocol exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Coordinator → node: preload data for one loader partition.
    Load,
    /// Coordinator → node: start the benchmark.
    Start,
    /// Coordinator → node: stop the benchmark and return the accumulated log.
    Stop,
    /// Coordinator → node: tear down and exit.
    Shutdown,
    /// Node → coordinator: the node's accumulated log, in response to `Stop`.
    Results,
    /// Node → coordinator: this node's loader partition has finished preloading.
    FinishedLoading,
    /// Either direction: application-level acknowledgement of a `request_ack` send.
    Ack,
    /// Node → coordinator: an unrecoverable error occurred; the payload is UTF-8 text.
    Err,
}

/// The serializable envelope carried over the wire.
///
/// `payload` is itself bincode-encoded per-`kind` data; see the
/// `loadforge-coordinator` and `loadforge-node` crates for the concrete
/// payload shapes (a `(BenchmarkConfig, loader_index)` tuple for `Load`, a
/// full `BenchmarkConfig` for `Start`, an encoded `Logger` for `Results`, a
/// UTF-8 string for `Err`, and an empty payload for the rest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Which of the fixed protocol message types this is.
    pub kind: MessageKind,
    /// Opaque, kind-specific payload.
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// Build an envelope with an empty payload.
    pub fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    /// Build an envelope by bincode-encoding `value` as the payload.
    pub fn encode<T: Serialize>(kind: MessageKind, value: &T) -> Result<Self, bincode::Error> {
        Ok(Self {
            kind,
            payload: bincode::serialize(value)?,
        })
    }

    /// Decode the payload as `T`.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, bincode::Error> {
        bincode::deserialize(&self.payload)
    }
}
