#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! At-least-once UDP messaging (C5): `send` with optional ack/retry, and a
//! per-message-kind listener registry on the receive side.
//!
//! Handlers registered via [`Transport::register_listener`] must be
//! idempotent: because delivery is at-least-once, a sender may redeliver
//! the same logical message after an ack is lost in transit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use loadforge_core::{Endpoint, MessageKind, WireMessage};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;

const MAX_DATAGRAM: usize = 64 * 1024;

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying socket failed to bind, send, or receive.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    /// A message could not be bincode-encoded.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Invoked once a [`Transport::send`] reaches a terminal outcome: `true` on
/// ack (or immediately, for fire-and-forget sends), `false` after
/// `max_sequential_failures` consecutive ack timeouts.
pub type SendCallback = Arc<dyn Fn(Endpoint, bool) + Send + Sync>;

/// Invoked for each received message of a given [`MessageKind`].
pub type Handler = Arc<dyn Fn(WireMessage, Endpoint) + Send + Sync>;

/// Delivery options for one [`Transport::send`] call.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// How long to wait for an ack before resending.
    pub timeout: Duration,
    /// Whether to require an ack at all; `false` is fire-and-forget.
    pub request_ack: bool,
    /// Consecutive ack timeouts tolerated before giving up.
    pub max_sequential_failures: u32,
}

impl SendOptions {
    /// Fire-and-forget: no ack requested, no retry.
    pub fn fire_and_forget() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            request_ack: false,
            max_sequential_failures: 0,
        }
    }

    /// At-least-once delivery: resend on ack timeout up to
    /// `max_sequential_failures` times before giving up.
    pub fn at_least_once(timeout: Duration, max_sequential_failures: u32) -> Self {
        Self {
            timeout,
            request_ack: true,
            max_sequential_failures,
        }
    }
}

type AckKey = (Endpoint, MessageKind);

/// A UDP-backed transport shared by the coordinator and worker nodes.
///
/// Owns the socket, a listener registry keyed by [`MessageKind`], and the
/// set of in-flight ack waiters for outstanding `send` calls. Cheaply
/// clonable; clones share the same socket and registries.
#[derive(Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
    listeners: Arc<DashMap<MessageKind, Handler>>,
    ack_waiters: Arc<DashMap<AckKey, oneshot::Sender<()>>>,
}

impl Transport {
    /// Bind a transport to `addr` and start its background receive loop.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let listeners: Arc<DashMap<MessageKind, Handler>> = Arc::new(DashMap::new());
        let ack_waiters: Arc<DashMap<AckKey, oneshot::Sender<()>>> = Arc::new(DashMap::new());

        let recv_socket = socket.clone();
        let recv_listeners = listeners.clone();
        let recv_waiters = ack_waiters.clone();
        tokio::spawn(receive_loop(recv_socket, recv_listeners, recv_waiters));

        Ok(Self {
            socket,
            listeners,
            ack_waiters,
        })
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Register a handler for every inbound message of `kind`. Replaces any
    /// previously registered handler for that kind.
    pub fn register_listener(&self, kind: MessageKind, handler: Handler) {
        self.listeners.insert(kind, handler);
    }

    /// Send `msg` to `endpoint`. With `opts.request_ack`, retries on ack
    /// timeout up to `opts.max_sequential_failures` times; `callback` is
    /// invoked exactly once with the terminal outcome. Fire-and-forget
    /// sends invoke `callback(endpoint, true)` once the datagram leaves the
    /// socket, without waiting on the network.
    pub fn send(&self, msg: WireMessage, endpoint: Endpoint, opts: SendOptions, callback: SendCallback) {
        let socket = self.socket.clone();
        let waiters = self.ack_waiters.clone();
        tokio::spawn(async move {
            let kind = msg.kind;
            let encoded = match bincode::serialize(&msg) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::error!(%err, "failed to encode outbound message");
                    callback(endpoint, false);
                    return;
                }
            };

            if !opts.request_ack {
                if let Err(err) = socket.send_to(&encoded, endpoint.addr()).await {
                    tracing::warn!(%err, ?endpoint, "fire-and-forget send failed");
                }
                callback(endpoint, true);
                return;
            }

            let mut failures = 0u32;
            loop {
                let (tx, rx) = oneshot::channel();
                waiters.insert((endpoint, kind), tx);

                if let Err(err) = socket.send_to(&encoded, endpoint.addr()).await {
                    tracing::warn!(%err, ?endpoint, "send failed, will retry on timeout");
                }

                match timeout(opts.timeout, rx).await {
                    Ok(Ok(())) => {
                        callback(endpoint, true);
                        return;
                    }
                    _ => {
                        waiters.remove(&(endpoint, kind));
                        failures += 1;
                        if failures > opts.max_sequential_failures {
                            callback(endpoint, false);
                            return;
                        }
                    }
                }
            }
        });
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    listeners: Arc<DashMap<MessageKind, Handler>>,
    ack_waiters: Arc<DashMap<AckKey, oneshot::Sender<()>>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(%err, "receive failed");
                continue;
            }
        };
        let sender = Endpoint::new(from);
        let msg: WireMessage = match bincode::deserialize(&buf[..len]) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(%err, ?sender, "dropping undecodable datagram");
                continue;
            }
        };

        if msg.kind == MessageKind::Ack {
            if let Ok(acked_kind) = msg.decode::<MessageKind>() {
                if let Some((_, tx)) = ack_waiters.remove(&(sender, acked_kind)) {
                    let _ = tx.send(());
                }
            }
            continue;
        }

        if let Ok(reply) = WireMessage::encode(MessageKind::Ack, &msg.kind) {
            if let Ok(bytes) = bincode::serialize(&reply) {
                if let Err(err) = socket.send_to(&bytes, from).await {
                    tracing::warn!(%err, ?sender, "failed to send ack");
                }
            }
        }

        if let Some(handler) = listeners.get(&msg.kind) {
            handler(msg, sender);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    async fn bind_local() -> Transport {
        Transport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind")
    }

    #[tokio::test]
    async fn fire_and_forget_delivers_to_registered_listener() {
        let server = bind_local().await;
        let client = bind_local().await;
        let server_endpoint = Endpoint::new(server.local_addr().unwrap());

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        server.register_listener(
            MessageKind::Shutdown,
            Arc::new(move |msg, from| {
                received_clone.lock().unwrap().push((msg.kind, from));
            }),
        );

        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();
        client.send(
            WireMessage::empty(MessageKind::Shutdown),
            server_endpoint,
            SendOptions::fire_and_forget(),
            Arc::new(move |_endpoint, ok| {
                done_clone.store(ok, Ordering::SeqCst);
            }),
        );

        for _ in 0..50 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(received.lock().unwrap().len(), 1);
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn request_ack_invokes_callback_with_success() {
        let server = bind_local().await;
        let client = bind_local().await;
        let server_endpoint = Endpoint::new(server.local_addr().unwrap());

        server.register_listener(MessageKind::Load, Arc::new(|_msg, _from| {}));

        let outcome = Arc::new(Mutex::new(None));
        let outcome_clone = outcome.clone();
        client.send(
            WireMessage::empty(MessageKind::Load),
            server_endpoint,
            SendOptions::at_least_once(Duration::from_millis(200), 3),
            Arc::new(move |_endpoint, ok| {
                *outcome_clone.lock().unwrap() = Some(ok);
            }),
        );

        for _ in 0..50 {
            if outcome.lock().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(*outcome.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn request_ack_gives_up_after_max_sequential_failures() {
        let client = bind_local().await;
        // No listener bound to this endpoint: nothing will ever reply, so
        // every attempt times out.
        let unreachable = Endpoint::new("127.0.0.1:1".parse().unwrap());

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let outcome = Arc::new(Mutex::new(None));
        let outcome_clone = outcome.clone();
        client.send(
            WireMessage::empty(MessageKind::Load),
            unreachable,
            SendOptions::at_least_once(Duration::from_millis(30), 2),
            Arc::new(move |_endpoint, ok| {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                *outcome_clone.lock().unwrap() = Some(ok);
            }),
        );

        for _ in 0..100 {
            if outcome.lock().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(*outcome.lock().unwrap(), Some(false));
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "callback invoked exactly once");
    }
}
