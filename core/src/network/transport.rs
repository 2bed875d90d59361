//! Transport abstraction
//!
//! The fabric does not own sockets. A `Transport` delivers a request payload
//! to a peer and returns its response bytes; anything satisfying that
//! contract (QUIC, TCP, a test harness) can carry gossip. `InMemoryNetwork`
//! is the in-process implementation used by the integration tests, with
//! link severing to simulate partitions.

use crate::types::PeerId;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// Boxed response future returned by a transport request
pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send + 'a>>;

/// Delivers request/response exchanges to remote peers
pub trait Transport: Send + Sync + 'static {
    /// Send `payload` to `peer` and await its response bytes
    fn request(&self, peer: PeerId, payload: Vec<u8>) -> TransportFuture<'_>;
}

/// Inbound side: a replica's handler for gossip payloads
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle a request from `from`, producing response bytes
    fn handle(&self, from: PeerId, payload: &[u8]) -> Result<Vec<u8>>;
}

/// In-process network of registered handlers
///
/// Exchanges are synchronous under the hood; the boxed future keeps the
/// calling convention identical to a real transport.
#[derive(Default)]
pub struct InMemoryNetwork {
    inner: Arc<RwLock<NetworkInner>>,
}

#[derive(Default)]
struct NetworkInner {
    handlers: HashMap<PeerId, Arc<dyn MessageHandler>>,
    severed: HashSet<(PeerId, PeerId)>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a peer's message handler, returning its transport endpoint
    pub fn register(&self, peer: PeerId, handler: Arc<dyn MessageHandler>) -> InMemoryTransport {
        self.inner.write().unwrap().handlers.insert(peer, handler);
        InMemoryTransport {
            local: peer,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Cut the link between two peers in both directions
    pub fn sever(&self, a: PeerId, b: PeerId) {
        let mut inner = self.inner.write().unwrap();
        inner.severed.insert((a, b));
        inner.severed.insert((b, a));
    }

    /// Restore the link between two peers
    pub fn heal(&self, a: PeerId, b: PeerId) {
        let mut inner = self.inner.write().unwrap();
        inner.severed.remove(&(a, b));
        inner.severed.remove(&(b, a));
    }
}

fn deliver(
    inner: &RwLock<NetworkInner>,
    from: PeerId,
    to: PeerId,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let handler = {
        let inner = inner.read().unwrap();
        if inner.severed.contains(&(from, to)) {
            return Err(Error::Transport(format!("link severed: {} -> {}", from, to)));
        }
        inner
            .handlers
            .get(&to)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("unknown peer: {}", to)))?
    };
    handler.handle(from, payload)
}

/// One peer's endpoint into an `InMemoryNetwork`
pub struct InMemoryTransport {
    local: PeerId,
    inner: Arc<RwLock<NetworkInner>>,
}

impl Transport for InMemoryTransport {
    fn request(&self, peer: PeerId, payload: Vec<u8>) -> TransportFuture<'_> {
        let result = deliver(&self.inner, self.local, peer, &payload);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl MessageHandler for Echo {
        fn handle(&self, _from: PeerId, payload: &[u8]) -> Result<Vec<u8>> {
            Ok(payload.to_vec())
        }
    }

    #[tokio::test]
    async fn test_request_reaches_handler() {
        let network = InMemoryNetwork::new();
        let a = PeerId([1u8; 32]);
        let b = PeerId([2u8; 32]);

        let transport_a = network.register(a, Arc::new(Echo));
        network.register(b, Arc::new(Echo));

        let reply = transport_a.request(b, b"ping".to_vec()).await.unwrap();
        assert_eq!(reply, b"ping");
    }

    #[tokio::test]
    async fn test_severed_link_fails() {
        let network = InMemoryNetwork::new();
        let a = PeerId([1u8; 32]);
        let b = PeerId([2u8; 32]);

        let transport_a = network.register(a, Arc::new(Echo));
        network.register(b, Arc::new(Echo));
        network.sever(a, b);

        assert!(transport_a.request(b, b"ping".to_vec()).await.is_err());

        network.heal(a, b);
        assert!(transport_a.request(b, b"ping".to_vec()).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_peer_fails() {
        let network = InMemoryNetwork::new();
        let a = PeerId([1u8; 32]);
        let transport_a = network.register(a, Arc::new(Echo));

        let ghost = PeerId([9u8; 32]);
        assert!(transport_a.request(ghost, b"ping".to_vec()).await.is_err());
    }
}
