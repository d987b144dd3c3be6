//! Test fixtures and helpers.
//!
//! A [`TestNet`] is one backend plus whatever endpoints and relays a test
//! asks for, every link an in-memory transport.

use std::sync::{Arc, Mutex};

use bundlenet::{Node, NodeBuilder, NodeConfig};
use bundlenet_core::{Adu, PeerId};
use bundlenet_session::Identity;
use bundlenet_store::MemoryStore;
use bundlenet_sync::MemoryTransport;

/// Seed of the backend identity in every [`TestNet`].
pub const BACKEND_SEED: u8 = 0xB0;

/// Everything the backend delivered, in delivery order.
pub type Inbox = Arc<Mutex<Vec<Adu>>>;

/// A deterministic identity.
pub fn identity(seed: u8) -> Identity {
    Identity::from_seed(&[seed; 32])
}

/// A backend with an inbox and a direct link to it.
pub struct TestNet {
    pub backend: Node<MemoryStore>,
    pub backend_link: MemoryTransport,
    pub inbox: Inbox,
}

impl TestNet {
    pub fn new() -> Self {
        let inbox: Inbox = Arc::default();
        let backend = {
            let inbox = inbox.clone();
            NodeBuilder::new(identity(BACKEND_SEED), NodeConfig::backend())
                .on_delivery(move |adu| inbox.lock().unwrap().push(adu.clone()))
                .build(MemoryStore::new())
                .expect("backend config is valid")
        };
        let backend_link = MemoryTransport::new(backend.service().expect("backend serves exchanges"));
        Self {
            backend,
            backend_link,
            inbox,
        }
    }

    pub fn backend_peer(&self) -> PeerId {
        self.backend.peer_id()
    }

    /// A polling endpoint that trusts the backend.
    pub fn endpoint(&self, seed: u8) -> Node<MemoryStore> {
        let node = Node::new(identity(seed), MemoryStore::new(), NodeConfig::endpoint().polling())
            .expect("endpoint config is valid");
        node.register_peer(self.backend.pre_key_bundle())
            .expect("backend keys verify");
        node
    }

    /// A relay and the link endpoints use to reach it.
    pub fn relay(&self, seed: u8) -> (Node<MemoryStore>, MemoryTransport) {
        let node = Node::new(identity(seed), MemoryStore::new(), NodeConfig::relay())
            .expect("relay config is valid");
        let link = MemoryTransport::new(node.service().expect("relays serve exchanges"));
        (node, link)
    }

    /// Delivered ADU bodies from `from`, in order.
    pub fn delivered_from(&self, from: &PeerId) -> Vec<Vec<u8>> {
        self.inbox
            .lock()
            .unwrap()
            .iter()
            .filter(|adu| adu.peer == *from)
            .map(|adu| adu.data.to_vec())
            .collect()
    }
}

impl Default for TestNet {
    fn default() -> Self {
        Self::new()
    }
}

/// Endpoints with distinct seeds starting at 1.
pub fn endpoints(net: &TestNet, count: usize) -> Vec<Node<MemoryStore>> {
    (0..count).map(|i| net.endpoint(i as u8 + 1)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlenet::ExchangeOptions;

    #[tokio::test]
    async fn test_endpoint_reaches_backend() {
        let net = TestNet::new();
        let endpoint = net.endpoint(1);
        endpoint.send(&net.backend_peer(), "mail", &b"ping"[..]).await.unwrap();
        let report = endpoint
            .exchange(&net.backend_link, &net.backend_peer(), ExchangeOptions::default())
            .await
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(net.delivered_from(&endpoint.peer_id()), vec![b"ping".to_vec()]);
    }

    #[test]
    fn test_endpoints_have_distinct_identities() {
        let net = TestNet::new();
        let nodes = endpoints(&net, 3);
        assert_ne!(nodes[0].peer_id(), nodes[1].peer_id());
        assert_ne!(nodes[1].peer_id(), nodes[2].peer_id());
        assert_ne!(nodes[0].peer_id(), net.backend_peer());
    }
}
