//! A "mock" (totally local) network for passing consensus packets between engines.
//!
//! Each node gets a [`MockHost`] holding one [`MockPeer`] per other node. A peer's
//! `send` delivers straight into the remote engine's [`MsgInlet`], tagged with the
//! sending node's identity and carrying a handle to the reverse peer object (the remote
//! node's view of the sender) for unicast replies.
//!
//! Hosts are created unwired — engines must exist before their inlets do — and are
//! connected afterwards with [`wire`].

use std::sync::{Arc, Mutex, Weak};

use ed25519_dalek::VerifyingKey;

use pbft_rs::messages::MsgKind;
use pbft_rs::networking::{KnownMsgSets, MsgInlet, PeerCapability, PeerHost};

pub(crate) struct MockPeer {
    /// Identity of the node this peer object belongs to.
    local_key: VerifyingKey,
    /// Identity of the node this peer object represents a connection to.
    remote_key: VerifyingKey,
    known: KnownMsgSets,
    wiring: Mutex<Option<Wiring>>,
}

struct Wiring {
    inlet: MsgInlet,
    reverse: Weak<MockPeer>,
}

impl PeerCapability for MockPeer {
    fn node_id(&self) -> VerifyingKey {
        self.remote_key
    }

    fn send(&self, kind: MsgKind, payload: &[u8]) {
        let wiring = self.wiring.lock().unwrap();
        if let Some(wiring) = &*wiring {
            let reverse: Weak<dyn PeerCapability> = wiring.reverse.clone();
            wiring
                .inlet
                .on_consensus_msg(kind.tag(), self.local_key, payload.to_vec(), reverse);
        }
    }

    fn known(&self) -> &KnownMsgSets {
        &self.known
    }
}

pub(crate) struct MockHost {
    peers: Vec<Arc<MockPeer>>,
}

impl MockHost {
    fn peer_for(&self, remote_key: &VerifyingKey) -> Option<Arc<MockPeer>> {
        self.peers
            .iter()
            .find(|peer| &peer.remote_key == remote_key)
            .cloned()
    }
}

impl PeerHost for MockHost {
    fn foreach_peer(&self, f: &mut dyn FnMut(&Arc<dyn PeerCapability>) -> bool) {
        for peer in &self.peers {
            let as_capability: Arc<dyn PeerCapability> = peer.clone();
            if !f(&as_capability) {
                break;
            }
        }
    }

    fn is_connected(&self, _node: &VerifyingKey) -> bool {
        true
    }
}

/// Create one unwired host per key, fully meshed.
pub(crate) fn mock_network(keys: &[VerifyingKey]) -> Vec<Arc<MockHost>> {
    keys.iter()
        .map(|local_key| {
            let peers = keys
                .iter()
                .filter(|remote_key| *remote_key != local_key)
                .map(|remote_key| {
                    Arc::new(MockPeer {
                        local_key: *local_key,
                        remote_key: *remote_key,
                        known: KnownMsgSets::new(),
                        wiring: Mutex::new(None),
                    })
                })
                .collect();
            Arc::new(MockHost { peers })
        })
        .collect()
}

/// Connect every peer object to the remote engine's inlet and to its reverse peer.
/// `inlets[i]` must belong to the engine of `keys[i]`.
pub(crate) fn wire(hosts: &[Arc<MockHost>], keys: &[VerifyingKey], inlets: &[MsgInlet]) {
    for (i, host) in hosts.iter().enumerate() {
        for peer in &host.peers {
            let j = keys
                .iter()
                .position(|key| *key == peer.remote_key)
                .expect("peer key is in the cluster");
            let reverse = hosts[j]
                .peer_for(&keys[i])
                .expect("mesh is fully connected");
            *peer.wiring.lock().unwrap() = Some(Wiring {
                inlet: inlets[j].clone(),
                reverse: Arc::downgrade(&reverse),
            });
        }
    }
}
