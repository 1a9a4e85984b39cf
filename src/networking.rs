/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait definitions for pluggable peer-to-peer gossip, as well as the internal types the
//! engine uses to interact with peers.
//!
//! The engine has modular networking, with each peer reachable by its
//! [VerifyingKey](ed25519_dalek::VerifyingKey). Networking providers implement two traits:
//! [`PeerCapability`] for a single connected peer, and [`PeerHost`] for the set of
//! connections. The engine holds only a [`Weak`] reference to the host — the host (and
//! through it, each peer's inbound thread) reaches the engine exclusively by enqueueing
//! envelopes via [`MsgInlet`], which breaks the reference cycle between the two.
//!
//! ## Duplicate suppression
//!
//! Every peer keeps four bounded known-message sets, one per [`MsgKind`]. A broadcast
//! skips peers that already know a message's [unique key](crate::messages::ConsensusHeader::unique_key)
//! and marks the key on everyone it sends to, so gossip rebroadcasts converge instead of
//! echoing forever. The sets are capped; the oldest key is evicted on overflow.

use std::{
    collections::{HashSet, VecDeque},
    sync::{mpsc::Sender, Arc, Mutex, Weak},
};

use ed25519_dalek::VerifyingKey;

use crate::messages::MsgKind;
use crate::types::data_types::MinerIndex;
use crate::types::roster::MinerSet;

/// Capacity of each per-peer known-message set.
pub const KNOWN_SET_CAPACITY: usize = 1024;

/// A bounded, insertion-ordered set of message keys.
pub struct KnownCache {
    keys: VecDeque<String>,
    index: HashSet<String>,
    capacity: usize,
}

impl KnownCache {
    pub fn new(capacity: usize) -> KnownCache {
        KnownCache {
            keys: VecDeque::with_capacity(capacity),
            index: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains(key)
    }

    /// Insert `key`, evicting the oldest key if the cache is full. Inserting a key that
    /// is already present is a no-op.
    pub fn insert(&mut self, key: String) {
        if self.index.contains(&key) {
            return;
        }
        if self.keys.len() >= self.capacity {
            if let Some(evicted) = self.keys.pop_front() {
                self.index.remove(&evicted);
            }
        }
        self.index.insert(key.clone());
        self.keys.push_back(key);
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.index.clear();
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// The four known-message sets of one peer, each behind its own lock. Concrete peers
/// embed this to implement [`PeerCapability`] once.
pub struct KnownMsgSets {
    prepare: Mutex<KnownCache>,
    sign: Mutex<KnownCache>,
    commit: Mutex<KnownCache>,
    view_change: Mutex<KnownCache>,
}

impl Default for KnownMsgSets {
    fn default() -> Self {
        KnownMsgSets::new()
    }
}

impl KnownMsgSets {
    pub fn new() -> KnownMsgSets {
        KnownMsgSets {
            prepare: Mutex::new(KnownCache::new(KNOWN_SET_CAPACITY)),
            sign: Mutex::new(KnownCache::new(KNOWN_SET_CAPACITY)),
            commit: Mutex::new(KnownCache::new(KNOWN_SET_CAPACITY)),
            view_change: Mutex::new(KnownCache::new(KNOWN_SET_CAPACITY)),
        }
    }

    fn set_for(&self, kind: MsgKind) -> &Mutex<KnownCache> {
        match kind {
            MsgKind::Prepare => &self.prepare,
            MsgKind::Sign => &self.sign,
            MsgKind::Commit => &self.commit,
            MsgKind::ViewChange => &self.view_change,
        }
    }

    pub fn is_known(&self, kind: MsgKind, key: &str) -> bool {
        match self.set_for(kind).lock() {
            Ok(cache) => cache.contains(key),
            Err(_) => false,
        }
    }

    pub fn mark(&self, kind: MsgKind, key: &str) {
        if let Ok(mut cache) = self.set_for(kind).lock() {
            cache.insert(key.to_string());
        }
    }

    pub fn clear(&self) {
        for kind in [
            MsgKind::Prepare,
            MsgKind::Sign,
            MsgKind::Commit,
            MsgKind::ViewChange,
        ] {
            if let Ok(mut cache) = self.set_for(kind).lock() {
                cache.clear();
            }
        }
    }
}

/// One connected peer, as seen by the engine.
pub trait PeerCapability: Send + Sync {
    /// The peer's node identity.
    fn node_id(&self) -> VerifyingKey;

    /// Enqueue a consensus packet to the peer. Must not block.
    fn send(&self, kind: MsgKind, payload: &[u8]);

    /// The peer's known-message sets.
    fn known(&self) -> &KnownMsgSets;

    fn is_known(&self, kind: MsgKind, key: &str) -> bool {
        self.known().is_known(kind, key)
    }

    fn mark_known(&self, kind: MsgKind, key: &str) {
        self.known().mark(kind, key)
    }

    fn clear_known(&self) {
        self.known().clear()
    }
}

/// The set of peer connections, as seen by the engine.
pub trait PeerHost: Send + Sync {
    /// Call `f` for each connected peer; stop early if `f` returns false.
    fn foreach_peer(&self, f: &mut dyn FnMut(&Arc<dyn PeerCapability>) -> bool);

    /// Whether a node is currently connected.
    fn is_connected(&self, node: &VerifyingKey) -> bool;
}

/// The engine's sending side: broadcast with per-peer duplicate suppression.
pub(crate) struct GossipHandle {
    host: Weak<dyn PeerHost>,
}

impl GossipHandle {
    pub(crate) fn new(host: Weak<dyn PeerHost>) -> GossipHandle {
        GossipHandle { host }
    }

    /// Broadcast `payload` under `key` to every connected miner not in `filter`. Peers in
    /// `filter` (the transport sender and the original author of a relayed message) have
    /// the key marked without a send — they hold the message already. Returns false if
    /// the host is gone.
    pub(crate) fn broadcast(
        &self,
        miners: &MinerSet,
        key: &str,
        kind: MsgKind,
        payload: &[u8],
        filter: &HashSet<VerifyingKey>,
    ) -> bool {
        let host = match self.host.upgrade() {
            Some(host) => host,
            None => return false,
        };

        host.foreach_peer(&mut |peer| {
            let node = peer.node_id();
            // Consensus messages are not broadcast to observer nodes.
            if !miners.contains(&node) {
                return true;
            }
            if filter.contains(&node) {
                peer.mark_known(kind, key);
                return true;
            }
            if peer.is_known(kind, key) {
                return true;
            }
            log::trace!("broadcast, kind={:?}, key={}", kind, key);
            peer.send(kind, payload);
            peer.mark_known(kind, key);
            true
        });
        true
    }

    /// Whether a node is currently connected, or `None` if the host is gone.
    pub(crate) fn is_connected(&self, node: &VerifyingKey) -> Option<bool> {
        self.host.upgrade().map(|host| host.is_connected(node))
    }

    /// Wipe all four known-message sets on every peer. Invoked only when the engine
    /// replays a committed prepare after a restart, so the replay is delivered.
    pub(crate) fn clear_masks(&self) {
        if let Some(host) = self.host.upgrade() {
            host.foreach_peer(&mut |peer| {
                peer.clear_known();
                true
            });
        }
    }
}

/// An inbound message, tagged with the resolved sender identity.
pub struct MsgEnvelope {
    pub idx: MinerIndex,
    pub node: VerifyingKey,
    pub kind: MsgKind,
    pub payload: Vec<u8>,
    /// The peer the message arrived on. Used for the occasional unicast reply (the
    /// view-change motivation path) and nothing else.
    pub peer: Weak<dyn PeerCapability>,
}

/// The receiving end the networking provider pushes inbound packets into.
///
/// Envelopes with an unknown kind tag or from a node outside the current miner roster are
/// dropped here; everything else is queued for the engine's worker.
#[derive(Clone)]
pub struct MsgInlet {
    queue: Sender<MsgEnvelope>,
    roster: Arc<Mutex<MinerSet>>,
}

impl MsgInlet {
    pub(crate) fn new(queue: Sender<MsgEnvelope>, roster: Arc<Mutex<MinerSet>>) -> MsgInlet {
        MsgInlet { queue, roster }
    }

    /// Route one inbound consensus packet into the engine queue.
    pub fn on_consensus_msg(
        &self,
        kind_tag: u8,
        node: VerifyingKey,
        payload: Vec<u8>,
        peer: Weak<dyn PeerCapability>,
    ) {
        let kind = match MsgKind::from_tag(kind_tag) {
            Some(kind) => kind,
            None => {
                log::warn!("recv an illegal msg, tag={}", kind_tag);
                return;
            }
        };

        let idx = match self.roster.lock() {
            Ok(roster) => roster.index_of(&node),
            Err(_) => None,
        };
        let idx = match idx {
            Some(idx) => idx,
            None => {
                log::info!("recv a pbft msg from unknown peer, kind={:?}", kind);
                return;
            }
        };

        let _ = self.queue.send(MsgEnvelope {
            idx,
            node,
            kind,
            payload,
            peer,
        });
    }
}
