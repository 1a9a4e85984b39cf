/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replica state machine: the three-phase flow, view change, and everything either
//! one touches.
//!
//! All state in this module is owned by [`Replica`] and mutated under the engine mutex
//! only; the [worker](crate::engine::worker) and the public methods of
//! [`PbftEngine`](crate::engine::PbftEngine) are the only callers. A handler never blocks
//! while holding the mutex, with two deliberate exceptions: the durable
//! [`BackupStore::put`] during commit-quorum handling (required by the crash model — the
//! COMMIT must not leave before the promise is on disk), and the synchronous block
//! re-execution during PREPARE handling.
//!
//! ## Phases
//!
//! Within one `(height, view)` a replica emits at most one PREPARE (leader only), one
//! SIGN, one COMMIT, and one VIEWCHANGE per target view:
//! 1. the leader broadcasts a [`Prepare`] carrying the proposed block;
//! 2. each miner re-executes the block, and if the re-derived no-seal hash matches the
//!    leader's, broadcasts a [`Sign`];
//! 3. a miner holding a sign quorum persists the prepare as its *committed prepare* and
//!    broadcasts a [`Commit`];
//! 4. a miner holding both quorums assembles the seal out of its commit cache and
//!    reports the sealed block upward, once per hash.
//!
//! A replica whose committed prepare never reached the chain (crash, lost commits) stays
//! locked on it: conflicting proposals at that height are refused, and the prepare is
//! replayed the next time the replica would otherwise lead.

use std::{
    cmp::{max, min},
    collections::{BTreeMap, HashMap, HashSet},
    ops::Bound,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use indexmap::IndexMap;

use crate::app::App;
use crate::backup::{backup_value, reload_value, BackupStore, COMMITTED_PREPARE_KEY};
use crate::config::Configuration;
use crate::messages::{
    Commit, ConsensusHeader, ConsensusMessage, MsgKind, Prepare, Sign, ViewChange,
};
use crate::networking::{GossipHandle, MsgEnvelope, PeerCapability};
use crate::types::block::{seal_block, BlockHeader, SealSignature};
use crate::types::crypto_primitives::{verify, Keypair};
use crate::types::data_types::{
    BlockBytes, BlockHeight, CryptoHash, MinerIndex, Timestamp, ViewNumber,
};
use crate::types::roster::{MinerSet, NodeDirectory, Role};

/// Bound on the exponential back-off exponent of the view timeout.
const MAX_CHANGE_CYCLE: u32 = 20;

/// How often stale cache entries are swept out.
const COLLECT_INTERVAL: Duration = Duration::from_secs(60);

/// A message deeper than this below the chain head is not relayed to other peers.
const RELAY_WINDOW: u64 = 10;

/// Callback invoked with the sealed block bytes once commit quorum is reached.
/// The second argument is whether the local replica proposed the block.
pub type OnSealGenerated = Box<dyn FnMut(Vec<u8>, bool) + Send>;

pub(crate) struct Replica<A: App, B: BackupStore> {
    keypair: Keypair,
    pub(crate) config: Configuration,
    app: A,
    backup: B,
    gossip: GossipHandle,
    directory: Arc<dyn NodeDirectory>,
    /// Roster snapshot shared with the [`MsgInlet`](crate::networking::MsgInlet);
    /// refreshed on every successful `reset_config`.
    shared_roster: Arc<Mutex<MinerSet>>,

    // Identity, re-derived at height boundaries.
    miners: MinerSet,
    node_idx: MinerIndex,
    role: Role,
    cfg_err: bool,

    // Progression through heights and views.
    highest_block: Option<BlockHeader>,
    consensus_block_number: BlockHeight,
    view: ViewNumber,
    to_view: ViewNumber,
    change_cycle: u32,
    leader_failed: bool,
    empty_block_flag: bool,
    last_consensus_time: Timestamp,
    last_sign_time: Timestamp,
    last_exec_finish_time: Timestamp,
    last_collect_time: Instant,

    // Caches. `raw_prepare` is the prepare as received, `prepare` the one rewritten
    // against the locally re-executed block, `committed_prepare` the one this replica
    // has durably promised to.
    raw_prepare: Option<Prepare>,
    prepare: Option<Prepare>,
    committed_prepare: Option<Prepare>,
    sign_cache: HashMap<CryptoHash, IndexMap<String, Sign>>,
    commit_cache: HashMap<CryptoHash, IndexMap<String, Commit>>,
    view_change_cache: BTreeMap<ViewNumber, BTreeMap<MinerIndex, ViewChange>>,
    sealed: HashSet<CryptoHash>,
    future_prepare: Option<(MinerIndex, Prepare)>,

    on_seal_generated: OnSealGenerated,
}

impl<A: App, B: BackupStore> Replica<A, B> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        app: A,
        backup: B,
        gossip: GossipHandle,
        directory: Arc<dyn NodeDirectory>,
        shared_roster: Arc<Mutex<MinerSet>>,
        keypair: Keypair,
        config: Configuration,
        on_seal_generated: OnSealGenerated,
    ) -> Replica<A, B> {
        let mut replica = Replica {
            keypair,
            config,
            app,
            backup,
            gossip,
            directory,
            shared_roster,
            miners: MinerSet::default(),
            node_idx: MinerIndex::new(0),
            role: Role::Observer,
            cfg_err: true,
            highest_block: None,
            consensus_block_number: BlockHeight::new(0),
            view: ViewNumber::init(),
            to_view: ViewNumber::init(),
            change_cycle: 0,
            leader_failed: false,
            empty_block_flag: false,
            last_consensus_time: Timestamp::now(),
            last_sign_time: Timestamp::zero(),
            last_exec_finish_time: Timestamp::now(),
            last_collect_time: Instant::now(),
            raw_prepare: None,
            prepare: None,
            committed_prepare: None,
            sign_cache: HashMap::new(),
            commit_cache: HashMap::new(),
            view_change_cache: BTreeMap::new(),
            sealed: HashSet::new(),
            future_prepare: None,
            on_seal_generated,
        };
        replica.reset_config();
        replica.reload_committed_prepare();
        replica
    }

    /// Re-read the committed prepare from the backup store, so a crash between
    /// sign-quorum and block persistence does not lose the replica's promise.
    fn reload_committed_prepare(&mut self) {
        match self.backup.get(COMMITTED_PREPARE_KEY) {
            Ok(Some(value)) => match reload_value(&value) {
                Ok(prepare) => {
                    log::info!(
                        "reloaded committed prepare, blk={}, hash={}, idx={}",
                        prepare.header.height,
                        prepare.header.block_hash,
                        prepare.header.idx
                    );
                    self.committed_prepare = Some(prepare);
                }
                Err(err) => log::warn!("reload of committed prepare failed: {}", err),
            },
            Ok(None) => {}
            Err(err) => log::warn!("reload of committed prepare failed: {}", err),
        }
    }

    /// Re-derive the miner roster and the local identity from the node directory.
    /// On an inconsistent snapshot the replica stops sealing until a later snapshot
    /// resolves it.
    pub(crate) fn reset_config(&mut self) {
        let records = self.directory.nodes_at(None);
        let my_key = self.keypair.public();

        let role = match records
            .iter()
            .find(|record| record.public_key == my_key)
            .map(|record| record.role)
        {
            Some(role) => role,
            None => {
                log::warn!("reset_config failed: can't find own record, stop sealing");
                self.cfg_err = true;
                return;
            }
        };

        let miners = match MinerSet::from_records(&records) {
            Ok(miners) => miners,
            Err(err) => {
                log::warn!("reset_config failed: {}, stop sealing", err);
                self.cfg_err = true;
                return;
            }
        };

        let node_idx = match miners.index_of(&my_key) {
            Some(idx) => idx,
            None => {
                log::info!("reset_config: local key not in miner roster, stop sealing");
                self.cfg_err = true;
                return;
            }
        };

        if miners.count() != self.miners.count() || node_idx != self.node_idx {
            self.prepare = None;
            self.sign_cache.clear();
            self.view_change_cache.clear();
            self.sealed.clear();
            log::info!(
                "reset_config success: node_idx={}, miner_count={}",
                node_idx,
                miners.count()
            );
        }
        self.miners = miners;
        self.node_idx = node_idx;
        self.role = role;
        self.cfg_err = false;

        if let Ok(mut shared) = self.shared_roster.lock() {
            *shared = self.miners.clone();
        }
    }

    pub(crate) fn set_omit_empty_block(&mut self, omit: bool) {
        self.config.omit_empty_block = omit;
    }

    /// The leader at the current `(height, view)`, if the replica is in a state to
    /// follow one.
    fn leader(&self) -> Option<MinerIndex> {
        if self.cfg_err || self.leader_failed {
            return None;
        }
        let highest = self.highest_block.as_ref()?;
        Some(self.miners.leader_at(self.view, highest.height))
    }

    /// Whether the local replica should propose the next block. As a side effect,
    /// replays a committed-but-unsaved prepare, and forces a fast view change when the
    /// current leader is disconnected.
    pub(crate) fn should_seal(&mut self) -> bool {
        if self.cfg_err || self.role != Role::Miner {
            return false;
        }

        let leader = match self.leader() {
            Some(leader) => leader,
            None => return false,
        };

        if leader != self.node_idx {
            if let Some(leader_key) = self.miners.public_key_of(leader).copied() {
                if self.gossip.is_connected(&leader_key) == Some(false) {
                    log::warn!("leader {} disconnected, forcing view change", leader);
                    self.last_consensus_time = Timestamp::zero();
                    self.last_sign_time = Timestamp::zero();
                }
            }
            return false;
        }

        if let Some(committed) = &self.committed_prepare {
            if committed.header.height == self.consensus_block_number {
                let raw_height = self.raw_prepare.as_ref().map(|raw| raw.header.height);
                if raw_height != Some(self.consensus_block_number) {
                    let committed = committed.clone();
                    self.replay_committed_prepare(committed);
                }
                return false;
            }
        }

        true
    }

    /// Post a committed but unsaved prepare out again. The known-message masks are
    /// cleared first so peers accept the redelivery.
    fn replay_committed_prepare(&mut self, committed: Prepare) {
        log::info!(
            "should_seal: found a committed but unsaved block, posting it out again, hash={}",
            committed.header.block_hash
        );
        self.gossip.clear_masks();

        let req = Prepare::new(
            &self.keypair,
            committed.header.height,
            self.view,
            self.node_idx,
            committed.header.block_hash,
            committed.block,
        );
        let body = ConsensusMessage::from(req.clone()).encode_body();
        self.gossip.broadcast(
            &self.miners,
            &req.header.unique_key(),
            MsgKind::Prepare,
            &body,
            &HashSet::new(),
        );
        self.handle_prepare(self.node_idx, req, true);
    }

    /// Leader path: broadcast a PREPARE for the candidate block and remember it as the
    /// raw prepare. Returns the view the prepare was issued in, which the caller quotes
    /// back through [`generate_commit`](Self::generate_commit).
    pub(crate) fn generate_seal(&mut self, header: &BlockHeader, block: &BlockBytes) -> ViewNumber {
        let view = self.view;
        if !self.broadcast_prepare(header, block) {
            log::error!(
                "broadcast of prepare failed, blk={}, hash={}",
                header.height,
                header.hash_without_seal()
            );
        }
        view
    }

    /// Single-node fast path: install the candidate block as the local prepare and sign
    /// it immediately. Fails if the view moved on since [`generate_seal`](Self::generate_seal).
    pub(crate) fn generate_commit(
        &mut self,
        header: &BlockHeader,
        block: &BlockBytes,
        claimed_view: ViewNumber,
    ) -> bool {
        if claimed_view != self.view {
            log::info!(
                "view has changed, generate_commit failed, claimed_view={}, view={}",
                claimed_view,
                self.view
            );
            return false;
        }

        let req = Prepare::new(
            &self.keypair,
            header.height,
            claimed_view,
            self.node_idx,
            header.hash_without_seal(),
            block.clone(),
        );
        self.add_prepare(req.clone());
        if self.broadcast_sign(req.header.height, req.header.view, req.header.block_hash) {
            self.check_and_commit();
        }
        true
    }

    fn broadcast_prepare(&mut self, header: &BlockHeader, block: &BlockBytes) -> bool {
        let req = Prepare::new(
            &self.keypair,
            header.height,
            self.view,
            self.node_idx,
            header.hash_without_seal(),
            block.clone(),
        );
        let body = ConsensusMessage::from(req.clone()).encode_body();
        if self.gossip.broadcast(
            &self.miners,
            &req.header.unique_key(),
            MsgKind::Prepare,
            &body,
            &HashSet::new(),
        ) {
            self.add_raw_prepare(req);
            true
        } else {
            false
        }
    }

    fn broadcast_sign(
        &mut self,
        height: BlockHeight,
        view: ViewNumber,
        block_hash: CryptoHash,
    ) -> bool {
        let sign = Sign::new(&self.keypair, height, view, self.node_idx, block_hash);
        let body = ConsensusMessage::from(sign.clone()).encode_body();
        if self.gossip.broadcast(
            &self.miners,
            &sign.header.unique_key(),
            MsgKind::Sign,
            &body,
            &HashSet::new(),
        ) {
            self.add_sign(sign);
            true
        } else {
            false
        }
    }

    fn broadcast_commit(
        &mut self,
        height: BlockHeight,
        view: ViewNumber,
        block_hash: CryptoHash,
    ) -> bool {
        let commit = Commit::new(&self.keypair, height, view, self.node_idx, block_hash);
        let body = ConsensusMessage::from(commit.clone()).encode_body();
        if self.gossip.broadcast(
            &self.miners,
            &commit.header.unique_key(),
            MsgKind::Commit,
            &body,
            &HashSet::new(),
        ) {
            self.add_commit(commit);
            true
        } else {
            false
        }
    }

    fn broadcast_view_change(&mut self) -> bool {
        if self.role != Role::Miner {
            log::info!("broadcast of view change given up for not miner");
            return true;
        }
        let highest = match &self.highest_block {
            Some(highest) => highest.clone(),
            None => return true,
        };

        if !self.empty_block_flag {
            log::warn!(
                "view change, blk={}, to_view={}",
                highest.height,
                self.to_view
            );
        }
        self.empty_block_flag = false;

        let req = ViewChange::new(
            &self.keypair,
            highest.height,
            self.to_view,
            self.node_idx,
            highest.hash_without_seal(),
        );
        let body = ConsensusMessage::from(req.clone()).encode_body();
        self.gossip.broadcast(
            &self.miners,
            &req.header.unique_key(),
            MsgKind::ViewChange,
            &body,
            &HashSet::new(),
        )
    }

    /// Decode and dispatch one inbound envelope, then relay it on to peers that have not
    /// seen it yet.
    pub(crate) fn handle_msg(&mut self, envelope: MsgEnvelope) {
        let msg = match ConsensusMessage::decode_body(envelope.kind, &envelope.payload) {
            Ok(msg) => msg,
            Err(err) => {
                log::warn!(
                    "recv a malformed pbft msg, kind={:?}, from={}: {}",
                    envelope.kind,
                    envelope.idx,
                    err
                );
                return;
            }
        };
        let header = msg.header().clone();

        match msg {
            ConsensusMessage::Prepare(req) => self.handle_prepare(envelope.idx, req, false),
            ConsensusMessage::Sign(req) => self.handle_sign(envelope.idx, req),
            ConsensusMessage::Commit(req) => self.handle_commit(envelope.idx, req),
            ConsensusMessage::ViewChange(req) => {
                self.handle_view_change(envelope.idx, req, envelope.peer.clone())
            }
        }

        // Gossip relay: only first-hop messages (header author == transport sender) are
        // forwarded, and only while they are not deep below the chain head.
        let within_window = match &self.highest_block {
            Some(highest) => {
                header.height > highest.height || highest.height - header.height < RELAY_WINDOW
            }
            None => false,
        };
        if within_window && header.idx == envelope.idx {
            let mut filter = HashSet::new();
            filter.insert(envelope.node);
            if let Some(author) = self.miners.public_key_of(header.idx) {
                filter.insert(*author);
            }
            self.gossip.broadcast(
                &self.miners,
                &header.unique_key(),
                envelope.kind,
                &envelope.payload,
                &filter,
            );
        }
    }

    pub(crate) fn handle_prepare(&mut self, from: MinerIndex, req: Prepare, self_generated: bool) {
        log::debug!(
            "handle_prepare: idx={}, view={}, blk={}, hash={}, from={}",
            req.header.idx,
            req.header.view,
            req.header.height,
            req.header.block_hash,
            from
        );

        if self.raw_prepare.as_ref().map(|raw| raw.header.block_hash)
            == Some(req.header.block_hash)
        {
            log::trace!("discard a prepare, duplicated");
            return;
        }

        if !self_generated && req.header.idx == self.node_idx {
            log::warn!("discard a prepare, own req echoed back");
            return;
        }

        if req.header.height < self.consensus_block_number || req.header.view < self.view {
            log::trace!("discard a prepare, lower than the needed blk");
            return;
        }

        if req.header.height > self.consensus_block_number || req.header.view > self.view {
            log::info!(
                "recv a future block, deferred, blk={}, view={}",
                req.header.height,
                req.header.view
            );
            self.recv_future_block(from, req);
            return;
        }

        if self.leader() != Some(req.header.idx) {
            log::warn!("discard a prepare, not from the leader, idx={}", req.header.idx);
            return;
        }

        if let Some(committed) = &self.committed_prepare {
            if req.header.height == committed.header.height
                && req.header.block_hash != committed.header.block_hash
            {
                log::info!(
                    "discard a prepare, locked on a committed but unsaved block, hash={}",
                    committed.header.block_hash
                );
                return;
            }
        }

        if !self.check_sign(&req.header) {
            log::warn!("discard a prepare, signature check failed");
            return;
        }

        // Installing the raw prepare resets `prepare`: a leader that issues more than
        // one prepare restarts the flow from here. It must happen after the
        // committed-prepare refusal above, or a conflicting proposal could evict the
        // promise this replica is locked on.
        self.add_raw_prepare(req.clone());

        log::trace!(
            "start exec tx, blk={}, hash={}",
            req.header.height,
            req.header.block_hash
        );
        let executed = match self.app.execute_block(&req.header.block_hash, &req.block) {
            Ok(executed) => executed,
            Err(err) => {
                log::warn!("discard a prepare, {}", err);
                return;
            }
        };
        if executed.header.hash_without_seal() != req.header.block_hash {
            log::warn!("discard a prepare, block_hash is not equal to block data");
            return;
        }
        self.last_exec_finish_time = Timestamp::now();
        log::trace!(
            "finish exec tx, blk={}, time={}",
            req.header.height,
            self.last_exec_finish_time
        );

        if executed.pending_transactions == 0 && self.config.omit_empty_block {
            self.change_view_for_empty_block();
            return;
        }

        self.app.add_block_cache(&executed);

        // Rebuild the prepare against the locally executed block; the SIGN that follows
        // vouches for this replica's own execution, not the leader's bytes.
        let real_hash = executed.header.hash_without_seal();
        let new_req = Prepare {
            header: ConsensusHeader::new(
                &self.keypair,
                req.header.height,
                req.header.view,
                req.header.idx,
                real_hash,
            ),
            block: executed.bytes,
        };
        self.add_prepare(new_req.clone());

        if self.role == Role::Miner
            && !self.broadcast_sign(new_req.header.height, new_req.header.view, real_hash)
        {
            log::warn!("broadcast of sign failed, blk={}", new_req.header.height);
        }

        log::info!(
            "handle_prepare success, blk={}, real_block_hash={}",
            new_req.header.height,
            real_hash
        );

        self.check_and_commit();
    }

    pub(crate) fn handle_sign(&mut self, from: MinerIndex, req: Sign) {
        log::debug!(
            "handle_sign: idx={}, view={}, blk={}, hash={}, from={}",
            req.header.idx,
            req.header.view,
            req.header.height,
            req.header.block_hash,
            from
        );

        if self.is_exist_sign(&req) {
            log::trace!("discard a sign, duplicated");
            return;
        }

        if req.header.idx == self.node_idx {
            log::warn!("discard a sign, own req echoed back");
            return;
        }

        let prepare_view = match &self.prepare {
            Some(prepare) if prepare.header.block_hash == req.header.block_hash => {
                prepare.header.view
            }
            _ => {
                // Not the block under agreement right now. Signs for a later height or
                // view are cached speculatively and counted once the prepare arrives.
                let future = req.header.height >= self.consensus_block_number
                    || req.header.view > self.view;
                if future && self.check_sign(&req.header) {
                    log::info!(
                        "cache a sign for a future block, blk={}, hash={}",
                        req.header.height,
                        req.header.block_hash
                    );
                    self.add_sign(req);
                }
                return;
            }
        };

        if prepare_view != req.header.view {
            log::info!(
                "discard a sign, view mismatch, sign.view={}, prepare.view={}",
                req.header.view,
                prepare_view
            );
            return;
        }

        if !self.check_sign(&req.header) {
            log::warn!("discard a sign, signature check failed");
            return;
        }

        self.add_sign(req);
        self.check_and_commit();
    }

    pub(crate) fn handle_commit(&mut self, from: MinerIndex, req: Commit) {
        log::debug!(
            "handle_commit: idx={}, view={}, blk={}, hash={}, from={}",
            req.header.idx,
            req.header.view,
            req.header.height,
            req.header.block_hash,
            from
        );

        if self.is_exist_commit(&req) {
            log::trace!("discard a commit, duplicated");
            return;
        }

        if req.header.idx == self.node_idx {
            log::warn!("discard a commit, own req echoed back");
            return;
        }

        let prepare_view = match &self.prepare {
            Some(prepare) if prepare.header.block_hash == req.header.block_hash => {
                prepare.header.view
            }
            _ => {
                let future = req.header.height >= self.consensus_block_number
                    || req.header.view > self.view;
                if future && self.check_sign(&req.header) {
                    log::info!(
                        "cache a commit for a future block, blk={}, hash={}",
                        req.header.height,
                        req.header.block_hash
                    );
                    self.add_commit(req);
                }
                return;
            }
        };

        if prepare_view != req.header.view {
            log::info!(
                "discard a commit, view mismatch, commit.view={}, prepare.view={}",
                req.header.view,
                prepare_view
            );
            return;
        }

        if !self.check_sign(&req.header) {
            log::warn!("discard a commit, signature check failed");
            return;
        }

        self.add_commit(req);
        self.check_and_save();
    }

    pub(crate) fn handle_view_change(
        &mut self,
        from: MinerIndex,
        req: ViewChange,
        peer: Weak<dyn PeerCapability>,
    ) {
        log::debug!(
            "handle_view_change: idx={}, view={}, blk={}, hash={}, from={}",
            req.header.idx,
            req.header.view,
            req.header.height,
            req.header.block_hash,
            from
        );

        if self.is_exist_view_change(&req) {
            log::trace!("discard a view change, duplicated");
            return;
        }

        if req.header.idx == self.node_idx {
            log::warn!("discard a view change, own req echoed back");
            return;
        }

        // Motivation: a restarted node announces a target view far behind ours. Pull it
        // forward with a unicast of our own view change. Only the original author is
        // answered, and the reply is never rebroadcast.
        if req.header.view + 1 < self.to_view && req.header.idx == from {
            if self.role != Role::Miner {
                log::info!("motivation of view change given up for not miner");
            } else if let (Some(peer), Some(highest)) = (peer.upgrade(), &self.highest_block) {
                let reply = ViewChange::new(
                    &self.keypair,
                    highest.height,
                    self.to_view,
                    self.node_idx,
                    highest.hash_without_seal(),
                );
                log::trace!(
                    "motivate view change, peer to_view={}, our to_view={}",
                    req.header.view,
                    self.to_view
                );
                peer.send(
                    MsgKind::ViewChange,
                    &ConsensusMessage::from(reply).encode_body(),
                );
            }
        }

        let highest = match &self.highest_block {
            Some(highest) => highest.clone(),
            None => return,
        };

        if req.header.height < highest.height || req.header.view <= self.view {
            log::trace!(
                "discard a view change, blk={}, view={}",
                highest.height,
                self.view
            );
            return;
        }

        if req.header.height == highest.height
            && req.header.block_hash != highest.hash_without_seal()
            && self.app.get_block(&req.header.block_hash).is_none()
        {
            log::info!(
                "discard a view change, same height but different head, mine={}, req={}",
                highest.hash_without_seal(),
                req.header.block_hash
            );
            return;
        }

        if !self.check_sign(&req.header) {
            log::warn!("discard a view change, signature check failed");
            return;
        }

        log::info!(
            "handle_view_change success, idx={}, to_view={}",
            req.header.idx,
            req.header.view
        );

        let view = req.header.view;
        self.view_change_cache
            .entry(view)
            .or_default()
            .insert(req.header.idx, req);

        if view == self.to_view {
            self.check_and_change_view();
        } else {
            self.consider_fast_forward(&highest);
        }
    }

    /// Fast-forward rule: when more than f distinct senders are already past our target
    /// view, our timers are the ones lagging. Zero them and aim just below the lowest of
    /// those views; the timeout that now fires immediately aligns `to_view` to it.
    fn consider_fast_forward(&mut self, highest: &BlockHeader) {
        let mut latest_per_sender: BTreeMap<MinerIndex, ViewNumber> = BTreeMap::new();
        let mut min_view: Option<ViewNumber> = None;
        let mut min_height: Option<BlockHeight> = None;

        let above_target = (Bound::Excluded(self.to_view), Bound::Unbounded);
        for (&view, entries) in self.view_change_cache.range(above_target) {
            for (&sender, entry) in entries {
                if entry.header.height < highest.height {
                    continue;
                }
                let newer = latest_per_sender
                    .get(&sender)
                    .map_or(true, |&prev| view > prev);
                if newer {
                    latest_per_sender.insert(sender, view);
                    if min_view.map_or(true, |m| view < m) {
                        min_view = Some(view);
                    }
                    if min_height.map_or(true, |m| entry.header.height < m) {
                        min_height = Some(entry.header.height);
                    }
                }
            }
        }

        // A replica still holding an unsaved committed prepare at the consensus height
        // must not jump ahead: its view change would reference a head the others are
        // about to move past, and they would discard it.
        let committed_height = self.committed_prepare.as_ref().map(|c| c.header.height);
        let holding_unsaved = min_height.is_some()
            && min_height == Some(self.consensus_block_number)
            && min_height == committed_height;

        if latest_per_sender.len() > self.miners.f() && !holding_unsaved {
            if let Some(min_view) = min_view {
                log::info!(
                    "fast forward view change, to_view={}, min_view={}",
                    self.to_view,
                    min_view
                );
                self.last_consensus_time = Timestamp::zero();
                self.last_sign_time = Timestamp::zero();
                self.to_view = min_view - 1;
                self.change_cycle = min(self.to_view.int() as u32, MAX_CHANGE_CYCLE);
            }
        }
    }

    /// Sign-quorum check. Runs after every sign insertion and after the local prepare is
    /// installed; fires exactly when the cache size *equals* quorum so the commit phase
    /// is entered once.
    fn check_and_commit(&mut self) {
        let (hash, height, view) = match &self.prepare {
            Some(prepare) => (
                prepare.header.block_hash,
                prepare.header.height,
                prepare.header.view,
            ),
            None => return,
        };
        let have_sign = self.sign_cache.get(&hash).map_or(0, |signs| signs.len());
        if have_sign != self.miners.quorum() {
            return;
        }

        log::info!(
            "reach enough sign for block={}, hash={}, have_sign={}, quorum={}",
            height,
            hash,
            have_sign,
            self.miners.quorum()
        );

        if view != self.view {
            log::info!(
                "view has changed, discard this block, preq.view={}, view={}",
                view,
                self.view
            );
            return;
        }

        // The raw prepare becomes the committed prepare, and the promise goes to disk
        // before any COMMIT leaves this replica.
        self.committed_prepare = self.raw_prepare.clone();
        if let Some(committed) = &self.committed_prepare {
            let value = backup_value(committed);
            if let Err(err) = self.backup.put(COMMITTED_PREPARE_KEY, &value) {
                log::warn!("backup of committed prepare failed: {}", err);
            }
        }

        if self.role == Role::Miner && !self.broadcast_commit(height, view, hash) {
            log::warn!("broadcast of commit failed, blk={}", height);
        }

        // Collecting commits may take another round trip; give it a fresh window.
        self.last_sign_time = Timestamp::now();

        self.check_and_save();
    }

    /// Commit-quorum check. When both quorums are in and this hash has not been sealed
    /// yet, assemble the seal out of the commit cache and report the block upward.
    fn check_and_save(&mut self) {
        let (hash, height, view, proposer) = match &self.prepare {
            Some(prepare) => (
                prepare.header.block_hash,
                prepare.header.height,
                prepare.header.view,
                prepare.header.idx,
            ),
            None => return,
        };
        let have_sign = self.sign_cache.get(&hash).map_or(0, |signs| signs.len());
        let have_commit = self.commit_cache.get(&hash).map_or(0, |commits| commits.len());
        let quorum = self.miners.quorum();
        if have_sign < quorum || have_commit < quorum || self.sealed.contains(&hash) {
            return;
        }
        self.sealed.insert(hash);

        log::info!(
            "reach enough commit for block={}, hash={}, have_sign={}, have_commit={}, quorum={}",
            height,
            hash,
            have_sign,
            have_commit,
            quorum
        );

        if view != self.view {
            log::info!(
                "view has changed, discard this block, preq.view={}, view={}",
                view,
                self.view
            );
            return;
        }

        match &self.highest_block {
            Some(highest) if height > highest.height => {}
            _ => {
                log::info!("discard this block, blk={}", height);
                return;
            }
        }

        let sig_list: Vec<SealSignature> = self
            .commit_cache
            .get(&hash)
            .into_iter()
            .flat_map(|commits| commits.values())
            .map(|commit| SealSignature {
                idx: commit.header.idx,
                sig: commit.header.sig,
            })
            .collect();

        let block = match &self.prepare {
            Some(prepare) => &prepare.block,
            None => return,
        };
        match seal_block(block.bytes(), &sig_list) {
            Ok(sealed) => {
                log::info!(
                    "sealed block ready, blk={}, hash={}, sigs={}",
                    height,
                    hash,
                    sig_list.len()
                );
                let is_local = proposer == self.node_idx;
                (self.on_seal_generated)(sealed, is_local);
            }
            Err(err) => log::warn!("seal assembly failed, blk={}: {}", height, err),
        }
    }

    /// View-change quorum check. The replica's own broadcast counts implicitly, hence
    /// quorum − 1 received entries suffice.
    fn check_and_change_view(&mut self) {
        let count = self
            .view_change_cache
            .get(&self.to_view)
            .map_or(0, |entries| entries.len());
        if count < self.miners.quorum().saturating_sub(1) {
            return;
        }

        log::info!("reach enough view change, to_view={}", self.to_view);
        self.leader_failed = false;
        self.view = self.to_view;

        self.raw_prepare = None;
        self.prepare = None;
        self.sign_cache.clear();
        self.commit_cache.clear();
        self.sealed.clear();

        let view = self.view;
        self.view_change_cache.retain(|&v, _| v > view);

        // Peer masks are left alone: clearing them here would rebroadcast a pile of
        // old messages.
    }

    /// Check whether the view deadline has expired, and if so start (or continue) a view
    /// change. Returns true when a timeout fired, so the caller can run the view-change
    /// callback outside the engine lock.
    pub(crate) fn check_timeout(&mut self) -> bool {
        let now = Timestamp::now();
        let last = max(self.last_consensus_time, self.last_sign_time);
        let interval =
            (self.config.view_timeout.as_millis() as f64 * 1.5f64.powi(self.change_cycle as i32))
                as u64;
        if now.millis_since(last) < interval {
            return false;
        }

        self.leader_failed = true;
        self.to_view += 1;
        self.change_cycle = min(self.change_cycle + 1, MAX_CHANGE_CYCLE);
        self.last_consensus_time = now;

        // Entries at the target view that reference a stale or conflicting head carry
        // no weight toward the change.
        if let Some(highest) = self.highest_block.clone() {
            let highest_hash = highest.hash_without_seal();
            if let Some(entries) = self.view_change_cache.get_mut(&self.to_view) {
                entries.retain(|_, entry| {
                    entry.header.height > highest.height
                        || (entry.header.height == highest.height
                            && entry.header.block_hash == highest_hash)
                });
            }
        }

        log::info!(
            "view timeout, blk={}, view={}, to_view={}, change_cycle={}",
            self.highest_block
                .as_ref()
                .map_or(0, |highest| highest.height.int()),
            self.view,
            self.to_view,
            self.change_cycle
        );

        if !self.broadcast_view_change() {
            log::warn!("broadcast of view change failed");
            return true;
        }
        self.check_and_change_view();
        true
    }

    /// Skip an empty proposal by timing the current leader out immediately. The
    /// `leader_failed` flag keeps the same leader from re-proposing its empty block
    /// before the view moves.
    pub(crate) fn change_view_for_empty_block(&mut self) {
        log::info!(
            "empty block proposed, changing view, to_view={}",
            self.to_view
        );
        self.last_consensus_time = Timestamp::zero();
        self.last_sign_time = Timestamp::zero();
        self.change_cycle = 0;
        self.empty_block_flag = true;
        self.leader_failed = true;
    }

    /// A block made it to the chain: advance to the next height and reset per-height
    /// state.
    pub(crate) fn report_block(&mut self, header: &BlockHeader) {
        self.highest_block = Some(header.clone());

        if header.height >= self.consensus_block_number {
            self.view = ViewNumber::init();
            self.to_view = ViewNumber::init();
            self.change_cycle = 0;
            self.leader_failed = false;
            self.last_consensus_time = Timestamp::now();
            self.consensus_block_number = header.height + 1;
            self.del_view_change();
        }

        self.reset_config();
        self.del_cache(&header.hash_without_seal());

        log::info!(
            "report: blk={}, hash={}, next blk={}",
            header.height,
            header.hash_without_seal(),
            self.consensus_block_number
        );
    }

    /// Replay the buffered future prepare once it has become current.
    pub(crate) fn handle_future_block(&mut self) {
        let ready = self.future_prepare.as_ref().map_or(false, |(_, req)| {
            req.header.height == self.consensus_block_number && req.header.view == self.view
        });
        if ready {
            if let Some((from, req)) = self.future_prepare.take() {
                log::info!("handle deferred block, blk={}", req.header.height);
                self.handle_prepare(from, req, false);
            }
        }
    }

    /// Sweep cache entries for heights the chain has moved past. Runs at most once per
    /// [`COLLECT_INTERVAL`].
    pub(crate) fn collect_garbage(&mut self) {
        let highest = match &self.highest_block {
            Some(highest) => highest.height,
            None => return,
        };
        if self.last_collect_time.elapsed() < COLLECT_INTERVAL {
            return;
        }

        let sealed = &mut self.sealed;
        self.sign_cache.retain(|hash, signs| {
            signs.retain(|_, sign| sign.header.height >= highest);
            if signs.is_empty() {
                sealed.remove(hash);
                false
            } else {
                true
            }
        });
        self.commit_cache.retain(|_, commits| {
            commits.retain(|_, commit| commit.header.height >= highest);
            !commits.is_empty()
        });
        self.view_change_cache.retain(|_, entries| {
            entries.retain(|_, entry| entry.header.height >= highest);
            !entries.is_empty()
        });

        self.last_collect_time = Instant::now();
    }

    /// Verify every incoming chain block: its recorded roster must match the miner list
    /// at the previous height, and it must carry a quorum of valid seal signatures over
    /// its no-seal hash.
    pub(crate) fn check_block_sign(
        &self,
        header: &BlockHeader,
        sig_list: &[SealSignature],
    ) -> bool {
        let prev_height = match header.height.prev() {
            Some(height) => height,
            None => {
                log::warn!("check_block_sign failed, no roster below blk={}", header.height);
                return false;
            }
        };

        let records = self.directory.nodes_at(Some(prev_height));
        let miners = match MinerSet::from_records(&records) {
            Ok(miners) => miners,
            Err(err) => {
                log::warn!(
                    "check_block_sign failed for blk={}, roster error: {}",
                    prev_height,
                    err
                );
                return false;
            }
        };

        if header.node_list != miners.key_bytes() {
            log::warn!(
                "check_block_sign failed, node list mismatch, blk={}, miner_count={}",
                header.height,
                miners.count()
            );
            return false;
        }

        if sig_list.len() < miners.quorum() {
            log::warn!(
                "check_block_sign failed, not enough sign, blk={}, sign_num={}, quorum={}",
                header.height,
                sig_list.len(),
                miners.quorum()
            );
            return false;
        }

        let hash = header.hash_without_seal();
        for seal_sig in sig_list {
            let public_key = match miners.public_key_of(seal_sig.idx) {
                Some(public_key) => public_key,
                None => {
                    log::warn!(
                        "check_block_sign failed, sig idx={} out of bounds, blk={}",
                        seal_sig.idx,
                        header.height
                    );
                    return false;
                }
            };
            if !verify(public_key, &seal_sig.sig, &hash) {
                log::warn!(
                    "check_block_sign failed, verify false, blk={}, hash={}",
                    header.height,
                    hash
                );
                return false;
            }
        }

        true
    }

    fn check_sign(&self, header: &ConsensusHeader) -> bool {
        match self.miners.public_key_of(header.idx) {
            Some(public_key) => header.verify(public_key),
            None => {
                log::warn!("can't find miner, idx={}", header.idx);
                false
            }
        }
    }

    fn recv_future_block(&mut self, from: MinerIndex, req: Prepare) {
        let already_buffered = self
            .future_prepare
            .as_ref()
            .map(|(_, buffered)| buffered.header.block_hash)
            == Some(req.header.block_hash);
        if !already_buffered {
            log::info!(
                "buffer a future prepare, blk={}, hash={}, idx={}",
                req.header.height,
                req.header.block_hash,
                req.header.idx
            );
            self.future_prepare = Some((from, req));
        }
    }

    fn add_raw_prepare(&mut self, req: Prepare) {
        log::debug!(
            "add_raw_prepare: raw_prepare={}, reset prepare cache",
            req.header.block_hash
        );
        self.raw_prepare = Some(req);
        self.prepare = None;
    }

    fn add_prepare(&mut self, req: Prepare) {
        // Sign and commit entries that voted under another view do not count toward
        // this prepare.
        let view = req.header.view;
        if let Some(signs) = self.sign_cache.get_mut(&req.header.block_hash) {
            signs.retain(|_, sign| sign.header.view == view);
        }
        if let Some(commits) = self.commit_cache.get_mut(&req.header.block_hash) {
            commits.retain(|_, commit| commit.header.view == view);
        }
        self.prepare = Some(req);
    }

    fn add_sign(&mut self, req: Sign) {
        self.sign_cache
            .entry(req.header.block_hash)
            .or_default()
            .insert(req.header.sig.hex(), req);
    }

    fn add_commit(&mut self, req: Commit) {
        self.commit_cache
            .entry(req.header.block_hash)
            .or_default()
            .insert(req.header.sig.hex(), req);
    }

    fn is_exist_sign(&self, req: &Sign) -> bool {
        self.sign_cache
            .get(&req.header.block_hash)
            .map_or(false, |signs| signs.contains_key(&req.header.sig.hex()))
    }

    fn is_exist_commit(&self, req: &Commit) -> bool {
        self.commit_cache
            .get(&req.header.block_hash)
            .map_or(false, |commits| commits.contains_key(&req.header.sig.hex()))
    }

    fn is_exist_view_change(&self, req: &ViewChange) -> bool {
        self.view_change_cache
            .get(&req.header.view)
            .map_or(false, |entries| entries.contains_key(&req.header.idx))
    }

    /// Drop sign/commit entries and the one-shot flag for a hash that reached the chain.
    fn del_cache(&mut self, hash: &CryptoHash) {
        self.sign_cache.remove(hash);
        self.commit_cache.remove(hash);
        if self.prepare.as_ref().map(|prepare| prepare.header.block_hash) == Some(*hash) {
            self.prepare = None;
        }
        self.sealed.remove(hash);
    }

    /// Drop view-change entries that disagree with the new chain head. Entries for the
    /// head itself and for future heights are retained.
    fn del_view_change(&mut self) {
        let highest = match &self.highest_block {
            Some(highest) => highest.clone(),
            None => return,
        };
        let highest_hash = highest.hash_without_seal();
        for entries in self.view_change_cache.values_mut() {
            entries.retain(|_, entry| {
                entry.header.height > highest.height
                    || (entry.header.height == highest.height
                        && entry.header.block_hash == highest_hash)
            });
        }
        self.view_change_cache.retain(|_, entries| !entries.is_empty());
    }
}
