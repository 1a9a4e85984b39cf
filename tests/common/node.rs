//! One engine plus its collaborators, and helpers that drive a whole cluster.

use std::{
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use alloy_rlp::Decodable;
use ed25519_dalek::{SigningKey, VerifyingKey};

use pbft_rs::config::Configuration;
use pbft_rs::engine::{OnSealGenerated, PbftEngine};
use pbft_rs::networking::{MsgInlet, PeerHost};
use pbft_rs::types::block::{Block, BlockHeader};
use pbft_rs::types::crypto_primitives::Keypair;
use pbft_rs::types::data_types::BlockHeight;
use pbft_rs::types::roster::{NodeDirectory, NodeRecord, Role};

use super::app::{make_block, make_header, IdentityApp};
use super::backup::MemBackup;
use super::network::{mock_network, wire, MockHost};

/// A directory whose snapshot never changes: every key is a miner at its position.
pub(crate) struct StaticDirectory(Vec<NodeRecord>);

impl StaticDirectory {
    pub(crate) fn miners(keys: &[VerifyingKey]) -> StaticDirectory {
        StaticDirectory(
            keys.iter()
                .enumerate()
                .map(|(index, key)| NodeRecord {
                    public_key: *key,
                    role: Role::Miner,
                    index: index as u64,
                })
                .collect(),
        )
    }
}

impl NodeDirectory for StaticDirectory {
    fn nodes_at(&self, _height: Option<BlockHeight>) -> Vec<NodeRecord> {
        self.0.clone()
    }
}

pub(crate) struct TestNode {
    pub(crate) index: usize,
    pub(crate) public_key: VerifyingKey,
    pub(crate) engine: PbftEngine<IdentityApp, MemBackup>,
    pub(crate) seals: Receiver<(Vec<u8>, bool)>,
    // Keeps the host (and with it the Weak handed to the engine) alive.
    #[allow(dead_code)]
    pub(crate) host: Arc<MockHost>,
    #[allow(dead_code)]
    pub(crate) backup: MemBackup,
}

pub(crate) fn cluster_keys(n: usize) -> Vec<SigningKey> {
    (0..n)
        .map(|i| SigningKey::from_bytes(&[i as u8 + 1; 32]))
        .collect()
}

/// Start `n` engines over a fully meshed mock network.
pub(crate) fn start_cluster(n: usize, config: Configuration) -> Vec<TestNode> {
    let signing = cluster_keys(n);
    let keys: Vec<VerifyingKey> = signing.iter().map(|key| key.verifying_key()).collect();
    let directory: Arc<dyn NodeDirectory> = Arc::new(StaticDirectory::miners(&keys));
    let hosts = mock_network(&keys);

    let mut nodes = Vec::with_capacity(n);
    for (i, signing_key) in signing.iter().enumerate() {
        let (seal_sender, seals) = mpsc::channel();
        let on_seal: OnSealGenerated = Box::new(move |bytes, is_local| {
            let _ = seal_sender.send((bytes, is_local));
        });
        let backup = MemBackup::default();
        let host_dyn: Arc<dyn PeerHost> = hosts[i].clone();
        let engine = PbftEngine::start(
            IdentityApp,
            Arc::downgrade(&host_dyn),
            directory.clone(),
            backup.clone(),
            Keypair::new(signing_key.clone()),
            config.clone(),
            on_seal,
            None,
        );
        nodes.push(TestNode {
            index: i,
            public_key: keys[i],
            engine,
            seals,
            host: hosts[i].clone(),
            backup,
        });
    }

    let inlets: Vec<MsgInlet> = nodes.iter().map(|node| node.engine.msg_inlet()).collect();
    wire(&hosts, &keys, &inlets);

    nodes
}

/// Report the same chain head to every engine and return its header.
pub(crate) fn report_genesis(nodes: &[TestNode], height: u64) -> BlockHeader {
    let keys: Vec<VerifyingKey> = nodes.iter().map(|node| node.public_key).collect();
    let header = make_header(&keys, height);
    for node in nodes {
        node.engine.report_block(&header);
    }
    header
}

/// Report a sealed block (as delivered by `on_seal_generated`) to every engine.
pub(crate) fn report_sealed(nodes: &[TestNode], sealed: &[u8]) -> BlockHeader {
    let block = Block::decode(&mut &sealed[..]).expect("sealed block decodes");
    for node in nodes {
        node.engine.report_block(&block.header);
    }
    block.header
}

/// Run the client loop for the whole cluster until every node has delivered a sealed
/// block for `height`: whichever node's `should_seal` answers true proposes the
/// deterministic candidate block, exactly as a node's sealing loop would. Nodes listed
/// in `silent` never propose (but still vote).
///
/// Returns one `(sealed_bytes, is_local)` pair per node, in node order. Panics if the
/// cluster does not finish before `timeout`.
pub(crate) fn drive_until_sealed(
    nodes: &[TestNode],
    silent: &[usize],
    height: u64,
    txs: usize,
    timeout: Duration,
) -> Vec<(Vec<u8>, bool)> {
    let keys: Vec<VerifyingKey> = nodes.iter().map(|node| node.public_key).collect();
    let (header, block) = make_block(&keys, height, txs);

    let deadline = Instant::now() + timeout;
    let mut sealed: Vec<Option<(Vec<u8>, bool)>> = nodes.iter().map(|_| None).collect();
    // A real sealing loop proposes once per working block; re-proposing on every poll
    // would keep resetting the leader's own prepare. Retry no faster than once a second.
    let mut last_attempt: Vec<Option<Instant>> = nodes.iter().map(|_| None).collect();
    while sealed.iter().any(Option::is_none) {
        assert!(
            Instant::now() < deadline,
            "cluster failed to seal blk={} in time",
            height
        );

        for node in nodes {
            let retry_due = last_attempt[node.index]
                .map_or(true, |at| at.elapsed() > Duration::from_secs(1));
            if !silent.contains(&node.index) && retry_due && node.engine.should_seal() {
                let view = node.engine.generate_seal(&header, &block);
                node.engine.generate_commit(&header, &block, view);
                last_attempt[node.index] = Some(Instant::now());
            }
        }

        for (i, node) in nodes.iter().enumerate() {
            if sealed[i].is_none() {
                if let Ok(delivery) = node.seals.try_recv() {
                    sealed[i] = Some(delivery);
                }
            }
        }

        thread::sleep(Duration::from_millis(10));
    }

    sealed.into_iter().flatten().collect()
}
