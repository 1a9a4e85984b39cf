/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that store information about the miner roster effective at a height.
//!
//! Not every node in a permissioned network votes in consensus: nodes with the
//! [`Miner`](Role::Miner) role participate, while [`Observer`](Role::Observer) nodes merely
//! keep up with decisions. The engine needs to know the full miner roster at all times to
//! pick leaders and count quorums, and reads it from an injected [`NodeDirectory`] at
//! height boundaries only — roster changes never take effect in the middle of a height.

use std::fmt::{self, Display, Formatter};

use ed25519_dalek::VerifyingKey;

use super::data_types::{BlockHeight, MinerIndex, ViewNumber};

/// What a node is permitted to do at the current height.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    /// Participates in consensus.
    Miner,
    /// Receives blocks but has no weight in consensus.
    Observer,
}

/// One node connection record, as reported by the [`NodeDirectory`].
#[derive(Clone, Debug)]
pub struct NodeRecord {
    pub public_key: VerifyingKey,
    pub role: Role,
    /// Miner index. Meaningful only for records with [`Role::Miner`].
    pub index: u64,
}

/// Source of node connection records. Supplied by the surrounding node, typically backed
/// by the system-contract configuration channel.
pub trait NodeDirectory: Send + Sync + 'static {
    /// Snapshot of all node connection records effective at `height`, or the latest
    /// records when `height` is `None`.
    fn nodes_at(&self, height: Option<BlockHeight>) -> Vec<NodeRecord>;
}

/// The ordered miner roster: maps miner index to public key and back, and answers the
/// leader and quorum questions of the protocol.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct MinerSet {
    // Public keys in miner-index order.
    miners: Vec<VerifyingKey>,
}

impl MinerSet {
    /// Build a roster from a snapshot of node records, keeping only miners and placing
    /// each at its declared index.
    pub fn from_records(records: &[NodeRecord]) -> Result<MinerSet, RosterError> {
        let miner_count = records
            .iter()
            .filter(|record| record.role == Role::Miner)
            .count();
        if miner_count == 0 {
            return Err(RosterError::NoMiners);
        }

        let mut miners: Vec<Option<VerifyingKey>> = vec![None; miner_count];
        for record in records.iter().filter(|record| record.role == Role::Miner) {
            let index = record.index as usize;
            if index >= miner_count {
                return Err(RosterError::IndexOutOfBounds {
                    index: record.index,
                    miner_count,
                });
            }
            if miners[index].is_some() {
                return Err(RosterError::DuplicateIndex {
                    index: record.index,
                });
            }
            miners[index] = Some(record.public_key);
        }

        // Every slot is filled: there are exactly miner_count records, all with distinct
        // in-bounds indices.
        Ok(MinerSet {
            miners: miners.into_iter().flatten().collect(),
        })
    }

    pub fn count(&self) -> usize {
        self.miners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.miners.is_empty()
    }

    /// The number of Byzantine faults the roster tolerates: `(n - 1) / 3`.
    pub fn f(&self) -> usize {
        self.count().saturating_sub(1) / 3
    }

    /// The number of agreeing miners needed to finalize: `n - f`.
    pub fn quorum(&self) -> usize {
        self.count() - self.f()
    }

    pub fn public_key_of(&self, idx: MinerIndex) -> Option<&VerifyingKey> {
        self.miners.get(idx.int() as usize)
    }

    pub fn index_of(&self, public_key: &VerifyingKey) -> Option<MinerIndex> {
        self.miners
            .iter()
            .position(|miner| miner == public_key)
            .map(|position| MinerIndex::new(position as u64))
    }

    pub fn contains(&self, public_key: &VerifyingKey) -> bool {
        self.index_of(public_key).is_some()
    }

    /// The leader at `(height, view)`: miner index `(view + height) mod n`.
    pub fn leader_at(&self, view: ViewNumber, height: BlockHeight) -> MinerIndex {
        MinerIndex::new((view.int() + height.int()) % self.count() as u64)
    }

    /// Public keys in miner-index order.
    pub fn keys(&self) -> &[VerifyingKey] {
        &self.miners
    }

    /// Raw key bytes in miner-index order, for comparison against a block header's
    /// `node_list`.
    pub fn key_bytes(&self) -> Vec<[u8; 32]> {
        self.miners.iter().map(|miner| miner.to_bytes()).collect()
    }
}

/// Error when deriving a [`MinerSet`] from a directory snapshot. The engine treats any of
/// these as a configuration error: it stops sealing until the directory reports a
/// consistent roster.
#[derive(Debug, PartialEq, Eq)]
pub enum RosterError {
    NoMiners,
    IndexOutOfBounds { index: u64, miner_count: usize },
    DuplicateIndex { index: u64 },
}

impl Display for RosterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RosterError::NoMiners => write!(f, "no miner records in snapshot"),
            RosterError::IndexOutOfBounds { index, miner_count } => write!(
                f,
                "miner index {} out of bounds for {} miners",
                index, miner_count
            ),
            RosterError::DuplicateIndex { index } => {
                write!(f, "duplicate miner index {}", index)
            }
        }
    }
}
