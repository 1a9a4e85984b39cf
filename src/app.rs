/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait for the engine's execution-and-chain collaborator.
//!
//! The leader's no-seal hash commits to *its* execution of the proposed block. Replicas
//! do not take the leader's word for it: each re-executes the block deterministically
//! through [`App::execute_block`] and proceeds only if the re-derived hash matches the
//! one the leader signed. The same collaborator answers the two chain queries the engine
//! needs (ancestry lookup during view change, and caching a re-executed block so the
//! chain can seal it cheaply later).

use std::fmt::{self, Display, Formatter};

use crate::types::block::BlockHeader;
use crate::types::data_types::{BlockBytes, CryptoHash};

/// A block that has been (re-)executed locally.
pub struct ExecutedBlock {
    /// Header after execution. Its no-seal hash is the digest the replica will sign.
    pub header: BlockHeader,
    /// Number of transactions the block carries. A proposal with zero of them may
    /// trigger an empty-block view change, depending on configuration.
    pub pending_transactions: usize,
    /// The re-serialized block, seal-ready.
    pub bytes: BlockBytes,
}

/// Error from [`App::execute_block`]. The engine drops the offending prepare and logs;
/// execution failures never propagate further.
#[derive(Debug)]
pub enum ExecuteBlockError {
    /// The block bytes could not be interpreted.
    MalformedBlock(alloy_rlp::Error),
    /// Execution ran and rejected the block.
    ExecutionFailed(String),
}

impl Display for ExecuteBlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteBlockError::MalformedBlock(err) => write!(f, "malformed block: {}", err),
            ExecuteBlockError::ExecutionFailed(reason) => {
                write!(f, "execution failed: {}", reason)
            }
        }
    }
}

pub trait App: Send + 'static {
    /// Validate and deterministically execute a candidate block, producing the
    /// re-executed block. `expected_hash` is the no-seal hash the proposer signed; the
    /// caller compares it against the result and discards the proposal on mismatch.
    fn execute_block(
        &mut self,
        expected_hash: &CryptoHash,
        block: &BlockBytes,
    ) -> Result<ExecutedBlock, ExecuteBlockError>;

    /// Look a block up by its no-seal hash. Used to recognize view-change messages that
    /// reference a head this replica has already moved past.
    fn get_block(&self, hash: &CryptoHash) -> Option<BlockBytes>;

    /// Hand a re-executed block to the chain's block cache so sealing it later does not
    /// execute it a third time.
    fn add_block_cache(&mut self, block: &ExecutedBlock);
}
