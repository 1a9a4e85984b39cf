//! A deterministic execution collaborator and block builders for the test cluster.

use alloy_rlp::{Decodable, Encodable};
use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};

use pbft_rs::app::{App, ExecuteBlockError, ExecutedBlock};
use pbft_rs::types::block::{Block, BlockHeader};
use pbft_rs::types::data_types::{BlockBytes, BlockHeight, CryptoHash, Timestamp};

/// Execution is the identity: the candidate block is decoded and handed back unchanged.
/// Every replica therefore re-derives exactly the hash an honest proposer signed, which
/// is all the engine needs from execution in these tests.
pub(crate) struct IdentityApp;

impl App for IdentityApp {
    fn execute_block(
        &mut self,
        _expected_hash: &CryptoHash,
        block: &BlockBytes,
    ) -> Result<ExecutedBlock, ExecuteBlockError> {
        let mut buf = block.bytes();
        let decoded = Block::decode(&mut buf).map_err(ExecuteBlockError::MalformedBlock)?;
        Ok(ExecutedBlock {
            header: decoded.header,
            pending_transactions: decoded.transactions.len(),
            bytes: block.clone(),
        })
    }

    fn get_block(&self, _hash: &CryptoHash) -> Option<BlockBytes> {
        None
    }

    fn add_block_cache(&mut self, _block: &ExecutedBlock) {}
}

/// A header at `height` recording `keys` as the roster the block was built against.
/// Fields are fixed so that every node that builds the block for a height produces
/// byte-identical block bytes.
pub(crate) fn make_header(keys: &[VerifyingKey], height: u64) -> BlockHeader {
    BlockHeader {
        height: BlockHeight::new(height),
        parent_hash: CryptoHash::new([height as u8; 32]),
        timestamp: Timestamp::new(1_700_000_000_000),
        tx_root: CryptoHash::zero(),
        state_root: CryptoHash::zero(),
        node_list: keys.iter().map(|key| key.to_bytes()).collect(),
    }
}

/// A candidate block at `height` carrying `txs` placeholder transactions. The header's
/// `tx_root` covers the transactions, so blocks with different contents at the same
/// height hash differently.
pub(crate) fn make_block(
    keys: &[VerifyingKey],
    height: u64,
    txs: usize,
) -> (BlockHeader, BlockBytes) {
    let transactions: Vec<BlockBytes> = (0..txs).map(|i| BlockBytes::new(vec![i as u8])).collect();
    let mut header = make_header(keys, height);
    header.tx_root = {
        let mut hasher = Sha256::new();
        for tx in &transactions {
            hasher.update(tx.bytes());
        }
        hasher.update((txs as u64).to_le_bytes());
        CryptoHash::new(hasher.finalize().into())
    };
    let block = Block {
        hash: header.hash_without_seal(),
        header: header.clone(),
        transactions,
        uncles: vec![],
        sig_list: vec![],
    };
    let mut bytes = Vec::new();
    block.encode(&mut bytes);
    (header, BlockBytes::new(bytes))
}
