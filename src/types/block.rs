/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Block headers, sealed blocks, and the seal field.
//!
//! A serialized block is the RLP 5-list `[header, transactions, uncles, hash, sig_list]`.
//! The *seal* is the final element: a list of `[miner_index, signature]` pairs over the
//! block's no-seal hash. Replacing the seal is what turns an agreed proposal into a chain
//! block, and is done by [`seal_block`] without touching the other four elements.

use alloy_rlp::{Bytes, Decodable, Encodable, Error as RlpError, Header};
use sha2::{Digest, Sha256};

use super::data_types::{BlockBytes, BlockHeight, CryptoHash, MinerIndex, SignatureBytes, Timestamp};

/// Header of a block.
///
/// `node_list` records the public keys of the miner roster the block was built against
/// (the roster at `height - 1`), in miner-index order. It is part of the no-seal hash,
/// which is why [`check_block_sign`](crate::engine::PbftEngine::check_block_sign) can
/// compare it against the locally derived roster.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlockHeader {
    pub height: BlockHeight,
    pub parent_hash: CryptoHash,
    pub timestamp: Timestamp,
    pub tx_root: CryptoHash,
    pub state_root: CryptoHash,
    pub node_list: Vec<[u8; 32]>,
}

impl BlockHeader {
    /// Hash of the header. The seal lives outside the header, so this is the hash of the
    /// block *without* the seal field: the digest every consensus message refers to, and
    /// the digest each seal signature is over.
    pub fn hash_without_seal(&self) -> CryptoHash {
        let mut buf = Vec::with_capacity(self.length());
        self.encode(&mut buf);
        CryptoHash::new(Sha256::digest(&buf).into())
    }

    fn node_list_payload_length(&self) -> usize {
        self.node_list.iter().map(|key| key.as_slice().length()).sum()
    }

    fn payload_length(&self) -> usize {
        let node_list_payload = self.node_list_payload_length();
        self.height.length()
            + self.parent_hash.length()
            + self.timestamp.length()
            + self.tx_root.length()
            + self.state_root.length()
            + node_list_payload
            + alloy_rlp::length_of_length(node_list_payload)
    }
}

impl Encodable for BlockHeader {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let payload_length = self.payload_length();
        Header {
            list: true,
            payload_length,
        }
        .encode(out);
        self.height.encode(out);
        self.parent_hash.encode(out);
        self.timestamp.encode(out);
        self.tx_root.encode(out);
        self.state_root.encode(out);
        Header {
            list: true,
            payload_length: self.node_list_payload_length(),
        }
        .encode(out);
        for key in &self.node_list {
            key.as_slice().encode(out);
        }
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for BlockHeader {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let mut payload = decode_list_payload(buf)?;
        let height = BlockHeight::decode(&mut payload)?;
        let parent_hash = CryptoHash::decode(&mut payload)?;
        let timestamp = Timestamp::decode(&mut payload)?;
        let tx_root = CryptoHash::decode(&mut payload)?;
        let state_root = CryptoHash::decode(&mut payload)?;

        let mut node_list_payload = decode_list_payload(&mut payload)?;
        let mut node_list = Vec::new();
        while !node_list_payload.is_empty() {
            let key = Bytes::decode(&mut node_list_payload)?;
            let key: [u8; 32] = key
                .as_ref()
                .try_into()
                .map_err(|_| RlpError::UnexpectedLength)?;
            node_list.push(key);
        }

        if !payload.is_empty() {
            return Err(RlpError::UnexpectedLength);
        }

        Ok(BlockHeader {
            height,
            parent_hash,
            timestamp,
            tx_root,
            state_root,
            node_list,
        })
    }
}

/// One `[miner_index, signature]` pair of a block's seal.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SealSignature {
    pub idx: MinerIndex,
    pub sig: SignatureBytes,
}

impl SealSignature {
    fn payload_length(&self) -> usize {
        self.idx.length() + self.sig.length()
    }
}

impl Encodable for SealSignature {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        Header {
            list: true,
            payload_length: self.payload_length(),
        }
        .encode(out);
        self.idx.encode(out);
        self.sig.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for SealSignature {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let mut payload = decode_list_payload(buf)?;
        let idx = MinerIndex::decode(&mut payload)?;
        let sig = SignatureBytes::decode(&mut payload)?;
        if !payload.is_empty() {
            return Err(RlpError::UnexpectedLength);
        }
        Ok(SealSignature { idx, sig })
    }
}

/// A fully structured block: the typed view of the 5-list wire form.
///
/// The engine itself treats proposal bytes opaquely and only ever rewrites the seal
/// element through [`seal_block`]; this type is for code above and below the engine
/// (block producers, executors) and for tests.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<BlockBytes>,
    pub uncles: Vec<BlockBytes>,
    pub hash: CryptoHash,
    pub sig_list: Vec<SealSignature>,
}

impl Block {
    pub fn hash_without_seal(&self) -> CryptoHash {
        self.header.hash_without_seal()
    }

    fn payload_length(&self) -> usize {
        self.header.length()
            + self.transactions.length()
            + self.uncles.length()
            + self.hash.length()
            + self.sig_list.length()
    }
}

impl Encodable for Block {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        Header {
            list: true,
            payload_length: self.payload_length(),
        }
        .encode(out);
        self.header.encode(out);
        self.transactions.encode(out);
        self.uncles.encode(out);
        self.hash.encode(out);
        self.sig_list.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Block {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let mut payload = decode_list_payload(buf)?;
        let header = BlockHeader::decode(&mut payload)?;
        let transactions = Vec::<BlockBytes>::decode(&mut payload)?;
        let uncles = Vec::<BlockBytes>::decode(&mut payload)?;
        let hash = CryptoHash::decode(&mut payload)?;
        let sig_list = Vec::<SealSignature>::decode(&mut payload)?;
        if !payload.is_empty() {
            return Err(RlpError::UnexpectedLength);
        }
        Ok(Block {
            header,
            transactions,
            uncles,
            hash,
            sig_list,
        })
    }
}

/// Rewrite the seal element of a serialized block, carrying the header, transactions,
/// uncles and hash elements through byte-exactly.
pub fn seal_block(block_rlp: &[u8], sig_list: &[SealSignature]) -> alloy_rlp::Result<Vec<u8>> {
    let mut buf = block_rlp;
    let mut payload = decode_list_payload(&mut buf)?;

    let header_raw = raw_item(&mut payload)?;
    let transactions_raw = raw_item(&mut payload)?;
    let uncles_raw = raw_item(&mut payload)?;
    let hash_raw = raw_item(&mut payload)?;
    let _discarded_seal = raw_item(&mut payload)?;
    if !payload.is_empty() {
        return Err(RlpError::UnexpectedLength);
    }

    let seal_payload_length: usize = sig_list.iter().map(|sig| sig.length()).sum();
    let mut seal = Vec::with_capacity(seal_payload_length + 9);
    Header {
        list: true,
        payload_length: seal_payload_length,
    }
    .encode(&mut seal);
    for sig in sig_list {
        sig.encode(&mut seal);
    }

    let payload_length =
        header_raw.len() + transactions_raw.len() + uncles_raw.len() + hash_raw.len() + seal.len();
    let mut out = Vec::with_capacity(payload_length + 9);
    Header {
        list: true,
        payload_length,
    }
    .encode(&mut out);
    out.extend_from_slice(header_raw);
    out.extend_from_slice(transactions_raw);
    out.extend_from_slice(uncles_raw);
    out.extend_from_slice(hash_raw);
    out.extend_from_slice(&seal);
    Ok(out)
}

/// Parse the sig list out of a serialized block without decoding the other elements.
pub fn sig_list_of(block_rlp: &[u8]) -> alloy_rlp::Result<Vec<SealSignature>> {
    let mut buf = block_rlp;
    let mut payload = decode_list_payload(&mut buf)?;
    let _header = raw_item(&mut payload)?;
    let _transactions = raw_item(&mut payload)?;
    let _uncles = raw_item(&mut payload)?;
    let _hash = raw_item(&mut payload)?;
    let mut seal_raw = raw_item(&mut payload)?;
    Vec::<SealSignature>::decode(&mut seal_raw)
}

/// Decode the header of an RLP list and return its payload, advancing `buf` past it.
pub(crate) fn decode_list_payload<'a>(buf: &mut &'a [u8]) -> alloy_rlp::Result<&'a [u8]> {
    let header = Header::decode(buf)?;
    if !header.list {
        return Err(RlpError::UnexpectedString);
    }
    if buf.len() < header.payload_length {
        return Err(RlpError::InputTooShort);
    }
    let payload = &buf[..header.payload_length];
    *buf = &buf[header.payload_length..];
    Ok(payload)
}

/// Take the next RLP item off `buf` raw, header bytes included.
fn raw_item<'a>(buf: &mut &'a [u8]) -> alloy_rlp::Result<&'a [u8]> {
    let original = *buf;
    let header = Header::decode(buf)?;
    if buf.len() < header.payload_length {
        return Err(RlpError::InputTooShort);
    }
    let header_length = original.len() - buf.len();
    let total = header_length + header.payload_length;
    *buf = &original[total..];
    Ok(&original[..total])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_header() -> BlockHeader {
        BlockHeader {
            height: BlockHeight::new(10),
            parent_hash: CryptoHash::new([1; 32]),
            timestamp: Timestamp::new(1_700_000_000_000),
            tx_root: CryptoHash::new([2; 32]),
            state_root: CryptoHash::new([3; 32]),
            node_list: vec![[4; 32], [5; 32], [6; 32], [7; 32]],
        }
    }

    #[test]
    fn header_round_trip() {
        let header = test_header();
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), header.length());
        let decoded = BlockHeader::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn block_round_trip() {
        let header = test_header();
        let block = Block {
            hash: header.hash_without_seal(),
            header,
            transactions: vec![BlockBytes::new(vec![0xca, 0xfe]), BlockBytes::new(vec![])],
            uncles: vec![],
            sig_list: vec![SealSignature {
                idx: MinerIndex::new(2),
                sig: SignatureBytes::new([9; 64]),
            }],
        };
        let mut buf = Vec::new();
        block.encode(&mut buf);
        assert_eq!(buf.len(), block.length());
        let decoded = Block::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(block, decoded);
    }

    #[test]
    fn seal_block_replaces_only_the_sig_list() {
        let header = test_header();
        let block = Block {
            hash: header.hash_without_seal(),
            header,
            transactions: vec![BlockBytes::new(vec![0xde, 0xad, 0xbe, 0xef])],
            uncles: vec![],
            sig_list: vec![],
        };
        let mut unsealed = Vec::new();
        block.encode(&mut unsealed);

        let sig_list = vec![
            SealSignature {
                idx: MinerIndex::new(0),
                sig: SignatureBytes::new([1; 64]),
            },
            SealSignature {
                idx: MinerIndex::new(3),
                sig: SignatureBytes::new([2; 64]),
            },
        ];
        let sealed = seal_block(&unsealed, &sig_list).unwrap();
        let decoded = Block::decode(&mut sealed.as_slice()).unwrap();
        assert_eq!(decoded.sig_list, sig_list);
        assert_eq!(decoded.header, block.header);
        assert_eq!(decoded.transactions, block.transactions);
        assert_eq!(decoded.hash, block.hash);
        assert_eq!(sig_list_of(&sealed).unwrap(), sig_list);
    }

    #[test]
    fn no_seal_hash_ignores_the_sig_list() {
        let header = test_header();
        let mut block = Block {
            hash: header.hash_without_seal(),
            header,
            transactions: vec![],
            uncles: vec![],
            sig_list: vec![],
        };
        let unsealed_hash = block.hash_without_seal();
        block.sig_list.push(SealSignature {
            idx: MinerIndex::new(1),
            sig: SignatureBytes::new([8; 64]),
        });
        assert_eq!(unsealed_hash, block.hash_without_seal());
    }
}
