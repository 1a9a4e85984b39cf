/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the structured messages that are sent between miners.
//!
//! ## Messages
//!
//! The three-phase protocol involves four message kinds, all sharing the same
//! [header](ConsensusHeader):
//! 1. [`Prepare`]: broadcast by the leader of a view, carrying the proposed block.
//! 2. [`Sign`]: broadcast by a miner that has re-executed the proposal and obtained the
//!    same no-seal hash.
//! 3. [`Commit`]: broadcast by a miner that has observed a sign quorum and durably
//!    recorded its promise to the proposal.
//! 4. [`ViewChange`]: broadcast by a miner that has abandoned the current leader; its
//!    `view` field is the *target* view.
//!
//! ## Signatures
//!
//! Every message carries two signatures by the sender: `sig` over the block's no-seal
//! hash (this is the signature that ends up in the seal), and `sig2` over the digest of
//! all remaining header fields, which authenticates the envelope itself. A message is
//! valid only if both verify under the public key at `idx` in the current roster.
//!
//! ## Wire form
//!
//! A message body is the RLP list `[height, view, idx, timestamp, block_hash, sig, sig2]`
//! (with `block` appended for [`Prepare`]); the peer packet tags the body with a one-byte
//! [`MsgKind`].

use alloy_rlp::{Decodable, Encodable, Error as RlpError, Header};
use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};

use crate::types::block::decode_list_payload;
use crate::types::crypto_primitives::{verify, Keypair};
use crate::types::data_types::{
    BlockBytes, BlockHeight, CryptoHash, MinerIndex, SignatureBytes, Timestamp, ViewNumber,
};

/// One-byte message kind tag carried by the peer packet.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MsgKind {
    Prepare = 0x00,
    Sign = 0x01,
    Commit = 0x02,
    ViewChange = 0x03,
}

impl MsgKind {
    pub fn from_tag(tag: u8) -> Option<MsgKind> {
        match tag {
            0x00 => Some(MsgKind::Prepare),
            0x01 => Some(MsgKind::Sign),
            0x02 => Some(MsgKind::Commit),
            0x03 => Some(MsgKind::ViewChange),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Fields common to all four consensus message kinds.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ConsensusHeader {
    /// Block height the message pertains to.
    pub height: BlockHeight,
    /// Leader round within that height. For [`ViewChange`] this is the target view.
    pub view: ViewNumber,
    /// Sender's miner index.
    pub idx: MinerIndex,
    /// Sender wall clock in milliseconds.
    pub timestamp: Timestamp,
    /// Hash of the block without the seal field.
    pub block_hash: CryptoHash,
    /// Signature over `block_hash`.
    pub sig: SignatureBytes,
    /// Signature over the digest of all fields above.
    pub sig2: SignatureBytes,
}

impl ConsensusHeader {
    /// Create a header for the current wall-clock instant, signing both digests with
    /// `keypair`.
    pub fn new(
        keypair: &Keypair,
        height: BlockHeight,
        view: ViewNumber,
        idx: MinerIndex,
        block_hash: CryptoHash,
    ) -> ConsensusHeader {
        let sig = keypair.sign(&block_hash);
        let mut header = ConsensusHeader {
            height,
            view,
            idx,
            timestamp: Timestamp::now(),
            block_hash,
            sig,
            sig2: SignatureBytes::new([0; 64]),
        };
        header.sig2 = keypair.sign(&header.digest_without_block());
        header
    }

    /// Digest of the header fields excluding `sig2` and any carried block bytes: the
    /// value `sig2` signs.
    pub fn digest_without_block(&self) -> CryptoHash {
        let payload_length = self.height.length()
            + self.view.length()
            + self.idx.length()
            + self.timestamp.length()
            + self.block_hash.length()
            + self.sig.length();
        let mut buf = Vec::with_capacity(payload_length + 9);
        Header {
            list: true,
            payload_length,
        }
        .encode(&mut buf);
        self.height.encode(&mut buf);
        self.view.encode(&mut buf);
        self.idx.encode(&mut buf);
        self.timestamp.encode(&mut buf);
        self.block_hash.encode(&mut buf);
        self.sig.encode(&mut buf);
        CryptoHash::new(Sha256::digest(&buf).into())
    }

    /// Check both signatures under `public_key`.
    pub fn verify(&self, public_key: &VerifyingKey) -> bool {
        verify(public_key, &self.sig, &self.block_hash)
            && verify(public_key, &self.sig2, &self.digest_without_block())
    }

    /// The key a message is known by in the per-peer duplicate-suppression sets.
    pub fn unique_key(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.idx,
            self.height,
            self.view,
            hex::encode(self.block_hash.bytes())
        )
    }

    fn fields_length(&self) -> usize {
        self.height.length()
            + self.view.length()
            + self.idx.length()
            + self.timestamp.length()
            + self.block_hash.length()
            + self.sig.length()
            + self.sig2.length()
    }

    fn encode_fields(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.height.encode(out);
        self.view.encode(out);
        self.idx.encode(out);
        self.timestamp.encode(out);
        self.block_hash.encode(out);
        self.sig.encode(out);
        self.sig2.encode(out);
    }

    fn decode_fields(buf: &mut &[u8]) -> alloy_rlp::Result<ConsensusHeader> {
        Ok(ConsensusHeader {
            height: BlockHeight::decode(buf)?,
            view: ViewNumber::decode(buf)?,
            idx: MinerIndex::decode(buf)?,
            timestamp: Timestamp::decode(buf)?,
            block_hash: CryptoHash::decode(buf)?,
            sig: SignatureBytes::decode(buf)?,
            sig2: SignatureBytes::decode(buf)?,
        })
    }
}

/// Broadcast by the leader of a view to propose the next block.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Prepare {
    pub header: ConsensusHeader,
    pub block: BlockBytes,
}

impl Prepare {
    pub fn new(
        keypair: &Keypair,
        height: BlockHeight,
        view: ViewNumber,
        idx: MinerIndex,
        block_hash: CryptoHash,
        block: BlockBytes,
    ) -> Prepare {
        Prepare {
            header: ConsensusHeader::new(keypair, height, view, idx, block_hash),
            block,
        }
    }
}

/// Broadcast by a miner whose re-execution of the proposal reproduced the leader's
/// no-seal hash.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Sign {
    pub header: ConsensusHeader,
}

impl Sign {
    pub fn new(
        keypair: &Keypair,
        height: BlockHeight,
        view: ViewNumber,
        idx: MinerIndex,
        block_hash: CryptoHash,
    ) -> Sign {
        Sign {
            header: ConsensusHeader::new(keypair, height, view, idx, block_hash),
        }
    }
}

/// Broadcast by a miner that has observed a sign quorum and persisted its committed
/// prepare.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Commit {
    pub header: ConsensusHeader,
}

impl Commit {
    pub fn new(
        keypair: &Keypair,
        height: BlockHeight,
        view: ViewNumber,
        idx: MinerIndex,
        block_hash: CryptoHash,
    ) -> Commit {
        Commit {
            header: ConsensusHeader::new(keypair, height, view, idx, block_hash),
        }
    }
}

/// Broadcast by a miner that has abandoned the current leader. `header.view` is the view
/// the sender is trying to move to; `header.height` and `header.block_hash` reference the
/// sender's chain head.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ViewChange {
    pub header: ConsensusHeader,
}

impl ViewChange {
    pub fn new(
        keypair: &Keypair,
        height: BlockHeight,
        to_view: ViewNumber,
        idx: MinerIndex,
        block_hash: CryptoHash,
    ) -> ViewChange {
        ViewChange {
            header: ConsensusHeader::new(keypair, height, to_view, idx, block_hash),
        }
    }
}

/// The four consensus message kinds as a tagged sum.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ConsensusMessage {
    Prepare(Prepare),
    Sign(Sign),
    Commit(Commit),
    ViewChange(ViewChange),
}

impl ConsensusMessage {
    pub fn kind(&self) -> MsgKind {
        match self {
            ConsensusMessage::Prepare(_) => MsgKind::Prepare,
            ConsensusMessage::Sign(_) => MsgKind::Sign,
            ConsensusMessage::Commit(_) => MsgKind::Commit,
            ConsensusMessage::ViewChange(_) => MsgKind::ViewChange,
        }
    }

    pub fn header(&self) -> &ConsensusHeader {
        match self {
            ConsensusMessage::Prepare(msg) => &msg.header,
            ConsensusMessage::Sign(msg) => &msg.header,
            ConsensusMessage::Commit(msg) => &msg.header,
            ConsensusMessage::ViewChange(msg) => &msg.header,
        }
    }

    pub fn unique_key(&self) -> String {
        self.header().unique_key()
    }

    /// Serialize the message body (everything except the kind tag).
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ConsensusMessage::Prepare(msg) => msg.encode(&mut buf),
            ConsensusMessage::Sign(msg) => msg.encode(&mut buf),
            ConsensusMessage::Commit(msg) => msg.encode(&mut buf),
            ConsensusMessage::ViewChange(msg) => msg.encode(&mut buf),
        }
        buf
    }

    /// Deserialize a message body of the given kind. The body must be exactly one RLP
    /// list with nothing trailing.
    pub fn decode_body(kind: MsgKind, body: &[u8]) -> alloy_rlp::Result<ConsensusMessage> {
        let mut buf = body;
        let msg = match kind {
            MsgKind::Prepare => ConsensusMessage::Prepare(Prepare::decode(&mut buf)?),
            MsgKind::Sign => ConsensusMessage::Sign(Sign::decode(&mut buf)?),
            MsgKind::Commit => ConsensusMessage::Commit(Commit::decode(&mut buf)?),
            MsgKind::ViewChange => ConsensusMessage::ViewChange(ViewChange::decode(&mut buf)?),
        };
        if !buf.is_empty() {
            return Err(RlpError::UnexpectedLength);
        }
        Ok(msg)
    }
}

impl From<Prepare> for ConsensusMessage {
    fn from(msg: Prepare) -> Self {
        ConsensusMessage::Prepare(msg)
    }
}

impl From<Sign> for ConsensusMessage {
    fn from(msg: Sign) -> Self {
        ConsensusMessage::Sign(msg)
    }
}

impl From<Commit> for ConsensusMessage {
    fn from(msg: Commit) -> Self {
        ConsensusMessage::Commit(msg)
    }
}

impl From<ViewChange> for ConsensusMessage {
    fn from(msg: ViewChange) -> Self {
        ConsensusMessage::ViewChange(msg)
    }
}

impl Encodable for Prepare {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let payload_length = self.header.fields_length() + self.block.length();
        Header {
            list: true,
            payload_length,
        }
        .encode(out);
        self.header.encode_fields(out);
        self.block.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.header.fields_length() + self.block.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Prepare {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let mut payload = decode_list_payload(buf)?;
        let header = ConsensusHeader::decode_fields(&mut payload)?;
        let block = BlockBytes::decode(&mut payload)?;
        if !payload.is_empty() {
            return Err(RlpError::UnexpectedLength);
        }
        Ok(Prepare { header, block })
    }
}

macro_rules! rlp_header_only_message {
    ($t:ty) => {
        impl Encodable for $t {
            fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
                let payload_length = self.header.fields_length();
                Header {
                    list: true,
                    payload_length,
                }
                .encode(out);
                self.header.encode_fields(out);
            }

            fn length(&self) -> usize {
                let payload_length = self.header.fields_length();
                payload_length + alloy_rlp::length_of_length(payload_length)
            }
        }

        impl Decodable for $t {
            fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
                let mut payload = decode_list_payload(buf)?;
                let header = ConsensusHeader::decode_fields(&mut payload)?;
                if !payload.is_empty() {
                    return Err(RlpError::UnexpectedLength);
                }
                Ok(Self { header })
            }
        }
    };
}

rlp_header_only_message!(Sign);
rlp_header_only_message!(Commit);
rlp_header_only_message!(ViewChange);

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;

    fn keypair(seed: u8) -> Keypair {
        Keypair::new(SigningKey::from_bytes(&[seed; 32]))
    }

    fn round_trip(msg: ConsensusMessage) {
        let body = msg.encode_body();
        let decoded = ConsensusMessage::decode_body(msg.kind(), &body).unwrap();
        assert_eq!(msg, decoded);
        assert_eq!(body, decoded.encode_body());
    }

    #[test]
    fn all_kinds_round_trip() {
        let keypair = keypair(7);
        let height = BlockHeight::new(10);
        let view = ViewNumber::new(2);
        let idx = MinerIndex::new(1);
        let hash = CryptoHash::new([0xab; 32]);

        round_trip(
            Prepare::new(
                &keypair,
                height,
                view,
                idx,
                hash,
                BlockBytes::new(vec![1, 2, 3]),
            )
            .into(),
        );
        round_trip(Sign::new(&keypair, height, view, idx, hash).into());
        round_trip(Commit::new(&keypair, height, view, idx, hash).into());
        round_trip(ViewChange::new(&keypair, height, view, idx, hash).into());
    }

    #[test]
    fn body_with_trailing_bytes_is_rejected() {
        let keypair = keypair(7);
        let sign = Sign::new(
            &keypair,
            BlockHeight::new(1),
            ViewNumber::new(0),
            MinerIndex::new(0),
            CryptoHash::new([1; 32]),
        );
        let mut body = ConsensusMessage::from(sign).encode_body();
        body.push(0x00);
        assert!(ConsensusMessage::decode_body(MsgKind::Sign, &body).is_err());
    }

    #[test]
    fn signatures_verify_under_the_sender_key_only() {
        let kp = keypair(3);
        let other = keypair(4);
        let sign = Sign::new(
            &kp,
            BlockHeight::new(5),
            ViewNumber::new(0),
            MinerIndex::new(2),
            CryptoHash::new([9; 32]),
        );
        assert!(sign.header.verify(&kp.public()));
        assert!(!sign.header.verify(&other.public()));
    }

    #[test]
    fn tampering_with_a_header_field_breaks_sig2() {
        let keypair = keypair(3);
        let mut sign = Sign::new(
            &keypair,
            BlockHeight::new(5),
            ViewNumber::new(0),
            MinerIndex::new(2),
            CryptoHash::new([9; 32]),
        );
        sign.header.view = ViewNumber::new(1);
        assert!(!sign.header.verify(&keypair.public()));
    }

    #[test]
    fn unique_key_identifies_sender_round_and_block() {
        let keypair = keypair(3);
        let sign = Sign::new(
            &keypair,
            BlockHeight::new(5),
            ViewNumber::new(1),
            MinerIndex::new(2),
            CryptoHash::new([0xff; 32]),
        );
        let key = sign.header.unique_key();
        assert!(key.starts_with("2_5_1_ff"));
    }
}
