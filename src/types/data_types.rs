/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" types that are sent around and inspected but have no active behavior.
//!
//! These types follow the newtype pattern, and the API for using them is defined in this module.
//! All of them serialize to RLP: the integer newtypes as canonical RLP integers, the fixed-width
//! newtypes ([`CryptoHash`], [`SignatureBytes`]) and [`BlockBytes`] as RLP byte strings.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign, Sub},
    time::{SystemTime, UNIX_EPOCH},
};

use alloy_rlp::{Bytes, Decodable, Encodable, Error as RlpError};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

/// Height of a block in the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlockHeight(u64);

impl BlockHeight {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Height of the block below this one, or `None` at the genesis height.
    pub fn prev(&self) -> Option<BlockHeight> {
        self.0.checked_sub(1).map(BlockHeight)
    }
}

impl Display for BlockHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for BlockHeight {
    type Output = BlockHeight;
    fn add(self, rhs: u64) -> Self::Output {
        BlockHeight(self.0 + rhs)
    }
}

impl AddAssign<u64> for BlockHeight {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs
    }
}

impl Sub<BlockHeight> for BlockHeight {
    type Output = u64;
    fn sub(self, rhs: BlockHeight) -> Self::Output {
        self.0 - rhs.0
    }
}

/// Leader round counter within a single height. Resets to 0 on height advance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ViewNumber(u64);

impl ViewNumber {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for ViewNumber {
    type Output = ViewNumber;
    fn add(self, rhs: u64) -> Self::Output {
        ViewNumber(self.0 + rhs)
    }
}

impl AddAssign<u64> for ViewNumber {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs
    }
}

impl Sub<u64> for ViewNumber {
    type Output = ViewNumber;
    fn sub(self, rhs: u64) -> Self::Output {
        ViewNumber(self.0 - rhs)
    }
}

/// Position of a miner within the roster effective at the current height.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MinerIndex(u64);

impl MinerIndex {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for MinerIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Wall-clock time in milliseconds since the Unix epoch. Carried in messages for
/// diagnostics; clock skew between miners is never enforced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub fn now() -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(millis)
    }

    pub fn millis_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A 256-bit digest. Block hashes are always the hash of the block *without* its seal field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// First seven characters of the Base64 encoding of the hash, for log lines.
    pub fn abridged(&self) -> String {
        let encoded = STANDARD_NO_PAD.encode(self.0);
        encoded[0..7].to_string()
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.abridged())
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.abridged())
    }
}

/// An Ed25519 signature represented in bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Hex rendering of the signature. Used as the key of the sign and commit caches.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex()[0..8])
    }
}

/// An opaque serialized block. The engine carries these through consensus without
/// interpreting them beyond the seal field.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct BlockBytes(Vec<u8>);

impl BlockBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

macro_rules! rlp_integer_newtype {
    ($t:ty) => {
        impl Encodable for $t {
            fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
                self.0.encode(out)
            }

            fn length(&self) -> usize {
                self.0.length()
            }
        }

        impl Decodable for $t {
            fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
                Ok(Self(u64::decode(buf)?))
            }
        }
    };
}

rlp_integer_newtype!(BlockHeight);
rlp_integer_newtype!(ViewNumber);
rlp_integer_newtype!(MinerIndex);
rlp_integer_newtype!(Timestamp);

impl Encodable for CryptoHash {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.0.as_slice().encode(out)
    }

    fn length(&self) -> usize {
        self.0.as_slice().length()
    }
}

impl Decodable for CryptoHash {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let bytes = Bytes::decode(buf)?;
        let bytes: [u8; 32] = bytes
            .as_ref()
            .try_into()
            .map_err(|_| RlpError::UnexpectedLength)?;
        Ok(CryptoHash(bytes))
    }
}

impl Encodable for SignatureBytes {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.0.as_slice().encode(out)
    }

    fn length(&self) -> usize {
        self.0.as_slice().length()
    }
}

impl Decodable for SignatureBytes {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let bytes = Bytes::decode(buf)?;
        let bytes: [u8; 64] = bytes
            .as_ref()
            .try_into()
            .map_err(|_| RlpError::UnexpectedLength)?;
        Ok(SignatureBytes(bytes))
    }
}

impl Encodable for BlockBytes {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.0.as_slice().encode(out)
    }

    fn length(&self) -> usize {
        self.0.as_slice().length()
    }
}

impl Decodable for BlockBytes {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let bytes = Bytes::decode(buf)?;
        Ok(BlockBytes(bytes.to_vec()))
    }
}
