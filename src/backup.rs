/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait for pluggable crash-durable storage of the engine's single backed-up record.
//!
//! A replica that observes a sign quorum is *locked* on the corresponding proposal: it
//! must not sign a conflicting block at the same height even across a crash. The engine
//! therefore writes the committed prepare through a [`BackupStore`] before the COMMIT
//! broadcast goes out, and reads it back on startup.
//!
//! Any durable embedded key/value engine suffices — a single key is used and the value
//! stays well under a megabyte. Deployments keep it under `<datadir>/pbftMsgBackup/`;
//! tests supply an in-memory store.

use std::io;

use alloy_rlp::{Decodable, Encodable, Header};

use crate::messages::Prepare;
use crate::types::block::decode_list_payload;

/// The only key the engine writes.
pub const COMMITTED_PREPARE_KEY: &str = "committed_prepare";

pub trait BackupStore: Send + 'static {
    /// Store `value` under `key`. The write must be durable when this returns.
    fn put(&mut self, key: &str, value: &[u8]) -> io::Result<()>;

    /// Read the value stored under `key` back.
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
}

/// Serialize a prepare for backup. The prepare's RLP is wrapped in a 1-element list so
/// the record can grow fields without breaking old readers.
pub(crate) fn backup_value(prepare: &Prepare) -> Vec<u8> {
    let payload_length = prepare.length();
    let mut buf = Vec::with_capacity(payload_length + 9);
    Header {
        list: true,
        payload_length,
    }
    .encode(&mut buf);
    prepare.encode(&mut buf);
    buf
}

/// Deserialize a backed-up prepare. Elements beyond the first are ignored.
pub(crate) fn reload_value(value: &[u8]) -> alloy_rlp::Result<Prepare> {
    let mut buf = value;
    let mut payload = decode_list_payload(&mut buf)?;
    Prepare::decode(&mut payload)
}
