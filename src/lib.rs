/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Practical Byzantine Fault Tolerant (PBFT) consensus engine for permissioned
//! blockchain nodes.
//!
//! Given a roster of known miner identities and a replicated ordered log of blocks, the
//! engine drives agreement on the next block among all non-faulty miners under the
//! classical Byzantine fault model: `f` faults are tolerated out of `3f + 1` miners, and
//! a block is final once `n - f` of them have signed it.
//!
//! ## What the crate provides
//!
//! - The replica state machine and its worker thread ([`engine`]): the three-phase
//!   PREPARE → SIGN → COMMIT flow with round-robin leader rotation, view change under
//!   timeout or leader disconnection, durable locking of committed-but-unsaved
//!   proposals for crash recovery, deterministic re-execution and hash re-derivation on
//!   every replica, and signature aggregation into the sealed block.
//! - The bit-exact RLP codec for the four consensus message kinds and the sealed block
//!   ([`messages`], [`types::block`]).
//! - Gossip-style rebroadcast with per-peer duplicate suppression over a pluggable
//!   networking provider ([`networking`]).
//!
//! ## What the node provides
//!
//! The engine is a library: the surrounding node supplies the block executor and chain
//! store ([`app::App`]), the peer connections ([`networking::PeerHost`]), the node
//! directory backed by its system-contract configuration ([`types::roster::NodeDirectory`]),
//! and a crash-durable [`backup::BackupStore`]. See [`engine::PbftEngine::start`].

pub mod app;

pub mod backup;

pub mod config;

pub mod engine;

pub mod messages;

pub mod networking;

pub mod types;

// Re-exports
pub use app::App;
pub use config::Configuration;
pub use engine::PbftEngine;
