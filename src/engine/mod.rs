/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that [start](PbftEngine::start) the consensus engine, the handle that keeps
//! it alive, and the upward interface the surrounding node drives it through.
//!
//! ## Lifecycle
//!
//! The node constructs the engine once with its collaborators — the execution/chain
//! [`App`], the [`PeerHost`](crate::networking::PeerHost), the
//! [`NodeDirectory`](crate::types::roster::NodeDirectory), a [`BackupStore`] and the
//! local [`Keypair`] — then:
//! 1. calls [`report_block`](PbftEngine::report_block) with the current chain head;
//! 2. polls [`should_seal`](PbftEngine::should_seal), and when it answers true, builds a
//!    candidate block and calls [`generate_seal`](PbftEngine::generate_seal) (and, when
//!    running a single-miner network, [`generate_commit`](PbftEngine::generate_commit));
//! 3. receives the sealed block through the `on_seal_generated` callback and submits it
//!    to the chain;
//! 4. calls `report_block` again once the chain has persisted it, advancing the engine
//!    to the next height.
//!
//! Inbound consensus packets reach the engine through the [`MsgInlet`] returned by
//! [`msg_inlet`](PbftEngine::msg_inlet); peer threads only ever enqueue.

pub(crate) mod replica;

pub(crate) mod worker;

use std::{
    sync::{
        mpsc::{self, Sender},
        Arc, Mutex, MutexGuard, Weak,
    },
    thread::JoinHandle,
};

use crate::app::App;
use crate::backup::BackupStore;
use crate::config::Configuration;
use crate::networking::{GossipHandle, MsgInlet, PeerHost};
use crate::types::block::{BlockHeader, SealSignature};
use crate::types::crypto_primitives::Keypair;
use crate::types::data_types::{BlockBytes, ViewNumber};
use crate::types::roster::{MinerSet, NodeDirectory};

use replica::Replica;
pub use replica::OnSealGenerated;

/// Callback invoked after every view change, outside the engine lock. The node uses it
/// to reset per-view sealing state.
pub type OnViewChange = Box<dyn Fn() + Send + Sync>;

pub(crate) struct EngineInner<A: App, B: BackupStore> {
    replica: Mutex<Replica<A, B>>,
    pub(crate) on_view_change: Option<OnViewChange>,
}

impl<A: App, B: BackupStore> EngineInner<A, B> {
    /// Run `f` under the engine lock. A poisoned lock is recovered rather than
    /// propagated — replica state is kept consistent by the handlers themselves, and no
    /// caller of the engine can do anything useful with the poison.
    pub(crate) fn with_replica<R>(&self, f: impl FnOnce(&mut Replica<A, B>) -> R) -> R {
        let mut guard: MutexGuard<Replica<A, B>> = match self.replica.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

/// The engine handle. Dropping it (or calling [`stop_working`](Self::stop_working))
/// joins the worker thread; pending queue entries are discarded.
pub struct PbftEngine<A: App, B: BackupStore> {
    inner: Arc<EngineInner<A, B>>,
    inlet: MsgInlet,
    worker: Option<JoinHandle<()>>,
    worker_shutdown: Sender<()>,
}

impl<A: App, B: BackupStore> PbftEngine<A, B> {
    /// Initialize the replica state (re-reading the roster and reloading any backed-up
    /// committed prepare) and spawn the worker thread.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        app: A,
        host: Weak<dyn PeerHost>,
        directory: Arc<dyn NodeDirectory>,
        backup: B,
        keypair: Keypair,
        config: Configuration,
        on_seal_generated: OnSealGenerated,
        on_view_change: Option<OnViewChange>,
    ) -> PbftEngine<A, B> {
        let shared_roster = Arc::new(Mutex::new(MinerSet::default()));
        let replica = Replica::new(
            app,
            backup,
            GossipHandle::new(host),
            directory,
            shared_roster.clone(),
            keypair,
            config,
            on_seal_generated,
        );
        let inner = Arc::new(EngineInner {
            replica: Mutex::new(replica),
            on_view_change,
        });

        let (queue_sender, queue_receiver) = mpsc::channel();
        let inlet = MsgInlet::new(queue_sender, shared_roster);

        let (worker_shutdown, shutdown_receiver) = mpsc::channel();
        let worker = worker::start_worker(inner.clone(), queue_receiver, shutdown_receiver);

        log::info!("pbft engine started");
        PbftEngine {
            inner,
            inlet,
            worker: Some(worker),
            worker_shutdown,
        }
    }

    /// The receiving end the networking provider pushes inbound consensus packets into.
    pub fn msg_inlet(&self) -> MsgInlet {
        self.inlet.clone()
    }

    /// Whether the local replica should propose the next block now.
    pub fn should_seal(&self) -> bool {
        self.inner.with_replica(|replica| replica.should_seal())
    }

    /// Broadcast a PREPARE for the candidate block. Returns the view it was issued in,
    /// to be quoted back through [`generate_commit`](Self::generate_commit).
    pub fn generate_seal(&self, header: &BlockHeader, block: &BlockBytes) -> ViewNumber {
        self.inner
            .with_replica(|replica| replica.generate_seal(header, block))
    }

    /// Single-node fast path: locally install the candidate block and sign it. Returns
    /// false if the view has moved on since the quoted [`generate_seal`](Self::generate_seal).
    pub fn generate_commit(
        &self,
        header: &BlockHeader,
        block: &BlockBytes,
        claimed_view: ViewNumber,
    ) -> bool {
        self.inner
            .with_replica(|replica| replica.generate_commit(header, block, claimed_view))
    }

    /// Inform the engine that the chain has persisted a block.
    pub fn report_block(&self, header: &BlockHeader) {
        self.inner.with_replica(|replica| replica.report_block(header))
    }

    /// Verify an incoming chain block's roster and seal signatures.
    pub fn check_block_sign(&self, header: &BlockHeader, sig_list: &[SealSignature]) -> bool {
        self.inner
            .with_replica(|replica| replica.check_block_sign(header, sig_list))
    }

    /// Re-derive the miner roster from the node directory. The node calls this when the
    /// system-contract configuration channel reports a change.
    pub fn reset_config(&self) {
        self.inner.with_replica(|replica| replica.reset_config())
    }

    pub fn set_omit_empty_block(&self, omit: bool) {
        self.inner
            .with_replica(|replica| replica.set_omit_empty_block(omit))
    }

    /// Skip the current leader after it proposed (or would propose) an empty block.
    /// Called by the node's sealing loop when it declines to build on an empty proposal.
    pub fn change_view_for_empty_block(&self) {
        self.inner
            .with_replica(|replica| replica.change_view_for_empty_block())
    }

    /// Stop and join the worker thread. Pending queue entries are discarded.
    pub fn stop_working(&mut self) {
        let _ = self.worker_shutdown.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<A: App, B: BackupStore> Drop for PbftEngine<A, B> {
    fn drop(&mut self) {
        self.stop_working();
    }
}
