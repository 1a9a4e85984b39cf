/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The engine's single worker thread.
//!
//! All replica-state mutation funnels through this loop. Each iteration pops at most one
//! envelope off the inbound queue (with a bounded 5 ms wait, which doubles as the idle
//! sleep), dispatches it under the engine lock, then fires any due view timeout, replays
//! a buffered future prepare that has become current, and sweeps stale cache entries.
//! The view-change callback runs outside the lock.

use std::{
    sync::{
        mpsc::{Receiver, RecvTimeoutError, TryRecvError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::app::App;
use crate::backup::BackupStore;
use crate::networking::MsgEnvelope;

use super::EngineInner;

const QUEUE_WAIT: Duration = Duration::from_millis(5);

pub(crate) fn start_worker<A: App, B: BackupStore>(
    inner: Arc<EngineInner<A, B>>,
    queue: Receiver<MsgEnvelope>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => return,
        }

        match queue.recv_timeout(QUEUE_WAIT) {
            Ok(envelope) => inner.with_replica(|replica| replica.handle_msg(envelope)),
            Err(RecvTimeoutError::Timeout) => (),
            // All inlets dropped; the engine is shutting down.
            Err(RecvTimeoutError::Disconnected) => return,
        }

        let view_changed = inner.with_replica(|replica| replica.check_timeout());
        if view_changed {
            if let Some(on_view_change) = &inner.on_view_change {
                on_view_change();
            }
        }

        inner.with_replica(|replica| {
            replica.handle_future_block();
            replica.collect_garbage();
        });
    })
}
