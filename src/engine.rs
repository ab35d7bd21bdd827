/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus thread: a cooperative loop around [`ConsensusCore::process`].
//!
//! The loop calls `process` until it reports no progress, advances process lists once more, then
//! sleeps briefly. No preemption, no coroutines: suspension points are exactly the non-blocking
//! queue drains inside `process`.

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread,
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    consensus::state::ConsensusCore, networking::network::Network,
    storage::pluggables::BlockStore,
};

/// How long the consensus thread sleeps when a full process step made no progress.
const IDLE_SLEEP: Duration = Duration::from_millis(10);

pub(crate) fn start_engine<S: BlockStore, N: Network>(
    mut core: ConsensusCore<S, N>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                panic!("the consensus thread's shutdown signal was disconnected")
            }
        }

        let mut progress = core.process();
        progress |= core.update_state();
        if !progress {
            thread::sleep(IDLE_SLEEP);
        }
    })
}
