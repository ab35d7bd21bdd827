/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Bounded multi-producer queues with observable depth.
//!
//! The consensus thread drains these with non-blocking receives; producers (network, API, timers)
//! fail fast when a queue is full instead of blocking the node. Depth is tracked explicitly
//! because the backpressure rules need it: above [`INMSGQUEUE_LOW`] the holding review and
//! missing-message replies are suppressed, above [`INMSGQUEUE_HIGH`] gap-fill responses are
//! ignored outright.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    mpsc::{sync_channel, Receiver, SyncSender, TryRecvError, TrySendError},
    Arc,
};

/// Inbound depth above which the node stops volunteering work (holding review, fault responses,
/// missing-message replies).
pub const INMSGQUEUE_LOW: usize = 1_000;

/// Inbound depth above which gap-fill responses are dropped entirely.
pub const INMSGQUEUE_HIGH: usize = 4_000;

/// Create a bounded queue of the given capacity.
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = sync_channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    (
        QueueSender {
            tx,
            depth: depth.clone(),
        },
        QueueReceiver { rx, depth },
    )
}

/// The producer half. Cloneable; every producer sees the same depth.
pub struct QueueSender<T> {
    tx: SyncSender<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueue without blocking. On a full or disconnected queue the value comes back to the
    /// caller.
    pub fn try_send(&self, value: T) -> Result<(), T> {
        match self.tx.try_send(value) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(value)) | Err(TrySendError::Disconnected(value)) => Err(value),
        }
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The consumer half, owned by the consensus thread.
pub struct QueueReceiver<T> {
    rx: Receiver<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> QueueReceiver<T> {
    /// Dequeue without blocking.
    pub fn try_recv(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(value) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                Some(value)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_tracks_sends_and_receives() {
        let (tx, rx) = bounded::<u32>(4);
        assert!(tx.try_send(1).is_ok());
        assert!(tx.try_send(2).is_ok());
        assert_eq!(tx.len(), 2);
        assert_eq!(rx.try_recv(), Some(1));
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn a_full_queue_returns_the_value() {
        let (tx, _rx) = bounded::<u32>(1);
        assert!(tx.try_send(1).is_ok());
        assert_eq!(tx.try_send(2), Err(2));
    }

    #[test]
    fn draining_an_empty_queue_is_a_non_event() {
        let (_tx, rx) = bounded::<u32>(1);
        assert_eq!(rx.try_recv(), None);
    }
}
