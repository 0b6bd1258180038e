// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::primitives::{Hash256, Transaction};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A transaction waiting for a block, tagged with its submission ordinal.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTx {
    pub ordinal: u64,
    pub tx: Transaction,
}

#[derive(Debug, Default)]
struct Queue {
    txs: VecDeque<QueuedTx>,

    /// Slots held by reservations that have not pushed yet
    reserved: usize,
}

/// Bounded FIFO of transactions waiting to be packed into a block.
#[derive(Debug)]
pub struct Mempool {
    queue: Mutex<Queue>,
    capacity: usize,
    next_ordinal: AtomicU64,

    /// Raised when the number of triggering transactions reaches `threshold`
    ready: Notify,
    threshold: usize,
}

impl Mempool {
    #[must_use]
    pub fn new(capacity: usize, threshold: usize) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            capacity,
            next_ordinal: AtomicU64::new(0),
            ready: Notify::new(),
            threshold,
        }
    }

    /// Appends a transaction and returns its ordinal.
    pub fn push(&self, tx: Transaction) -> Result<u64, MempoolErr> {
        let mut queue = self.queue.lock();

        if queue.txs.len() + queue.reserved >= self.capacity {
            return Err(MempoolErr::Full);
        }

        Ok(self.push_locked(&mut queue, tx))
    }

    /// Holds one slot of capacity until the returned reservation pushes or
    /// is dropped.
    pub fn reserve(self: &Arc<Self>) -> Result<Reservation, MempoolErr> {
        let mut queue = self.queue.lock();

        if queue.txs.len() + queue.reserved >= self.capacity {
            return Err(MempoolErr::Full);
        }

        queue.reserved += 1;

        Ok(Reservation {
            mempool: self.clone(),
            held: true,
        })
    }

    fn push_locked(&self, queue: &mut Queue, tx: Transaction) -> u64 {
        let ordinal = self.next_ordinal.fetch_add(1, Ordering::Relaxed);
        queue.txs.push_back(QueuedTx { ordinal, tx });

        if count_triggering(&queue.txs) >= self.threshold {
            self.ready.notify_one();
        }

        ordinal
    }

    /// Takes every queued transaction, leaving an empty queue behind.
    pub fn drain(&self) -> Vec<QueuedTx> {
        let mut queue = self.queue.lock();
        Vec::from(mem::take(&mut queue.txs))
    }

    /// Puts transactions back at the front of the queue, keeping their
    /// order. Ignores the capacity, these were accepted before.
    pub fn requeue_front(&self, txs: Vec<QueuedTx>) {
        if txs.is_empty() {
            return;
        }

        let mut queue = self.queue.lock();

        for tx in txs.into_iter().rev() {
            queue.txs.push_front(tx);
        }
    }

    /// Assigns fresh ordinals to transactions recovered outside the queue.
    pub fn stamp(&self, txs: Vec<Transaction>) -> Vec<QueuedTx> {
        txs.into_iter()
            .map(|tx| QueuedTx {
                ordinal: self.next_ordinal.fetch_add(1, Ordering::Relaxed),
                tx,
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().txs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().txs.is_empty()
    }

    /// Queued transactions other than node maintenance records.
    #[must_use]
    pub fn triggering_len(&self) -> usize {
        count_triggering(&self.queue.lock().txs)
    }

    #[must_use]
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.queue.lock().txs.iter().any(|q| &q.tx.tx_hash == hash)
    }

    /// Resolves once the soft threshold has been reached.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }
}

/// A queue slot taken ahead of a write that must not outlive its
/// transaction. Dropping it unused gives the slot back.
#[derive(Debug)]
pub struct Reservation {
    mempool: Arc<Mempool>,
    held: bool,
}

impl Reservation {
    /// Queues `tx` in the reserved slot and returns its ordinal.
    pub fn push(mut self, tx: Transaction) -> u64 {
        let mut queue = self.mempool.queue.lock();
        queue.reserved -= 1;
        self.held = false;
        self.mempool.push_locked(&mut queue, tx)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.held {
            self.mempool.queue.lock().reserved -= 1;
        }
    }
}

fn count_triggering(queue: &VecDeque<QueuedTx>) -> usize {
    queue
        .iter()
        .filter(|q| !q.tx.action.is_maintenance())
        .count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MempoolErr {
    /// Queue is at capacity
    Full,
}
