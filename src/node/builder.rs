// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::node::mempool::{Mempool, QueuedTx};
use crate::primitives::Block;
use crate::settings::Consensus;
use chrono::{DateTime, Utc};
use log::*;

/// Bytes reserved for the block header in the size estimate.
const HEADER_OVERHEAD_BYTES: usize = 512;

/// Packs queued transactions into unsealed blocks.
#[derive(Debug, Clone, Copy)]
pub struct BlockBuilder {
    pub soft_threshold: usize,
    pub max_transactions: usize,
    pub max_bytes: usize,
}

impl BlockBuilder {
    #[must_use]
    pub fn from_settings(settings: &Consensus) -> Self {
        Self {
            soft_threshold: settings.soft_threshold,
            max_transactions: settings.max_block_transactions,
            max_bytes: settings.max_block_bytes,
        }
    }

    /// Returns true if a block should be emitted now.
    #[must_use]
    pub fn should_emit(&self, mempool: &Mempool, tick_elapsed: bool) -> bool {
        let pending = mempool.triggering_len();
        pending >= self.soft_threshold || (tick_elapsed && pending > 0)
    }

    /// Drains the queue into an unsealed block extending `tip`. Whatever
    /// does not fit goes back to the front of the queue.
    pub fn build(
        &self,
        mempool: &Mempool,
        tip: &Block,
        now: DateTime<Utc>,
    ) -> Result<Option<(Block, Vec<QueuedTx>)>, serde_json::Error> {
        let drained = mempool.drain();

        if drained.is_empty() {
            return Ok(None);
        }

        let (taken, rest) = match self.split(drained) {
            Ok(split) => split,
            Err((err, drained)) => {
                mempool.requeue_front(drained);
                return Err(err);
            }
        };

        if !rest.is_empty() {
            debug!(
                "Block {} is full, returning {} transactions to the queue",
                tip.id + 1,
                rest.len()
            );
            mempool.requeue_front(rest);
        }

        // Timestamps never go backwards along the chain
        let timestamp = if now < tip.timestamp { tip.timestamp } else { now };
        let Some(prev_hash) = tip.hash else {
            mempool.requeue_front(taken);
            return Ok(None);
        };

        let block = Block::new_unsealed(
            tip.id + 1,
            prev_hash,
            timestamp,
            taken.iter().map(|q| q.tx.clone()).collect(),
        );

        Ok(Some((block, taken)))
    }

    /// Splits at the first transaction that would exceed either cap. The
    /// first transaction is always taken so an oversized one cannot stall
    /// the queue.
    #[allow(clippy::type_complexity)]
    fn split(
        &self,
        mut drained: Vec<QueuedTx>,
    ) -> Result<(Vec<QueuedTx>, Vec<QueuedTx>), (serde_json::Error, Vec<QueuedTx>)> {
        let mut bytes = HEADER_OVERHEAD_BYTES;
        let mut cut = drained.len();

        for (i, queued) in drained.iter().enumerate() {
            let size = match queued.tx.size_bytes() {
                Ok(size) => size + 1,
                Err(err) => return Err((err, drained)),
            };

            if i > 0 && (i >= self.max_transactions || bytes + size > self.max_bytes) {
                cut = i;
                break;
            }

            bytes += size;
        }

        let rest = drained.split_off(cut);
        Ok((drained, rest))
    }
}
