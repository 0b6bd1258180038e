// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Nonce search for sealing blocks.
//!
//! The search is deterministic: it starts at a seed derived from the block
//! content and the sealing peer, then walks forward with wrapping
//! arithmetic. The same block sealed by the same peer always yields the
//! same nonce.

use crate::primitives::{Address, Block, Hash256};
use log::*;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How many hashes are tried between cancellation checks.
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Starting nonce for `validator` sealing the block with `unsealed` bytes.
#[must_use]
pub fn nonce_seed(unsealed: &[u8], validator: &Address) -> u64 {
    let digest = Hash256::hash_from_slices(&[unsealed, validator.as_str().as_bytes()]);
    let mut seed = [0; 8];
    seed.copy_from_slice(&digest.0[..8]);
    u64::from_le_bytes(seed)
}

/// Finds the first nonce from the seed whose hash meets `difficulty`.
/// Blocks the calling thread.
pub fn search_nonce(
    block: &Block,
    validator: &Address,
    difficulty: usize,
    cancel: &AtomicBool,
) -> Result<u64, MinerErr> {
    let unsealed = block.unsealed_bytes()?;
    let mut nonce = nonce_seed(&unsealed, validator);
    let mut attempts: u64 = 0;

    loop {
        if attempts % CANCEL_CHECK_INTERVAL == 0
            && (cancel.load(Ordering::Relaxed) || crate::global::exit_requested())
        {
            return Err(MinerErr::Cancelled);
        }

        let hash = block.compute_hash_with(validator, nonce)?;

        if hash.meets_difficulty(difficulty) {
            debug!(
                "Found nonce {} for block {} after {} attempts",
                nonce,
                block.id,
                attempts + 1
            );
            return Ok(nonce);
        }

        nonce = nonce.wrapping_add(1);
        attempts = attempts.checked_add(1).ok_or(MinerErr::Exhausted)?;
    }
}

/// Seals `block` on the rayon pool.
pub async fn seal_block(
    mut block: Block,
    validator: Address,
    difficulty: usize,
    cancel: Arc<AtomicBool>,
) -> Result<Block, MinerErr> {
    tokio_rayon::spawn(move || {
        let nonce = search_nonce(&block, &validator, difficulty, &cancel)?;
        block.seal(validator, nonce)?;
        Ok(block)
    })
    .await
}

#[derive(Debug)]
pub enum MinerErr {
    /// Search was cancelled or the node is shutting down
    Cancelled,

    /// Every nonce was tried
    Exhausted,

    /// Block could not be encoded
    Codec(serde_json::Error),
}

impl fmt::Display for MinerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("nonce search cancelled"),
            Self::Exhausted => f.write_str("nonce space exhausted"),
            Self::Codec(err) => write!(f, "could not encode block: {err}"),
        }
    }
}

impl From<serde_json::Error> for MinerErr {
    fn from(other: serde_json::Error) -> Self {
        Self::Codec(other)
    }
}
