// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::chain::{ChainBackend, ChainBackendErr};
use crate::primitives::{Address, Block, BlockVerifyErr, Hash256, Transaction};
use log::*;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Immutable view of the chain at one point in time.
#[derive(Debug, Default)]
pub struct Snapshot {
    blocks: Vec<Arc<Block>>,

    /// tx hash -> (block id, position in block)
    tx_index: HashMap<Hash256, (u64, usize)>,

    /// SHA-256 of the canonical encoding of `blocks`
    chain_hash: Option<Hash256>,
}

impl Snapshot {
    fn build(blocks: Vec<Arc<Block>>, chain_hash: Option<Hash256>) -> Self {
        let mut tx_index = HashMap::new();

        for block in &blocks {
            for (i, tx) in block.transactions.iter().enumerate() {
                tx_index.insert(tx.tx_hash, (block.id, i));
            }
        }

        Self {
            blocks,
            tx_index,
            chain_hash,
        }
    }

    /// The next snapshot with `block` on top. Only the new block's
    /// transactions are indexed.
    fn extend(&self, block: Arc<Block>, chain_hash: Hash256) -> Self {
        let mut tx_index = self.tx_index.clone();

        for (i, tx) in block.transactions.iter().enumerate() {
            tx_index.insert(tx.tx_hash, (block.id, i));
        }

        let mut blocks = Vec::with_capacity(self.blocks.len() + 1);
        blocks.extend_from_slice(&self.blocks);
        blocks.push(block);

        Self {
            blocks,
            tx_index,
            chain_hash: Some(chain_hash),
        }
    }

    #[must_use]
    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.blocks.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[must_use]
    pub fn tip(&self) -> Option<&Arc<Block>> {
        self.blocks.last()
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<&Arc<Block>> {
        usize::try_from(id).ok().and_then(|id| self.blocks.get(id))
    }

    /// Blocks with ids in `from..to`, clamped to the chain.
    #[must_use]
    pub fn range(&self, from: u64, to: u64) -> &[Arc<Block>] {
        let len = self.blocks.len();
        let from = usize::try_from(from).unwrap_or(len).min(len);
        let to = usize::try_from(to).unwrap_or(len).min(len);

        if from >= to {
            return &[];
        }

        &self.blocks[from..to]
    }

    #[must_use]
    pub fn chain_hash(&self) -> Option<Hash256> {
        self.chain_hash
    }

    #[must_use]
    pub fn contains_transaction(&self, hash: &Hash256) -> bool {
        self.tx_index.contains_key(hash)
    }

    /// Returns the transaction with `hash` and the id of its block.
    #[must_use]
    pub fn get_transaction(&self, hash: &Hash256) -> Option<(u64, &Transaction)> {
        let (block_id, pos) = self.tx_index.get(hash)?;
        let block = self.get(*block_id)?;
        block.transactions.get(*pos).map(|tx| (*block_id, tx))
    }

    /// Transactions newest first, walking back from the tip.
    pub fn recent_transactions(&self) -> impl Iterator<Item = (u64, &Transaction)> + '_ {
        self.blocks
            .iter()
            .rev()
            .flat_map(|block| block.transactions.iter().rev().map(move |tx| (block.id, tx)))
    }

    /// Transactions sent or received by `address`, oldest first.
    #[must_use]
    pub fn transactions_of(&self, address: &Address) -> Vec<(u64, &Transaction)> {
        self.blocks
            .iter()
            .flat_map(|block| block.transactions.iter().map(move |tx| (block.id, tx)))
            .filter(|(_, tx)| tx.involves(address))
            .collect()
    }
}

/// Append only block store.
///
/// The chain file holds one canonical json block per line, so a block is
/// persisted by appending its line and the file is only rewritten on
/// [`ChainStore::replace`].
///
/// Readers clone the current [`Snapshot`] under a short read lock and never
/// wait on writers. Writers are serialized, build the next snapshot on the
/// side, persist it and only then publish it.
pub struct ChainStore {
    backend: Box<dyn ChainBackend>,
    snapshot: RwLock<Arc<Snapshot>>,

    /// Running SHA-256 of the persisted file, held by the writer
    writer: Mutex<Sha256>,
    difficulty: usize,
}

impl ChainStore {
    /// Loads and fully validates the stored chain.
    pub fn open(backend: Box<dyn ChainBackend>, difficulty: usize) -> Result<Self, ChainErr> {
        let blocks = match backend.load()? {
            Some(bytes) => decode_lines(&bytes)?,
            None => vec![],
        };

        validate_chain(&blocks, difficulty)?;
        let mut hasher = Sha256::new();

        for block in &blocks {
            hasher.update(encode_line(block)?);
        }

        let blocks: Vec<Arc<Block>> = blocks.into_iter().map(Arc::new).collect();
        let chain_hash = if blocks.is_empty() {
            None
        } else {
            Some(Hash256(hasher.clone().finalize().into()))
        };

        info!("Loaded chain with {} blocks", blocks.len());

        Ok(Self {
            backend,
            snapshot: RwLock::new(Arc::new(Snapshot::build(blocks, chain_hash))),
            writer: Mutex::new(hasher),
            difficulty,
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    #[must_use]
    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    /// Appends a sealed block to the tip. Returns the digest of the
    /// persisted chain. Nothing changes on error.
    pub fn append(&self, block: Block) -> Result<Hash256, ChainErr> {
        let mut hasher = self.writer.lock();
        let current = self.snapshot();
        let id = block.id;

        let verdict = match current.tip() {
            Some(tip) => block.validate(tip, self.difficulty),
            None => block.validate_genesis(self.difficulty),
        };
        verdict.map_err(|err| ChainErr::InvalidBlock { id, err })?;

        if block
            .transactions
            .iter()
            .any(|tx| current.contains_transaction(&tx.tx_hash))
        {
            return Err(ChainErr::InvalidBlock {
                id,
                err: BlockVerifyErr::DuplicateTxs,
            });
        }

        let line = encode_line(&block)?;
        self.backend.append(&line)?;
        hasher.update(&line);
        let digest = Hash256(hasher.clone().finalize().into());

        *self.snapshot.write() = Arc::new(current.extend(Arc::new(block), digest));
        debug!("Appended block {} to the chain", id);
        Ok(digest)
    }

    /// Replaces the whole chain after validating it. Used when resyncing
    /// from the coordinator.
    pub fn replace(&self, blocks: Vec<Block>) -> Result<Hash256, ChainErr> {
        let mut hasher = self.writer.lock();
        validate_chain(&blocks, self.difficulty)?;

        let mut encoded = vec![];

        for block in &blocks {
            encoded.extend_from_slice(&encode_line(block)?);
        }

        self.backend.persist(&encoded)?;
        *hasher = Sha256::new();
        hasher.update(&encoded);
        let digest = Hash256(hasher.clone().finalize().into());

        let count = blocks.len();
        let blocks = blocks.into_iter().map(Arc::new).collect();
        *self.snapshot.write() = Arc::new(Snapshot::build(blocks, Some(digest)));
        info!("Replaced local chain with {} blocks", count);
        Ok(digest)
    }

    /// [`ChainStore::append`] on the blocking pool.
    pub async fn append_async(self: &Arc<Self>, block: Block) -> Result<Hash256, ChainErr> {
        let chain = self.clone();
        tokio::task::spawn_blocking(move || chain.append(block))
            .await
            .map_err(|_| ChainErr::Unavailable)?
    }

    /// [`ChainStore::replace`] on the blocking pool.
    pub async fn replace_async(self: &Arc<Self>, blocks: Vec<Block>) -> Result<Hash256, ChainErr> {
        let chain = self.clone();
        tokio::task::spawn_blocking(move || chain.replace(blocks))
            .await
            .map_err(|_| ChainErr::Unavailable)?
    }

    /// Digest recomputed from what the backend holds.
    pub fn digest(&self) -> Result<Option<Hash256>, ChainErr> {
        Ok(self.backend.stored_digest()?)
    }

    #[must_use]
    pub fn tip(&self) -> Option<Arc<Block>> {
        self.snapshot().tip().cloned()
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<Arc<Block>> {
        self.snapshot().get(id).cloned()
    }

    #[must_use]
    pub fn range(&self, from: u64, to: u64) -> Vec<Arc<Block>> {
        self.snapshot().range(from, to).to_vec()
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.snapshot().length()
    }

    #[must_use]
    pub fn get_transaction(&self, hash: &Hash256) -> Option<(u64, Transaction)> {
        self.snapshot()
            .get_transaction(hash)
            .map(|(id, tx)| (id, tx.clone()))
    }

    #[must_use]
    pub fn recent_transactions(&self, n: usize) -> Vec<(u64, Transaction)> {
        self.snapshot()
            .recent_transactions()
            .take(n)
            .map(|(id, tx)| (id, tx.clone()))
            .collect()
    }

    #[must_use]
    pub fn transactions_of(&self, address: &Address) -> Vec<(u64, Transaction)> {
        self.snapshot()
            .transactions_of(address)
            .into_iter()
            .map(|(id, tx)| (id, tx.clone()))
            .collect()
    }

    #[must_use]
    pub fn chain_hash(&self) -> Option<Hash256> {
        self.snapshot().chain_hash()
    }
}

/// Canonical encoding of one block followed by a newline.
pub fn encode_line(block: &Block) -> Result<Vec<u8>, ChainErr> {
    let mut line = crate::codec::encode_to_vec(block)?;
    line.push(b'\n');
    Ok(line)
}

/// Decodes a chain file. Each line is decoded on its own, the size limit
/// applies per block.
fn decode_lines(bytes: &[u8]) -> Result<Vec<Block>, ChainBackendErr> {
    bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| crate::codec::decode(line).map_err(ChainBackendErr::from))
        .collect()
}

/// Validates a full chain from genesis. Transaction hashes must be unique
/// across blocks.
pub fn validate_chain(blocks: &[Block], difficulty: usize) -> Result<(), ChainErr> {
    let mut seen = std::collections::HashSet::new();

    for (i, block) in blocks.iter().enumerate() {
        let verdict = if i == 0 {
            block.validate_genesis(difficulty)
        } else {
            block.validate(&blocks[i - 1], difficulty)
        };
        verdict.map_err(|err| ChainErr::InvalidBlock { id: block.id, err })?;

        for tx in &block.transactions {
            if !seen.insert(tx.tx_hash) {
                return Err(ChainErr::InvalidBlock {
                    id: block.id,
                    err: BlockVerifyErr::DuplicateTxs,
                });
            }
        }
    }

    Ok(())
}

#[derive(Debug)]
pub enum ChainErr {
    /// Block failed validation against the tip
    InvalidBlock { id: u64, err: BlockVerifyErr },

    /// Backend error
    Backend(ChainBackendErr),

    /// Encoding the chain failed
    Codec(serde_json::Error),

    /// The blocking writer task did not complete
    Unavailable,
}

impl fmt::Display for ChainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBlock { id, err } => write!(f, "block {id} is invalid: {err}"),
            Self::Backend(err) => write!(f, "{err}"),
            Self::Codec(err) => write!(f, "could not encode chain: {err}"),
            Self::Unavailable => f.write_str("chain writer task failed"),
        }
    }
}

impl From<ChainBackendErr> for ChainErr {
    fn from(other: ChainBackendErr) -> Self {
        Self::Backend(other)
    }
}

impl From<serde_json::Error> for ChainErr {
    fn from(other: serde_json::Error) -> Self {
        Self::Codec(other)
    }
}
