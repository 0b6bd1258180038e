// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::primitives::{Address, Hash256, Transaction, TxVerifyErr};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Dense height, genesis is 0
    pub id: u64,

    /// Address of the sealing peer. `None` while unsealed
    pub validator: Option<Address>,
    pub timestamp: DateTime<Utc>,

    /// Hash of the previous block, all zeroes for genesis
    pub prev_hash: Hash256,
    pub nonce: Option<u64>,
    pub transactions: Vec<Transaction>,
    pub hash: Option<Hash256>,
}

#[derive(Serialize)]
struct BlockHashView<'a> {
    id: u64,
    prev_hash: &'a Hash256,
    timestamp: &'a DateTime<Utc>,
    validator: &'a Address,
    nonce: u64,
    transactions: Vec<&'a Hash256>,
}

impl Block {
    #[must_use]
    pub fn new_unsealed(
        id: u64,
        prev_hash: Hash256,
        timestamp: DateTime<Utc>,
        transactions: Vec<Transaction>,
    ) -> Self {
        Self {
            id,
            validator: None,
            timestamp,
            prev_hash,
            nonce: None,
            transactions,
            hash: None,
        }
    }

    /// Unsealed genesis block. The coordinator seals it locally.
    #[must_use]
    pub fn genesis(timestamp: DateTime<Utc>, transactions: Vec<Transaction>) -> Self {
        Self::new_unsealed(0, Hash256::zero(), timestamp, transactions)
    }

    #[must_use]
    pub fn is_genesis(&self) -> bool {
        self.id == 0
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.validator.is_some() && self.nonce.is_some() && self.hash.is_some()
    }

    /// Hash of the block as if sealed by `validator` with `nonce`.
    pub fn compute_hash_with(
        &self,
        validator: &Address,
        nonce: u64,
    ) -> Result<Hash256, serde_json::Error> {
        let view = BlockHashView {
            id: self.id,
            prev_hash: &self.prev_hash,
            timestamp: &self.timestamp,
            validator,
            nonce,
            transactions: self.transactions.iter().map(|tx| &tx.tx_hash).collect(),
        };
        let encoded = crate::codec::encode_to_vec(&view)?;
        Ok(Hash256::hash_from_slice(encoded))
    }

    /// Canonical bytes of the block with every sealing field cleared.
    pub fn unsealed_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut unsealed = self.clone();
        unsealed.validator = None;
        unsealed.nonce = None;
        unsealed.hash = None;
        crate::codec::encode_to_vec(&unsealed)
    }

    pub fn seal(&mut self, validator: Address, nonce: u64) -> Result<Hash256, serde_json::Error> {
        let hash = self.compute_hash_with(&validator, nonce)?;
        self.validator = Some(validator);
        self.nonce = Some(nonce);
        self.hash = Some(hash);
        Ok(hash)
    }

    /// Checks that the stored hash recomputes and meets `difficulty`.
    pub fn verify_seal(&self, difficulty: usize) -> Result<(), BlockVerifyErr> {
        let (validator, nonce, hash) = match (&self.validator, self.nonce, &self.hash) {
            (Some(validator), Some(nonce), Some(hash)) => (validator, nonce, hash),
            _ => return Err(BlockVerifyErr::Unsealed),
        };

        let computed = self
            .compute_hash_with(validator, nonce)
            .map_err(|_| BlockVerifyErr::Codec)?;

        if &computed != hash {
            return Err(BlockVerifyErr::InvalidHash);
        }

        if !hash.meets_difficulty(difficulty) {
            return Err(BlockVerifyErr::InvalidPoW);
        }

        Ok(())
    }

    /// Validates a sealed block against its predecessor.
    pub fn validate(&self, prev: &Block, difficulty: usize) -> Result<(), BlockVerifyErr> {
        if self.id != prev.id + 1 {
            return Err(BlockVerifyErr::InvalidHeight);
        }

        if Some(self.prev_hash) != prev.hash {
            return Err(BlockVerifyErr::InvalidPrevHash);
        }

        if self.timestamp < prev.timestamp {
            return Err(BlockVerifyErr::InvalidTimestamp);
        }

        self.validate_body()?;
        self.verify_seal(difficulty)
    }

    /// Validates a sealed genesis block.
    pub fn validate_genesis(&self, difficulty: usize) -> Result<(), BlockVerifyErr> {
        if self.id != 0 {
            return Err(BlockVerifyErr::InvalidHeight);
        }

        if !self.prev_hash.is_zero() {
            return Err(BlockVerifyErr::InvalidPrevHash);
        }

        self.validate_body()?;
        self.verify_seal(difficulty)
    }

    fn validate_body(&self) -> Result<(), BlockVerifyErr> {
        if self.transactions.is_empty() {
            return Err(BlockVerifyErr::NoTransactions);
        }

        let mut seen = std::collections::HashSet::with_capacity(self.transactions.len());

        for tx in &self.transactions {
            if !seen.insert(tx.tx_hash) {
                return Err(BlockVerifyErr::DuplicateTxs);
            }

            tx.verify().map_err(BlockVerifyErr::Tx)?;
        }

        Ok(())
    }

    /// Returns true if both blocks carry the same unsealed content.
    #[must_use]
    pub fn same_content(&self, other: &Block) -> bool {
        self.id == other.id
            && self.prev_hash == other.prev_hash
            && self.timestamp == other.timestamp
            && self.transactions.len() == other.transactions.len()
            && self
                .transactions
                .iter()
                .zip(other.transactions.iter())
                .all(|(a, b)| a == b)
    }

    pub fn size_bytes(&self) -> Result<usize, serde_json::Error> {
        crate::codec::encode_to_vec(self).map(|encoded| encoded.len())
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum BlockVerifyErr {
    InvalidHeight,
    InvalidPrevHash,
    InvalidTimestamp,
    InvalidHash,
    InvalidPoW,
    InvalidValidator,
    ContentMismatch,
    NoTransactions,
    DuplicateTxs,
    Unsealed,
    Codec,
    Tx(TxVerifyErr),
}

impl std::fmt::Display for BlockVerifyErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::primitives::{Document, Payload};

    pub(crate) fn test_tx(title: &str) -> Transaction {
        let payload = Payload::DocumentMinted(Document {
            title: title.to_owned(),
            description: "test document".to_owned(),
        });
        Transaction::from_payload(
            &payload,
            Address::random(),
            Some(Address::random()),
            Utc::now(),
        )
        .unwrap()
    }

    /// Brute force seal, only for tests.
    pub(crate) fn seal_naive(block: &mut Block, validator: &Address, difficulty: usize) {
        let mut nonce = 0_u64;

        loop {
            let hash = block.compute_hash_with(validator, nonce).unwrap();

            if hash.meets_difficulty(difficulty) {
                block.seal(validator.clone(), nonce).unwrap();
                return;
            }

            nonce += 1;
        }
    }

    pub(crate) fn sealed_genesis() -> Block {
        let mut genesis = Block::genesis(Utc::now(), vec![test_tx("genesis")]);
        seal_naive(&mut genesis, &Address::random(), 1);
        genesis
    }

    pub(crate) fn sealed_child(prev: &Block, txs: Vec<Transaction>) -> Block {
        let mut block = Block::new_unsealed(prev.id + 1, prev.hash.unwrap(), Utc::now(), txs);
        seal_naive(&mut block, &Address::random(), 1);
        block
    }

    #[test]
    fn genesis_validates() {
        let genesis = sealed_genesis();
        assert!(genesis.is_sealed());
        assert!(genesis.validate_genesis(1).is_ok());
        assert!(genesis.hash.unwrap().to_hex().starts_with('0'));
    }

    #[test]
    fn child_validates() {
        let genesis = sealed_genesis();
        let child = sealed_child(&genesis, vec![test_tx("one")]);
        assert!(child.validate(&genesis, 1).is_ok());
    }

    #[test]
    fn broken_link_is_rejected() {
        let genesis = sealed_genesis();
        let mut child = sealed_child(&genesis, vec![test_tx("one")]);
        child.prev_hash = Hash256::hash_from_slice(b"other");
        assert_eq!(
            child.validate(&genesis, 1),
            Err(BlockVerifyErr::InvalidPrevHash)
        );

        let child = sealed_child(&genesis, vec![test_tx("one")]);
        let grandchild = sealed_child(&child, vec![test_tx("two")]);
        assert_eq!(
            grandchild.validate(&genesis, 1),
            Err(BlockVerifyErr::InvalidHeight)
        );
    }

    #[test]
    fn tampered_seal_is_rejected() {
        let genesis = sealed_genesis();
        let mut child = sealed_child(&genesis, vec![test_tx("one")]);
        child.transactions.push(test_tx("two"));
        assert_eq!(child.verify_seal(1), Err(BlockVerifyErr::InvalidHash));

        let unsealed = Block::new_unsealed(1, genesis.hash.unwrap(), Utc::now(), vec![]);
        assert_eq!(unsealed.verify_seal(1), Err(BlockVerifyErr::Unsealed));
    }

    #[test]
    fn empty_block_is_rejected() {
        let genesis = sealed_genesis();
        let child = sealed_child(&genesis, vec![]);
        assert_eq!(
            child.validate(&genesis, 1),
            Err(BlockVerifyErr::NoTransactions)
        );
    }

    #[test]
    fn sealing_keeps_content() {
        let unsealed = Block::new_unsealed(3, Hash256::zero(), Utc::now(), vec![test_tx("x")]);
        let mut sealed = unsealed.clone();
        seal_naive(&mut sealed, &Address::random(), 1);
        assert!(unsealed.same_content(&sealed));
        assert_eq!(
            unsealed.unsealed_bytes().unwrap(),
            sealed.unsealed_bytes().unwrap()
        );
    }
}
