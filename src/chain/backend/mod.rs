// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::codec::CodecErr;
use crate::primitives::Hash256;
use std::fmt;

/// Persistence for the block list.
///
/// The chain store hands the backend canonical bytes, one line per block,
/// so the digest of what was written is always the digest of the published
/// snapshot.
pub trait ChainBackend: Send + Sync {
    /// Returns the stored bytes, or `None` if nothing was ever persisted.
    fn load(&self) -> Result<Option<Vec<u8>>, ChainBackendErr>;

    /// Replaces the stored chain with `encoded`. Must be atomic: a reader
    /// either sees the previous bytes or the new ones.
    fn persist(&self, encoded: &[u8]) -> Result<(), ChainBackendErr>;

    /// Adds the line of one block at the end. On error the stored bytes are
    /// left as they were.
    fn append(&self, line: &[u8]) -> Result<(), ChainBackendErr>;

    /// SHA-256 of the stored bytes, recomputed from storage.
    fn stored_digest(&self) -> Result<Option<Hash256>, ChainBackendErr> {
        Ok(self.load()?.map(Hash256::hash_from_slice))
    }
}

#[derive(Debug)]
pub enum ChainBackendErr {
    /// Stored bytes do not decode into a block list
    CorruptData(CodecErr),

    /// Io error
    Io(std::io::Error),
}

impl fmt::Display for ChainBackendErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CorruptData(err) => write!(f, "stored chain is corrupted: {err}"),
            Self::Io(err) => write!(f, "chain io error: {err}"),
        }
    }
}

impl From<std::io::Error> for ChainBackendErr {
    fn from(other: std::io::Error) -> Self {
        Self::Io(other)
    }
}

impl From<CodecErr> for ChainBackendErr {
    fn from(other: CodecErr) -> Self {
        Self::CorruptData(other)
    }
}

pub mod disk;
pub mod memory;

pub use disk::DiskBackend;
pub use memory::MemoryBackend;
