// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::chain::{ChainBackend, ChainBackendErr};
use parking_lot::Mutex;
use std::sync::Arc;

/// In memory backend. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    stored: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the stored bytes without going through a chain store.
    pub fn overwrite(&self, bytes: Vec<u8>) {
        *self.stored.lock() = Some(bytes);
    }
}

impl ChainBackend for MemoryBackend {
    fn load(&self) -> Result<Option<Vec<u8>>, ChainBackendErr> {
        Ok(self.stored.lock().clone())
    }

    fn persist(&self, encoded: &[u8]) -> Result<(), ChainBackendErr> {
        *self.stored.lock() = Some(encoded.to_vec());
        Ok(())
    }

    fn append(&self, line: &[u8]) -> Result<(), ChainBackendErr> {
        self.stored
            .lock()
            .get_or_insert_with(Vec::new)
            .extend_from_slice(line);
        Ok(())
    }
}
