// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::chain::{ChainBackend, ChainBackendErr};
use log::*;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Chain file backend. The file holds one canonical json block per line.
#[derive(Debug, Clone)]
pub struct DiskBackend {
    path: PathBuf,
}

impl DiskBackend {
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_owned(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChainBackend for DiskBackend {
    fn load(&self) -> Result<Option<Vec<u8>>, ChainBackendErr> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn persist(&self, encoded: &[u8]) -> Result<(), ChainBackendErr> {
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = fs::File::create(&tmp)?;
        file.write_all(encoded)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        debug!("Wrote {} bytes to {}", encoded.len(), self.path.display());
        Ok(())
    }

    fn append(&self, line: &[u8]) -> Result<(), ChainBackendErr> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let len = file.metadata()?.len();

        let written = file.write_all(line).and_then(|()| file.sync_data());

        if let Err(err) = written {
            // Drop a partially written line
            if let Err(truncate) = file.set_len(len) {
                error!(
                    "Could not truncate {} after a failed append: {}",
                    self.path.display(),
                    truncate
                );
            }

            return Err(err.into());
        }

        trace!("Appended {} bytes to {}", line.len(), self.path.display());
        Ok(())
    }
}
