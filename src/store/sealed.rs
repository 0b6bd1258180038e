// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::crypto::{self, SymmetricKey};
use crate::primitives::Hash256;
use crate::store::SealErr;
use log::*;
use std::fs;
use std::path::{Path, PathBuf};

/// Header of every sealed artifact.
pub const SEAL_MAGIC: &[u8] = b"FBSEAL1\n";

pub const CHAIN_FILE: &str = "chain.json";
pub const DB_FILE: &str = "node.db";

/// Artifacts living in the data directory, in sealing order.
pub const ARTIFACTS: [&str; 2] = [CHAIN_FILE, DB_FILE];

const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";

/// Handle over the decrypted data directory. Every artifact is sealed
/// again on `close` or, failing that, when the handle is dropped.
pub struct SealedStore {
    key: SymmetricKey,
    dir: PathBuf,
    closed: bool,
}

impl SealedStore {
    /// Decrypts every artifact found in `dir` in place.
    pub fn open(key: Option<&SymmetricKey>, dir: &Path) -> Result<Self, SealErr> {
        let key = key.ok_or(SealErr::MissingKey)?.clone();
        fs::create_dir_all(dir)?;

        for name in ARTIFACTS {
            let path = dir.join(name);

            if !path.exists() {
                debug!("Artifact {} not present, starting fresh", name);
                continue;
            }

            let contents = fs::read(&path)?;

            match contents.strip_prefix(SEAL_MAGIC) {
                Some(sealed) => {
                    let plaintext =
                        crypto::open_bytes(&key, sealed).map_err(|_| SealErr::Corrupted(name))?;
                    write_atomic(&path, &plaintext)?;
                    debug!("Unsealed {}", name);
                }
                None if is_valid_plaintext(name, &contents) => {
                    warn!(
                        "Artifact {} was found unsealed, the previous run did not shut down cleanly",
                        name
                    );
                }
                None => return Err(SealErr::Corrupted(name)),
            }
        }

        Ok(Self {
            key,
            dir: dir.to_path_buf(),
            closed: false,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// SHA-256 of an artifact's plaintext, `None` if it does not exist.
    pub fn plaintext_digest(&self, name: &str) -> Result<Option<Hash256>, SealErr> {
        let path = self.path(name);

        if !path.exists() {
            return Ok(None);
        }

        Ok(Some(Hash256::hash_from_slice(fs::read(path)?)))
    }

    /// Seals every artifact. The handle is inert afterwards.
    pub fn close(mut self) -> Result<(), SealErr> {
        self.closed = true;
        self.seal_all()
    }

    fn seal_all(&self) -> Result<(), SealErr> {
        for name in ARTIFACTS {
            let path = self.dir.join(name);

            if !path.exists() {
                continue;
            }

            let contents = fs::read(&path)?;

            if contents.starts_with(SEAL_MAGIC) {
                continue;
            }

            let sealed = crypto::seal_bytes(&self.key, &contents).map_err(|_| SealErr::Corrupted(name))?;
            let mut out = Vec::with_capacity(SEAL_MAGIC.len() + sealed.len());
            out.extend_from_slice(SEAL_MAGIC);
            out.extend_from_slice(&sealed);
            write_atomic(&path, &out)?;
            debug!("Sealed {}", name);
        }

        Ok(())
    }
}

impl Drop for SealedStore {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        if let Err(err) = self.seal_all() {
            error!("Failed to seal data directory on drop: {}", err);
        }
    }
}

fn is_valid_plaintext(name: &str, contents: &[u8]) -> bool {
    match name {
        CHAIN_FILE => serde_json::Deserializer::from_slice(contents)
            .into_iter::<serde_json::Value>()
            .all(|value| value.is_ok()),
        DB_FILE => contents.is_empty() || contents.starts_with(SQLITE_HEADER),
        _ => false,
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), SealErr> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SealedStore::open(None, dir.path()),
            Err(SealErr::MissingKey)
        ));
    }

    #[test]
    fn first_run_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let key = SymmetricKey::generate();
        let store = SealedStore::open(Some(&key), dir.path()).unwrap();
        assert!(store.plaintext_digest(CHAIN_FILE).unwrap().is_none());
        store.close().unwrap();
    }

    #[test]
    fn seal_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = SymmetricKey::generate();
        let store = SealedStore::open(Some(&key), dir.path()).unwrap();
        fs::write(store.path(CHAIN_FILE), b"[]").unwrap();
        let digest = store.plaintext_digest(CHAIN_FILE).unwrap().unwrap();
        store.close().unwrap();

        let on_disk = fs::read(dir.path().join(CHAIN_FILE)).unwrap();
        assert!(on_disk.starts_with(SEAL_MAGIC));

        let store = SealedStore::open(Some(&key), dir.path()).unwrap();
        assert_eq!(fs::read(store.path(CHAIN_FILE)).unwrap(), b"[]");
        assert_eq!(store.plaintext_digest(CHAIN_FILE).unwrap(), Some(digest));
    }

    #[test]
    fn drop_reseals() {
        let dir = tempfile::tempdir().unwrap();
        let key = SymmetricKey::generate();

        {
            let store = SealedStore::open(Some(&key), dir.path()).unwrap();
            fs::write(store.path(CHAIN_FILE), b"[]").unwrap();
        }

        let on_disk = fs::read(dir.path().join(CHAIN_FILE)).unwrap();
        assert!(on_disk.starts_with(SEAL_MAGIC));
    }

    #[test]
    fn wrong_key_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let store = SealedStore::open(Some(&SymmetricKey::generate()), dir.path()).unwrap();
        fs::write(store.path(CHAIN_FILE), b"[]").unwrap();
        store.close().unwrap();

        assert!(matches!(
            SealedStore::open(Some(&SymmetricKey::generate()), dir.path()),
            Err(SealErr::Corrupted(CHAIN_FILE))
        ));
    }

    #[test]
    fn leftover_plaintext_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let lines = b"{\"id\":0}\n{\"id\":1}\n";
        fs::write(dir.path().join(CHAIN_FILE), lines).unwrap();
        let store = SealedStore::open(Some(&SymmetricKey::generate()), dir.path()).unwrap();
        assert_eq!(fs::read(store.path(CHAIN_FILE)).unwrap(), lines);
    }

    #[test]
    fn garbage_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DB_FILE), b"not a database").unwrap();
        assert!(matches!(
            SealedStore::open(Some(&SymmetricKey::generate()), dir.path()),
            Err(SealErr::Corrupted(DB_FILE))
        ));
    }
}
