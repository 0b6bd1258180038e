// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// 256 bit SHA-256 digest. Serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    #[must_use]
    pub fn zero() -> Self {
        Self([0; 32])
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(encoded: &str) -> Result<Self, &'static str> {
        if encoded.len() != 64 {
            return Err("invalid hash length");
        }

        let mut out = [0; 32];
        hex::decode_to_slice(encoded, &mut out).map_err(|_| "invalid hash encoding")?;
        Ok(Self(out))
    }

    /// Hashes the given slice with SHA-256.
    #[must_use]
    pub fn hash_from_slice<T: AsRef<[u8]>>(slice: T) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(slice.as_ref());
        Self(hasher.finalize().into())
    }

    /// Hashes the concatenation of the given slices.
    #[must_use]
    pub fn hash_from_slices<T: AsRef<[u8]>>(slices: &[T]) -> Self {
        let mut hasher = Sha256::new();

        for slice in slices {
            hasher.update(slice.as_ref());
        }

        Self(hasher.finalize().into())
    }

    /// Returns true if the hex encoding of the hash starts with `nibbles` zeroes.
    #[must_use]
    pub fn meets_difficulty(&self, nibbles: usize) -> bool {
        if nibbles > 64 {
            return false;
        }

        self.to_hex().bytes().take(nibbles).all(|c| c == b'0')
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash256").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Hash256 {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Hash256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        String::serialize(&self.to_hex(), serializer)
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D>(deserializer: D) -> Result<Hash256, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        Hash256::from_hex(&string).map_err(|err| serde::de::Error::custom(err.to_owned()))
    }
}
