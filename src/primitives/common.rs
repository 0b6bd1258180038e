// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Every address starts with this prefix.
pub const ADDRESS_PREFIX: &str = "fl:";

/// Number of hex characters following the prefix.
pub const ADDRESS_HEX_LEN: usize = 32;

/// Total address length in characters.
pub const ADDRESS_LEN: usize = ADDRESS_PREFIX.len() + ADDRESS_HEX_LEN;

/// Stable entity identifier. `fl:` followed by 32 lowercase hex characters.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    /// Generates a fresh random address.
    #[must_use]
    pub fn random() -> Self {
        let bytes: [u8; ADDRESS_HEX_LEN / 2] = rand::thread_rng().gen();
        Self(format!("{ADDRESS_PREFIX}{}", hex::encode(bytes)))
    }

    pub fn parse(encoded: &str) -> Result<Self, &'static str> {
        let hex_part = encoded
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or("invalid address prefix")?;

        if hex_part.len() != ADDRESS_HEX_LEN {
            return Err("invalid address length");
        }

        if !hex_part
            .bytes()
            .all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c))
        {
            return Err("invalid address encoding");
        }

        Ok(Self(encoded.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Address").field(&self.0).finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        String::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Address, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        Address::parse(&string).map_err(|err| serde::de::Error::custom(err.to_owned()))
    }
}
