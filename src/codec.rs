// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Canonical serialization used for digests, signatures and the chain file.
//!
//! Values are routed through `serde_json::Value` before being written, so
//! equal values always produce identical bytes.

use serde::de::DeserializeOwned;
use serde::Serialize;

pub const CODEC_BYTES_LIMIT: usize = 16_000_000;

pub fn encode_to_vec<T: Serialize>(val: &T) -> Result<Vec<u8>, serde_json::Error> {
    // Round trip through `Value` so that any map ordering is normalised.
    let value = serde_json::to_value(val)?;
    serde_json::to_vec(&value)
}

pub fn encode_pretty<T: Serialize>(val: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(val)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecErr> {
    if bytes.len() > CODEC_BYTES_LIMIT {
        return Err(CodecErr::TooLarge);
    }

    serde_json::from_slice(bytes).map_err(CodecErr::Json)
}

#[derive(Debug)]
pub enum CodecErr {
    /// Input exceeds `CODEC_BYTES_LIMIT`
    TooLarge,

    /// Malformed json
    Json(serde_json::Error),
}

impl std::fmt::Display for CodecErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge => write!(f, "input exceeds {CODEC_BYTES_LIMIT} bytes"),
            Self::Json(err) => write!(f, "{err}"),
        }
    }
}
