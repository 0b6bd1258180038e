// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

pub mod cipher;
pub mod password;
pub mod totp;

pub use cipher::*;
pub use password::*;
pub use totp::*;

use std::fmt;

#[derive(Debug)]
pub enum CryptoErr {
    /// Authenticated encryption failed
    Encrypt,

    /// Ciphertext did not authenticate under the given key
    Decrypt,

    /// Base64 or length error in encoded material
    Encoding,

    /// Stored password digest could not be parsed
    InvalidDigest,

    /// Payload (de)serialization error
    Codec(serde_json::Error),
}

impl fmt::Display for CryptoErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encrypt => f.write_str("encryption failed"),
            Self::Decrypt => f.write_str("decryption failed"),
            Self::Encoding => f.write_str("malformed encoded key material"),
            Self::InvalidDigest => f.write_str("malformed password digest"),
            Self::Codec(err) => write!(f, "payload codec error: {err}"),
        }
    }
}

impl From<serde_json::Error> for CryptoErr {
    fn from(other: serde_json::Error) -> Self {
        Self::Codec(other)
    }
}
