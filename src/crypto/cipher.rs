// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::crypto::CryptoErr;
use crate::primitives::{Action, Address, Hash256};
use chacha20poly1305::aead::{Aead, NewAead};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Utc};
use rand::Rng;
use zeroize::Zeroize;

pub const NONCE_BYTES: usize = 24;
pub const KEY_BYTES: usize = 32;

/// Timestamp layout mixed into the payload key context.
pub const KEY_TIMESTAMP_FORMAT: &str = "%m%y%d%H%M%S";

const FROM_PREFIX_CHARS: usize = 7;
const TO_SUFFIX_CHARS: usize = 12;

/// Symmetric 256 bit key, wiped on drop.
#[derive(Clone)]
pub struct SymmetricKey(pub [u8; KEY_BYTES]);

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl SymmetricKey {
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }

    /// Decodes a url-safe base64 key as carried in the secrets file.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoErr> {
        let mut decoded =
            base64::decode_config(encoded.trim(), base64::URL_SAFE).map_err(|_| CryptoErr::Encoding)?;

        if decoded.len() != KEY_BYTES {
            decoded.zeroize();
            return Err(CryptoErr::Encoding);
        }

        let mut out = [0; KEY_BYTES];
        out.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self(out))
    }

    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::encode_config(self.0, base64::URL_SAFE)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Encrypts `plaintext`, returning `nonce || ciphertext`.
pub fn seal_bytes(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoErr> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key.0));
    let nonce: [u8; NONCE_BYTES] = rand::thread_rng().gen();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoErr::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`seal_bytes`]. Fails if the tag does not authenticate.
pub fn open_bytes(key: &SymmetricKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoErr> {
    if sealed.len() < NONCE_BYTES {
        return Err(CryptoErr::Decrypt);
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_BYTES);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key.0));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoErr::Decrypt)
}

/// Builds the public key context of a transaction: two digit action code,
/// the first 7 characters of the sender, the last 12 characters of the
/// recipient (the sender when there is none) and the timestamp.
#[must_use]
pub fn payload_key_context(
    action: Action,
    from: &Address,
    to: Option<&Address>,
    timestamp: &DateTime<Utc>,
) -> String {
    let from = from.as_str();
    let to = to.map_or(from, Address::as_str);
    let from_prefix: String = from.chars().take(FROM_PREFIX_CHARS).collect();
    let to_suffix = &to[to.len().saturating_sub(TO_SUFFIX_CHARS)..];

    format!(
        "{:02}{}{}{}",
        action.code(),
        from_prefix,
        to_suffix,
        timestamp.format(KEY_TIMESTAMP_FORMAT)
    )
}

/// Derives the payload key of a transaction from its header fields.
#[must_use]
pub fn derive_payload_key(
    action: Action,
    from: &Address,
    to: Option<&Address>,
    timestamp: &DateTime<Utc>,
) -> SymmetricKey {
    let context = payload_key_context(action, from, to, timestamp);
    SymmetricKey(Hash256::hash_from_slice(context.as_bytes()).0)
}

/// Encrypts a payload into its url-safe base64 wire form.
pub fn encrypt_payload(key: &SymmetricKey, plaintext: &[u8]) -> Result<String, CryptoErr> {
    let sealed = seal_bytes(key, plaintext)?;
    Ok(base64::encode_config(sealed, base64::URL_SAFE))
}

pub fn decrypt_payload(key: &SymmetricKey, encoded: &str) -> Result<Vec<u8>, CryptoErr> {
    let sealed = base64::decode_config(encoded, base64::URL_SAFE).map_err(|_| CryptoErr::Encoding)?;
    open_bytes(key, &sealed)
}
