// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Salted Argon2i password digests.
//!
//! Stored form: `argon2i$<passes>,<kib>$<salt hex>$<digest hex>`. The cost
//! parameters travel with the digest so they can be raised later without
//! invalidating existing rows.

use crate::crypto::CryptoErr;
use argon2rs::{Argon2, Variant};
use rand::Rng;
use zeroize::Zeroize;

const SALT_BYTES: usize = 16;
const DIGEST_BYTES: usize = 32;

#[cfg(not(test))]
const PASSES: u32 = 3;
#[cfg(not(test))]
const KIB: u32 = 4096;

// Unoptimized test builds would spend seconds per digest otherwise.
#[cfg(test)]
const PASSES: u32 = 1;
#[cfg(test)]
const KIB: u32 = 64;

pub fn hash_password(password: &str) -> Result<String, CryptoErr> {
    let salt: [u8; SALT_BYTES] = rand::thread_rng().gen();
    let digest = digest(password.as_bytes(), &salt, PASSES, KIB)?;
    Ok(format!(
        "argon2i${PASSES},{KIB}${}${}",
        hex::encode(salt),
        hex::encode(digest)
    ))
}

/// Constant time verification of `password` against a stored digest.
pub fn verify_password(password: &str, stored: &str) -> Result<bool, CryptoErr> {
    let mut parts = stored.split('$');

    if parts.next() != Some("argon2i") {
        return Err(CryptoErr::InvalidDigest);
    }

    let params = parts.next().ok_or(CryptoErr::InvalidDigest)?;
    let salt = parts.next().ok_or(CryptoErr::InvalidDigest)?;
    let oracle = parts.next().ok_or(CryptoErr::InvalidDigest)?;

    if parts.next().is_some() {
        return Err(CryptoErr::InvalidDigest);
    }

    let (passes, kib) = params.split_once(',').ok_or(CryptoErr::InvalidDigest)?;
    let passes: u32 = passes.parse().map_err(|_| CryptoErr::InvalidDigest)?;
    let kib: u32 = kib.parse().map_err(|_| CryptoErr::InvalidDigest)?;
    let salt = hex::decode(salt).map_err(|_| CryptoErr::InvalidDigest)?;
    let oracle = hex::decode(oracle).map_err(|_| CryptoErr::InvalidDigest)?;

    if salt.len() != SALT_BYTES {
        return Err(CryptoErr::InvalidDigest);
    }

    let oracle: [u8; DIGEST_BYTES] = oracle
        .as_slice()
        .try_into()
        .map_err(|_| CryptoErr::InvalidDigest)?;
    let mut computed = digest(password.as_bytes(), &salt, passes, kib)?;
    let result = constant_time_eq::constant_time_eq_32(&computed, &oracle);
    computed.zeroize();
    Ok(result)
}

/// [`hash_password`] on the rayon pool.
pub async fn hash_password_async(password: String) -> Result<String, CryptoErr> {
    tokio_rayon::spawn(move || hash_password(&password)).await
}

/// [`verify_password`] on the rayon pool.
pub async fn verify_password_async(password: String, stored: String) -> Result<bool, CryptoErr> {
    tokio_rayon::spawn(move || verify_password(&password, &stored)).await
}

fn digest(
    password: &[u8],
    salt: &[u8],
    passes: u32,
    kib: u32,
) -> Result<[u8; DIGEST_BYTES], CryptoErr> {
    let hasher =
        Argon2::new(passes, 1, kib, Variant::Argon2i).map_err(|_| CryptoErr::InvalidDigest)?;
    let mut out = [0; DIGEST_BYTES];
    hasher.hash(&mut out, password, salt, &[], &[]);
    Ok(out)
}
