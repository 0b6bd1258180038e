// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

/// Leading zero hex characters a sealed block hash must carry
pub const DIFFICULTY: usize = 1;

/// Random bytes in a registration code. Encoded as 16 hex characters
pub const AUTH_CODE_BYTES: usize = 8;

/// Random bytes in a peer certificate
pub const CERTIFICATE_BYTES: usize = 32;

/// Random bytes in a negotiation id
pub const NEGOTIATION_ID_BYTES: usize = 16;

/// Page sizes accepted by the explorer
pub const EXPLORER_LIMITS: [u32; 5] = [5, 25, 50, 75, 100];

/// Page size used when the explorer request does not name one
pub const DEFAULT_EXPLORER_LIMIT: u32 = 25;

/// Max request body size accepted by the http surface
pub const MAX_BODY_BYTES: u64 = 1024 * 64;

/// Max length of a username
pub const MAX_USERNAME_LEN: usize = 24;

/// Max length of first and last names
pub const MAX_PERSON_NAME_LEN: usize = 32;

/// Exponential backoff for a peer after `failures` consecutive failed
/// rounds, in seconds.
#[must_use]
pub fn backoff_secs(failures: u32, base: u64, cap: u64) -> u64 {
    if failures == 0 {
        return 0;
    }

    let exp = failures.saturating_sub(1).min(63);
    base.saturating_mul(1_u64 << exp).min(cap)
}
