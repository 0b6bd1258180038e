// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::consensus::rules::NEGOTIATION_ID_BYTES;
use crate::primitives::NegotiationState;
use rand::Rng;

/// Returns true if a negotiation may move from `from` to `to`.
///
/// ```text
/// opened -> delivered -> sealed -> finalized
///    \          \           \
///     +----------+-----------+----> failed
/// ```
#[must_use]
pub fn can_transition(from: NegotiationState, to: NegotiationState) -> bool {
    use NegotiationState::*;

    matches!(
        (from, to),
        (Opened, Delivered)
            | (Delivered, Sealed)
            | (Sealed, Finalized)
            | (Opened, Failed)
            | (Delivered, Failed)
            | (Sealed, Failed)
    )
}

/// Fresh random negotiation id, hex encoded.
#[must_use]
pub fn new_negotiation_id() -> String {
    let bytes: [u8; NEGOTIATION_ID_BYTES] = rand::thread_rng().gen();
    hex::encode(bytes)
}
