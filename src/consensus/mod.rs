// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Coordinator driven sealing rounds.
//!
//! The coordinator packs queued transactions into an unsealed block and
//! hands it to exactly one archival peer, picked round-robin. The peer
//! searches a nonce and posts the sealed block back. The coordinator
//! verifies it and appends it to the chain. At most one round is active.

pub mod engine;
pub mod negotiation;
pub mod rules;
pub mod sealer;
pub mod selection;

pub use engine::*;
pub use negotiation::*;
pub use sealer::*;
pub use selection::*;

use crate::chain::{ChainBackendErr, ChainErr};
use crate::db::DbErr;
use crate::miner::MinerErr;
use crate::primitives::{BlockVerifyErr, NegotiationState};
use std::fmt;

#[derive(Debug)]
pub enum ConsensusErr {
    /// This node is already sealing another block
    Busy(String),

    /// No such negotiation
    UnknownNegotiation(String),

    /// Negotiation exists but is no longer waiting for this message
    Stale {
        id: String,
        state: NegotiationState,
    },

    /// Sender is not the peer assigned to the negotiation
    NotAssigned,

    /// Coordinator certificate missing or wrong
    BadCertificate,

    /// Sealed block does not carry the delivered content
    ContentMismatch,

    /// Validator is not the assigned peer
    WrongValidator,

    /// Seal does not verify
    InvalidSeal(BlockVerifyErr),

    /// Unsealed block submitted where a sealed one is expected, or the
    /// other way around
    MalformedBlock,

    /// A block reached the chain but its file signature and index rows
    /// could not be stored
    Unrecorded { block_id: u64, err: DbErr },

    Chain(ChainErr),
    Db(DbErr),
    Miner(MinerErr),
    Codec(serde_json::Error),
}

impl ConsensusErr {
    /// The chain can no longer be written, or no longer matches the
    /// metadata store. The node should stop.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Chain(ChainErr::Backend(ChainBackendErr::Io(_))) | Self::Unrecorded { .. }
        )
    }
}

impl fmt::Display for ConsensusErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy(id) => write!(f, "already sealing negotiation {id}"),
            Self::UnknownNegotiation(id) => write!(f, "unknown negotiation {id}"),
            Self::Stale { id, state } => write!(f, "negotiation {id} is {state}"),
            Self::NotAssigned => f.write_str("negotiation is assigned to another peer"),
            Self::BadCertificate => f.write_str("invalid coordinator certificate"),
            Self::ContentMismatch => f.write_str("sealed block content differs from the delivered block"),
            Self::WrongValidator => f.write_str("validator is not the assigned peer"),
            Self::InvalidSeal(err) => write!(f, "invalid seal: {err}"),
            Self::MalformedBlock => f.write_str("malformed block"),
            Self::Unrecorded { block_id, err } => {
                write!(f, "block {block_id} is on the chain but not recorded: {err}")
            }
            Self::Chain(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Miner(err) => write!(f, "{err}"),
            Self::Codec(err) => write!(f, "{err}"),
        }
    }
}

impl From<ChainErr> for ConsensusErr {
    fn from(other: ChainErr) -> Self {
        Self::Chain(other)
    }
}

impl From<DbErr> for ConsensusErr {
    fn from(other: DbErr) -> Self {
        Self::Db(other)
    }
}

impl From<MinerErr> for ConsensusErr {
    fn from(other: MinerErr) -> Self {
        Self::Miner(other)
    }
}

impl From<serde_json::Error> for ConsensusErr {
    fn from(other: serde_json::Error) -> Self {
        Self::Codec(other)
    }
}
