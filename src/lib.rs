// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! # FolioBlocks
//! Node runtime of a permissioned ledger for academic credentials.
//!
//! ## Roles
//! * **Coordinator**: one per federation. Accepts every write over HTTP,
//!   encrypts it into a transaction, packs transactions into blocks and
//!   hands each block to one archival peer to seal. Sealed blocks are
//!   verified before they are appended.
//! * **Archival peer**: registers with the coordinator using an auth code,
//!   seals the blocks it is given with a proof of work search and keeps a
//!   full replica of the chain.
//!
//! ## Storage
//! Every node keeps two artifacts in its data directory: `chain.json`, the
//! chain itself, and `node.db`, a SQLite database holding entities, session
//! tokens, consensus negotiations and a content index of the chain. Both are
//! encrypted at rest with a key from the node's secrets file and decrypted
//! only while the node runs.
//!
//! ## Consensus
//! One block is in flight at a time. The coordinator selects an available
//! peer, delivers the unsealed block with a deadline and waits for the
//! sealed block. Peers that time out or submit an invalid seal are backed
//! off exponentially and the block goes to the next peer.

pub mod chain;
pub mod cli;
pub mod codec;
pub mod consensus;
pub mod crypto;
pub mod db;
pub mod global;
pub mod miner;
pub mod node;
pub mod primitives;
pub mod settings;
pub mod store;
