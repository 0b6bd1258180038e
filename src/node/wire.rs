// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Request and response bodies exchanged between nodes and clients.

use crate::primitives::{Address, Block, Hash256, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TOKEN_HEADER: &str = "x-token";
pub const PASSCODE_HEADER: &str = "x-passcode";
pub const HASH_HEADER: &str = "x-hash";
pub const CERTIFICATE_HEADER: &str = "x-certificate";

/// Machine readable error returned by every failing endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub email: String,
    pub auth_code: String,
    pub role: Role,

    #[serde(default)]
    pub first_name: Option<String>,

    #[serde(default)]
    pub last_name: Option<String>,

    /// Name of the institution or company founded by the registrant
    #[serde(default)]
    pub association_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub address: Address,
    pub username: String,
    pub role: Role,
    pub registered: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub address: Address,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifyRequest {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CertifyResponse {
    pub certificate: String,
    pub coordinator_address: Address,
    pub chain_hash: Hash256,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub blocks: Vec<Block>,
    pub chain_hash: Hash256,
}

/// Coordinator to peer: seal this block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub negotiation_id: String,
    pub coordinator_address: Address,
    pub block: Block,
    pub deadline: DateTime<Utc>,
}

/// Peer to coordinator: the sealed block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SealRequest {
    pub negotiation_id: String,
    pub block: Block,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SealResponse {
    pub block_hash: Hash256,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Hashing,
    Abandoned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub status: ProgressStatus,
}
