// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::primitives::{
    Action, ActivityState, Address, AssociationKind, Hash256, NegotiationState, NodeStatus,
    RequestState, Role, TokenState,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EntityRow {
    pub address: Address,
    pub role: Role,
    pub username: String,
    pub email: String,

    #[serde(skip)]
    pub password_hash: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub program: Option<String>,
    pub association: Option<Address>,
    pub activity: ActivityState,
    pub registered_at: DateTime<Utc>,
}

impl EntityRow {
    pub(crate) const COLUMNS: &'static str = "address, role, username, email, password_hash, \
        first_name, last_name, program, association, activity, registered_at";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            address: row.get(0)?,
            role: row.get(1)?,
            username: row.get(2)?,
            email: row.get(3)?,
            password_hash: row.get(4)?,
            first_name: row.get(5)?,
            last_name: row.get(6)?,
            program: row.get(7)?,
            association: row.get(8)?,
            activity: row.get(9)?,
            registered_at: row.get(10)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AssociationRow {
    pub address: Address,
    pub name: String,
    pub kind: AssociationKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TokenRow {
    pub value: String,
    pub address: Address,
    pub state: TokenState,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuthCodeRow {
    pub code: String,
    pub email: String,
    pub role: Role,
    pub issued_by: Address,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TxMappingRow {
    pub tx_hash: Hash256,
    pub address_ref: Address,
    pub content_type: Action,
    pub block_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NegotiationRow {
    pub id: String,
    pub coordinator: Address,
    pub peer: Address,
    pub block_id: u64,
    pub state: NegotiationState,
    pub opened_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempt: u32,

    /// Unsealed block, json
    pub block: String,
}

impl NegotiationRow {
    pub(crate) const COLUMNS: &'static str =
        "id, coordinator, peer, block_id, state, opened_at, deadline, updated_at, attempt, block";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            coordinator: row.get(1)?,
            peer: row.get(2)?,
            block_id: row.get(3)?,
            state: row.get(4)?,
            opened_at: row.get(5)?,
            deadline: row.get(6)?,
            updated_at: row.get(7)?,
            attempt: row.get(8)?,
            block: row.get(9)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AssociatedNodeRow {
    pub address: Address,
    pub host: String,
    pub port: u16,

    #[serde(skip)]
    pub certificate: String,
    pub status: NodeStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl AssociatedNodeRow {
    pub(crate) const COLUMNS: &'static str =
        "address, host, port, certificate, status, last_seen, registered_at";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            address: row.get(0)?,
            host: row.get(1)?,
            port: row.get(2)?,
            certificate: row.get(3)?,
            status: row.get(4)?,
            last_seen: row.get(5)?,
            registered_at: row.get(6)?,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AccessRequestRow {
    pub id: String,
    pub requestor: Address,
    pub receiver: Address,
    pub reason: String,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccessRequestRow {
    pub(crate) const COLUMNS: &'static str =
        "id, requestor, receiver, reason, state, created_at, updated_at";

    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            requestor: row.get(1)?,
            receiver: row.get(2)?,
            reason: row.get(3)?,
            state: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

/// Identity of the local node, a single row.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeIdentity {
    pub address: Address,
    pub role: Role,
    pub username: String,

    /// Certificate presented by the coordinator to this peer
    pub certificate: Option<String>,
    pub coordinator_address: Option<Address>,
}

/// Counters shown on the dashboard summary.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ActivityCounts {
    pub associated: u64,
    pub logs: u64,
    pub remarks: u64,
    pub documents: u64,
    pub total_transactions: u64,
    pub total_entities: u64,
}
