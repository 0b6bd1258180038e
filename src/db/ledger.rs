// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::db::{AccessRequestRow, DbErr, MetaStore, NodeIdentity, TxMappingRow};
use crate::primitives::{Action, Address, Hash256, RequestState};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

pub(crate) fn insert_tx_mapping(conn: &Connection, row: &TxMappingRow) -> Result<(), DbErr> {
    conn.execute(
        "INSERT OR IGNORE INTO tx_content_mappings (tx_hash, address_ref, content_type, block_id, timestamp) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![row.tx_hash, row.address_ref, row.content_type, row.block_id, row.timestamp],
    )?;
    Ok(())
}

fn mapping_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TxMappingRow> {
    Ok(TxMappingRow {
        tx_hash: row.get(0)?,
        address_ref: row.get(1)?,
        content_type: row.get(2)?,
        block_id: row.get(3)?,
        timestamp: row.get(4)?,
    })
}

impl MetaStore {
    /// Writes a content-type index row. Writing the same `tx_hash` twice is
    /// a no-op.
    pub async fn insert_tx_mapping(&self, row: TxMappingRow) -> Result<(), DbErr> {
        self.run(move |conn| insert_tx_mapping(conn, &row)).await
    }

    /// Index rows for every transaction of a finalized block, in one
    /// transaction. Rows already present get their block id filled in.
    pub async fn index_block(&self, block_id: u64, rows: Vec<TxMappingRow>) -> Result<(), DbErr> {
        self.run(move |conn| {
            let tx = conn.transaction()?;

            for row in &rows {
                insert_tx_mapping(&tx, row)?;
                tx.execute(
                    "UPDATE tx_content_mappings SET block_id = ?1 WHERE tx_hash = ?2",
                    params![block_id, row.tx_hash],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_tx_mapping(&self, tx_hash: Hash256) -> Result<Option<TxMappingRow>, DbErr> {
        self.run(move |conn| {
            let row = conn
                .query_row(
                    "SELECT tx_hash, address_ref, content_type, block_id, timestamp \
                     FROM tx_content_mappings WHERE tx_hash = ?1",
                    [&tx_hash],
                    mapping_from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Index rows referencing `address`, optionally narrowed to one action.
    pub async fn mappings_of(
        &self,
        address: Address,
        action: Option<Action>,
    ) -> Result<Vec<TxMappingRow>, DbErr> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT tx_hash, address_ref, content_type, block_id, timestamp \
                 FROM tx_content_mappings \
                 WHERE address_ref = ?1 AND (?2 IS NULL OR content_type = ?2) \
                 ORDER BY timestamp",
            )?;
            let rows = stmt
                .query_map(params![address, action], mapping_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Index rows not yet covered by a finalized block.
    pub async fn unconfirmed_mappings(&self) -> Result<Vec<TxMappingRow>, DbErr> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tx_hash, address_ref, content_type, block_id, timestamp \
                 FROM tx_content_mappings WHERE block_id IS NULL ORDER BY timestamp",
            )?;
            let rows = stmt
                .query_map([], mapping_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn set_file_signature(
        &self,
        filename: &'static str,
        digest: Hash256,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO file_signatures (filename, digest, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(filename) DO UPDATE SET digest = excluded.digest, updated_at = excluded.updated_at",
                params![filename, digest, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_file_signature(&self, filename: &'static str) -> Result<Option<Hash256>, DbErr> {
        self.run(move |conn| {
            let digest = conn
                .query_row(
                    "SELECT digest FROM file_signatures WHERE filename = ?1",
                    [filename],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(digest)
        })
        .await
    }

    pub async fn insert_access_request(&self, row: AccessRequestRow) -> Result<(), DbErr> {
        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO access_requests ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    AccessRequestRow::COLUMNS
                ),
                params![
                    row.id,
                    row.requestor,
                    row.receiver,
                    row.reason,
                    row.state,
                    row.created_at,
                    row.updated_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_access_request(&self, id: String) -> Result<Option<AccessRequestRow>, DbErr> {
        self.run(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM access_requests WHERE id = ?1",
                        AccessRequestRow::COLUMNS
                    ),
                    [&id],
                    AccessRequestRow::from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Requests where `address` is either side, newest first.
    pub async fn access_requests_of(&self, address: Address) -> Result<Vec<AccessRequestRow>, DbErr> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM access_requests WHERE requestor = ?1 OR receiver = ?1 \
                 ORDER BY created_at DESC",
                AccessRequestRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map([&address], AccessRequestRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Moves a request from `from` to `to`. Fails with `Conflict` if the
    /// request is no longer in `from`.
    pub async fn transition_access_request(
        &self,
        id: String,
        from: RequestState,
        to: RequestState,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE access_requests SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
                params![to, now, id, from],
            )?;

            if changed == 0 {
                let exists: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM access_requests WHERE id = ?1",
                    [&id],
                    |row| row.get(0),
                )?;

                if exists == 0 {
                    return Err(DbErr::NotFound);
                }

                return Err(DbErr::Conflict(format!("request is not {from}")));
            }

            Ok(())
        })
        .await
    }

    pub async fn node_identity(&self) -> Result<Option<NodeIdentity>, DbErr> {
        self.run(|conn| {
            let row = conn
                .query_row(
                    "SELECT address, role, username, certificate, coordinator_address \
                     FROM node_identity WHERE id = 1",
                    [],
                    |row| {
                        Ok(NodeIdentity {
                            address: row.get(0)?,
                            role: row.get(1)?,
                            username: row.get(2)?,
                            certificate: row.get(3)?,
                            coordinator_address: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    pub async fn set_node_identity(&self, identity: NodeIdentity) -> Result<(), DbErr> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO node_identity (id, address, role, username, certificate, coordinator_address) \
                 VALUES (1, ?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(id) DO UPDATE SET address = excluded.address, role = excluded.role, \
                 username = excluded.username, certificate = excluded.certificate, \
                 coordinator_address = excluded.coordinator_address",
                params![
                    identity.address,
                    identity.role,
                    identity.username,
                    identity.certificate,
                    identity.coordinator_address
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Session token this peer holds at its coordinator.
    pub async fn session_token(&self) -> Result<Option<String>, DbErr> {
        self.run(|conn| {
            let token: Option<Option<String>> = conn
                .query_row(
                    "SELECT session_token FROM node_identity WHERE id = 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(token.flatten())
        })
        .await
    }

    /// Stores the session token. Does nothing before the identity exists.
    pub async fn set_session_token(&self, token: Option<String>) -> Result<(), DbErr> {
        self.run(move |conn| {
            conn.execute(
                "UPDATE node_identity SET session_token = ?1 WHERE id = 1",
                params![token],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::entities::tests::entity;
    use crate::primitives::Role;
    use chrono::Duration;

    fn mapping(address: &Address, action: Action, seed: &[u8]) -> TxMappingRow {
        TxMappingRow {
            tx_hash: Hash256::hash_from_slice(seed),
            address_ref: address.clone(),
            content_type: action,
            block_id: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn tx_mappings_are_idempotent() {
        let store = MetaStore::open_in_memory().unwrap();
        let address = Address::random();
        let row = mapping(&address, Action::ApplicantLogAdded, b"tx-1");
        store.insert_tx_mapping(row.clone()).await.unwrap();
        store.insert_tx_mapping(row.clone()).await.unwrap();

        let other = mapping(&address, Action::ExtraRemarkAdded, b"tx-2");
        store
            .index_block(3, vec![row.clone(), other.clone()])
            .await
            .unwrap();

        let all = store.mappings_of(address.clone(), None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.block_id == Some(3)));

        let logs = store
            .mappings_of(address, Some(Action::ApplicantLogAdded))
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].tx_hash, row.tx_hash);
        assert!(store.unconfirmed_mappings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_signature_upsert() {
        let store = MetaStore::open_in_memory().unwrap();
        assert!(store.get_file_signature("chain.json").await.unwrap().is_none());
        let first = Hash256::hash_from_slice(b"one");
        let second = Hash256::hash_from_slice(b"two");
        store
            .set_file_signature("chain.json", first, Utc::now())
            .await
            .unwrap();
        store
            .set_file_signature("chain.json", second, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            store.get_file_signature("chain.json").await.unwrap(),
            Some(second)
        );
    }

    #[tokio::test]
    async fn access_request_transitions() {
        let store = MetaStore::open_in_memory().unwrap();
        let employer = entity(Role::Employer, "acme");
        let applicant = entity(Role::Applicant, "student");
        store.insert_entity(employer.clone()).await.unwrap();
        store.insert_entity(applicant.clone()).await.unwrap();
        let now = Utc::now();
        let row = AccessRequestRow {
            id: "req-1".to_owned(),
            requestor: employer.address.clone(),
            receiver: applicant.address.clone(),
            reason: "background check".to_owned(),
            state: RequestState::Opened,
            created_at: now,
            updated_at: now,
        };
        store.insert_access_request(row).await.unwrap();

        store
            .transition_access_request(
                "req-1".to_owned(),
                RequestState::Opened,
                RequestState::Approved,
                now + Duration::seconds(1),
            )
            .await
            .unwrap();
        assert!(matches!(
            store
                .transition_access_request(
                    "req-1".to_owned(),
                    RequestState::Opened,
                    RequestState::Rejected,
                    now,
                )
                .await,
            Err(DbErr::Conflict(_))
        ));
        assert!(matches!(
            store
                .transition_access_request(
                    "missing".to_owned(),
                    RequestState::Opened,
                    RequestState::Rejected,
                    now,
                )
                .await,
            Err(DbErr::NotFound)
        ));

        let of_applicant = store.access_requests_of(applicant.address).await.unwrap();
        assert_eq!(of_applicant.len(), 1);
        assert_eq!(of_applicant[0].state, RequestState::Approved);
    }

    #[tokio::test]
    async fn identity_is_a_single_row() {
        let store = MetaStore::open_in_memory().unwrap();
        assert!(store.node_identity().await.unwrap().is_none());
        let mut identity = NodeIdentity {
            address: Address::random(),
            role: Role::ArchivalPeer,
            username: "archive-1".to_owned(),
            certificate: None,
            coordinator_address: None,
        };
        store.set_node_identity(identity.clone()).await.unwrap();
        identity.certificate = Some("cert".to_owned());
        identity.coordinator_address = Some(Address::random());
        store.set_node_identity(identity.clone()).await.unwrap();
        assert_eq!(store.node_identity().await.unwrap(), Some(identity));
    }

    #[tokio::test]
    async fn session_token_survives_identity_updates() {
        let store = MetaStore::open_in_memory().unwrap();
        store.set_session_token(Some("early".to_owned())).await.unwrap();
        assert_eq!(store.session_token().await.unwrap(), None);

        let mut identity = NodeIdentity {
            address: Address::random(),
            role: Role::ArchivalPeer,
            username: "archive-1".to_owned(),
            certificate: None,
            coordinator_address: None,
        };
        store.set_node_identity(identity.clone()).await.unwrap();
        store.set_session_token(Some("token".to_owned())).await.unwrap();

        identity.certificate = Some("cert".to_owned());
        store.set_node_identity(identity).await.unwrap();
        assert_eq!(store.session_token().await.unwrap().as_deref(), Some("token"));

        store.set_session_token(None).await.unwrap();
        assert_eq!(store.session_token().await.unwrap(), None);
    }
}
