// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::db::{AssociatedNodeRow, DbErr, MetaStore, NegotiationRow};
use crate::primitives::{Address, NegotiationState, NodeStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl MetaStore {
    pub async fn insert_negotiation(&self, row: NegotiationRow) -> Result<(), DbErr> {
        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO consensus_negotiations ({}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    NegotiationRow::COLUMNS
                ),
                params![
                    row.id,
                    row.coordinator,
                    row.peer,
                    row.block_id,
                    row.state,
                    row.opened_at,
                    row.deadline,
                    row.updated_at,
                    row.attempt,
                    row.block
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_negotiation(&self, id: String) -> Result<Option<NegotiationRow>, DbErr> {
        self.run(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM consensus_negotiations WHERE id = ?1",
                        NegotiationRow::COLUMNS
                    ),
                    [&id],
                    NegotiationRow::from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Compare-and-set on the negotiation state. Fails with `Conflict` if
    /// the row is not in `from`, `NotFound` if it does not exist.
    pub async fn transition_negotiation(
        &self,
        id: String,
        from: NegotiationState,
        to: NegotiationState,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE consensus_negotiations \
                 SET state = ?1, updated_at = ?2, deadline = COALESCE(?3, deadline) \
                 WHERE id = ?4 AND state = ?5",
                params![to, now, deadline, id, from],
            )?;

            if changed == 0 {
                let state: Option<NegotiationState> = conn
                    .query_row(
                        "SELECT state FROM consensus_negotiations WHERE id = ?1",
                        [&id],
                        |row| row.get(0),
                    )
                    .optional()?;

                return match state {
                    None => Err(DbErr::NotFound),
                    Some(state) => Err(DbErr::Conflict(format!(
                        "negotiation is {state}, expected {from}"
                    ))),
                };
            }

            Ok(())
        })
        .await
    }

    /// Refreshes `updated_at` of a non-terminal negotiation.
    pub async fn touch_negotiation(&self, id: String, now: DateTime<Utc>) -> Result<bool, DbErr> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE consensus_negotiations SET updated_at = ?1 \
                 WHERE id = ?2 AND state NOT IN (?3, ?4)",
                params![now, id, NegotiationState::Finalized, NegotiationState::Failed],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Negotiations not yet finalized or failed, oldest first.
    pub async fn active_negotiations(&self) -> Result<Vec<NegotiationRow>, DbErr> {
        self.run(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM consensus_negotiations WHERE state NOT IN (?1, ?2) \
                 ORDER BY opened_at",
                NegotiationRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    params![NegotiationState::Finalized, NegotiationState::Failed],
                    NegotiationRow::from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Marks every non-terminal negotiation as failed and returns them as
    /// they were before the update.
    pub async fn fail_active_negotiations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<NegotiationRow>, DbErr> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let rows = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM consensus_negotiations WHERE state NOT IN (?1, ?2) \
                     ORDER BY opened_at",
                    NegotiationRow::COLUMNS
                ))?;
                let rows = stmt
                    .query_map(
                        params![NegotiationState::Finalized, NegotiationState::Failed],
                        NegotiationRow::from_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            tx.execute(
                "UPDATE consensus_negotiations SET state = ?1, updated_at = ?2 \
                 WHERE state NOT IN (?3, ?1)",
                params![NegotiationState::Failed, now, NegotiationState::Finalized],
            )?;
            tx.commit()?;
            Ok(rows)
        })
        .await
    }

    /// Inserts or refreshes an associated peer. Returns true if the peer
    /// was not known before.
    pub async fn upsert_associated_node(&self, row: AssociatedNodeRow) -> Result<bool, DbErr> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let known: i64 = tx.query_row(
                "SELECT COUNT(*) FROM associated_nodes WHERE address = ?1",
                [&row.address],
                |r| r.get(0),
            )?;
            tx.execute(
                &format!(
                    "INSERT INTO associated_nodes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT(address) DO UPDATE SET host = excluded.host, port = excluded.port, \
                     certificate = excluded.certificate, status = excluded.status, \
                     last_seen = excluded.last_seen",
                    AssociatedNodeRow::COLUMNS
                ),
                params![
                    row.address,
                    row.host,
                    row.port,
                    row.certificate,
                    row.status,
                    row.last_seen,
                    row.registered_at
                ],
            )?;
            tx.commit()?;
            Ok(known == 0)
        })
        .await
    }

    /// Associated peers ordered by address.
    pub async fn associated_nodes(&self) -> Result<Vec<AssociatedNodeRow>, DbErr> {
        self.run(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM associated_nodes ORDER BY address",
                AssociatedNodeRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map([], AssociatedNodeRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn get_associated_node(
        &self,
        address: Address,
    ) -> Result<Option<AssociatedNodeRow>, DbErr> {
        self.run(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM associated_nodes WHERE address = ?1",
                        AssociatedNodeRow::COLUMNS
                    ),
                    [&address],
                    AssociatedNodeRow::from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Updates a peer's status. `last_seen` is only moved forward when given.
    pub async fn set_node_status(
        &self,
        address: Address,
        status: NodeStatus,
        seen: Option<DateTime<Utc>>,
    ) -> Result<(), DbErr> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE associated_nodes SET status = ?1, last_seen = COALESCE(?2, last_seen) \
                 WHERE address = ?3",
                params![status, seen, address],
            )?;

            if changed == 0 {
                return Err(DbErr::NotFound);
            }

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

    fn negotiation(id: &str, peer: &Address, block_id: u64) -> NegotiationRow {
        let now = Utc::now();
        NegotiationRow {
            id: id.to_owned(),
            coordinator: Address::random(),
            peer: peer.clone(),
            block_id,
            state: NegotiationState::Opened,
            opened_at: now,
            deadline: now + Duration::seconds(10),
            updated_at: now,
            attempt: 1,
            block: "{}".to_owned(),
        }
    }

    async fn store_with_peer() -> (MetaStore, Address) {
        let store = MetaStore::open_in_memory().unwrap();
        let peer = entity(Role::ArchivalPeer, "archive-1");
        store.insert_entity(peer.clone()).await.unwrap();
        (store, peer.address)
    }

    #[tokio::test]
    async fn one_active_round_per_peer_and_block() {
        let (store, peer) = store_with_peer().await;
        store
            .insert_negotiation(negotiation("a", &peer, 1))
            .await
            .unwrap();
        assert!(matches!(
            store.insert_negotiation(negotiation("b", &peer, 1)).await,
            Err(DbErr::Conflict(_))
        ));

        // Once terminal another round for the same block may open
        store
            .transition_negotiation(
                "a".to_owned(),
                NegotiationState::Opened,
                NegotiationState::Failed,
                None,
                Utc::now(),
            )
            .await
            .unwrap();
        store
            .insert_negotiation(negotiation("b", &peer, 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_peer_is_rejected() {
        let store = MetaStore::open_in_memory().unwrap();
        assert!(matches!(
            store
                .insert_negotiation(negotiation("a", &Address::random(), 1))
                .await,
            Err(DbErr::MissingReference)
        ));
    }

    #[tokio::test]
    async fn compare_and_set_transitions() {
        let (store, peer) = store_with_peer().await;
        store
            .insert_negotiation(negotiation("a", &peer, 1))
            .await
            .unwrap();
        let later = Utc::now() + Duration::seconds(60);
        store
            .transition_negotiation(
                "a".to_owned(),
                NegotiationState::Opened,
                NegotiationState::Delivered,
                Some(later),
                Utc::now(),
            )
            .await
            .unwrap();

        let row = store.get_negotiation("a".to_owned()).await.unwrap().unwrap();
        assert_eq!(row.state, NegotiationState::Delivered);
        assert_eq!(row.deadline, later);

        assert!(matches!(
            store
                .transition_negotiation(
                    "a".to_owned(),
                    NegotiationState::Opened,
                    NegotiationState::Delivered,
                    None,
                    Utc::now(),
                )
                .await,
            Err(DbErr::Conflict(_))
        ));
        assert!(matches!(
            store
                .transition_negotiation(
                    "zz".to_owned(),
                    NegotiationState::Opened,
                    NegotiationState::Delivered,
                    None,
                    Utc::now(),
                )
                .await,
            Err(DbErr::NotFound)
        ));
    }

    #[tokio::test]
    async fn restart_fails_active_rounds() {
        let (store, peer) = store_with_peer().await;
        store
            .insert_negotiation(negotiation("a", &peer, 1))
            .await
            .unwrap();
        store
            .insert_negotiation(negotiation("b", &peer, 2))
            .await
            .unwrap();
        store
            .transition_negotiation(
                "b".to_owned(),
                NegotiationState::Opened,
                NegotiationState::Finalized,
                None,
                Utc::now(),
            )
            .await
            .unwrap();

        let failed = store.fail_active_negotiations(Utc::now()).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "a");
        assert_eq!(failed[0].state, NegotiationState::Opened);
        assert!(store.active_negotiations().await.unwrap().is_empty());
        assert_eq!(
            store.get_negotiation("b".to_owned()).await.unwrap().unwrap().state,
            NegotiationState::Finalized
        );
    }

    #[tokio::test]
    async fn associated_node_upsert() {
        let (store, peer) = store_with_peer().await;
        let row = AssociatedNodeRow {
            address: peer.clone(),
            host: "127.0.0.1".to_owned(),
            port: 6002,
            certificate: "cert-1".to_owned(),
            status: NodeStatus::Available,
            last_seen: None,
            registered_at: Utc::now(),
        };
        assert!(store.upsert_associated_node(row.clone()).await.unwrap());

        let mut again = row.clone();
        again.certificate = "cert-2".to_owned();
        assert!(!store.upsert_associated_node(again).await.unwrap());

        let seen = Utc::now();
        store
            .set_node_status(peer.clone(), NodeStatus::Unreachable, Some(seen))
            .await
            .unwrap();
        let fetched = store.get_associated_node(peer).await.unwrap().unwrap();
        assert_eq!(fetched.certificate, "cert-2");
        assert_eq!(fetched.status, NodeStatus::Unreachable);
        assert_eq!(fetched.last_seen, Some(seen));
        assert_eq!(fetched.registered_at, row.registered_at);
        assert_eq!(store.associated_nodes().await.unwrap().len(), 1);
    }
}
