// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::db::{ActivityCounts, AssociationRow, DbErr, EntityRow, MetaStore};
use crate::primitives::{Action, ActivityState, Address, Role};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

pub(crate) fn insert_entity(conn: &Connection, row: &EntityRow) -> Result<(), DbErr> {
    conn.execute(
        &format!(
            "INSERT INTO entities ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            EntityRow::COLUMNS
        ),
        params![
            row.address,
            row.role,
            row.username,
            row.email,
            row.password_hash,
            row.first_name,
            row.last_name,
            row.program,
            row.association,
            row.activity,
            row.registered_at,
        ],
    )?;
    Ok(())
}

pub(crate) fn get_entity(conn: &Connection, address: &Address) -> Result<Option<EntityRow>, DbErr> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM entities WHERE address = ?1", EntityRow::COLUMNS),
            [address],
            EntityRow::from_row,
        )
        .optional()?;
    Ok(row)
}

impl MetaStore {
    pub async fn insert_association(&self, row: AssociationRow) -> Result<(), DbErr> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO associations (address, name, kind, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![row.address, row.name, row.kind, row.created_at],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_association(&self, address: Address) -> Result<Option<AssociationRow>, DbErr> {
        self.run(move |conn| {
            let row = conn
                .query_row(
                    "SELECT address, name, kind, created_at FROM associations WHERE address = ?1",
                    [&address],
                    |row| {
                        Ok(AssociationRow {
                            address: row.get(0)?,
                            name: row.get(1)?,
                            kind: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    pub async fn insert_entity(&self, row: EntityRow) -> Result<(), DbErr> {
        self.run(move |conn| insert_entity(conn, &row)).await
    }

    /// Inserts an association and its founding entity in one transaction.
    pub async fn insert_entity_with_association(
        &self,
        association: AssociationRow,
        row: EntityRow,
    ) -> Result<(), DbErr> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO associations (address, name, kind, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    association.address,
                    association.name,
                    association.kind,
                    association.created_at
                ],
            )?;
            insert_entity(&tx, &row)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_entity(&self, address: Address) -> Result<Option<EntityRow>, DbErr> {
        self.run(move |conn| get_entity(conn, &address)).await
    }

    pub async fn get_entity_by_username(&self, username: String) -> Result<Option<EntityRow>, DbErr> {
        self.run(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM entities WHERE username = ?1", EntityRow::COLUMNS),
                    [&username],
                    EntityRow::from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    pub async fn email_taken(&self, email: String) -> Result<bool, DbErr> {
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM entities WHERE email = ?1",
                [&email],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    pub async fn set_activity(&self, address: Address, activity: ActivityState) -> Result<(), DbErr> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE entities SET activity = ?1 WHERE address = ?2",
                params![activity, address],
            )?;

            if changed == 0 {
                return Err(DbErr::NotFound);
            }

            Ok(())
        })
        .await
    }

    /// Entities ordered by registration, newest first.
    pub async fn list_entities(&self, limit: u32, offset: u32) -> Result<Vec<EntityRow>, DbErr> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM entities ORDER BY registered_at DESC, address LIMIT ?1 OFFSET ?2",
                EntityRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![limit, offset], EntityRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn count_entities(&self) -> Result<u64, DbErr> {
        self.run(|conn| {
            let count: u64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
            Ok(count)
        })
        .await
    }

    /// Entities of `role` belonging to `association`.
    pub async fn members_of(
        &self,
        association: Address,
        role: Role,
    ) -> Result<Vec<EntityRow>, DbErr> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM entities WHERE association = ?1 AND role = ?2 ORDER BY registered_at",
                EntityRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![association, role], EntityRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Returns true if the entity is the earliest registered member of its
    /// association.
    pub async fn is_association_founder(&self, address: Address) -> Result<bool, DbErr> {
        self.run(move |conn| {
            let entity = get_entity(conn, &address)?.ok_or(DbErr::NotFound)?;
            let association = match entity.association {
                Some(association) => association,
                None => return Ok(false),
            };
            let earlier: i64 = conn.query_row(
                "SELECT COUNT(*) FROM entities WHERE association = ?1 AND registered_at < ?2",
                params![association, entity.registered_at],
                |row| row.get(0),
            )?;
            Ok(earlier == 0)
        })
        .await
    }

    /// Dashboard counters for an entity. Institutions see their association,
    /// everyone else sees themselves.
    pub async fn activity_counts(&self, address: Address) -> Result<ActivityCounts, DbErr> {
        self.run(move |conn| {
            let entity = get_entity(conn, &address)?.ok_or(DbErr::NotFound)?;
            let subjects: Vec<Address> = match (entity.role, &entity.association) {
                (Role::Institution, Some(association)) => {
                    let mut stmt = conn.prepare(
                        "SELECT address FROM entities WHERE association = ?1 AND role = ?2",
                    )?;
                    let rows = stmt
                        .query_map(params![association, Role::Applicant], |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                _ => vec![entity.address.clone()],
            };

            let mut counts = ActivityCounts {
                associated: subjects.len() as u64,
                ..ActivityCounts::default()
            };

            // Issuances are indexed under the issuing institution
            let mut subjects = subjects;
            if entity.role == Role::Institution {
                subjects.push(entity.address.clone());
            }

            let mut stmt = conn.prepare(
                "SELECT content_type, COUNT(*) FROM tx_content_mappings \
                 WHERE address_ref = ?1 GROUP BY content_type",
            )?;

            for subject in &subjects {
                let rows = stmt.query_map([subject], |row| {
                    Ok((row.get::<_, Action>(0)?, row.get::<_, u64>(1)?))
                })?;

                for row in rows {
                    let (action, count) = row?;
                    match action {
                        Action::ApplicantLogAdded => counts.logs += count,
                        Action::ExtraRemarkAdded => counts.remarks += count,
                        Action::DocumentMinted | Action::DocumentBatchMinted => {
                            counts.documents += count;
                        }
                        _ => {}
                    }
                }
            }

            counts.total_transactions =
                conn.query_row("SELECT COUNT(*) FROM tx_content_mappings", [], |row| row.get(0))?;
            counts.total_entities =
                conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
            Ok(counts)
        })
        .await
    }
}

/// Row for a freshly registered entity.
#[must_use]
pub fn new_entity(
    role: Role,
    username: String,
    email: String,
    password_hash: String,
    association: Option<Address>,
    registered_at: DateTime<Utc>,
) -> EntityRow {
    EntityRow {
        address: Address::random(),
        role,
        username,
        email,
        password_hash,
        first_name: None,
        last_name: None,
        program: None,
        association,
        activity: ActivityState::Offline,
        registered_at,
    }
}
