// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::db::entities::insert_entity;
use crate::db::{AssociationRow, AuthCodeRow, DbErr, EntityRow, MetaStore, TokenRow};
use crate::primitives::{Address, TokenState};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl MetaStore {
    /// Stores a new session token unless the entity already holds
    /// `max_live` live tokens.
    pub async fn insert_token(&self, row: TokenRow, max_live: usize) -> Result<(), DbErr> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let live: usize = tx.query_row(
                "SELECT COUNT(*) FROM tokens WHERE address = ?1 AND state IN (?2, ?3) AND expires_at > ?4",
                params![row.address, TokenState::Fresh, TokenState::InUse, Utc::now()],
                |row| row.get(0),
            )?;

            if live >= max_live {
                return Err(DbErr::Conflict(format!(
                    "entity already holds {live} live tokens"
                )));
            }

            tx.execute(
                "INSERT INTO tokens (value, address, state, issued_at, expires_at, last_used) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.value,
                    row.address,
                    row.state,
                    row.issued_at,
                    row.expires_at,
                    row.last_used
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_token(&self, value: String) -> Result<Option<TokenRow>, DbErr> {
        self.run(move |conn| {
            let row = conn
                .query_row(
                    "SELECT value, address, state, issued_at, expires_at, last_used \
                     FROM tokens WHERE value = ?1",
                    [&value],
                    |row| {
                        Ok(TokenRow {
                            value: row.get(0)?,
                            address: row.get(1)?,
                            state: row.get(2)?,
                            issued_at: row.get(3)?,
                            expires_at: row.get(4)?,
                            last_used: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Marks a live token as used. Returns false if the token is not live.
    pub async fn touch_token(&self, value: String, now: DateTime<Utc>) -> Result<bool, DbErr> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE tokens SET state = ?1, last_used = ?2 \
                 WHERE value = ?3 AND state IN (?4, ?1) AND expires_at > ?2",
                params![TokenState::InUse, now, value, TokenState::Fresh],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Expires a live token. Returns false if it was not live.
    pub async fn expire_token(&self, value: String) -> Result<bool, DbErr> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE tokens SET state = ?1 WHERE value = ?2 AND state IN (?3, ?4)",
                params![TokenState::Expired, value, TokenState::Fresh, TokenState::InUse],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Moves every live token past its expiry to `expired`.
    pub async fn sweep_tokens(&self, now: DateTime<Utc>) -> Result<usize, DbErr> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE tokens SET state = ?1 WHERE state IN (?2, ?3) AND expires_at <= ?4",
                params![TokenState::Expired, TokenState::Fresh, TokenState::InUse, now],
            )?;
            Ok(changed)
        })
        .await
    }

    pub async fn live_token_count(&self, address: Address) -> Result<usize, DbErr> {
        self.run(move |conn| {
            let count: usize = conn.query_row(
                "SELECT COUNT(*) FROM tokens WHERE address = ?1 AND state IN (?2, ?3)",
                params![address, TokenState::Fresh, TokenState::InUse],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    /// Stores a registration code. Fails with `Conflict` if the email is
    /// already registered or holds a live code.
    pub async fn insert_auth_code(&self, row: AuthCodeRow) -> Result<(), DbErr> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let registered: i64 = tx.query_row(
                "SELECT COUNT(*) FROM entities WHERE email = ?1",
                [&row.email],
                |r| r.get(0),
            )?;

            if registered > 0 {
                return Err(DbErr::Conflict("email is already registered".to_owned()));
            }

            let live: i64 = tx.query_row(
                "SELECT COUNT(*) FROM auth_codes WHERE email = ?1 AND consumed = 0 AND expires_at > ?2",
                params![row.email, row.issued_at],
                |r| r.get(0),
            )?;

            if live > 0 {
                return Err(DbErr::Conflict("email already holds a live code".to_owned()));
            }

            tx.execute(
                "INSERT INTO auth_codes (code, email, role, issued_by, issued_at, expires_at, consumed) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.code,
                    row.email,
                    row.role,
                    row.issued_by,
                    row.issued_at,
                    row.expires_at,
                    row.consumed
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Live, unconsumed registration codes.
    pub async fn list_unused_auth_codes(&self, now: DateTime<Utc>) -> Result<Vec<AuthCodeRow>, DbErr> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT code, email, role, issued_by, issued_at, expires_at, consumed \
                 FROM auth_codes WHERE consumed = 0 AND expires_at > ?1 ORDER BY issued_at",
            )?;
            let rows = stmt
                .query_map([now], |row| {
                    Ok(AuthCodeRow {
                        code: row.get(0)?,
                        email: row.get(1)?,
                        role: row.get(2)?,
                        issued_by: row.get(3)?,
                        issued_at: row.get(4)?,
                        expires_at: row.get(5)?,
                        consumed: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Consumes `code` and inserts `entity` in one transaction. The code
    /// must be live and bound to the entity's email and role.
    pub async fn register_with_code(
        &self,
        code: String,
        entity: EntityRow,
        association: Option<AssociationRow>,
    ) -> Result<(), DbErr> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE auth_codes SET consumed = 1 \
                 WHERE code = ?1 AND email = ?2 AND role = ?3 AND consumed = 0 AND expires_at > ?4",
                params![code, entity.email, entity.role, entity.registered_at],
            )?;

            if changed != 1 {
                return Err(DbErr::NotFound);
            }

            if let Some(association) = &association {
                tx.execute(
                    "INSERT INTO associations (address, name, kind, created_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        association.address,
                        association.name,
                        association.kind,
                        association.created_at
                    ],
                )?;
            }

            insert_entity(&tx, &entity)?;
            tx.commit()?;
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

    fn token(address: &Address, value: &str, expires_at: DateTime<Utc>) -> TokenRow {
        TokenRow {
            value: value.to_owned(),
            address: address.clone(),
            state: TokenState::Fresh,
            issued_at: Utc::now(),
            expires_at,
            last_used: None,
        }
    }

    #[tokio::test]
    async fn live_token_limit() {
        let store = MetaStore::open_in_memory().unwrap();
        let row = entity(Role::Employer, "acme");
        store.insert_entity(row.clone()).await.unwrap();
        let expiry = Utc::now() + Duration::days(7);

        for i in 0..5 {
            store
                .insert_token(token(&row.address, &format!("t{i}"), expiry), 5)
                .await
                .unwrap();
        }

        assert!(matches!(
            store.insert_token(token(&row.address, "t5", expiry), 5).await,
            Err(DbErr::Conflict(_))
        ));

        assert!(store.expire_token("t0".to_owned()).await.unwrap());
        assert!(!store.expire_token("t0".to_owned()).await.unwrap());
        store
            .insert_token(token(&row.address, "t5", expiry), 5)
            .await
            .unwrap();
        assert_eq!(store.live_token_count(row.address).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn touch_and_sweep() {
        let store = MetaStore::open_in_memory().unwrap();
        let row = entity(Role::Employer, "acme");
        store.insert_entity(row.clone()).await.unwrap();
        let now = Utc::now();
        store
            .insert_token(token(&row.address, "live", now + Duration::days(7)), 5)
            .await
            .unwrap();
        store
            .insert_token(token(&row.address, "stale", now + Duration::seconds(1)), 5)
            .await
            .unwrap();

        assert!(store.touch_token("live".to_owned(), now).await.unwrap());
        assert_eq!(
            store.get_token("live".to_owned()).await.unwrap().unwrap().state,
            TokenState::InUse
        );

        // One sweep past the expiry moves the stale token
        let swept = store.sweep_tokens(now + Duration::seconds(2)).await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(
            store.get_token("stale".to_owned()).await.unwrap().unwrap().state,
            TokenState::Expired
        );
        assert!(!store
            .touch_token("stale".to_owned(), now + Duration::seconds(3))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn auth_code_lifecycle() {
        let store = MetaStore::open_in_memory().unwrap();
        let admin = entity(Role::Admin, "root");
        store.insert_entity(admin.clone()).await.unwrap();
        let now = Utc::now();
        let code = AuthCodeRow {
            code: "0123456789abcdef".to_owned(),
            email: "registrar@folio.test".to_owned(),
            role: Role::Institution,
            issued_by: admin.address.clone(),
            issued_at: now,
            expires_at: now + Duration::hours(24),
            consumed: false,
        };
        store.insert_auth_code(code.clone()).await.unwrap();

        // Same email cannot hold two live codes
        let mut second = code.clone();
        second.code = "fedcba9876543210".to_owned();
        assert!(matches!(
            store.insert_auth_code(second).await,
            Err(DbErr::Conflict(_))
        ));
        assert_eq!(store.list_unused_auth_codes(now).await.unwrap(), vec![code.clone()]);

        // Wrong role does not consume
        let mut wrong = entity(Role::Employer, "registrar");
        wrong.email = code.email.clone();
        assert!(matches!(
            store.register_with_code(code.code.clone(), wrong, None).await,
            Err(DbErr::NotFound)
        ));

        let mut registrar = entity(Role::Institution, "registrar");
        registrar.email = code.email.clone();
        store
            .register_with_code(code.code.clone(), registrar.clone(), None)
            .await
            .unwrap();
        assert!(store.list_unused_auth_codes(now).await.unwrap().is_empty());

        // Consumed codes cannot be reused
        let mut again = entity(Role::Institution, "registrar2");
        again.email = code.email.clone();
        assert!(matches!(
            store.register_with_code(code.code.clone(), again, None).await,
            Err(DbErr::NotFound)
        ));
    }
}
