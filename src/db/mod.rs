// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Metadata store over a single SQLite connection.
//!
//! All access goes through [`MetaStore::run`], which executes the closure on
//! the blocking pool while holding the connection lock. Busy or locked
//! databases are retried with exponential backoff before surfacing as
//! [`DbErr::Unavailable`].

mod consensus;
mod entities;
mod ledger;
mod models;
pub mod schema;
mod tokens;

pub use entities::new_entity;
pub use models::*;

#[cfg(test)]
pub(crate) use entities::tests as test_utils;

use crate::primitives::{
    Action, ActivityState, Address, AssociationKind, Hash256, NegotiationState, NodeStatus,
    RequestState, Role, TokenState,
};
use log::*;
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, ErrorCode};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const BUSY_RETRIES: u32 = 3;
const BUSY_BACKOFF_BASE: Duration = Duration::from_millis(25);

#[derive(Clone)]
pub struct MetaStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetaStore {
    pub fn open(path: &Path) -> Result<Self, DbErr> {
        info!("Opening metadata database at {}", path.display());
        let mut conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(250))?;
        schema::init_schema(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, DbErr> {
        let mut conn = Connection::open_in_memory()?;
        schema::init_schema(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` on the blocking pool with exclusive access to the connection.
    pub async fn run<F, T>(&self, f: F) -> Result<T, DbErr>
    where
        F: Fn(&mut Connection) -> Result<T, DbErr> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut attempt = 0;

            loop {
                let result = {
                    let mut guard = conn.lock();
                    f(&mut guard)
                };

                match result {
                    Err(DbErr::Busy) if attempt < BUSY_RETRIES => {
                        let backoff = BUSY_BACKOFF_BASE * 2_u32.pow(attempt);
                        debug!("Metadata database busy, retrying in {:?}", backoff);
                        std::thread::sleep(backoff);
                        attempt += 1;
                    }
                    Err(DbErr::Busy) => return Err(DbErr::Unavailable),
                    other => return other,
                }
            }
        })
        .await
        .map_err(|_| DbErr::Unavailable)?
    }

    /// Closes the connection once every other handle has been dropped.
    pub fn close(self) -> Result<(), DbErr> {
        match Arc::try_unwrap(self.conn) {
            Ok(conn) => conn.into_inner().close().map_err(|(_, err)| err.into()),
            Err(_) => {
                warn!("Metadata database still referenced at shutdown");
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
pub enum DbErr {
    /// Unique constraint violated
    Conflict(String),

    /// Referenced row does not exist
    MissingReference,

    /// Row not found
    NotFound,

    /// Database is busy or locked. Retried internally
    Busy,

    /// Retries exhausted or worker lost
    Unavailable,

    /// Stored schema version is not supported
    Schema(i64),

    /// Stored value could not be decoded
    Codec(String),

    /// Any other sqlite error
    Sqlite(rusqlite::Error),
}

impl fmt::Display for DbErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::MissingReference => f.write_str("referenced row does not exist"),
            Self::NotFound => f.write_str("not found"),
            Self::Busy => f.write_str("database busy"),
            Self::Unavailable => f.write_str("database unavailable"),
            Self::Schema(v) => write!(f, "unsupported schema version {v}"),
            Self::Codec(msg) => write!(f, "stored value is malformed: {msg}"),
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
        }
    }
}

impl From<rusqlite::Error> for DbErr {
    fn from(other: rusqlite::Error) -> Self {
        match &other {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound,
            rusqlite::Error::SqliteFailure(err, msg) => match err.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Self::Busy,
                ErrorCode::ConstraintViolation => match err.extended_code {
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                        Self::Conflict(msg.clone().unwrap_or_else(|| "duplicate row".to_owned()))
                    }
                    rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Self::MissingReference,
                    _ => Self::Sqlite(other),
                },
                _ => Self::Sqlite(other),
            },
            _ => Self::Sqlite(other),
        }
    }
}

impl From<serde_json::Error> for DbErr {
    fn from(other: serde_json::Error) -> Self {
        Self::Codec(other.to_string())
    }
}

/// Stores closed enums and identifiers as their text form.
macro_rules! impl_sql_text {
    ($($name:ty),+ $(,)?) => {
        $(
            impl ToSql for $name {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    Ok(ToSqlOutput::from(self.to_string()))
                }
            }

            impl FromSql for $name {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    value
                        .as_str()?
                        .parse()
                        .map_err(|err: &'static str| FromSqlError::Other(err.into()))
                }
            }
        )+
    };
}

impl_sql_text!(
    Address,
    Hash256,
    Role,
    ActivityState,
    TokenState,
    AssociationKind,
    NodeStatus,
    RequestState,
    NegotiationState,
    Action,
);
