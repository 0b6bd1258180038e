// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::db::DbErr;
use log::*;
use rusqlite::{Connection, OptionalExtension};

pub const SCHEMA_VERSION: i64 = 1;

pub fn init_schema(conn: &mut Connection) -> Result<(), DbErr> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let current: Option<i64> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    match current {
        None => {
            info!("Creating metadata schema v{}", SCHEMA_VERSION);
            let tx = conn.transaction()?;
            tx.execute_batch(TABLES)?;
            tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [SCHEMA_VERSION])?;
            tx.commit()?;
        }
        Some(version) if version == SCHEMA_VERSION => {
            debug!("Metadata schema is up to date (v{})", version);
        }
        Some(version) => {
            error!(
                "Metadata schema v{} is not supported by this build (v{})",
                version, SCHEMA_VERSION
            );
            return Err(DbErr::Schema(version));
        }
    }

    Ok(())
}

const TABLES: &str = r#"
CREATE TABLE associations (
    address     TEXT PRIMARY KEY NOT NULL,
    name        TEXT NOT NULL,
    kind        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE entities (
    address         TEXT PRIMARY KEY NOT NULL,
    role            TEXT NOT NULL,
    username        TEXT NOT NULL UNIQUE,
    email           TEXT NOT NULL UNIQUE,
    password_hash   TEXT NOT NULL,
    first_name      TEXT,
    last_name       TEXT,
    program         TEXT,
    association     TEXT REFERENCES associations(address),
    activity        TEXT NOT NULL,
    registered_at   TEXT NOT NULL
);

CREATE INDEX entities_association ON entities(association);

CREATE TABLE tokens (
    value       TEXT PRIMARY KEY NOT NULL,
    address     TEXT NOT NULL REFERENCES entities(address),
    state       TEXT NOT NULL,
    issued_at   TEXT NOT NULL,
    expires_at  TEXT NOT NULL,
    last_used   TEXT
);

CREATE INDEX tokens_address ON tokens(address, state);

CREATE TABLE auth_codes (
    code        TEXT PRIMARY KEY NOT NULL,
    email       TEXT NOT NULL,
    role        TEXT NOT NULL,
    issued_by   TEXT NOT NULL REFERENCES entities(address),
    issued_at   TEXT NOT NULL,
    expires_at  TEXT NOT NULL,
    consumed    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE tx_content_mappings (
    tx_hash         TEXT PRIMARY KEY NOT NULL,
    address_ref     TEXT NOT NULL,
    content_type    TEXT NOT NULL,
    block_id        INTEGER,
    timestamp       TEXT NOT NULL
);

CREATE INDEX tx_content_mappings_address ON tx_content_mappings(address_ref, content_type);

CREATE TABLE file_signatures (
    filename    TEXT PRIMARY KEY NOT NULL,
    digest      TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE consensus_negotiations (
    id          TEXT PRIMARY KEY NOT NULL,
    coordinator TEXT NOT NULL,
    peer        TEXT NOT NULL REFERENCES entities(address),
    block_id    INTEGER NOT NULL,
    state       TEXT NOT NULL,
    opened_at   TEXT NOT NULL,
    deadline    TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    attempt     INTEGER NOT NULL,
    block       TEXT NOT NULL
);

CREATE UNIQUE INDEX consensus_negotiations_active
    ON consensus_negotiations(peer, block_id)
    WHERE state NOT IN ('finalized', 'failed');

CREATE TABLE associated_nodes (
    address         TEXT PRIMARY KEY NOT NULL REFERENCES entities(address),
    host            TEXT NOT NULL,
    port            INTEGER NOT NULL,
    certificate     TEXT NOT NULL,
    status          TEXT NOT NULL,
    last_seen       TEXT,
    registered_at   TEXT NOT NULL
);

CREATE TABLE access_requests (
    id          TEXT PRIMARY KEY NOT NULL,
    requestor   TEXT NOT NULL REFERENCES entities(address),
    receiver    TEXT NOT NULL REFERENCES entities(address),
    reason      TEXT NOT NULL,
    state       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE node_identity (
    id                  INTEGER PRIMARY KEY CHECK (id = 1),
    address             TEXT NOT NULL,
    role                TEXT NOT NULL,
    username            TEXT NOT NULL,
    certificate         TEXT,
    coordinator_address TEXT,
    session_token       TEXT
);
"#;
