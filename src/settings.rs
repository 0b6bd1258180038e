// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use config::{Config, ConfigError, File};
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, metadata, File as FsFile};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use struct_field_names_as_array::FieldNamesAsArray;

/// Upper bound of every consensus and scheduler timer, one day.
pub const MAX_TIMER_SECS: u64 = 86_400;

/// Prefix of environment overrides, e.g. `FOLIOBLOCKS_CONSENSUS_SOFTTHRESHOLD`.
pub const ENV_PREFIX: &str = "folioblocks";

#[derive(Debug, Clone, Serialize, Deserialize, Default, FieldNamesAsArray)]
pub struct Settings {
    /// Network settings.
    pub network: Network,

    /// Node settings.
    pub node: Node,

    /// Block production and negotiation settings.
    pub consensus: Consensus,

    /// Session and registration settings.
    pub auth: Auth,

    /// Periodic task settings.
    pub scheduler: Scheduler,
}

impl Settings {
    /// Loads settings from defaults, the configuration file and the given
    /// environment, in that order of precedence.
    ///
    /// When `config_path` is `None` the default location is used and a file
    /// holding the defaults is created there if missing.
    pub fn new<I>(config_path: Option<&Path>, env_source: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let default_settings = Settings::default();
        let config_path = match config_path {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().map(|path| {
                write_default_config(&path, &default_settings);
                path
            }),
        };

        let mut s = Config::builder().add_source(Config::try_from(&default_settings)?);

        if let Some(path) = config_path {
            s = s.add_source(File::from(path).required(false));
        }

        // Make sure to list these in order
        let sections: Vec<Vec<&'static str>> = vec![
            Network::FIELD_NAMES_AS_ARRAY.to_vec(),
            Node::FIELD_NAMES_AS_ARRAY.to_vec(),
            Consensus::FIELD_NAMES_AS_ARRAY.to_vec(),
            Auth::FIELD_NAMES_AS_ARRAY.to_vec(),
            Scheduler::FIELD_NAMES_AS_ARRAY.to_vec(),
        ];

        // Gather all possible settings keys
        let possible_keys: HashMap<String, String> = Settings::FIELD_NAMES_AS_ARRAY
            .iter()
            .zip(sections.iter())
            .flat_map(|(section, fields)| {
                fields.iter().copied().map(move |field| {
                    (
                        format!("{}_{}_{}", ENV_PREFIX, section, field.replace('_', "")),
                        format!("{section}.{field}"),
                    )
                })
            })
            .collect();

        // Parse env vars manually, the `Environment` source cannot tell
        // section separators apart from underscores inside field names.
        for (k, v) in env_source {
            if v.is_empty() {
                continue;
            }

            if let Some(key) = possible_keys.get(&k.to_lowercase()) {
                s = s.set_override(key.as_str(), v)?;
            }
        }

        s.build()?.try_deserialize()
    }

    /// Rejects combinations the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.consensus;
        let sch = &self.scheduler;

        if c.soft_threshold == 0 || c.max_block_transactions == 0 || c.max_block_bytes == 0 {
            return Err(invalid("block size limits must be non-zero"));
        }

        if c.soft_threshold > c.max_block_transactions {
            return Err(invalid(
                "consensus.soft_threshold exceeds consensus.max_block_transactions",
            ));
        }

        if c.queue_capacity < c.max_block_transactions {
            return Err(invalid(
                "consensus.queue_capacity is below consensus.max_block_transactions",
            ));
        }

        if c.difficulty > 8 {
            return Err(invalid("consensus.difficulty is out of range"));
        }

        if c.delivery_timeout_secs == 0 || c.seal_timeout_secs == 0 || c.max_failures == 0 {
            return Err(invalid("consensus timers must be non-zero"));
        }

        if c.backoff_base_secs == 0 || c.backoff_cap_secs < c.backoff_base_secs {
            return Err(invalid("consensus backoff is misconfigured"));
        }

        let timers = [
            c.delivery_timeout_secs,
            c.seal_timeout_secs,
            c.backoff_cap_secs,
            sch.token_sweep_secs,
            sch.consensus_tick_secs,
            sch.liveness_secs,
            sch.probe_timeout_secs,
        ];

        if timers.iter().any(|secs| *secs > MAX_TIMER_SECS) {
            return Err(invalid("consensus and scheduler timers must not exceed one day"));
        }

        if sch.token_sweep_secs == 0
            || sch.consensus_tick_secs == 0
            || sch.liveness_secs == 0
            || sch.probe_timeout_secs == 0
        {
            return Err(invalid("scheduler intervals must be non-zero"));
        }

        if self.auth.max_live_tokens == 0 {
            return Err(invalid("auth limits must be non-zero"));
        }

        if !(1..=365).contains(&self.auth.token_lifetime_days) {
            return Err(invalid("auth.token_lifetime_days must be between 1 and 365"));
        }

        if !(1..=8_760).contains(&self.auth.auth_code_lifetime_hours) {
            return Err(invalid("auth.auth_code_lifetime_hours must be between 1 and 8760"));
        }

        if self.node.username.trim().is_empty() || self.node.password.is_empty() {
            return Err(invalid("node.username and node.password are required"));
        }

        if self.node.role == NodeRole::Peer && self.network.coordinator_url.is_empty() {
            return Err(invalid("network.coordinator_url is required on archival peers"));
        }

        Ok(())
    }

    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.node.data_dir)
    }

    #[must_use]
    pub fn secrets_path(&self) -> PathBuf {
        match &self.node.secrets_file {
            Some(path) => PathBuf::from(path),
            None => self.data_dir().join("node-env.vars"),
        }
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Message(message.to_owned())
}

fn default_config_path() -> Option<PathBuf> {
    let mut path = dirs::config_dir()?;
    path.push("Folioblocks");
    path.push("config.toml");
    Some(path)
}

fn write_default_config(path: &Path, settings: &Settings) {
    if metadata(path).is_ok() {
        return;
    }

    let settings_str = match toml::ser::to_string_pretty(settings) {
        Ok(s) => s,
        Err(err) => {
            error!("Failed to serialize default configuration! Reason: {:#?}", err);
            return;
        }
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap_or(());
    }

    // If this fails, do nothing and fall back to environment variables
    match FsFile::create(path) {
        Ok(mut file) => {
            file.write_all(settings_str.as_bytes()).unwrap_or(());
        }
        Err(err) => {
            error!("Failed to create configuration! Reason: {:#?}", err);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Coordinator,
    Peer,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coordinator => f.write_str("coordinator"),
            Self::Peer => f.write_str("peer"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FieldNamesAsArray)]
pub struct Network {
    /// HTTP listen address.
    pub host: String,

    /// HTTP listen port.
    pub port: u16,

    /// Host other nodes use to reach this node. Defaults to `host`.
    pub public_host: Option<String>,

    /// Base url of the coordinator. Used by archival peers.
    pub coordinator_url: String,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 6001,
            public_host: None,
            coordinator_url: "http://127.0.0.1:6001".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FieldNamesAsArray)]
pub struct Node {
    /// `coordinator` or `peer`.
    pub role: NodeRole,

    /// Node data directory.
    pub data_dir: String,

    /// Secrets file. Defaults to `node-env.vars` inside the data directory.
    pub secrets_file: Option<String>,

    /// Username of the node's own entity.
    pub username: String,

    /// Password of the node's own entity.
    pub password: String,

    /// Email of the node's own entity.
    pub email: String,

    /// Registration code used by an archival peer joining the federation.
    pub auth_code: Option<String>,

    /// Log level: trace, debug, info, warning, error or critical.
    pub log_level: String,

    /// Write `node.log` into the data directory.
    pub log_file: bool,
}

impl Default for Node {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|mut path| {
                path.push("Folioblocks");
                path
            })
            .unwrap_or_else(|| PathBuf::from("folioblocks-data"));

        Self {
            role: NodeRole::Coordinator,
            data_dir: data_dir.to_string_lossy().into_owned(),
            secrets_file: None,
            username: "folioblocks".to_owned(),
            password: "folioblocks".to_owned(),
            email: "node@folioblocks.local".to_owned(),
            auth_code: None,
            log_level: "info".to_owned(),
            log_file: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FieldNamesAsArray)]
pub struct Consensus {
    /// Leading zero hex characters a sealed block hash must have.
    pub difficulty: usize,

    /// Number of queued transactions that triggers a round.
    pub soft_threshold: usize,

    /// Max transactions in one block.
    pub max_block_transactions: usize,

    /// Max canonical size of one block in bytes.
    pub max_block_bytes: usize,

    /// Capacity of the block builder queue.
    pub queue_capacity: usize,

    /// Deadline for delivering an unsealed block to a peer.
    pub delivery_timeout_secs: u64,

    /// Deadline for a delivered block to come back sealed.
    pub seal_timeout_secs: u64,

    /// Backoff applied to a peer after its first failure.
    pub backoff_base_secs: u64,

    /// Upper bound of the peer backoff.
    pub backoff_cap_secs: u64,

    /// Consecutive failures after which a block is dropped.
    pub max_failures: u32,

    /// Attempts a peer makes to submit a sealed block.
    pub submit_retries: u32,
}

impl Default for Consensus {
    fn default() -> Self {
        Self {
            difficulty: 1,
            soft_threshold: 5,
            max_block_transactions: 64,
            max_block_bytes: 524_288,
            queue_capacity: 4096,
            delivery_timeout_secs: 10,
            seal_timeout_secs: 60,
            backoff_base_secs: 2,
            backoff_cap_secs: 120,
            max_failures: 3,
            submit_retries: 3,
        }
    }
}

impl Consensus {
    #[must_use]
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    #[must_use]
    pub fn seal_timeout(&self) -> Duration {
        Duration::from_secs(self.seal_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FieldNamesAsArray)]
pub struct Auth {
    /// Session token lifetime.
    pub token_lifetime_days: i64,

    /// Max concurrent live tokens per entity.
    pub max_live_tokens: usize,

    /// Registration code lifetime.
    pub auth_code_lifetime_hours: i64,
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            token_lifetime_days: 7,
            max_live_tokens: 5,
            auth_code_lifetime_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FieldNamesAsArray)]
pub struct Scheduler {
    pub token_sweep_secs: u64,
    pub consensus_tick_secs: u64,
    pub liveness_secs: u64,

    /// Deadline of one liveness probe.
    pub probe_timeout_secs: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            token_sweep_secs: 120,
            consensus_tick_secs: 10,
            liveness_secs: 30,
            probe_timeout_secs: 5,
        }
    }
}
