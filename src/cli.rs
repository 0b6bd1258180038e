// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::settings::{NodeRole, Settings};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "folioblocks")]
#[command(about = "Permissioned credential ledger node", version)]
pub struct Args {
    /// HTTP listen address
    #[arg(long)]
    pub host: Option<String>,

    /// HTTP listen port
    #[arg(long)]
    pub port: Option<u16>,

    /// Node role
    #[arg(long, value_enum)]
    pub role: Option<NodeRole>,

    /// Secrets file holding AUTH_KEY and SECRET_KEY
    #[arg(long, env = "FOLIOBLOCKS_SECRETS_FILE")]
    pub secrets_file: Option<PathBuf>,

    /// Data directory
    #[arg(long, env = "FOLIOBLOCKS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Path to configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Do not write node.log
    #[arg(long)]
    pub no_log_file: bool,

    /// Shorthand for `--log-level debug`
    #[arg(long)]
    pub debug: bool,

    /// Print the current admin passcode and exit
    #[arg(long)]
    pub passcode: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Directive understood by `EnvFilter`.
    #[must_use]
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
        }
    }

    /// Parses the spelling used in configuration files.
    #[must_use]
    pub fn from_setting(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl Args {
    /// Flags take precedence over the file and environment.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(host) = &self.host {
            settings.network.host = host.clone();
        }

        if let Some(port) = self.port {
            settings.network.port = port;
        }

        if let Some(role) = self.role {
            settings.node.role = role;
        }

        if let Some(path) = &self.secrets_file {
            settings.node.secrets_file = Some(path.to_string_lossy().into_owned());
        }

        if let Some(path) = &self.data_dir {
            settings.node.data_dir = path.to_string_lossy().into_owned();
        }

        if self.no_log_file {
            settings.node.log_file = false;
        }

        if self.debug {
            settings.node.log_level = "debug".to_owned();
        } else if let Some(level) = self.log_level {
            settings.node.log_level = level.as_filter().to_owned();
        }
    }
}
