// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! At rest protection of the node data directory.

mod sealed;
mod secrets;

pub use sealed::*;
pub use secrets::*;

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum SealErr {
    /// No key was supplied
    MissingKey,

    /// Artifact failed authentication or is not valid plaintext
    Corrupted(&'static str),

    /// Filesystem error
    Io(io::Error),
}

impl fmt::Display for SealErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingKey => f.write_str("no sealing key supplied"),
            Self::Corrupted(name) => write!(f, "sealed artifact {name} is corrupted"),
            Self::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl From<io::Error> for SealErr {
    fn from(other: io::Error) -> Self {
        Self::Io(other)
    }
}

#[derive(Debug)]
pub enum SecretsErr {
    /// Filesystem error
    Io(io::Error),

    /// Malformed `KEY=value` line
    Parse(dotenvy::Error),

    /// Required entry is absent
    Missing(&'static str),

    /// Entry is present but malformed
    Invalid(&'static str),
}

impl fmt::Display for SecretsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Parse(err) => write!(f, "malformed secrets file: {err}"),
            Self::Missing(key) => write!(f, "secrets file is missing {key}"),
            Self::Invalid(key) => write!(f, "secrets file entry {key} is invalid"),
        }
    }
}

impl From<io::Error> for SecretsErr {
    fn from(other: io::Error) -> Self {
        Self::Io(other)
    }
}

impl From<dotenvy::Error> for SecretsErr {
    fn from(other: dotenvy::Error) -> Self {
        Self::Parse(other)
    }
}
