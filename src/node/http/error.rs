// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::chain::ChainErr;
use crate::consensus::ConsensusErr;
use crate::crypto::CryptoErr;
use crate::db::DbErr;
use crate::node::assembler::AssembleErr;
use crate::node::wire::ErrorBody;
use log::*;
use std::convert::Infallible;
use std::fmt;
use warp::http::StatusCode;
use warp::{Rejection, Reply};

/// Client facing error kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiErrKind {
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    InvalidInput,
    Unavailable,
    Integrity,
    ConsensusTimeout,
}

impl ApiErrKind {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::InvalidInput => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Integrity => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ConsensusTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::InvalidInput => "invalid-input",
            Self::Unavailable => "unavailable",
            Self::Integrity => "integrity",
            Self::ConsensusTimeout => "consensus-timeout",
        }
    }
}

#[derive(Debug)]
pub struct ApiErr {
    pub kind: ApiErrKind,
    pub message: String,
}

impl ApiErr {
    pub fn new(kind: ApiErrKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ApiErrKind::Unauthenticated, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ApiErrKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiErrKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ApiErrKind::Conflict, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ApiErrKind::InvalidInput, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ApiErrKind::Unavailable, message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ApiErrKind::Integrity, message)
    }

    #[must_use]
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.kind.code().to_owned(),
            message: self.message.clone(),
        }
    }

    #[must_use]
    pub fn into_reply(self) -> warp::reply::WithStatus<warp::reply::Json> {
        warp::reply::with_status(warp::reply::json(&self.body()), self.kind.status())
    }
}

impl fmt::Display for ApiErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl warp::reject::Reject for ApiErr {}

impl From<DbErr> for ApiErr {
    fn from(other: DbErr) -> Self {
        match other {
            DbErr::Conflict(msg) => Self::conflict(msg),
            DbErr::NotFound => Self::not_found("not found"),
            DbErr::MissingReference => Self::invalid_input("referenced entity does not exist"),
            DbErr::Busy | DbErr::Unavailable => Self::unavailable("metadata store is busy"),
            other => {
                error!("Metadata store failure: {}", other);
                Self::integrity("metadata store failure")
            }
        }
    }
}

impl From<AssembleErr> for ApiErr {
    fn from(other: AssembleErr) -> Self {
        match other {
            AssembleErr::Forbidden(_) => Self::forbidden(other.to_string()),
            AssembleErr::InvalidInput(_) | AssembleErr::UnknownRecipient(_) => {
                Self::invalid_input(other.to_string())
            }
            AssembleErr::QueueFull => Self::unavailable(other.to_string()),
            AssembleErr::Db(err) => err.into(),
            AssembleErr::Crypto(err) => err.into(),
        }
    }
}

impl From<CryptoErr> for ApiErr {
    fn from(other: CryptoErr) -> Self {
        error!("Crypto failure: {}", other);
        Self::integrity("crypto failure")
    }
}

impl From<ChainErr> for ApiErr {
    fn from(other: ChainErr) -> Self {
        error!("Chain store failure: {}", other);
        Self::integrity("chain store failure")
    }
}

impl From<serde_json::Error> for ApiErr {
    fn from(other: serde_json::Error) -> Self {
        error!("Encoding failure: {}", other);
        Self::integrity("encoding failure")
    }
}

impl From<ConsensusErr> for ApiErr {
    fn from(other: ConsensusErr) -> Self {
        match other {
            ConsensusErr::Busy(_)
            | ConsensusErr::Stale { .. }
            | ConsensusErr::UnknownNegotiation(_) => Self::conflict(other.to_string()),
            ConsensusErr::NotAssigned | ConsensusErr::BadCertificate => {
                Self::forbidden(other.to_string())
            }
            ConsensusErr::ContentMismatch
            | ConsensusErr::WrongValidator
            | ConsensusErr::InvalidSeal(_)
            | ConsensusErr::MalformedBlock => Self::invalid_input(other.to_string()),
            ConsensusErr::Db(err) | ConsensusErr::Unrecorded { err, .. } => err.into(),
            ConsensusErr::Chain(err) => err.into(),
            ConsensusErr::Codec(err) => err.into(),
            ConsensusErr::Miner(_) => Self::unavailable(other.to_string()),
        }
    }
}

/// Turns every rejection into a json error body.
pub async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let err = if let Some(err) = rejection.find::<ApiErr>() {
        ApiErr::new(err.kind, err.message.clone())
    } else if rejection.is_not_found() {
        ApiErr::not_found("no such route")
    } else if let Some(err) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        ApiErr::invalid_input(err.to_string())
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        ApiErr::invalid_input("request body is too large")
    } else if let Some(err) = rejection.find::<warp::reject::InvalidQuery>() {
        ApiErr::invalid_input(err.to_string())
    } else if let Some(err) = rejection.find::<warp::reject::MissingHeader>() {
        match err.name() {
            crate::node::wire::TOKEN_HEADER => ApiErr::unauthenticated(err.to_string()),
            _ => ApiErr::invalid_input(err.to_string()),
        }
    } else if let Some(err) = rejection.find::<warp::reject::InvalidHeader>() {
        ApiErr::invalid_input(err.to_string())
    } else if rejection.find::<warp::reject::UnsupportedMediaType>().is_some() {
        ApiErr::invalid_input("expected a json body")
    } else if rejection.find::<warp::reject::LengthRequired>().is_some() {
        ApiErr::invalid_input("content length required")
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        ApiErr::not_found("no such route")
    } else {
        error!("Unhandled rejection: {:?}", rejection);
        ApiErr::integrity("internal error")
    };

    Ok(err.into_reply())
}
