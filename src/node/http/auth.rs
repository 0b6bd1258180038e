// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Bearer tokens. A token is a HS256 JWT signed with the node secret key
//! and is only honoured while the tokens table holds it as live.

use crate::db::EntityRow;
use crate::node::http::error::ApiErr;
use crate::node::http::with_ctx;
use crate::node::wire::TOKEN_HEADER;
use crate::node::Context;
use crate::primitives::{Address, Role};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::{Filter, Rejection};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Address,
    pub role: Role,
    pub registered: DateTime<Utc>,
    pub iat: i64,
    pub exp: i64,

    /// Makes two tokens issued in the same second distinct
    pub jti: String,
}

#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeys {
    #[must_use]
    pub fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Signs a token for `entity` valid for `lifetime` from `now`.
    pub fn issue(
        &self,
        entity: &EntityRow,
        now: DateTime<Utc>,
        lifetime: Duration,
    ) -> Result<(String, DateTime<Utc>), ApiErr> {
        let expires_at = now + lifetime;
        let claims = Claims {
            sub: entity.address.clone(),
            role: entity.role,
            registered: entity.registered_at,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: hex::encode(rand::thread_rng().gen::<[u8; 8]>()),
        };

        let token = encode(&Header::default(), &claims, &self.encoding).map_err(|err| {
            error!("Could not sign token: {}", err);
            ApiErr::integrity("could not sign token")
        })?;

        Ok((token, expires_at))
    }

    /// Checks signature and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims, ApiErr> {
        decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|err| ApiErr::unauthenticated(format!("invalid token: {err}")))
    }
}

/// An authenticated caller.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    pub address: Address,
    pub role: Role,
    pub token: String,
}

impl Session {
    /// Fails with `forbidden` unless the caller has one of `roles`.
    pub fn require(&self, roles: &[Role]) -> Result<(), ApiErr> {
        if roles.contains(&self.role) {
            Ok(())
        } else {
            Err(ApiErr::forbidden(format!(
                "{} may not use this endpoint",
                self.role
            )))
        }
    }
}

/// Validates a presented token and marks it as used.
pub async fn authenticate(ctx: &Context, token: String) -> Result<Session, ApiErr> {
    let claims = ctx.keys.verify(&token)?;

    if !ctx.db.touch_token(token.clone(), Utc::now()).await? {
        return Err(ApiErr::unauthenticated("token is expired or unknown"));
    }

    Ok(Session {
        address: claims.sub,
        role: claims.role,
        token,
    })
}

/// Extracts the [`Session`] from the `x-token` header.
pub fn with_session(
    ctx: Arc<Context>,
) -> impl Filter<Extract = (Session,), Error = Rejection> + Clone {
    warp::header::<String>(TOKEN_HEADER)
        .and(with_ctx(ctx))
        .and_then(|token: String, ctx: Arc<Context>| async move {
            authenticate(&ctx, token)
                .await
                .map_err(warp::reject::custom)
        })
}
