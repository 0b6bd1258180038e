// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::crypto::{hash_password_async, verify_password_async};
use crate::db::{new_entity, AssociationRow, DbErr, TokenRow};
use crate::node::http::{json_body, reply, respond, with_ctx, with_session, ApiErr, Reply, Session};
use crate::node::wire::{LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
use crate::node::Context;
use crate::primitives::{
    ActivityState, Address, AssociationKind, EntityRegistered, OrganizationCreated, Payload, Role,
    TokenState,
};
use chrono::{DateTime, Duration, Utc};
use log::*;
use serde::Serialize;
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::Filter;

pub const MAX_USERNAME_LEN: usize = 24;
pub const MAX_PERSON_NAME_LEN: usize = 32;
pub const MIN_PASSWORD_LEN: usize = 8;

pub fn routes(ctx: Arc<Context>) -> BoxedFilter<(Reply,)> {
    let register = warp::path!("entity" / "register")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(json_body::<RegisterRequest>())
        .and_then(|ctx: Arc<Context>, body: RegisterRequest| async move {
            respond(register(ctx, body).await)
        });

    let login = warp::path!("entity" / "login")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(json_body::<LoginRequest>())
        .and_then(|ctx: Arc<Context>, body: LoginRequest| async move {
            respond(login(ctx, body).await)
        });

    let logout = warp::path!("entity" / "logout")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and_then(|ctx: Arc<Context>, session: Session| async move {
            respond(logout(ctx, session).await)
        });

    let info = warp::path!("entity" / "info")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx))
        .and_then(|ctx: Arc<Context>, session: Session| async move {
            respond(info(ctx, session).await)
        });

    register
        .or(login)
        .unify()
        .or(logout)
        .unify()
        .or(info)
        .unify()
        .boxed()
}

/// Public view of an entity.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EntityInfo {
    pub address: Address,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub program: Option<String>,
    pub association: Option<AssociationRow>,
    pub activity: ActivityState,
    pub registered: DateTime<Utc>,
}

pub(crate) fn validate_username(username: &str) -> Result<(), ApiErr> {
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if username.is_empty() || username.chars().count() > MAX_USERNAME_LEN || !valid_chars {
        return Err(ApiErr::invalid_input(format!(
            "username must be 1 to {MAX_USERNAME_LEN} letters, digits, '_', '-' or '.'"
        )));
    }

    Ok(())
}

pub(crate) fn validate_credentials(username: &str, password: &str, email: &str) -> Result<(), ApiErr> {
    validate_username(username)?;

    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiErr::invalid_input(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    validate_email(email)
}

pub(crate) fn validate_email(email: &str) -> Result<(), ApiErr> {
    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty() && domain.contains('.') && !email.contains(char::is_whitespace) =>
        {
            Ok(())
        }
        _ => Err(ApiErr::invalid_input("email is malformed")),
    }
}

pub(crate) fn validate_person_name(name: Option<&str>) -> Result<(), ApiErr> {
    match name {
        Some(name) if name.trim().is_empty() || name.chars().count() > MAX_PERSON_NAME_LEN => {
            Err(ApiErr::invalid_input(format!(
                "names must be 1 to {MAX_PERSON_NAME_LEN} characters"
            )))
        }
        _ => Ok(()),
    }
}

async fn register(ctx: Arc<Context>, req: RegisterRequest) -> Result<Reply, ApiErr> {
    let assembler = ctx.assembler()?;

    validate_credentials(&req.username, &req.password, &req.email)?;
    validate_person_name(req.first_name.as_deref())?;
    validate_person_name(req.last_name.as_deref())?;

    if !req.role.is_registrable() {
        return Err(ApiErr::invalid_input(format!("{} cannot register", req.role)));
    }

    let now = Utc::now();
    let association = match req.role {
        Role::Institution | Role::Employer => {
            let name = req
                .association_name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| ApiErr::invalid_input("association_name is required"))?;

            let kind = if req.role == Role::Institution {
                AssociationKind::Institution
            } else {
                AssociationKind::Employer
            };

            Some(AssociationRow {
                address: Address::random(),
                name: name.to_owned(),
                kind,
                created_at: now,
            })
        }
        _ => None,
    };

    let mut row = new_entity(
        req.role,
        req.username.clone(),
        req.email.clone(),
        hash_password_async(req.password.clone()).await?,
        association.as_ref().map(|a| a.address.clone()),
        now,
    );
    row.first_name = req.first_name.clone();
    row.last_name = req.last_name.clone();

    // Queue slots are taken first so the entity never lands without its
    // ledger records
    let mut records = vec![];

    if let Some(association) = &association {
        let payload = Payload::OrganizationCreated(OrganizationCreated {
            association: association.address.clone(),
            name: association.name.clone(),
            kind: association.kind,
            founded_by: row.address.clone(),
        });
        records.push(assembler.prepare_internal(payload, &ctx.address, Some(row.address.clone()))?);
    }

    let payload = Payload::EntityRegistered(EntityRegistered {
        address: row.address.clone(),
        username: row.username.clone(),
        role: row.role,
        association: row.association.clone(),
        registered: now,
    });
    records.push(assembler.prepare_internal(payload, &ctx.address, Some(row.address.clone()))?);

    ctx.db
        .register_with_code(req.auth_code.clone(), row.clone(), association.clone())
        .await
        .map_err(|err| match err {
            DbErr::NotFound => {
                ApiErr::forbidden("auth code is unknown, expired or bound to another email or role")
            }
            other => other.into(),
        })?;

    info!("Registered {} {} as {}", row.role, row.username, row.address);

    for prepared in records {
        assembler.commit(prepared).await;
    }

    reply(
        StatusCode::CREATED,
        &RegisterResponse {
            address: row.address,
            username: row.username,
            role: row.role,
            registered: now,
        },
    )
}

async fn login(ctx: Arc<Context>, req: LoginRequest) -> Result<Reply, ApiErr> {
    let bad_credentials = || ApiErr::unauthenticated("invalid username or password");

    let entity = ctx
        .db
        .get_entity_by_username(req.username)
        .await?
        .ok_or_else(bad_credentials)?;

    if !verify_password_async(req.password, entity.password_hash.clone()).await? {
        return Err(bad_credentials());
    }

    let now = Utc::now();
    let lifetime = Duration::days(ctx.settings.auth.token_lifetime_days);
    let (token, expires_at) = ctx.keys.issue(&entity, now, lifetime)?;

    ctx.db
        .insert_token(
            TokenRow {
                value: token.clone(),
                address: entity.address.clone(),
                state: TokenState::Fresh,
                issued_at: now,
                expires_at,
                last_used: None,
            },
            ctx.settings.auth.max_live_tokens,
        )
        .await?;

    ctx.db
        .set_activity(entity.address.clone(), ActivityState::Online)
        .await?;

    debug!("{} logged in", entity.username);

    reply(
        StatusCode::OK,
        &LoginResponse {
            token,
            address: entity.address,
            role: entity.role,
            expires_at,
        },
    )
}

async fn logout(ctx: Arc<Context>, session: Session) -> Result<Reply, ApiErr> {
    ctx.db.expire_token(session.token).await?;

    if ctx.db.live_token_count(session.address.clone()).await? == 0 {
        ctx.db
            .set_activity(session.address.clone(), ActivityState::Offline)
            .await?;
    }

    reply(
        StatusCode::ACCEPTED,
        &serde_json::json!({ "address": session.address }),
    )
}

async fn info(ctx: Arc<Context>, session: Session) -> Result<Reply, ApiErr> {
    let entity = ctx
        .db
        .get_entity(session.address)
        .await?
        .ok_or_else(|| ApiErr::not_found("entity no longer exists"))?;

    let association = match &entity.association {
        Some(address) => ctx.db.get_association(address.clone()).await?,
        None => None,
    };

    reply(
        StatusCode::OK,
        &EntityInfo {
            address: entity.address,
            username: entity.username,
            email: entity.email,
            role: entity.role,
            first_name: entity.first_name,
            last_name: entity.last_name,
            program: entity.program,
            association,
            activity: entity.activity,
            registered: entity.registered_at,
        },
    )
}
