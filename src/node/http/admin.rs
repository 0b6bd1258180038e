// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::db::AuthCodeRow;
use crate::node::http::entity::validate_email;
use crate::node::http::{json_body, reply, respond, with_ctx, with_session, ApiErr, Reply, Session};
use crate::node::wire::PASSCODE_HEADER;
use crate::node::Context;
use crate::primitives::Role;
use chrono::{Duration, Utc};
use log::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::Filter;

const ISSUERS: &[Role] = &[Role::Admin, Role::Coordinator];

pub fn routes(ctx: Arc<Context>) -> BoxedFilter<(Reply,)> {
    let generate = warp::path!("admin" / "generate_auth")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and(warp::header::<String>(PASSCODE_HEADER))
        .and(json_body::<GenerateAuthRequest>())
        .and_then(
            |ctx: Arc<Context>, session: Session, passcode: String, req: GenerateAuthRequest| async move {
                respond(generate_auth(ctx, session, passcode, req).await)
            },
        );

    let unused = warp::path!("admin" / "list_unused_tokens")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx))
        .and_then(|ctx: Arc<Context>, session: Session| async move {
            respond(list_unused(ctx, session).await)
        });

    generate.or(unused).unify().boxed()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateAuthRequest {
    pub email: String,
    pub role: Role,
}

/// 8 random bytes, hex encoded.
fn new_auth_code() -> String {
    hex::encode(rand::thread_rng().gen::<[u8; 8]>())
}

/// Checks the time based passcode derived from the node's secrets before a
/// privileged action.
fn check_passcode(ctx: &Context, session: &Session, passcode: &str) -> Result<(), ApiErr> {
    if !ctx.passcode.verify(passcode.trim()) {
        warn!("Bad passcode from {}", session.address);
        return Err(ApiErr::forbidden("passcode does not match"));
    }

    Ok(())
}

async fn generate_auth(
    ctx: Arc<Context>,
    session: Session,
    passcode: String,
    req: GenerateAuthRequest,
) -> Result<Reply, ApiErr> {
    ctx.assembler()?;
    session.require(ISSUERS)?;
    check_passcode(&ctx, &session, &passcode)?;

    if !req.role.is_registrable() {
        return Err(ApiErr::invalid_input(format!(
            "codes cannot be issued for {}",
            req.role
        )));
    }

    validate_email(&req.email)?;

    let now = Utc::now();
    let row = AuthCodeRow {
        code: new_auth_code(),
        email: req.email,
        role: req.role,
        issued_by: session.address.clone(),
        issued_at: now,
        expires_at: now + Duration::hours(ctx.settings.auth.auth_code_lifetime_hours),
        consumed: false,
    };

    ctx.db.insert_auth_code(row.clone()).await?;
    info!(
        "{} issued a {} registration code for {}",
        session.address, row.role, row.email
    );

    reply(StatusCode::CREATED, &row)
}

async fn list_unused(ctx: Arc<Context>, session: Session) -> Result<Reply, ApiErr> {
    session.require(ISSUERS)?;
    let codes = ctx.db.list_unused_auth_codes(Utc::now()).await?;
    reply(StatusCode::OK, &codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::http::routes;
    use crate::node::http::test_utils::*;
    use crate::node::wire::TOKEN_HEADER;

    async fn generate(
        ctx: &Arc<Context>,
        token: &str,
        passcode: &str,
        email: &str,
        role: Role,
    ) -> warp::http::Response<warp::hyper::body::Bytes> {
        warp::test::request()
            .method("POST")
            .path("/admin/generate_auth")
            .header(TOKEN_HEADER, token)
            .header(PASSCODE_HEADER, passcode)
            .json(&GenerateAuthRequest {
                email: email.to_owned(),
                role,
            })
            .reply(&routes(ctx.clone()))
            .await
    }

    #[tokio::test]
    async fn admin_issues_and_lists_codes() {
        let (ctx, _) = coordinator().await;
        let (_, token) = login_as(&ctx, Role::Admin, "root").await;
        let passcode = ctx.passcode.now();

        let res = generate(&ctx, &token, &passcode, "dean@uni.test", Role::Institution).await;
        assert_eq!(res.status(), 201);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        let code = body["code"].as_str().unwrap();
        assert_eq!(code.len(), 16);
        assert!(code.chars().all(|c| c.is_ascii_hexdigit()));

        let res = generate(&ctx, &token, &passcode, "dean@uni.test", Role::Institution).await;
        assert_eq!(res.status(), 409);

        let res = warp::test::request()
            .method("GET")
            .path("/admin/list_unused_tokens")
            .header(TOKEN_HEADER, &token)
            .reply(&routes(ctx.clone()))
            .await;
        assert_eq!(res.status(), 200);
        let codes: Vec<serde_json::Value> = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0]["email"], "dean@uni.test");
    }

    #[tokio::test]
    async fn refuses_bad_passcode_and_roles() {
        let (ctx, _) = coordinator().await;
        let (_, admin) = login_as(&ctx, Role::Admin, "root").await;
        let (_, employer) = login_as(&ctx, Role::Employer, "acme").await;
        let passcode = ctx.passcode.now();

        // The account password is not a passcode
        let res = generate(&ctx, &admin, PASSWORD, "a@b.test", Role::Applicant).await;
        assert_eq!(res.status(), 403);

        let res = generate(&ctx, &admin, "000000x", "a@b.test", Role::Applicant).await;
        assert_eq!(res.status(), 403);

        let res = generate(&ctx, &employer, &passcode, "a@b.test", Role::Applicant).await;
        assert_eq!(res.status(), 403);

        let res = generate(&ctx, &admin, &passcode, "a@b.test", Role::Coordinator).await;
        assert_eq!(res.status(), 422);

        let res = generate(&ctx, &admin, &passcode, "not-an-email", Role::Applicant).await;
        assert_eq!(res.status(), 422);

        // Registered emails cannot receive a code.
        let res = generate(&ctx, &admin, &passcode, "acme@folio.test", Role::Employer).await;
        assert_eq!(res.status(), 409);
    }

    #[tokio::test]
    async fn passcode_from_other_secrets_is_refused() {
        let (ctx, _) = coordinator().await;
        let (_, admin) = login_as(&ctx, Role::Admin, "root").await;
        let other = crate::crypto::PasscodeTotp::new(b"someone-else").unwrap();
        let now = u64::try_from(Utc::now().timestamp()).unwrap();
        let step = crate::crypto::PASSCODE_STEP_SECS;
        let window = crate::crypto::PASSCODE_WINDOW_STEPS;

        // Pick a foreign code that does not collide with any accepted one
        let foreign = (0..20)
            .map(|i| other.code_at(now + i * step))
            .find(|code| {
                (0..=2 * (window + 1))
                    .all(|i| ctx.passcode.code_at(now + i * step - (window + 1) * step) != *code)
            })
            .unwrap();

        let res = generate(&ctx, &admin, &foreign, "a@b.test", Role::Applicant).await;
        assert_eq!(res.status(), 403);
        assert!(ctx.db.list_unused_auth_codes(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_passcode_is_invalid_input() {
        let (ctx, _) = coordinator().await;
        let (_, token) = login_as(&ctx, Role::Admin, "root").await;

        let res = warp::test::request()
            .method("POST")
            .path("/admin/generate_auth")
            .header(TOKEN_HEADER, &token)
            .json(&GenerateAuthRequest {
                email: "x@y.test".to_owned(),
                role: Role::Applicant,
            })
            .reply(&routes(ctx))
            .await;
        assert_eq!(res.status(), 422);
    }
}
