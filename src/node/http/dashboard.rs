// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Institution, applicant and employer workflows. Every write becomes a
//! ledger transaction through the assembler.

use crate::crypto::hash_password_async;
use crate::db::{new_entity, AccessRequestRow, ActivityCounts, EntityRow, TxMappingRow};
use crate::node::assembler::Submitted;
use crate::node::http::entity::{validate_credentials, validate_person_name};
use crate::node::http::{json_body, reply, respond, with_ctx, with_session, ApiErr, Reply, Session};
use crate::node::Context;
use crate::primitives::{
    AccessRequestClosed, AccessRequestOpened, AccessRequestProcessed, Action, Address,
    ApplicantCreated, ApplicantLog, ApplicantLogKind, Document, DocumentBatch, ExtraRemark,
    Payload, RequestState, Role,
};
use chrono::{DateTime, Utc};
use log::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::Filter;

/// Accepted range of an applicant's enrollment year.
const YEARS: std::ops::RangeInclusive<u16> = 1900..=2100;

pub fn routes(ctx: Arc<Context>) -> BoxedFilter<(Reply,)> {
    let summary = warp::path!("dashboard")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and_then(|ctx: Arc<Context>, session: Session| async move {
            respond(summary(ctx, session).await)
        });

    let students = warp::path!("dashboard" / "students")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and_then(|ctx: Arc<Context>, session: Session| async move {
            respond(students(ctx, session).await)
        });

    let create_applicant = warp::path!("dashboard" / "applicants")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and(json_body::<NewApplicant>())
        .and_then(
            |ctx: Arc<Context>, session: Session, body: NewApplicant| async move {
                respond(create_applicant(ctx, session, body).await)
            },
        );

    let add_log = warp::path!("dashboard" / "applicants" / String / "logs")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and(json_body::<NewLog>())
        .and_then(
            |address: String, ctx: Arc<Context>, session: Session, body: NewLog| async move {
                respond(add_log(ctx, session, address, body).await)
            },
        );

    let add_remark = warp::path!("dashboard" / "applicants" / String / "remarks")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and(json_body::<NewRemark>())
        .and_then(
            |address: String, ctx: Arc<Context>, session: Session, body: NewRemark| async move {
                respond(add_remark(ctx, session, address, body).await)
            },
        );

    let list_requests = warp::path!("dashboard" / "requests")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and_then(|ctx: Arc<Context>, session: Session| async move {
            respond(list_requests(ctx, session).await)
        });

    let open_request = warp::path!("dashboard" / "requests")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and(json_body::<NewAccessRequest>())
        .and_then(
            |ctx: Arc<Context>, session: Session, body: NewAccessRequest| async move {
                respond(open_request(ctx, session, body).await)
            },
        );

    let process_request = warp::path!("dashboard" / "requests" / String / "process")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and(json_body::<ProcessRequest>())
        .and_then(
            |id: String, ctx: Arc<Context>, session: Session, body: ProcessRequest| async move {
                respond(process_request(ctx, session, id, body).await)
            },
        );

    let close_request = warp::path!("dashboard" / "requests" / String / "close")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and_then(|id: String, ctx: Arc<Context>, session: Session| async move {
            respond(close_request(ctx, session, id).await)
        });

    let list_issuances = warp::path!("dashboard" / "issuances")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and_then(|ctx: Arc<Context>, session: Session| async move {
            respond(list_issuances(ctx, session).await)
        });

    let issue = warp::path!("dashboard" / "issuances")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and(json_body::<NewIssuance>())
        .and_then(
            |ctx: Arc<Context>, session: Session, body: NewIssuance| async move {
                respond(issue(ctx, session, body).await)
            },
        );

    let issue_batch = warp::path!("dashboard" / "issuances" / "batch")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx))
        .and(json_body::<NewBatchIssuance>())
        .and_then(
            |ctx: Arc<Context>, session: Session, body: NewBatchIssuance| async move {
                respond(issue_batch(ctx, session, body).await)
            },
        );

    summary
        .or(students)
        .unify()
        .or(create_applicant)
        .unify()
        .or(add_log)
        .unify()
        .or(add_remark)
        .unify()
        .or(list_requests)
        .unify()
        .or(open_request)
        .unify()
        .or(process_request)
        .unify()
        .or(close_request)
        .unify()
        .or(list_issuances)
        .unify()
        .or(issue)
        .unify()
        .or(issue_batch)
        .unify()
        .boxed()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub address: Address,
    pub role: Role,
    #[serde(flatten)]
    pub counts: ActivityCounts,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewApplicant {
    pub username: String,
    pub password: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub course: String,
    pub year: u16,
    pub prefer_role: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewLog {
    pub kind: ApplicantLogKind,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub role: Option<String>,
    pub duration_start: DateTime<Utc>,
    #[serde(default)]
    pub duration_end: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewRemark {
    pub title: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewAccessRequest {
    pub receiver: Address,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub approved: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewIssuance {
    pub recipient: Address,
    #[serde(flatten)]
    pub document: Document,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewBatchIssuance {
    pub recipient: Address,
    pub documents: Vec<Document>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApplicantCreatedResponse {
    pub address: Address,
    pub username: String,
    pub transaction: Submitted,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AccessRequestResponse {
    pub request: AccessRequestRow,
    pub transaction: Submitted,
}

fn parse_address(encoded: &str) -> Result<Address, ApiErr> {
    Address::parse(encoded).map_err(ApiErr::invalid_input)
}

fn new_request_id() -> String {
    format!("req-{}", hex::encode(rand::thread_rng().gen::<[u8; 8]>()))
}

async fn caller(ctx: &Context, session: &Session) -> Result<EntityRow, ApiErr> {
    ctx.db
        .get_entity(session.address.clone())
        .await?
        .ok_or_else(|| ApiErr::unauthenticated("caller no longer exists"))
}

/// Association of an institution caller.
async fn institution_of(ctx: &Context, session: &Session) -> Result<Address, ApiErr> {
    session.require(&[Role::Institution])?;
    caller(ctx, session)
        .await?
        .association
        .ok_or_else(|| ApiErr::forbidden("institution has no association"))
}

/// Looks up an applicant enrolled in `association`.
async fn enrolled_applicant(
    ctx: &Context,
    association: &Address,
    address: Address,
) -> Result<EntityRow, ApiErr> {
    let applicant = ctx
        .db
        .get_entity(address.clone())
        .await?
        .filter(|row| row.role == Role::Applicant)
        .ok_or_else(|| ApiErr::not_found(format!("no applicant {address}")))?;

    if applicant.association.as_ref() != Some(association) {
        return Err(ApiErr::forbidden("applicant is not enrolled in this institution"));
    }

    Ok(applicant)
}

fn validate(payload: &Payload) -> Result<(), ApiErr> {
    payload.validate().map_err(ApiErr::invalid_input)
}

async fn summary(ctx: Arc<Context>, session: Session) -> Result<Reply, ApiErr> {
    let counts = ctx.db.activity_counts(session.address.clone()).await?;

    reply(
        StatusCode::OK,
        &Summary {
            address: session.address,
            role: session.role,
            counts,
        },
    )
}

async fn students(ctx: Arc<Context>, session: Session) -> Result<Reply, ApiErr> {
    let association = institution_of(&ctx, &session).await?;
    let students = ctx.db.members_of(association, Role::Applicant).await?;
    reply(StatusCode::OK, &students)
}

/// An institution enrolls an applicant directly, without a registration
/// code.
async fn create_applicant(ctx: Arc<Context>, session: Session, body: NewApplicant) -> Result<Reply, ApiErr> {
    let assembler = ctx.assembler()?;
    let association = institution_of(&ctx, &session).await?;

    validate_credentials(&body.username, &body.password, &body.email)?;
    validate_person_name(Some(body.first_name.as_str()))?;
    validate_person_name(Some(body.last_name.as_str()))?;

    if !YEARS.contains(&body.year) {
        return Err(ApiErr::invalid_input("year is out of range"));
    }

    let mut row = new_entity(
        Role::Applicant,
        body.username,
        body.email,
        hash_password_async(body.password).await?,
        Some(association.clone()),
        Utc::now(),
    );
    row.first_name = Some(body.first_name.clone());
    row.last_name = Some(body.last_name.clone());
    row.program = Some(body.course.clone());

    let payload = Payload::ApplicantCreated(ApplicantCreated {
        address: row.address.clone(),
        institution: association,
        first_name: body.first_name,
        last_name: body.last_name,
        course: body.course,
        year: body.year,
        prefer_role: body.prefer_role,
    });
    validate(&payload)?;

    let prepared =
        assembler.prepare_new(payload, &session.address, session.role, Some(row.address.clone()))?;
    ctx.db.insert_entity(row.clone()).await?;
    info!("{} enrolled applicant {}", session.address, row.address);
    let transaction = assembler.commit(prepared).await;

    reply(
        StatusCode::CREATED,
        &ApplicantCreatedResponse {
            address: row.address,
            username: row.username,
            transaction,
        },
    )
}

async fn add_log(
    ctx: Arc<Context>,
    session: Session,
    address: String,
    body: NewLog,
) -> Result<Reply, ApiErr> {
    let assembler = ctx.assembler()?;
    let association = institution_of(&ctx, &session).await?;
    let applicant = enrolled_applicant(&ctx, &association, parse_address(&address)?).await?;

    let payload = Payload::ApplicantLogAdded(ApplicantLog {
        kind: body.kind,
        name: body.name,
        description: body.description,
        role: body.role,
        duration_start: body.duration_start,
        duration_end: body.duration_end,
        validated_by: session.address.clone(),
    });

    let submitted = assembler
        .submit(payload, &session.address, session.role, Some(applicant.address))
        .await?;
    reply(StatusCode::ACCEPTED, &submitted)
}

/// Applicants remark on themselves, institutions on their applicants.
async fn add_remark(
    ctx: Arc<Context>,
    session: Session,
    address: String,
    body: NewRemark,
) -> Result<Reply, ApiErr> {
    let assembler = ctx.assembler()?;
    session.require(&[Role::Applicant, Role::Institution])?;
    let target = parse_address(&address)?;

    if session.role == Role::Institution {
        let association = institution_of(&ctx, &session).await?;
        enrolled_applicant(&ctx, &association, target.clone()).await?;
    } else if target != session.address {
        return Err(ApiErr::forbidden("applicants may only remark on themselves"));
    }

    let payload = Payload::ExtraRemarkAdded(ExtraRemark {
        title: body.title,
        description: body.description,
        inserted_by: session.address.clone(),
    });

    let submitted = assembler
        .submit(payload, &session.address, session.role, Some(target))
        .await?;
    reply(StatusCode::ACCEPTED, &submitted)
}

async fn list_requests(ctx: Arc<Context>, session: Session) -> Result<Reply, ApiErr> {
    session.require(&[Role::Employer, Role::Applicant, Role::Institution])?;

    let mut requests = ctx.db.access_requests_of(session.address.clone()).await?;

    // Institutions answer for their applicants
    if session.role == Role::Institution {
        let association = institution_of(&ctx, &session).await?;
        for applicant in ctx.db.members_of(association, Role::Applicant).await? {
            requests.extend(ctx.db.access_requests_of(applicant.address).await?);
        }
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    }

    reply(StatusCode::OK, &requests)
}

async fn open_request(
    ctx: Arc<Context>,
    session: Session,
    body: NewAccessRequest,
) -> Result<Reply, ApiErr> {
    let assembler = ctx.assembler()?;
    session.require(&[Role::Employer])?;

    ctx.db
        .get_entity(body.receiver.clone())
        .await?
        .filter(|row| row.role == Role::Applicant)
        .ok_or_else(|| ApiErr::not_found(format!("no applicant {}", body.receiver)))?;

    let now = Utc::now();
    let request = AccessRequestRow {
        id: new_request_id(),
        requestor: session.address.clone(),
        receiver: body.receiver,
        reason: body.reason,
        state: RequestState::Opened,
        created_at: now,
        updated_at: now,
    };

    let payload = Payload::AccessRequestOpened(AccessRequestOpened {
        request_id: request.id.clone(),
        requestor: request.requestor.clone(),
        receiver: request.receiver.clone(),
        reason: request.reason.clone(),
    });
    validate(&payload)?;

    let prepared = assembler
        .prepare(payload, &session.address, session.role, Some(request.receiver.clone()))
        .await?;
    ctx.db.insert_access_request(request.clone()).await?;
    let transaction = assembler.commit(prepared).await;

    debug!("Access request {} opened by {}", request.id, session.address);
    reply(
        StatusCode::CREATED,
        &AccessRequestResponse {
            request,
            transaction,
        },
    )
}

async fn get_request(ctx: &Context, id: &str) -> Result<AccessRequestRow, ApiErr> {
    ctx.db
        .get_access_request(id.to_owned())
        .await?
        .ok_or_else(|| ApiErr::not_found(format!("no access request {id}")))
}

/// The receiving applicant, or its institution, answers a request.
async fn process_request(
    ctx: Arc<Context>,
    session: Session,
    id: String,
    body: ProcessRequest,
) -> Result<Reply, ApiErr> {
    let assembler = ctx.assembler()?;
    session.require(&[Role::Applicant, Role::Institution])?;
    let request = get_request(&ctx, &id).await?;

    if session.role == Role::Institution {
        let association = institution_of(&ctx, &session).await?;
        enrolled_applicant(&ctx, &association, request.receiver.clone()).await?;
    } else if request.receiver != session.address {
        return Err(ApiErr::forbidden("request is addressed to someone else"));
    }

    let to = if body.approved {
        RequestState::Approved
    } else {
        RequestState::Rejected
    };

    let payload = Payload::AccessRequestProcessed(AccessRequestProcessed {
        request_id: id.clone(),
        approved: body.approved,
        processed_by: session.address.clone(),
    });
    let prepared = assembler
        .prepare(payload, &session.address, session.role, Some(request.requestor))
        .await?;

    ctx.db
        .transition_access_request(id, RequestState::Opened, to, Utc::now())
        .await?;

    let submitted = assembler.commit(prepared).await;
    reply(StatusCode::ACCEPTED, &submitted)
}

async fn close_request(ctx: Arc<Context>, session: Session, id: String) -> Result<Reply, ApiErr> {
    let assembler = ctx.assembler()?;
    session.require(&[Role::Employer])?;
    let request = get_request(&ctx, &id).await?;

    if request.requestor != session.address {
        return Err(ApiErr::forbidden("only the requestor may close a request"));
    }

    if request.state == RequestState::Closed {
        return Err(ApiErr::conflict("request is already closed"));
    }

    let payload = Payload::AccessRequestClosed(AccessRequestClosed {
        request_id: id.clone(),
        closed_by: session.address.clone(),
    });
    let prepared = assembler
        .prepare(payload, &session.address, session.role, Some(request.receiver))
        .await?;

    ctx.db
        .transition_access_request(id, request.state, RequestState::Closed, Utc::now())
        .await?;

    let submitted = assembler.commit(prepared).await;
    reply(StatusCode::ACCEPTED, &submitted)
}

/// Institutions see what they issued, applicants what they received.
async fn list_issuances(ctx: Arc<Context>, session: Session) -> Result<Reply, ApiErr> {
    session.require(&[Role::Institution, Role::Applicant])?;

    let issuances: Vec<TxMappingRow> = if session.role == Role::Institution {
        let mut rows = ctx
            .db
            .mappings_of(session.address.clone(), Some(Action::DocumentMinted))
            .await?;
        rows.extend(
            ctx.db
                .mappings_of(session.address.clone(), Some(Action::DocumentBatchMinted))
                .await?,
        );
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        rows
    } else {
        ctx.chain
            .transactions_of(&session.address)
            .into_iter()
            .filter(|(_, tx)| {
                matches!(tx.action, Action::DocumentMinted | Action::DocumentBatchMinted)
                    && tx.to_address.as_ref() == Some(&session.address)
            })
            .map(|(block_id, tx)| TxMappingRow {
                tx_hash: tx.tx_hash,
                address_ref: tx.from_address,
                content_type: tx.action,
                block_id: Some(block_id),
                timestamp: tx.timestamp,
            })
            .collect()
    };

    reply(StatusCode::OK, &issuances)
}

async fn issue(ctx: Arc<Context>, session: Session, body: NewIssuance) -> Result<Reply, ApiErr> {
    let assembler = ctx.assembler()?;
    let association = institution_of(&ctx, &session).await?;
    let recipient = enrolled_applicant(&ctx, &association, body.recipient).await?;

    let submitted = assembler
        .submit(
            Payload::DocumentMinted(body.document),
            &session.address,
            session.role,
            Some(recipient.address),
        )
        .await?;
    reply(StatusCode::ACCEPTED, &submitted)
}

async fn issue_batch(
    ctx: Arc<Context>,
    session: Session,
    body: NewBatchIssuance,
) -> Result<Reply, ApiErr> {
    let assembler = ctx.assembler()?;
    let association = institution_of(&ctx, &session).await?;
    let recipient = enrolled_applicant(&ctx, &association, body.recipient).await?;

    let submitted = assembler
        .submit(
            Payload::DocumentBatchMinted(DocumentBatch {
                documents: body.documents,
            }),
            &session.address,
            session.role,
            Some(recipient.address),
        )
        .await?;
    reply(StatusCode::ACCEPTED, &submitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_password;
    use crate::db::AssociationRow;
    use crate::node::http::routes;
    use crate::node::http::test_utils::*;
    use crate::node::wire::TOKEN_HEADER;
    use crate::primitives::AssociationKind;
    use serde_json::{json, Value};

    struct School {
        ctx: Arc<Context>,
        token: String,
    }

    impl School {
        async fn open() -> Self {
            let (ctx, _) = coordinator().await;
            let association = AssociationRow {
                address: Address::random(),
                name: "Uni".to_owned(),
                kind: AssociationKind::Institution,
                created_at: Utc::now(),
            };
            let row = new_entity(
                Role::Institution,
                "registrar".to_owned(),
                "registrar@uni.test".to_owned(),
                hash_password(PASSWORD).unwrap(),
                Some(association.address.clone()),
                Utc::now(),
            );
            ctx.db
                .insert_entity_with_association(association, row.clone())
                .await
                .unwrap();
            let token = token_for(&ctx, &row).await;
            Self { ctx, token }
        }

        async fn call(&self, method: &str, path: &str, token: &str, body: Option<Value>) -> (u16, Value) {
            let mut req = warp::test::request()
                .method(method)
                .path(path)
                .header(TOKEN_HEADER, token);
            if let Some(body) = body {
                req = req.json(&body);
            }
            let res = req.reply(&routes(self.ctx.clone())).await;
            let status = res.status().as_u16();
            let body = if res.body().is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(res.body()).unwrap()
            };
            (status, body)
        }

        async fn enroll(&self, username: &str) -> (Address, String) {
            let (status, body) = self
                .call(
                    "POST",
                    "/dashboard/applicants",
                    &self.token,
                    Some(json!({
                        "username": username,
                        "password": PASSWORD,
                        "email": format!("{username}@uni.test"),
                        "first_name": "Grace",
                        "last_name": "Hopper",
                        "course": "Computer Science",
                        "year": 2024,
                        "prefer_role": "Engineer",
                    })),
                )
                .await;
            assert_eq!(status, 201, "{body}");
            let address = Address::parse(body["address"].as_str().unwrap()).unwrap();
            let row = self.ctx.db.get_entity(address.clone()).await.unwrap().unwrap();
            let token = token_for(&self.ctx, &row).await;
            (address, token)
        }

        fn queued(&self) -> Vec<Action> {
            self.ctx
                .assembler()
                .unwrap()
                .mempool()
                .drain()
                .into_iter()
                .map(|q| q.tx.action)
                .collect()
        }
    }

    #[tokio::test]
    async fn institution_enrolls_and_issues() {
        let school = School::open().await;
        let (student, _) = school.enroll("grace").await;

        let (status, students) = school.call("GET", "/dashboard/students", &school.token, None).await;
        assert_eq!(status, 200);
        assert_eq!(students.as_array().unwrap().len(), 1);
        assert_eq!(students[0]["program"], "Computer Science");
        assert!(students[0].get("password_hash").is_none());

        let (status, _) = school
            .call(
                "POST",
                &format!("/dashboard/applicants/{student}/logs"),
                &school.token,
                Some(json!({
                    "kind": "project",
                    "name": "Compiler",
                    "description": "Wrote a compiler",
                    "duration_start": "2024-01-01T00:00:00Z",
                })),
            )
            .await;
        assert_eq!(status, 202);

        let (status, _) = school
            .call(
                "POST",
                "/dashboard/issuances",
                &school.token,
                Some(json!({
                    "recipient": student,
                    "title": "Diploma",
                    "description": "BSc Computer Science",
                })),
            )
            .await;
        assert_eq!(status, 202);

        let (status, _) = school
            .call(
                "POST",
                "/dashboard/issuances/batch",
                &school.token,
                Some(json!({
                    "recipient": student,
                    "documents": [
                        {"title": "Transcript", "description": "Year 1"},
                        {"title": "Transcript", "description": "Year 2"},
                    ],
                })),
            )
            .await;
        assert_eq!(status, 202);

        let (_, issued) = school.call("GET", "/dashboard/issuances", &school.token, None).await;
        assert_eq!(issued.as_array().unwrap().len(), 2);

        let (_, summary) = school.call("GET", "/dashboard", &school.token, None).await;
        assert_eq!(summary["role"], "institution");
        assert_eq!(summary["associated"], 1);
        assert_eq!(summary["documents"], 2);

        assert_eq!(
            school.queued(),
            vec![
                Action::ApplicantCreated,
                Action::ApplicantLogAdded,
                Action::DocumentMinted,
                Action::DocumentBatchMinted,
            ]
        );
    }

    #[tokio::test]
    async fn only_own_applicants() {
        let school = School::open().await;
        let other = School {
            ctx: school.ctx.clone(),
            token: login_as(&school.ctx, Role::Institution, "loner").await.1,
        };
        let (student, student_token) = school.enroll("grace").await;

        // An institution without an association cannot enroll anyone.
        let (status, _) = other.call("GET", "/dashboard/students", &other.token, None).await;
        assert_eq!(status, 403);

        let (status, _) = school
            .call(
                "POST",
                &format!("/dashboard/applicants/{}/remarks", Address::random()),
                &student_token,
                Some(json!({"title": "Note", "description": "Not mine"})),
            )
            .await;
        assert_eq!(status, 403);

        let (status, _) = school
            .call(
                "POST",
                &format!("/dashboard/applicants/{student}/remarks"),
                &student_token,
                Some(json!({"title": "Note", "description": "About me"})),
            )
            .await;
        assert_eq!(status, 202);

        // Applicants cannot issue documents.
        let (status, _) = school
            .call(
                "POST",
                "/dashboard/issuances",
                &student_token,
                Some(json!({"recipient": student, "title": "Fake", "description": "Fake"})),
            )
            .await;
        assert_eq!(status, 403);

        let (status, _) = school
            .call(
                "POST",
                "/dashboard/issuances",
                &school.token,
                Some(json!({"recipient": student, "title": "", "description": "Empty title"})),
            )
            .await;
        assert_eq!(status, 422);
    }

    #[tokio::test]
    async fn access_request_lifecycle() {
        let school = School::open().await;
        let (student, student_token) = school.enroll("grace").await;
        let (_, employer) = login_as(&school.ctx, Role::Employer, "acme").await;
        school.queued();

        let (status, opened) = school
            .call(
                "POST",
                "/dashboard/requests",
                &employer,
                Some(json!({"receiver": student, "reason": "Hiring"})),
            )
            .await;
        assert_eq!(status, 201);
        let id = opened["request"]["id"].as_str().unwrap().to_owned();
        assert_eq!(opened["request"]["state"], "opened");

        // Employers cannot answer their own requests.
        let (status, _) = school
            .call(
                "POST",
                &format!("/dashboard/requests/{id}/process"),
                &employer,
                Some(json!({"approved": true})),
            )
            .await;
        assert_eq!(status, 403);

        let (status, _) = school
            .call(
                "POST",
                &format!("/dashboard/requests/{id}/process"),
                &student_token,
                Some(json!({"approved": true})),
            )
            .await;
        assert_eq!(status, 202);

        let (status, _) = school
            .call(
                "POST",
                &format!("/dashboard/requests/{id}/process"),
                &school.token,
                Some(json!({"approved": false})),
            )
            .await;
        assert_eq!(status, 409);

        let (_, listed) = school.call("GET", "/dashboard/requests", &school.token, None).await;
        assert_eq!(listed[0]["state"], "approved");

        let (status, _) = school
            .call("POST", &format!("/dashboard/requests/{id}/close"), &employer, None)
            .await;
        assert_eq!(status, 202);

        let (status, _) = school
            .call("POST", &format!("/dashboard/requests/{id}/close"), &employer, None)
            .await;
        assert_eq!(status, 409);

        assert_eq!(
            school.queued(),
            vec![
                Action::AccessRequestOpened,
                Action::AccessRequestProcessed,
                Action::AccessRequestClosed,
            ]
        );
    }

    #[tokio::test]
    async fn full_queue_leaves_no_partial_writes() {
        let school = School::open().await;
        let (student, student_token) = school.enroll("grace").await;
        let (_, employer) = login_as(&school.ctx, Role::Employer, "acme").await;

        let (status, opened) = school
            .call(
                "POST",
                "/dashboard/requests",
                &employer,
                Some(json!({"receiver": student, "reason": "Hiring"})),
            )
            .await;
        assert_eq!(status, 201);
        let id = opened["request"]["id"].as_str().unwrap().to_owned();

        let mempool = school.ctx.assembler().unwrap().mempool().clone();
        let filler = crate::primitives::test_utils::test_tx("filler");
        while mempool.push(filler.clone()).is_ok() {}

        let applicant = json!({
            "username": "ada",
            "password": PASSWORD,
            "email": "ada@uni.test",
            "first_name": "Ada",
            "last_name": "Lovelace",
            "course": "Mathematics",
            "year": 2024,
            "prefer_role": "Analyst",
        });
        let (status, _) = school
            .call("POST", "/dashboard/applicants", &school.token, Some(applicant.clone()))
            .await;
        assert_eq!(status, 503);
        assert!(school
            .ctx
            .db
            .get_entity_by_username("ada".to_owned())
            .await
            .unwrap()
            .is_none());

        let (status, _) = school
            .call(
                "POST",
                "/dashboard/requests",
                &employer,
                Some(json!({"receiver": student, "reason": "Second look"})),
            )
            .await;
        assert_eq!(status, 503);
        assert_eq!(
            school.ctx.db.access_requests_of(student.clone()).await.unwrap().len(),
            1
        );

        let (status, _) = school
            .call(
                "POST",
                &format!("/dashboard/requests/{id}/process"),
                &student_token,
                Some(json!({"approved": true})),
            )
            .await;
        assert_eq!(status, 503);
        let (status, _) = school
            .call("POST", &format!("/dashboard/requests/{id}/close"), &employer, None)
            .await;
        assert_eq!(status, 503);
        let request = school.ctx.db.get_access_request(id.clone()).await.unwrap().unwrap();
        assert_eq!(request.state, RequestState::Opened);

        // Once the builder drains the queue the same requests go through
        school.queued();
        let (status, _) = school
            .call("POST", "/dashboard/applicants", &school.token, Some(applicant))
            .await;
        assert_eq!(status, 201);
        let (status, _) = school
            .call(
                "POST",
                &format!("/dashboard/requests/{id}/process"),
                &student_token,
                Some(json!({"approved": true})),
            )
            .await;
        assert_eq!(status, 202);
        assert_eq!(
            school.queued(),
            vec![Action::ApplicantCreated, Action::AccessRequestProcessed]
        );
    }

    #[tokio::test]
    async fn peers_refuse_writes() {
        let ctx = peer().await;
        let (_, token) = login_as(&ctx, Role::Employer, "acme").await;
        let res = warp::test::request()
            .method("POST")
            .path("/dashboard/requests")
            .header(TOKEN_HEADER, &token)
            .json(&json!({"receiver": Address::random(), "reason": "Hiring"}))
            .reply(&routes(ctx))
            .await;
        assert_eq!(res.status(), 503);
    }
}
