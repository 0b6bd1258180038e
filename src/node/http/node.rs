// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Node to node endpoints: negotiation, peer certification and chain
//! distribution.

use crate::consensus::RoundInfo;
use crate::db::AssociatedNodeRow;
use crate::node::http::explorer::BlockSummary;
use crate::node::http::{json_body, reply, respond, with_ctx, with_session, ApiErr, Reply, Session};
use crate::node::wire::*;
use crate::node::{Context, RoleContext};
use crate::primitives::{
    Address, Block, Hash256, NodeCertified, NodeRegistered, NodeStatus, NodeSync, Payload, Role,
};
use crate::settings::NodeRole;
use chrono::Utc;
use log::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::Filter;

pub fn routes(ctx: Arc<Context>) -> BoxedFilter<(Reply,)> {
    let info = warp::path!("node" / "info")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(|ctx: Arc<Context>| async move { respond(info(ctx).await) });

    let open = warp::path!("node" / "negotiate" / "open")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(warp::header::<String>(CERTIFICATE_HEADER))
        .and(json_body::<OpenRequest>())
        .and_then(
            |ctx: Arc<Context>, certificate: String, request: OpenRequest| async move {
                respond(open(ctx, certificate, request).await)
            },
        );

    let seal = warp::path!("node" / "negotiate" / "seal")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and(json_body::<SealRequest>())
        .and_then(
            |ctx: Arc<Context>, session: Session, request: SealRequest| async move {
                respond(seal(ctx, session, request).await)
            },
        );

    let progress = warp::path!("node" / "negotiate" / String)
        .and(warp::put())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and(json_body::<ProgressUpdate>())
        .and_then(
            |id: String, ctx: Arc<Context>, session: Session, update: ProgressUpdate| async move {
                respond(progress(ctx, session, id, update).await)
            },
        );

    let certify = warp::path!("node" / "certify")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and(json_body::<CertifyRequest>())
        .and_then(
            |ctx: Arc<Context>, session: Session, request: CertifyRequest| async move {
                respond(certify(ctx, session, request).await)
            },
        );

    let sync = warp::path!("node" / "sync")
        .and(warp::post())
        .and(with_ctx(ctx.clone()))
        .and(with_session(ctx.clone()))
        .and_then(|ctx: Arc<Context>, session: Session| async move {
            respond(sync(ctx, session).await)
        });

    let verify = warp::path!("node" / "verify_chain_hash")
        .and(warp::post())
        .and(with_ctx(ctx))
        .and(warp::header::<String>(HASH_HEADER))
        .and_then(|ctx: Arc<Context>, hash: String| async move {
            respond(verify_chain_hash(&ctx, &hash))
        });

    info.or(open)
        .unify()
        .or(seal)
        .unify()
        .or(progress)
        .unify()
        .or(certify)
        .unify()
        .or(sync)
        .unify()
        .or(verify)
        .unify()
        .boxed()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeInfo {
    pub role: NodeRole,
    pub address: Address,
    pub length: u64,
    pub chain_hash: Option<Hash256>,
    pub tip: Option<BlockSummary>,

    /// Transactions waiting for a block, coordinator only
    pub queued: Option<usize>,

    /// Round in flight, coordinator only
    pub round: Option<RoundInfo>,

    /// Negotiation being sealed, peer only
    pub sealing: Option<String>,
    pub peers: Vec<AssociatedNodeRow>,

    /// Fatal consensus faults since start
    pub faults: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationAccepted {
    pub negotiation_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainHashCheck {
    pub chain_hash: Option<Hash256>,
    pub matches: bool,
}

async fn info(ctx: Arc<Context>) -> Result<Reply, ApiErr> {
    let snapshot = ctx.chain.snapshot();

    let mut info = NodeInfo {
        role: ctx.node_role(),
        address: ctx.address.clone(),
        length: snapshot.length(),
        chain_hash: snapshot.chain_hash(),
        tip: snapshot.tip().map(|b| BlockSummary::from(&**b)),
        queued: None,
        round: None,
        sealing: None,
        peers: vec![],
        faults: 0,
    };

    match &ctx.role {
        RoleContext::Coordinator { assembler, engine } => {
            info.queued = Some(assembler.mempool().len());
            info.round = engine.round_info().await;
            info.peers = ctx.db.associated_nodes().await?;
            info.faults = engine.faults();
        }
        RoleContext::Peer { sealer, .. } => {
            info.sealing = sealer.sealing();
        }
    }

    reply(StatusCode::OK, &info)
}

/// Coordinator hands a block to this peer.
async fn open(ctx: Arc<Context>, certificate: String, request: OpenRequest) -> Result<Reply, ApiErr> {
    let sealer = ctx.sealer()?;

    if !sealer.check_certificate(&certificate) {
        warn!(
            "Refused negotiation {} with a bad certificate",
            request.negotiation_id
        );
        return Err(ApiErr::forbidden("certificate does not match"));
    }

    let negotiation_id = request.negotiation_id.clone();
    sealer.on_open(request).await?;

    reply(StatusCode::ACCEPTED, &NegotiationAccepted { negotiation_id })
}

/// Peer posts its sealed block.
async fn seal(ctx: Arc<Context>, session: Session, request: SealRequest) -> Result<Reply, ApiErr> {
    session.require(&[Role::ArchivalPeer])?;
    let engine = ctx.engine()?;
    let block_hash = engine.on_sealed(&session.address, request).await?;

    reply(StatusCode::OK, &SealResponse { block_hash })
}

async fn progress(
    ctx: Arc<Context>,
    session: Session,
    negotiation_id: String,
    update: ProgressUpdate,
) -> Result<Reply, ApiErr> {
    session.require(&[Role::ArchivalPeer])?;
    let engine = ctx.engine()?;
    engine
        .on_progress(&session.address, &negotiation_id, update.status)
        .await?;

    reply(StatusCode::ACCEPTED, &update)
}

fn new_certificate() -> String {
    base64::encode_config(rand::thread_rng().gen::<[u8; 32]>(), base64::URL_SAFE)
}

fn current_chain_hash(ctx: &Context) -> Result<Hash256, ApiErr> {
    ctx.chain
        .chain_hash()
        .ok_or_else(|| ApiErr::unavailable("chain is not initialized"))
}

/// Records the calling peer as an associated node and hands it the
/// certificate the coordinator presents on every delivery.
async fn certify(ctx: Arc<Context>, session: Session, request: CertifyRequest) -> Result<Reply, ApiErr> {
    session.require(&[Role::ArchivalPeer])?;
    let assembler = ctx.assembler()?;

    if request.host.trim().is_empty() || request.host.len() > 253 {
        return Err(ApiErr::invalid_input("host must be 1 to 253 characters"));
    }

    if request.port == 0 {
        return Err(ApiErr::invalid_input("port must not be 0"));
    }

    let chain_hash = current_chain_hash(&ctx)?;
    let now = Utc::now();
    let certificate = new_certificate();

    let registered = assembler.prepare_internal(
        Payload::NodeRegistered(NodeRegistered {
            new_address: session.address.clone(),
            acceptor_address: ctx.address.clone(),
            role: Role::ArchivalPeer,
        }),
        &ctx.address,
        Some(session.address.clone()),
    )?;
    let certified = assembler.prepare_internal(
        Payload::NodeCertified(NodeCertified {
            requestor_address: session.address.clone(),
            host: request.host.clone(),
            port: request.port,
        }),
        &ctx.address,
        Some(session.address.clone()),
    )?;

    let is_new = ctx
        .db
        .upsert_associated_node(AssociatedNodeRow {
            address: session.address.clone(),
            host: request.host.clone(),
            port: request.port,
            certificate: certificate.clone(),
            status: NodeStatus::Available,
            last_seen: Some(now),
            registered_at: now,
        })
        .await?;

    info!(
        "Certified peer {} at {}:{}",
        session.address, request.host, request.port
    );

    // A re-certification only records the new endpoint
    if is_new {
        assembler.commit(registered).await;
    }

    assembler.commit(certified).await;

    reply(
        StatusCode::OK,
        &CertifyResponse {
            certificate,
            coordinator_address: ctx.address.clone(),
            chain_hash,
        },
    )
}

/// Full chain for a peer catching up.
async fn sync(ctx: Arc<Context>, session: Session) -> Result<Reply, ApiErr> {
    session.require(&[Role::ArchivalPeer])?;
    let assembler = ctx.assembler()?;
    let snapshot = ctx.chain.snapshot();
    let chain_hash = snapshot
        .chain_hash()
        .ok_or_else(|| ApiErr::unavailable("chain is not initialized"))?;
    let blocks: Vec<Block> = snapshot.blocks().iter().map(|b| Block::clone(b)).collect();

    let payload = Payload::NodeSync(NodeSync {
        requestor_address: session.address.clone(),
    });

    if let Err(err) = assembler
        .submit_internal(payload, &ctx.address, Some(session.address.clone()))
        .await
    {
        warn!("Could not record sync of {}: {}", session.address, err);
    }

    debug!("Serving {} blocks to {}", blocks.len(), session.address);
    reply(StatusCode::OK, &SyncResponse { blocks, chain_hash })
}

fn verify_chain_hash(ctx: &Context, presented: &str) -> Result<Reply, ApiErr> {
    let presented =
        Hash256::from_hex(presented).map_err(|_| ApiErr::invalid_input("malformed x-hash"))?;
    let chain_hash = ctx.chain.chain_hash();
    let matches = chain_hash == Some(presented);
    let status = if matches {
        StatusCode::OK
    } else {
        StatusCode::NOT_ACCEPTABLE
    };

    reply(status, &ChainHashCheck { chain_hash, matches })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::http::routes;
    use crate::node::http::test_utils::*;
    use crate::primitives::test_utils::*;
    use crate::primitives::Action;

    fn open_request(ctx: &Context) -> OpenRequest {
        let tip = ctx.chain.tip().unwrap();
        OpenRequest {
            negotiation_id: "n-1".to_owned(),
            coordinator_address: Address::random(),
            block: Block::new_unsealed(tip.id + 1, tip.hash.unwrap(), Utc::now(), vec![test_tx(
                "diploma",
            )]),
            deadline: Utc::now() + chrono::Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn info_reports_role() {
        let (ctx, _) = coordinator().await;
        let res = warp::test::request()
            .method("GET")
            .path("/node/info")
            .reply(&routes(ctx.clone()))
            .await;
        assert_eq!(res.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["role"], "coordinator");
        assert_eq!(body["length"], 1);
        assert_eq!(body["queued"], 0);

        let ctx = peer().await;
        let res = warp::test::request()
            .method("GET")
            .path("/node/info")
            .reply(&routes(ctx))
            .await;
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["role"], "peer");
        assert!(body["queued"].is_null());
    }

    #[tokio::test]
    async fn certify_then_sync() {
        let (ctx, _) = coordinator().await;
        let (row, token) = login_as(&ctx, Role::ArchivalPeer, "archive1").await;
        let filter = routes(ctx.clone());

        let res = warp::test::request()
            .method("POST")
            .path("/node/certify")
            .header(TOKEN_HEADER, &token)
            .json(&CertifyRequest {
                host: "10.0.0.7".to_owned(),
                port: 5001,
            })
            .reply(&filter)
            .await;
        assert_eq!(res.status(), 200);
        let body: CertifyResponse = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body.coordinator_address, ctx.address);
        assert_eq!(Some(body.chain_hash), ctx.chain.chain_hash());
        assert_eq!(base64::decode_config(&body.certificate, base64::URL_SAFE).unwrap().len(), 32);

        let stored = ctx.db.get_associated_node(row.address.clone()).await.unwrap().unwrap();
        assert_eq!(stored.certificate, body.certificate);
        assert_eq!(stored.status, NodeStatus::Available);

        let actions: Vec<Action> = ctx
            .assembler()
            .unwrap()
            .mempool()
            .drain()
            .into_iter()
            .map(|q| q.tx.action)
            .collect();
        assert_eq!(actions, vec![Action::NodeRegistered, Action::NodeCertified]);

        // Certifying again only refreshes the row.
        let res = warp::test::request()
            .method("POST")
            .path("/node/certify")
            .header(TOKEN_HEADER, &token)
            .json(&CertifyRequest {
                host: "10.0.0.8".to_owned(),
                port: 5001,
            })
            .reply(&filter)
            .await;
        assert_eq!(res.status(), 200);
        assert_eq!(ctx.assembler().unwrap().mempool().len(), 1);

        let res = warp::test::request()
            .method("POST")
            .path("/node/sync")
            .header(TOKEN_HEADER, &token)
            .reply(&filter)
            .await;
        assert_eq!(res.status(), 200);
        let body: SyncResponse = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body.blocks.len(), 1);
        assert_eq!(Some(body.chain_hash), ctx.chain.chain_hash());
    }

    #[tokio::test]
    async fn only_peers_certify() {
        let (ctx, _) = coordinator().await;
        let (_, token) = login_as(&ctx, Role::Employer, "acme").await;

        let res = warp::test::request()
            .method("POST")
            .path("/node/certify")
            .header(TOKEN_HEADER, &token)
            .json(&CertifyRequest {
                host: "10.0.0.7".to_owned(),
                port: 5001,
            })
            .reply(&routes(ctx))
            .await;
        assert_eq!(res.status(), 403);
    }

    #[tokio::test]
    async fn chain_hash_verification() {
        let (ctx, _) = coordinator().await;
        let filter = routes(ctx.clone());
        let hash = ctx.chain.chain_hash().unwrap();

        let res = warp::test::request()
            .method("POST")
            .path("/node/verify_chain_hash")
            .header(HASH_HEADER, hash.to_hex())
            .reply(&filter)
            .await;
        assert_eq!(res.status(), 200);

        let res = warp::test::request()
            .method("POST")
            .path("/node/verify_chain_hash")
            .header(HASH_HEADER, Hash256::zero().to_hex())
            .reply(&filter)
            .await;
        assert_eq!(res.status(), 406);

        let res = warp::test::request()
            .method("POST")
            .path("/node/verify_chain_hash")
            .header(HASH_HEADER, "nope")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), 422);
    }

    #[tokio::test]
    async fn open_requires_certificate() {
        let ctx = peer().await;
        ctx.sealer().unwrap().set_certificate("cert-a".to_owned());
        let filter = routes(ctx.clone());

        let res = warp::test::request()
            .method("POST")
            .path("/node/negotiate/open")
            .header(CERTIFICATE_HEADER, "cert-b")
            .json(&open_request(&ctx))
            .reply(&filter)
            .await;
        assert_eq!(res.status(), 403);

        let res = warp::test::request()
            .method("POST")
            .path("/node/negotiate/open")
            .json(&open_request(&ctx))
            .reply(&filter)
            .await;
        assert_eq!(res.status(), 422);

        let res = warp::test::request()
            .method("POST")
            .path("/node/negotiate/open")
            .header(CERTIFICATE_HEADER, "cert-a")
            .json(&open_request(&ctx))
            .reply(&filter)
            .await;
        assert_eq!(res.status(), 202);
        let body: NegotiationAccepted = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body.negotiation_id, "n-1");
    }

    #[tokio::test]
    async fn negotiation_endpoints_are_role_bound() {
        let (ctx, _) = coordinator().await;
        let (_, token) = login_as(&ctx, Role::ArchivalPeer, "archive1").await;

        // No round is active, the seal is stale.
        let req = SealRequest {
            negotiation_id: "n-404".to_owned(),
            block: sealed_child(&ctx.chain.tip().unwrap(), vec![test_tx("x")]),
        };
        let res = warp::test::request()
            .method("POST")
            .path("/node/negotiate/seal")
            .header(TOKEN_HEADER, &token)
            .json(&req)
            .reply(&routes(ctx.clone()))
            .await;
        assert_eq!(res.status(), 409);

        // Peers do not run the engine.
        let peer = peer().await;
        let (_, token) = login_as(&peer, Role::ArchivalPeer, "archive2").await;
        let res = warp::test::request()
            .method("PUT")
            .path("/node/negotiate/n-1")
            .header(TOKEN_HEADER, &token)
            .json(&ProgressUpdate {
                status: ProgressStatus::Hashing,
            })
            .reply(&routes(peer))
            .await;
        assert_eq!(res.status(), 503);
    }
}
