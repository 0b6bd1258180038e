// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! HTTP surface of a node. Every router takes the shared [`Context`] and
//! every failure is answered with an [`ErrorBody`](crate::node::wire::ErrorBody).

pub mod admin;
pub mod auth;
pub mod dashboard;
pub mod entity;
pub mod error;
pub mod explorer;
pub mod node;

pub use auth::{with_session, Session, TokenKeys};
pub use error::{ApiErr, ApiErrKind};

use crate::node::Context;
use log::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::{Filter, Rejection};

/// Max accepted request body.
pub const MAX_BODY_BYTES: u64 = 1024 * 64;

/// Page sizes the explorer accepts.
pub const PAGE_LIMITS: [u32; 5] = [5, 25, 50, 75, 100];

pub const DEFAULT_PAGE_LIMIT: u32 = 25;

pub type Reply = WithStatus<Json>;

/// Every route of the node.
pub fn routes(
    ctx: Arc<Context>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone {
    entity::routes(ctx.clone())
        .or(explorer::routes(ctx.clone()))
        .or(node::routes(ctx.clone()))
        .or(admin::routes(ctx.clone()))
        .or(dashboard::routes(ctx))
        .with(warp::log("folioblocks::http"))
        .recover(error::handle_rejection)
}

pub fn with_ctx(ctx: Arc<Context>) -> impl Filter<Extract = (Arc<Context>,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

pub fn json_body<T: DeserializeOwned + Send>(
) -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    // When accepting a body, we want a JSON body
    // (and to reject huge payloads)...
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

pub fn reply<T: Serialize>(status: StatusCode, body: &T) -> Result<Reply, ApiErr> {
    Ok(warp::reply::with_status(warp::reply::json(body), status))
}

/// Turns a handler result into a reply, answering errors with their body.
pub fn respond(result: Result<Reply, ApiErr>) -> Result<Reply, Rejection> {
    Ok(result.unwrap_or_else(|err| {
        debug!("Request failed with {}", err);
        err.into_reply()
    }))
}

/// `limit` and `page` query of list endpoints.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<u32>,
    pub page: Option<u32>,
}

impl PageQuery {
    /// Returns `(limit, offset)`.
    pub fn resolve(&self) -> Result<(u32, u32), ApiErr> {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_LIMIT);

        if !PAGE_LIMITS.contains(&limit) {
            return Err(ApiErr::invalid_input(format!(
                "limit must be one of {PAGE_LIMITS:?}"
            )));
        }

        let page = self.page.unwrap_or(1);

        if page == 0 {
            return Err(ApiErr::invalid_input("page starts at 1"));
        }

        let offset = (page - 1)
            .checked_mul(limit)
            .ok_or_else(|| ApiErr::invalid_input("page is out of range"))?;
        Ok((limit, offset))
    }
}

/// One page of a list endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Paged<T> {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub items: Vec<T>,
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::chain::{ChainStore, MemoryBackend};
    use crate::consensus::{ConsensusEngine, PeerSealer};
    use crate::crypto::{hash_password, PasscodeTotp};
    use crate::db::{new_entity, EntityRow, MetaStore, TokenRow};
    use crate::node::assembler::Assembler;
    use crate::node::mempool::Mempool;
    use crate::node::transport::{CoordinatorLink, PeerLink, TransportErr};
    use crate::node::wire::*;
    use crate::node::RoleContext;
    use crate::primitives::test_utils::sealed_genesis;
    use crate::primitives::{Hash256, Role, TokenState};
    use crate::settings::Settings;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use parking_lot::Mutex;

    pub const PASSWORD: &str = "correct horse";

    /// Peer link that accepts every delivery and records it.
    #[derive(Default)]
    pub struct AcceptingPeers {
        pub opened: Mutex<Vec<OpenRequest>>,
    }

    #[async_trait]
    impl PeerLink for AcceptingPeers {
        async fn open(
            &self,
            _peer: &crate::db::AssociatedNodeRow,
            request: &OpenRequest,
            _timeout: std::time::Duration,
        ) -> Result<(), TransportErr> {
            self.opened.lock().push(request.clone());
            Ok(())
        }

        async fn probe(
            &self,
            _peer: &crate::db::AssociatedNodeRow,
            _timeout: std::time::Duration,
        ) -> Result<(), TransportErr> {
            Ok(())
        }
    }

    /// Coordinator link of a peer whose coordinator never answers.
    pub struct SilentCoordinator;

    #[async_trait]
    impl CoordinatorLink for SilentCoordinator {
        async fn submit_seal(
            &self,
            _request: &SealRequest,
            _timeout: std::time::Duration,
        ) -> Result<SealResponse, TransportErr> {
            Err(TransportErr::Timeout)
        }

        async fn report_progress(
            &self,
            _negotiation_id: &str,
            _status: ProgressStatus,
            _timeout: std::time::Duration,
        ) -> Result<(), TransportErr> {
            Err(TransportErr::Timeout)
        }

        async fn verify_chain_hash(
            &self,
            _hash: Hash256,
            _timeout: std::time::Duration,
        ) -> Result<bool, TransportErr> {
            Err(TransportErr::Timeout)
        }

        async fn pull_chain(
            &self,
            _timeout: std::time::Duration,
        ) -> Result<SyncResponse, TransportErr> {
            Err(TransportErr::Timeout)
        }
    }

    fn chain() -> Arc<ChainStore> {
        let chain = ChainStore::open(Box::new(MemoryBackend::default()), 1).unwrap();
        chain.append(sealed_genesis()).unwrap();
        Arc::new(chain)
    }

    /// Coordinator context over in-memory stores, with its own entity
    /// registered.
    pub async fn coordinator() -> (Arc<Context>, Arc<AcceptingPeers>) {
        let db = MetaStore::open_in_memory().unwrap();
        let me = new_entity(
            Role::Coordinator,
            "coordinator".to_owned(),
            "coordinator@folio.test".to_owned(),
            hash_password(PASSWORD).unwrap(),
            None,
            Utc::now(),
        );
        db.insert_entity(me.clone()).await.unwrap();

        let settings = Settings::default();
        let chain = chain();
        let mempool = Arc::new(Mempool::new(
            settings.consensus.queue_capacity,
            settings.consensus.soft_threshold,
        ));
        let assembler = Assembler::new(db.clone(), mempool);
        let peers = Arc::new(AcceptingPeers::default());
        let engine = Arc::new(ConsensusEngine::new(
            me.address.clone(),
            db.clone(),
            chain.clone(),
            assembler.clone(),
            peers.clone(),
            &settings.consensus,
        ));

        let ctx = Context {
            settings,
            address: me.address,
            keys: TokenKeys::from_secret("test-secret"),
            passcode: PasscodeTotp::new(b"test-passcode").unwrap(),
            db,
            chain,
            role: RoleContext::Coordinator { assembler, engine },
        };

        (Arc::new(ctx), peers)
    }

    /// Archival peer context whose coordinator is unreachable.
    pub async fn peer() -> Arc<Context> {
        let db = MetaStore::open_in_memory().unwrap();
        let me = new_entity(
            Role::ArchivalPeer,
            "archival".to_owned(),
            "archival@folio.test".to_owned(),
            hash_password(PASSWORD).unwrap(),
            None,
            Utc::now(),
        );
        db.insert_entity(me.clone()).await.unwrap();

        let settings = Settings::default();
        let upstream: Arc<dyn CoordinatorLink> = Arc::new(SilentCoordinator);
        let sealer = Arc::new(PeerSealer::new(
            me.address.clone(),
            db.clone(),
            upstream.clone(),
            &settings.consensus,
        ));

        let ctx = Context {
            settings,
            address: me.address,
            keys: TokenKeys::from_secret("test-secret"),
            passcode: PasscodeTotp::new(b"test-passcode").unwrap(),
            db,
            chain: chain(),
            role: RoleContext::Peer { sealer, upstream },
        };

        Arc::new(ctx)
    }

    /// Inserts an entity of `role` and returns it with a live token.
    pub async fn login_as(ctx: &Context, role: Role, username: &str) -> (EntityRow, String) {
        let row = new_entity(
            role,
            username.to_owned(),
            format!("{username}@folio.test"),
            hash_password(PASSWORD).unwrap(),
            None,
            Utc::now(),
        );
        ctx.db.insert_entity(row.clone()).await.unwrap();
        let token = token_for(ctx, &row).await;
        (row, token)
    }

    pub async fn token_for(ctx: &Context, row: &EntityRow) -> String {
        let now = Utc::now();
        let (token, expires_at) = ctx.keys.issue(row, now, Duration::days(7)).unwrap();
        ctx.db
            .insert_token(
                TokenRow {
                    value: token.clone(),
                    address: row.address.clone(),
                    state: TokenState::Fresh,
                    issued_at: now,
                    expires_at,
                    last_used: None,
                },
                5,
            )
            .await
            .unwrap();
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_query_resolution() {
        assert_eq!(PageQuery::default().resolve().unwrap(), (25, 0));
        let q = PageQuery {
            limit: Some(50),
            page: Some(3),
        };
        assert_eq!(q.resolve().unwrap(), (50, 100));
        let q = PageQuery {
            limit: Some(7),
            page: None,
        };
        assert!(q.resolve().is_err());
        let q = PageQuery {
            limit: None,
            page: Some(0),
        };
        assert!(q.resolve().is_err());
    }

    #[tokio::test]
    async fn unknown_routes_are_json_404() {
        let (ctx, _) = test_utils::coordinator().await;
        let res = warp::test::request()
            .method("GET")
            .path("/nowhere")
            .reply(&routes(ctx))
            .await;
        assert_eq!(res.status(), 404);
        let body: crate::node::wire::ErrorBody = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body.code, "not-found");
    }
}
