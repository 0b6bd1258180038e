// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Inter-node calls over HTTP. Every call carries a deadline and a
//! cancelled call is reported as [`TransportErr::Timeout`].

use crate::db::{AssociatedNodeRow, DbErr, MetaStore};
use crate::node::wire::*;
use crate::primitives::Hash256;
use async_trait::async_trait;
use log::*;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;

/// Calls made by the coordinator on archival peers.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Delivers an unsealed block. Ok means the peer accepted it.
    async fn open(
        &self,
        peer: &AssociatedNodeRow,
        request: &OpenRequest,
        timeout: Duration,
    ) -> Result<(), TransportErr>;

    /// Liveness probe against `node/info`.
    async fn probe(&self, peer: &AssociatedNodeRow, timeout: Duration) -> Result<(), TransportErr>;
}

/// Calls made by an archival peer on its coordinator.
#[async_trait]
pub trait CoordinatorLink: Send + Sync {
    async fn submit_seal(
        &self,
        request: &SealRequest,
        timeout: Duration,
    ) -> Result<SealResponse, TransportErr>;

    async fn report_progress(
        &self,
        negotiation_id: &str,
        status: ProgressStatus,
        timeout: Duration,
    ) -> Result<(), TransportErr>;

    /// Returns true if the coordinator's chain hash equals `hash`.
    async fn verify_chain_hash(&self, hash: Hash256, timeout: Duration)
        -> Result<bool, TransportErr>;

    async fn pull_chain(&self, timeout: Duration) -> Result<SyncResponse, TransportErr>;
}

fn http_client() -> Client {
    Client::builder()
        .user_agent(concat!("folioblocks/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

/// Coordinator side [`PeerLink`], authenticated by each peer's certificate.
#[derive(Clone)]
pub struct HttpPeerLink {
    client: Client,
}

impl HttpPeerLink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: http_client(),
        }
    }
}

impl Default for HttpPeerLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerLink for HttpPeerLink {
    async fn open(
        &self,
        peer: &AssociatedNodeRow,
        request: &OpenRequest,
        timeout: Duration,
    ) -> Result<(), TransportErr> {
        let url = format!("{}/node/negotiate/open", peer.base_url());
        let builder = self
            .client
            .post(url)
            .header(CERTIFICATE_HEADER, &peer.certificate)
            .json(request);

        send(builder, timeout).await.map(|_| ())
    }

    async fn probe(&self, peer: &AssociatedNodeRow, timeout: Duration) -> Result<(), TransportErr> {
        let url = format!("{}/node/info", peer.base_url());
        send(self.client.get(url), timeout).await.map(|_| ())
    }
}

/// Peer side client of the coordinator. Holds the session token and logs
/// in again once when the coordinator answers 401.
///
/// With a token store attached, every new token is persisted so a restarted
/// peer keeps its session instead of opening another one.
pub struct CoordinatorClient {
    client: Client,
    base_url: String,
    credentials: LoginRequest,
    token: RwLock<Option<String>>,
    store: Option<MetaStore>,
}

impl CoordinatorClient {
    #[must_use]
    pub fn new(base_url: &str, username: String, password: String) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            credentials: LoginRequest { username, password },
            token: RwLock::new(None),
            store: None,
        }
    }

    #[must_use]
    pub fn with_token_store(mut self, store: MetaStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Picks up the token persisted by a previous run. Returns true if
    /// there was one.
    pub async fn restore_session(&self) -> Result<bool, DbErr> {
        let Some(store) = &self.store else {
            return Ok(false);
        };

        match store.session_token().await? {
            Some(token) => {
                *self.token.write() = Some(token);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    pub async fn register(
        &self,
        request: &RegisterRequest,
        timeout: Duration,
    ) -> Result<RegisterResponse, TransportErr> {
        let builder = self.client.post(self.url("entity/register")).json(request);
        decode(send(builder, timeout).await?).await
    }

    /// Logs in with the stored credentials and keeps the token.
    pub async fn login(&self, timeout: Duration) -> Result<LoginResponse, TransportErr> {
        let builder = self
            .client
            .post(self.url("entity/login"))
            .json(&self.credentials);
        let response: LoginResponse = decode(send(builder, timeout).await?).await?;
        *self.token.write() = Some(response.token.clone());

        if let Some(store) = &self.store {
            if let Err(err) = store.set_session_token(Some(response.token.clone())).await {
                warn!("Could not persist the session token: {}", err);
            }
        }

        Ok(response)
    }

    pub async fn certify(
        &self,
        request: &CertifyRequest,
        timeout: Duration,
    ) -> Result<CertifyResponse, TransportErr> {
        let url = self.url("node/certify");
        let response = self
            .authorized(timeout, || self.client.post(&url).json(request))
            .await?;
        decode(response).await
    }

    /// Sends an authenticated request, logging in first when there is no
    /// token and once more if the token was rejected.
    async fn authorized<F>(&self, timeout: Duration, build: F) -> Result<Response, TransportErr>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        if self.token.read().is_none() {
            self.login(timeout).await?;
        }

        let mut relogged = false;

        loop {
            let token = self.token.read().clone().unwrap_or_default();
            let builder = build().header(TOKEN_HEADER, token);

            match send(builder, timeout).await {
                Err(TransportErr::Status(StatusCode::UNAUTHORIZED, _)) if !relogged => {
                    debug!("Coordinator rejected session token, logging in again");
                    relogged = true;
                    self.login(timeout).await?;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl CoordinatorLink for CoordinatorClient {
    async fn submit_seal(
        &self,
        request: &SealRequest,
        timeout: Duration,
    ) -> Result<SealResponse, TransportErr> {
        let url = self.url("node/negotiate/seal");
        let response = self
            .authorized(timeout, || self.client.post(&url).json(request))
            .await?;
        decode(response).await
    }

    async fn report_progress(
        &self,
        negotiation_id: &str,
        status: ProgressStatus,
        timeout: Duration,
    ) -> Result<(), TransportErr> {
        let url = self.url(&format!("node/negotiate/{negotiation_id}"));
        let update = ProgressUpdate { status };
        self.authorized(timeout, || self.client.put(&url).json(&update))
            .await
            .map(|_| ())
    }

    async fn verify_chain_hash(
        &self,
        hash: Hash256,
        timeout: Duration,
    ) -> Result<bool, TransportErr> {
        let builder = self
            .client
            .post(self.url("node/verify_chain_hash"))
            .header(HASH_HEADER, hash.to_hex());

        match send(builder, timeout).await {
            Ok(_) => Ok(true),
            Err(TransportErr::Status(StatusCode::NOT_ACCEPTABLE, _)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn pull_chain(&self, timeout: Duration) -> Result<SyncResponse, TransportErr> {
        let url = self.url("node/sync");
        let response = self
            .authorized(timeout, || self.client.post(&url))
            .await?;
        decode(response).await
    }
}

/// Sends under `timeout` and turns non-success statuses into errors.
async fn send(builder: RequestBuilder, timeout: Duration) -> Result<Response, TransportErr> {
    let response = builder.timeout(timeout).send().await?;
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.message,
        Err(_) => status.to_string(),
    };

    Err(TransportErr::Status(status, message))
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, TransportErr> {
    response
        .json::<T>()
        .await
        .map_err(|err| TransportErr::Decode(err.to_string()))
}

#[derive(Debug)]
pub enum TransportErr {
    /// Deadline elapsed before a response
    Timeout,

    /// Connection could not be established or was dropped
    Unreachable(String),

    /// Remote answered with a non-success status
    Status(StatusCode, String),

    /// Response body could not be decoded
    Decode(String),
}

impl TransportErr {
    /// Returns true if the remote node is busy with another block.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Status(StatusCode::CONFLICT, _))
    }

    /// Returns true if retrying the same request cannot succeed.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        match self {
            Self::Status(status, _) => {
                status.is_client_error()
                    && *status != StatusCode::REQUEST_TIMEOUT
                    && *status != StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

impl fmt::Display for TransportErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("request timed out"),
            Self::Unreachable(msg) => write!(f, "node unreachable: {msg}"),
            Self::Status(status, msg) => write!(f, "remote answered {status}: {msg}"),
            Self::Decode(msg) => write!(f, "malformed response: {msg}"),
        }
    }
}

impl From<reqwest::Error> for TransportErr {
    fn from(other: reqwest::Error) -> Self {
        if other.is_timeout() {
            Self::Timeout
        } else if other.is_decode() {
            Self::Decode(other.to_string())
        } else {
            Self::Unreachable(other.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NodeIdentity;
    use crate::node::http::routes;
    use crate::node::http::test_utils::*;
    use crate::node::Context;
    use crate::primitives::Role;
    use std::sync::Arc;

    fn serve(ctx: &Arc<Context>) -> String {
        let (addr, server) = warp::serve(routes(ctx.clone())).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        format!("http://{addr}")
    }

    async fn peer_store(address: crate::primitives::Address) -> MetaStore {
        let db = MetaStore::open_in_memory().unwrap();
        db.set_node_identity(NodeIdentity {
            address,
            role: Role::ArchivalPeer,
            username: "archive".to_owned(),
            certificate: None,
            coordinator_address: None,
        })
        .await
        .unwrap();
        db
    }

    fn certify_request() -> CertifyRequest {
        CertifyRequest {
            host: "127.0.0.1".to_owned(),
            port: 7001,
        }
    }

    #[tokio::test]
    async fn restarts_reuse_the_stored_token() {
        let (ctx, _) = coordinator().await;
        let (peer, _) = login_as(&ctx, Role::ArchivalPeer, "archive").await;
        let base = serve(&ctx);
        let db = peer_store(peer.address.clone()).await;

        // More restarts than the coordinator allows live tokens
        for run in 0..ctx.settings.auth.max_live_tokens + 2 {
            let client = CoordinatorClient::new(&base, "archive".to_owned(), PASSWORD.to_owned())
                .with_token_store(db.clone());
            assert_eq!(client.restore_session().await.unwrap(), run > 0);
            client
                .certify(&certify_request(), Duration::from_secs(5))
                .await
                .unwrap();
        }

        // The one issued by the fixture and the one the peer keeps
        assert_eq!(
            ctx.db.live_token_count(peer.address).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn rejected_stored_token_is_replaced() {
        let (ctx, _) = coordinator().await;
        let (peer, _) = login_as(&ctx, Role::ArchivalPeer, "archive").await;
        let base = serve(&ctx);
        let db = peer_store(peer.address).await;
        db.set_session_token(Some("revoked".to_owned())).await.unwrap();

        let client = CoordinatorClient::new(&base, "archive".to_owned(), PASSWORD.to_owned())
            .with_token_store(db.clone());
        assert!(client.restore_session().await.unwrap());
        client
            .certify(&certify_request(), Duration::from_secs(5))
            .await
            .unwrap();

        let stored = db.session_token().await.unwrap().unwrap();
        assert_ne!(stored, "revoked");
        assert_eq!(client.token(), Some(stored));
    }
}
