// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Node composition root. [`Node::bootstrap`] opens every store in
//! dependency order, brings the node to a consistent chain and hands out a
//! shared [`Context`]. [`Node::shutdown`] tears it down in reverse.

pub mod assembler;
pub mod builder;
pub mod http;
pub mod mempool;
pub mod scheduler;
pub mod transport;
pub mod wire;

use crate::chain::{ChainErr, ChainStore, DiskBackend};
use crate::consensus::{ConsensusEngine, ConsensusErr, PeerSealer};
use crate::crypto::{hash_password_async, CryptoErr, PasscodeTotp};
use crate::db::{new_entity, DbErr, EntityRow, MetaStore, NodeIdentity, TxMappingRow};
use crate::global::{exit_requested, EXIT_SIGNAL};
use crate::miner::{self, MinerErr};
use crate::node::assembler::Assembler;
use crate::node::http::{ApiErr, TokenKeys};
use crate::node::mempool::Mempool;
use crate::node::scheduler::Scheduler;
use crate::node::transport::{CoordinatorClient, CoordinatorLink, HttpPeerLink, TransportErr};
use crate::node::wire::{CertifyRequest, RegisterRequest};
use crate::primitives::{Address, Block, EntityRegistered, Hash256, NodeGenesis, Payload, Role, Transaction};
use crate::settings::{NodeRole, Settings};
use crate::store::{SealErr, SealedStore, Secrets, SecretsErr, CHAIN_FILE, DB_FILE};
use chrono::Utc;
use log::*;
use std::fmt;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Handles shared by every HTTP handler and scheduled task.
pub struct Context {
    pub settings: Settings,
    pub address: Address,
    pub keys: TokenKeys,

    /// Second factor for privileged admin actions
    pub passcode: PasscodeTotp,
    pub db: MetaStore,
    pub chain: Arc<ChainStore>,
    pub role: RoleContext,
}

/// The part of the context that depends on the node role.
pub enum RoleContext {
    Coordinator {
        assembler: Assembler,
        engine: Arc<ConsensusEngine>,
    },
    Peer {
        sealer: Arc<PeerSealer>,
        upstream: Arc<dyn CoordinatorLink>,
    },
}

impl Context {
    #[must_use]
    pub fn node_role(&self) -> NodeRole {
        match self.role {
            RoleContext::Coordinator { .. } => NodeRole::Coordinator,
            RoleContext::Peer { .. } => NodeRole::Peer,
        }
    }

    /// Writes are only accepted by the coordinator.
    pub fn assembler(&self) -> Result<&Assembler, ApiErr> {
        match &self.role {
            RoleContext::Coordinator { assembler, .. } => Ok(assembler),
            RoleContext::Peer { .. } => Err(ApiErr::unavailable(
                "this node is an archival peer, send writes to the coordinator",
            )),
        }
    }

    pub fn engine(&self) -> Result<&Arc<ConsensusEngine>, ApiErr> {
        match &self.role {
            RoleContext::Coordinator { engine, .. } => Ok(engine),
            RoleContext::Peer { .. } => Err(ApiErr::unavailable("this node does not run consensus")),
        }
    }

    pub fn sealer(&self) -> Result<&Arc<PeerSealer>, ApiErr> {
        match &self.role {
            RoleContext::Peer { sealer, .. } => Ok(sealer),
            RoleContext::Coordinator { .. } => Err(ApiErr::unavailable("this node does not seal blocks")),
        }
    }
}

pub struct Node {
    ctx: Arc<Context>,
    sealed: SealedStore,
}

impl Node {
    /// Opens the node in `settings.node.data_dir`.
    pub async fn bootstrap(settings: Settings) -> Result<Self, NodeErr> {
        let secrets = Secrets::load_or_generate(&settings.secrets_path(), settings.node.role)?;
        let sealed = SealedStore::open(Some(&secrets.auth_key), &settings.data_dir())?;
        let db = MetaStore::open(&sealed.path(DB_FILE))?;

        let intact = chain_intact(&sealed, &db).await?;

        if !intact && settings.node.role == NodeRole::Coordinator {
            error!("Chain file does not match its recorded signature");
            return Err(NodeErr::Integrity);
        }

        let chain_path = sealed.path(CHAIN_FILE);

        if !intact {
            warn!("Local chain does not match its recorded signature, resyncing from the coordinator");
            discard(&chain_path)?;
        }

        let chain = match ChainStore::open(
            Box::new(DiskBackend::new(&chain_path)),
            settings.consensus.difficulty,
        ) {
            Ok(chain) => chain,
            Err(err) if settings.node.role == NodeRole::Peer => {
                warn!("Local chain is unreadable ({}), resyncing from the coordinator", err);
                discard(&chain_path)?;
                ChainStore::open(
                    Box::new(DiskBackend::new(&chain_path)),
                    settings.consensus.difficulty,
                )?
            }
            Err(err) => return Err(err.into()),
        };
        let chain = Arc::new(chain);
        let keys = TokenKeys::from_secret(&secrets.secret_key);
        let passcode = secrets.passcode()?;

        let ctx = match settings.node.role {
            NodeRole::Coordinator => {
                bootstrap_coordinator(settings, keys, passcode, db, chain).await?
            }
            NodeRole::Peer => {
                bootstrap_peer(settings, keys, passcode, db, chain, !intact).await?
            }
        };

        info!(
            "Node {} ready as {} with {} blocks",
            ctx.address,
            ctx.node_role(),
            ctx.chain.length()
        );

        Ok(Self {
            ctx: Arc::new(ctx),
            sealed,
        })
    }

    #[must_use]
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Serves HTTP and runs the scheduler until an exit is requested or a
    /// scheduled task fails fatally.
    pub async fn run(&self) -> Result<(), NodeErr> {
        let addr = listen_addr(&self.ctx.settings)?;
        let (bound, server) = warp::serve(http::routes(self.ctx.clone()))
            .try_bind_with_graceful_shutdown(addr, check_exit_signal())
            .map_err(|err| NodeErr::Bind(err.to_string()))?;

        info!(
            "FolioBlocks v{} listening on http://{}",
            env!("CARGO_PKG_VERSION"),
            bound
        );

        let scheduler = Scheduler::new(self.ctx.clone());

        tokio::select!(
            _ = server => Ok(()),
            result = scheduler.run() => result,
        )
    }

    /// Closes the metadata database and re-seals the data directory.
    pub fn shutdown(self) -> Result<(), NodeErr> {
        let Self { ctx, sealed } = self;
        let db = ctx.db.clone();
        drop(ctx);

        if let Err(err) = db.close() {
            error!("Could not close metadata database: {}", err);
        }

        sealed.close()?;
        info!("Data directory sealed");
        Ok(())
    }
}

/// Resolves once the exit flag is raised.
pub async fn check_exit_signal() {
    while !exit_requested() {
        sleep(Duration::from_millis(100)).await;
    }

    info!(
        "FolioBlocks v{} shutting down...",
        env!("CARGO_PKG_VERSION")
    );
}

fn listen_addr(settings: &Settings) -> Result<SocketAddr, NodeErr> {
    let ip: IpAddr = settings
        .network
        .host
        .parse()
        .map_err(|_| NodeErr::Bind(format!("invalid listen host {}", settings.network.host)))?;
    Ok(SocketAddr::new(ip, settings.network.port))
}

/// Compares the chain file against the digest recorded at the last write.
async fn chain_intact(sealed: &SealedStore, db: &MetaStore) -> Result<bool, NodeErr> {
    let actual = sealed.plaintext_digest(CHAIN_FILE)?;
    let recorded = db.get_file_signature(CHAIN_FILE).await?;

    match (actual, recorded) {
        (None, None) => Ok(true),
        (Some(actual), Some(recorded)) => Ok(actual == recorded),
        (actual, recorded) => {
            debug!(
                "Chain file present: {}, signature present: {}",
                actual.is_some(),
                recorded.is_some()
            );
            Ok(false)
        }
    }
}

fn discard(path: &std::path::Path) -> Result<(), NodeErr> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(NodeErr::Seal(SealErr::Io(err))),
    }
}

/// Index rows of every transaction in `block`.
fn mapping_rows(block: &Block) -> Vec<TxMappingRow> {
    block
        .transactions
        .iter()
        .map(|tx| TxMappingRow {
            tx_hash: tx.tx_hash,
            address_ref: tx.from_address.clone(),
            content_type: tx.action,
            block_id: Some(block.id),
            timestamp: tx.timestamp,
        })
        .collect()
}

/// Records `digest` as the chain signature and indexes `blocks`.
async fn record_chain(db: &MetaStore, digest: Hash256, blocks: &[Arc<Block>]) -> Result<(), NodeErr> {
    db.set_file_signature(CHAIN_FILE, digest, Utc::now()).await?;

    for block in blocks {
        db.index_block(block.id, mapping_rows(block)).await?;
    }

    Ok(())
}

/// Finds or creates the entity this node runs as.
async fn own_entity(settings: &Settings, db: &MetaStore, role: Role) -> Result<EntityRow, NodeErr> {
    if let Some(identity) = db.node_identity().await? {
        if let Some(row) = db.get_entity(identity.address).await? {
            return Ok(row);
        }
    }

    if let Some(row) = db.get_entity_by_username(settings.node.username.clone()).await? {
        if row.role == role {
            return Ok(row);
        }

        return Err(NodeErr::Config(format!(
            "username {} belongs to a {} entity",
            row.username, row.role
        )));
    }

    let row = new_entity(
        role,
        settings.node.username.clone(),
        settings.node.email.clone(),
        hash_password_async(settings.node.password.clone()).await?,
        None,
        Utc::now(),
    );
    db.insert_entity(row.clone()).await?;
    info!("Created {} entity {} ({})", role, row.username, row.address);
    Ok(row)
}

async fn bootstrap_coordinator(
    settings: Settings,
    keys: TokenKeys,
    passcode: PasscodeTotp,
    db: MetaStore,
    chain: Arc<ChainStore>,
) -> Result<Context, NodeErr> {
    let me = own_entity(&settings, &db, Role::Coordinator).await?;

    db.set_node_identity(NodeIdentity {
        address: me.address.clone(),
        role: Role::Coordinator,
        username: me.username.clone(),
        certificate: None,
        coordinator_address: None,
    })
    .await?;

    if chain.length() == 0 {
        create_genesis(&me, &db, &chain).await?;
    }

    let mempool = Arc::new(Mempool::new(
        settings.consensus.queue_capacity,
        settings.consensus.soft_threshold,
    ));
    let assembler = Assembler::new(db.clone(), mempool);
    let engine = Arc::new(ConsensusEngine::new(
        me.address.clone(),
        db.clone(),
        chain.clone(),
        assembler.clone(),
        Arc::new(HttpPeerLink::new()),
        &settings.consensus,
    ));
    engine.resume().await?;

    Ok(Context {
        settings,
        address: me.address,
        keys,
        passcode,
        db,
        chain,
        role: RoleContext::Coordinator { assembler, engine },
    })
}

/// Seals the first block locally.
async fn create_genesis(me: &EntityRow, db: &MetaStore, chain: &Arc<ChainStore>) -> Result<(), NodeErr> {
    let now = Utc::now();
    let genesis = Payload::NodeGenesis(NodeGenesis {
        block_genesis_no: 0,
        generator_address: me.address.clone(),
    });
    let registered = Payload::EntityRegistered(EntityRegistered {
        address: me.address.clone(),
        username: me.username.clone(),
        role: me.role,
        association: None,
        registered: me.registered_at,
    });
    let txs = vec![
        Transaction::from_payload(&genesis, me.address.clone(), None, now)?,
        Transaction::from_payload(&registered, me.address.clone(), Some(me.address.clone()), now)?,
    ];

    info!("Sealing genesis block");
    let block = miner::seal_block(
        Block::genesis(now, txs),
        me.address.clone(),
        chain.difficulty(),
        EXIT_SIGNAL.clone(),
    )
    .await?;

    let digest = chain.append_async(block).await?;
    let snapshot = chain.snapshot();
    record_chain(db, digest, snapshot.blocks()).await?;

    if let Some(tip) = snapshot.tip() {
        info!("Genesis block sealed: {}", tip.hash.unwrap_or_else(Hash256::zero));
    }

    Ok(())
}

async fn bootstrap_peer(
    settings: Settings,
    keys: TokenKeys,
    passcode: PasscodeTotp,
    db: MetaStore,
    chain: Arc<ChainStore>,
    must_resync: bool,
) -> Result<Context, NodeErr> {
    let client = Arc::new(
        CoordinatorClient::new(
            &settings.network.coordinator_url,
            settings.node.username.clone(),
            settings.node.password.clone(),
        )
        .with_token_store(db.clone()),
    );
    let timeout = settings.consensus.delivery_timeout();

    let mut identity = match db.node_identity().await? {
        Some(identity) => {
            if client.restore_session().await? {
                debug!("Reusing the stored coordinator session");
            }
            identity
        }
        None => join(&settings, &db, &client, timeout).await?,
    };

    let sealer = Arc::new(PeerSealer::new(
        identity.address.clone(),
        db.clone(),
        client.clone(),
        &settings.consensus,
    ));

    let request = CertifyRequest {
        host: settings
            .network
            .public_host
            .clone()
            .unwrap_or_else(|| settings.network.host.clone()),
        port: settings.network.port,
    };

    match client.certify(&request, timeout).await {
        Ok(certified) => {
            identity.certificate = Some(certified.certificate);
            identity.coordinator_address = Some(certified.coordinator_address);
            db.set_node_identity(identity.clone()).await?;
            info!("Certified by coordinator {}", certified.chain_hash);
        }
        Err(err) if identity.certificate.is_some() => {
            warn!("Could not renew certificate, keeping the stored one: {}", err);
        }
        Err(err) => return Err(err.into()),
    }

    if let Some(certificate) = identity.certificate.clone() {
        sealer.set_certificate(certificate);
    }

    let upstream: Arc<dyn CoordinatorLink> = client;
    let stale = match chain.chain_hash() {
        Some(hash) if !must_resync => matches!(
            upstream.verify_chain_hash(hash, timeout).await,
            Ok(false)
        ),
        _ => true,
    };

    if stale {
        if let Err(err) =
            resync(&db, &chain, upstream.as_ref(), settings.consensus.seal_timeout()).await
        {
            if chain.length() == 0 {
                return Err(err);
            }

            warn!("Initial sync failed, retrying on the next liveness check: {}", err);
        }
    }

    sealer.resume().await?;

    Ok(Context {
        settings,
        address: identity.address,
        keys,
        passcode,
        db,
        chain,
        role: RoleContext::Peer { sealer, upstream },
    })
}

/// Registers this peer with the coordinator and records the identity.
async fn join(
    settings: &Settings,
    db: &MetaStore,
    client: &CoordinatorClient,
    timeout: Duration,
) -> Result<NodeIdentity, NodeErr> {
    let auth_code = settings
        .node
        .auth_code
        .clone()
        .ok_or_else(|| NodeErr::Config("node.auth_code is required to join a coordinator".to_owned()))?;

    let registered = client
        .register(
            &RegisterRequest {
                username: settings.node.username.clone(),
                password: settings.node.password.clone(),
                email: settings.node.email.clone(),
                auth_code,
                role: Role::ArchivalPeer,
                first_name: None,
                last_name: None,
                association_name: None,
            },
            timeout,
        )
        .await?;

    info!("Registered with the coordinator as {}", registered.address);

    let mut row = new_entity(
        Role::ArchivalPeer,
        registered.username.clone(),
        settings.node.email.clone(),
        hash_password_async(settings.node.password.clone()).await?,
        None,
        registered.registered,
    );
    row.address = registered.address.clone();
    db.insert_entity(row).await?;

    let identity = NodeIdentity {
        address: registered.address,
        role: Role::ArchivalPeer,
        username: registered.username,
        certificate: None,
        coordinator_address: None,
    };
    db.set_node_identity(identity.clone()).await?;
    client.login(timeout).await?;
    Ok(identity)
}

/// Replaces the local chain with the coordinator's.
pub async fn resync(
    db: &MetaStore,
    chain: &Arc<ChainStore>,
    upstream: &dyn CoordinatorLink,
    timeout: Duration,
) -> Result<Hash256, NodeErr> {
    let pulled = upstream.pull_chain(timeout).await?;
    let count = pulled.blocks.len();
    let digest = chain.replace_async(pulled.blocks).await?;

    if digest != pulled.chain_hash {
        warn!(
            "Pulled chain hash {} differs from the advertised {}",
            digest, pulled.chain_hash
        );
    }

    record_chain(db, digest, chain.snapshot().blocks()).await?;
    info!("Synced {} blocks from the coordinator", count);
    Ok(digest)
}

#[derive(Debug)]
pub enum NodeErr {
    /// Settings are invalid or incomplete
    Config(String),

    /// Secrets file could not be read or written
    Secrets(SecretsErr),

    /// Data directory could not be unsealed or sealed
    Seal(SealErr),

    /// Chain file does not match its recorded signature
    Integrity,

    /// Metadata database error
    Db(DbErr),

    /// Chain store error
    Chain(ChainErr),

    /// Genesis could not be sealed
    Miner(MinerErr),

    /// Transaction could not be created
    Crypto(CryptoErr),

    /// Coordinator could not be reached during bootstrap
    Upstream(TransportErr),

    /// Consensus failed in a way the node cannot recover from
    Consensus(ConsensusErr),

    /// HTTP listener could not be bound
    Bind(String),
}

impl NodeErr {
    /// Process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Secrets(_) | Self::Bind(_) | Self::Upstream(_) => 1,
            Self::Seal(_) | Self::Integrity | Self::Db(_) | Self::Chain(_) => 2,
            Self::Miner(_) | Self::Crypto(_) | Self::Consensus(_) => 3,
        }
    }
}

impl fmt::Display for NodeErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Secrets(err) => write!(f, "secrets: {err}"),
            Self::Seal(err) => write!(f, "sealed store: {err}"),
            Self::Integrity => f.write_str("chain file failed its integrity check"),
            Self::Db(err) => write!(f, "metadata database: {err}"),
            Self::Chain(err) => write!(f, "chain: {err}"),
            Self::Miner(err) => write!(f, "genesis: {err}"),
            Self::Crypto(err) => write!(f, "crypto: {err}"),
            Self::Upstream(err) => write!(f, "coordinator: {err}"),
            Self::Consensus(err) => write!(f, "consensus: {err}"),
            Self::Bind(msg) => write!(f, "http listener: {msg}"),
        }
    }
}

impl std::error::Error for NodeErr {}

impl From<SecretsErr> for NodeErr {
    fn from(other: SecretsErr) -> Self {
        Self::Secrets(other)
    }
}

impl From<SealErr> for NodeErr {
    fn from(other: SealErr) -> Self {
        Self::Seal(other)
    }
}

impl From<DbErr> for NodeErr {
    fn from(other: DbErr) -> Self {
        Self::Db(other)
    }
}

impl From<ChainErr> for NodeErr {
    fn from(other: ChainErr) -> Self {
        Self::Chain(other)
    }
}

impl From<MinerErr> for NodeErr {
    fn from(other: MinerErr) -> Self {
        Self::Miner(other)
    }
}

impl From<CryptoErr> for NodeErr {
    fn from(other: CryptoErr) -> Self {
        Self::Crypto(other)
    }
}

impl From<TransportErr> for NodeErr {
    fn from(other: TransportErr) -> Self {
        Self::Upstream(other)
    }
}

impl From<ConsensusErr> for NodeErr {
    fn from(other: ConsensusErr) -> Self {
        Self::Consensus(other)
    }
}
