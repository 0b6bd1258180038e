// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::chain::ChainStore;
use crate::consensus::negotiation::{can_transition, new_negotiation_id};
use crate::consensus::selection::PeerTable;
use crate::consensus::ConsensusErr;
use crate::db::{AssociatedNodeRow, DbErr, MetaStore, NegotiationRow, TxMappingRow};
use crate::node::assembler::Assembler;
use crate::node::builder::BlockBuilder;
use crate::node::mempool::{Mempool, QueuedTx};
use crate::node::transport::PeerLink;
use crate::node::wire::{OpenRequest, ProgressStatus, SealRequest};
use crate::primitives::{
    Address, Block, Hash256, NegotiationState, NodeConsensusProof, NodeStatus, Payload,
};
use crate::settings::{Consensus, MAX_TIMER_SECS};
use crate::store::CHAIN_FILE;
use chrono::{DateTime, Utc};
use log::*;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An unsealed block waiting for a peer, with its transactions as they
/// were queued.
#[derive(Debug, Clone)]
struct PendingBlock {
    block: Block,
    txs: Vec<QueuedTx>,

    /// Failed rounds of this block so far
    failures: u32,
}

#[derive(Debug, Clone)]
struct ActiveRound {
    negotiation_id: String,
    peer: Address,
    state: NegotiationState,
    deadline: DateTime<Utc>,
    pending: PendingBlock,
}

#[derive(Debug)]
enum Round {
    Idle,
    Active(ActiveRound),

    /// A failed block waiting to be re-dispatched
    Retry(PendingBlock),
}

/// Public view of the current round.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoundInfo {
    pub negotiation_id: String,
    pub peer: Address,
    pub block_id: u64,
    pub state: NegotiationState,
    pub deadline: DateTime<Utc>,
    pub attempt: u32,
}

/// Coordinator side of the sealing protocol.
pub struct ConsensusEngine {
    address: Address,
    db: MetaStore,
    chain: Arc<ChainStore>,
    assembler: Assembler,
    builder: BlockBuilder,
    link: Arc<dyn PeerLink>,
    settings: Consensus,

    /// Singleton round. Held across the whole open/verify sequence
    round: tokio::sync::Mutex<Round>,
    peers: Mutex<PeerTable>,
    faults: AtomicU64,

    /// Appended block whose signature and index rows are not stored yet
    unrecorded: Mutex<Option<ChainRecord>>,
}

/// Metadata that has to follow a block onto the chain.
struct ChainRecord {
    block_id: u64,
    digest: Hash256,
    rows: Vec<TxMappingRow>,
}

impl ConsensusEngine {
    #[must_use]
    pub fn new(
        address: Address,
        db: MetaStore,
        chain: Arc<ChainStore>,
        assembler: Assembler,
        link: Arc<dyn PeerLink>,
        settings: &Consensus,
    ) -> Self {
        Self {
            address,
            db,
            chain,
            assembler,
            builder: BlockBuilder::from_settings(settings),
            link,
            settings: settings.clone(),
            round: tokio::sync::Mutex::new(Round::Idle),
            peers: Mutex::new(PeerTable::new(
                settings.backoff_base_secs,
                settings.backoff_cap_secs,
            )),
            faults: AtomicU64::new(0),
            unrecorded: Mutex::new(None),
        }
    }

    fn mempool(&self) -> &Mempool {
        self.assembler.mempool()
    }

    /// Blocks dropped after exhausting their retries.
    #[must_use]
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub async fn round_info(&self) -> Option<RoundInfo> {
        match &*self.round.lock().await {
            Round::Active(active) => Some(RoundInfo {
                negotiation_id: active.negotiation_id.clone(),
                peer: active.peer.clone(),
                block_id: active.pending.block.id,
                state: active.state,
                deadline: active.deadline,
                attempt: active.pending.failures + 1,
            }),
            _ => None,
        }
    }

    /// Recovers rounds left open by a previous run. Every non-terminal
    /// negotiation is failed; a block that still extends the tip is queued
    /// for re-dispatch, the rest give their transactions back.
    pub async fn resume(&self) -> Result<(), ConsensusErr> {
        let stale = self.db.fail_active_negotiations(Utc::now()).await?;

        if stale.is_empty() {
            return Ok(());
        }

        let snapshot = self.chain.snapshot();
        let mut round = self.round.lock().await;

        for row in stale {
            warn!(
                "Negotiation {} for block {} was interrupted in state {}, marked failed",
                row.id, row.block_id, row.state
            );

            let block: Block = serde_json::from_str(&row.block)?;
            let extends_tip = snapshot
                .tip()
                .map_or(false, |tip| tip.id + 1 == block.id && tip.hash == Some(block.prev_hash));
            let txs: Vec<_> = block
                .transactions
                .iter()
                .filter(|tx| !snapshot.contains_transaction(&tx.tx_hash))
                .filter(|tx| !self.mempool().contains(&tx.tx_hash))
                .cloned()
                .collect();

            if extends_tip && matches!(*round, Round::Idle) && txs.len() == block.transactions.len() {
                info!("Block {} will be re-dispatched", block.id);
                *round = Round::Retry(PendingBlock {
                    txs: self.mempool().stamp(txs),
                    block,
                    failures: 0,
                });
            } else {
                self.mempool().requeue_front(self.mempool().stamp(txs));
            }
        }

        Ok(())
    }

    /// One consensus tick: times out a stale round, re-dispatches a failed
    /// block, or opens a round when the builder says so.
    pub async fn tick(&self, tick_elapsed: bool) -> Result<(), ConsensusErr> {
        self.flush_unrecorded().await?;
        let mut round = self.round.lock().await;

        match std::mem::replace(&mut *round, Round::Idle) {
            Round::Active(active) => {
                if Utc::now() <= active.deadline {
                    *round = Round::Active(active);
                    return Ok(());
                }

                warn!(
                    "Negotiation {} with {} timed out in state {}",
                    active.negotiation_id, active.peer, active.state
                );
                self.fail_round(&active.negotiation_id, active.state, &active.peer)
                    .await;
                let mut pending = active.pending;
                pending.failures += 1;
                self.dispatch(&mut round, pending).await
            }
            Round::Retry(pending) => self.dispatch(&mut round, pending).await,
            Round::Idle => {
                if !self.builder.should_emit(self.mempool(), tick_elapsed) {
                    return Ok(());
                }

                let Some(tip) = self.chain.tip() else {
                    return Ok(());
                };

                let Some((block, txs)) = self.builder.build(self.mempool(), &tip, Utc::now())?
                else {
                    return Ok(());
                };

                debug!(
                    "Built block {} with {} transactions",
                    block.id,
                    block.transactions.len()
                );
                let pending = PendingBlock {
                    block,
                    txs,
                    failures: 0,
                };
                self.dispatch(&mut round, pending).await
            }
        }
    }

    /// Hands `pending` to the next eligible peer. On return the round is
    /// either active or idle; transactions are never lost.
    async fn dispatch(&self, round: &mut Round, mut pending: PendingBlock) -> Result<(), ConsensusErr> {
        match self.deliver(&mut pending).await {
            Ok(Some((negotiation_id, peer, deadline))) => {
                *round = Round::Active(ActiveRound {
                    negotiation_id,
                    peer,
                    state: NegotiationState::Delivered,
                    deadline,
                    pending,
                });
                Ok(())
            }
            Ok(None) if pending.failures >= self.settings.max_failures => {
                let faults = self.faults.fetch_add(1, Ordering::Relaxed) + 1;
                error!(
                    "Dropping block {} after {} failed rounds, {} transactions returned to the queue (fault #{})",
                    pending.block.id,
                    pending.failures,
                    pending.txs.len(),
                    faults
                );
                self.mempool().requeue_front(pending.txs);
                Ok(())
            }
            Ok(None) => {
                debug!(
                    "No eligible peer for block {}, transactions returned to the queue",
                    pending.block.id
                );
                self.mempool().requeue_front(pending.txs);
                Ok(())
            }
            Err(err) => {
                self.mempool().requeue_front(pending.txs);
                Err(err)
            }
        }
    }

    /// Opens negotiations until a peer accepts the block, the failure
    /// budget is spent, or no peer is eligible.
    async fn deliver(
        &self,
        pending: &mut PendingBlock,
    ) -> Result<Option<(String, Address, DateTime<Utc>)>, ConsensusErr> {
        let encoded = serde_json::to_string(&pending.block)?;

        while pending.failures < self.settings.max_failures {
            let peers = self.db.associated_nodes().await?;
            let selected = self
                .peers
                .lock()
                .select(&peers, pending.block.id, Instant::now())
                .cloned();

            let Some(peer) = selected else {
                return Ok(None);
            };

            let id = new_negotiation_id();
            let now = Utc::now();
            let delivery = chrono_duration(self.settings.delivery_timeout());
            let sealing = chrono_duration(self.settings.seal_timeout());

            self.db
                .insert_negotiation(NegotiationRow {
                    id: id.clone(),
                    coordinator: self.address.clone(),
                    peer: peer.address.clone(),
                    block_id: pending.block.id,
                    state: NegotiationState::Opened,
                    opened_at: now,
                    deadline: now + delivery,
                    updated_at: now,
                    attempt: pending.failures + 1,
                    block: encoded.clone(),
                })
                .await?;
            self.peers.lock().mark_outstanding(&peer.address);

            let request = OpenRequest {
                negotiation_id: id.clone(),
                coordinator_address: self.address.clone(),
                block: pending.block.clone(),
                deadline: now + delivery + sealing,
            };

            match self
                .link
                .open(&peer, &request, self.settings.delivery_timeout())
                .await
            {
                Ok(()) => {
                    let now = Utc::now();
                    let deadline = now + sealing;
                    self.db
                        .transition_negotiation(
                            id.clone(),
                            NegotiationState::Opened,
                            NegotiationState::Delivered,
                            Some(deadline),
                            now,
                        )
                        .await?;
                    self.set_status(&peer, NodeStatus::Mining).await;
                    info!(
                        "Block {} delivered to {} (negotiation {}, attempt {})",
                        pending.block.id,
                        peer.address,
                        id,
                        pending.failures + 1
                    );
                    return Ok(Some((id, peer.address, deadline)));
                }
                Err(err) => {
                    warn!(
                        "Delivering block {} to {} failed: {}",
                        pending.block.id, peer.address, err
                    );
                    self.fail_round(&id, NegotiationState::Opened, &peer.address)
                        .await;
                    pending.failures += 1;
                }
            }
        }

        Ok(None)
    }

    /// Marks a negotiation failed and backs the peer off. Store errors are
    /// logged, the round moves on regardless.
    async fn fail_round(&self, id: &str, from: NegotiationState, peer: &Address) {
        if can_transition(from, NegotiationState::Failed) {
            if let Err(err) = self
                .db
                .transition_negotiation(
                    id.to_owned(),
                    from,
                    NegotiationState::Failed,
                    None,
                    Utc::now(),
                )
                .await
            {
                warn!("Could not mark negotiation {} failed: {}", id, err);
            }
        }

        let backoff = {
            let mut peers = self.peers.lock();
            peers.release(peer);
            peers.penalize(peer, Instant::now())
        };

        if let Err(err) = self
            .db
            .set_node_status(peer.clone(), NodeStatus::Available, None)
            .await
        {
            debug!("Could not reset status of {}: {}", peer, err);
        }

        info!("Peer {} backing off for {:?}", peer, backoff);
    }

    /// Handles a sealed block posted by `peer`. Returns the block hash once
    /// finalized.
    pub async fn on_sealed(
        self: &Arc<Self>,
        peer: &Address,
        request: SealRequest,
    ) -> Result<Hash256, ConsensusErr> {
        let mut round = self.round.lock().await;

        let active = match std::mem::replace(&mut *round, Round::Idle) {
            Round::Active(active)
                if active.negotiation_id == request.negotiation_id && &active.peer == peer =>
            {
                active
            }
            other => {
                *round = other;
                return Err(self.stale(&request.negotiation_id, peer).await);
            }
        };

        let now = Utc::now();
        if let Err(err) = self
            .db
            .transition_negotiation(
                active.negotiation_id.clone(),
                NegotiationState::Delivered,
                NegotiationState::Sealed,
                None,
                now,
            )
            .await
        {
            *round = Round::Active(active);
            return Err(err.into());
        }

        let sealed = request.block;

        if let Err(err) = self.verify_sealed(&active, &sealed) {
            warn!(
                "Rejected seal of block {} from {}: {}",
                sealed.id, peer, err
            );
            self.fail_round(&active.negotiation_id, NegotiationState::Sealed, peer)
                .await;
            let mut pending = active.pending;
            pending.failures += 1;
            *round = Round::Retry(pending);
            drop(round);
            self.kick();
            return Err(err);
        }

        match self.finalize(&active, sealed).await {
            Ok(hash) => Ok(hash),
            Err(err) => {
                error!(
                    "Could not finalize block {}: {}",
                    active.pending.block.id, err
                );
                self.fail_round(&active.negotiation_id, NegotiationState::Sealed, peer)
                    .await;
                self.mempool().requeue_front(active.pending.txs);
                Err(err)
            }
        }
    }

    /// Progress report from the sealing peer.
    pub async fn on_progress(
        self: &Arc<Self>,
        peer: &Address,
        negotiation_id: &str,
        status: ProgressStatus,
    ) -> Result<(), ConsensusErr> {
        let mut round = self.round.lock().await;

        let active = match std::mem::replace(&mut *round, Round::Idle) {
            Round::Active(active)
                if active.negotiation_id == negotiation_id && &active.peer == peer =>
            {
                active
            }
            other => {
                *round = other;
                return Err(self.stale(negotiation_id, peer).await);
            }
        };

        match status {
            ProgressStatus::Hashing => {
                let touched = self
                    .db
                    .touch_negotiation(negotiation_id.to_owned(), Utc::now())
                    .await;
                *round = Round::Active(active);
                touched?;
                Ok(())
            }
            ProgressStatus::Abandoned => {
                warn!("Peer {} abandoned negotiation {}", peer, negotiation_id);
                self.fail_round(negotiation_id, active.state, peer).await;
                let mut pending = active.pending;
                pending.failures += 1;
                *round = Round::Retry(pending);
                drop(round);
                self.kick();
                Ok(())
            }
        }
    }

    /// Error for a message that does not belong to the active round.
    async fn stale(&self, id: &str, peer: &Address) -> ConsensusErr {
        match self.db.get_negotiation(id.to_owned()).await {
            Ok(Some(row)) if &row.peer != peer => ConsensusErr::NotAssigned,
            Ok(Some(row)) => ConsensusErr::Stale {
                id: row.id,
                state: row.state,
            },
            Ok(None) => ConsensusErr::UnknownNegotiation(id.to_owned()),
            Err(err) => err.into(),
        }
    }

    /// Schedules an immediate tick to re-dispatch a failed block.
    fn kick(self: &Arc<Self>) {
        let engine = self.clone();

        tokio::spawn(async move {
            if let Err(err) = engine.tick(false).await {
                error!("Re-dispatch failed: {}", err);
            }
        });
    }

    fn verify_sealed(&self, active: &ActiveRound, sealed: &Block) -> Result<(), ConsensusErr> {
        if !active.pending.block.same_content(sealed) {
            return Err(ConsensusErr::ContentMismatch);
        }

        sealed
            .verify_seal(self.chain.difficulty())
            .map_err(ConsensusErr::InvalidSeal)?;

        if sealed.validator.as_ref() != Some(&active.peer) {
            return Err(ConsensusErr::WrongValidator);
        }

        Ok(())
    }

    async fn finalize(&self, active: &ActiveRound, sealed: Block) -> Result<Hash256, ConsensusErr> {
        let block_id = sealed.id;
        let block_hash = sealed.hash.ok_or(ConsensusErr::MalformedBlock)?;
        let rows: Vec<TxMappingRow> = sealed
            .transactions
            .iter()
            .map(|tx| TxMappingRow {
                tx_hash: tx.tx_hash,
                address_ref: tx.from_address.clone(),
                content_type: tx.action,
                block_id: Some(block_id),
                timestamp: tx.timestamp,
            })
            .collect();
        let tx_count = rows.len();

        let digest = self.chain.append_async(sealed).await?;
        let now = Utc::now();

        // The block is on the chain from here on. A record that cannot be
        // written is kept and retried by the next tick.
        let record = ChainRecord {
            block_id,
            digest,
            rows,
        };

        if let Err(err) = self.record(&record).await {
            error!(
                "Block {} is on the chain but could not be recorded: {}",
                block_id, err
            );
            *self.unrecorded.lock() = Some(record);
        }

        if let Err(err) = self
            .db
            .transition_negotiation(
                active.negotiation_id.clone(),
                NegotiationState::Sealed,
                NegotiationState::Finalized,
                None,
                now,
            )
            .await
        {
            error!(
                "Could not finalize negotiation {}: {}",
                active.negotiation_id, err
            );
        }

        {
            let mut peers = self.peers.lock();
            peers.release(&active.peer);
            peers.reset(&active.peer);
        }

        if let Err(err) = self
            .db
            .set_node_status(active.peer.clone(), NodeStatus::Available, Some(now))
            .await
        {
            debug!("Could not update status of {}: {}", active.peer, err);
        }

        let proof = Payload::NodeConsensusProof(NodeConsensusProof {
            negotiation_id: active.negotiation_id.clone(),
            miner_address: active.peer.clone(),
            coordinator_address: self.address.clone(),
            block_id,
            block_hash,
        });

        if let Err(err) = self
            .assembler
            .submit_internal(proof, &self.address, Some(active.peer.clone()))
            .await
        {
            warn!("Could not queue consensus proof for block {}: {}", block_id, err);
        }

        info!(
            "Finalized block {} ({} transactions) sealed by {}",
            block_id, tx_count, active.peer
        );
        Ok(block_hash)
    }

    async fn record(&self, record: &ChainRecord) -> Result<(), DbErr> {
        self.db
            .set_file_signature(CHAIN_FILE, record.digest, Utc::now())
            .await?;
        self.db
            .index_block(record.block_id, record.rows.clone())
            .await
    }

    /// Retries a chain record left behind by [`ConsensusEngine::finalize`].
    /// Fails with a fatal error if it still cannot be written.
    async fn flush_unrecorded(&self) -> Result<(), ConsensusErr> {
        let Some(record) = self.unrecorded.lock().take() else {
            return Ok(());
        };

        match self.record(&record).await {
            Ok(()) => {
                info!("Recorded block {} after a retry", record.block_id);
                Ok(())
            }
            Err(err) => {
                let block_id = record.block_id;
                *self.unrecorded.lock() = Some(record);
                Err(ConsensusErr::Unrecorded { block_id, err })
            }
        }
    }

    /// Probes every associated peer and records its status. Peers holding
    /// a block are left alone.
    pub async fn probe_peers(&self, timeout: Duration) -> Result<(), ConsensusErr> {
        let peers = self.db.associated_nodes().await?;
        let sealing = self.round_info().await.map(|round| round.peer);

        for peer in peers {
            // Only the peer holding the active round keeps its Mining status
            if peer.status == NodeStatus::Mining && sealing.as_ref() == Some(&peer.address) {
                continue;
            }

            let status = match self.link.probe(&peer, timeout).await {
                Ok(()) => NodeStatus::Available,
                Err(err) => {
                    debug!("Peer {} did not answer the probe: {}", peer.address, err);
                    NodeStatus::Unreachable
                }
            };

            if status != peer.status {
                info!("Peer {} is now {}", peer.address, status);
            }

            let seen = (status == NodeStatus::Available).then(Utc::now);
            self.db.set_node_status(peer.address, status, seen).await?;
        }

        Ok(())
    }

    async fn set_status(&self, peer: &AssociatedNodeRow, status: NodeStatus) {
        if let Err(err) = self
            .db
            .set_node_status(peer.address.clone(), status, Some(Utc::now()))
            .await
        {
            debug!("Could not update status of {}: {}", peer.address, err);
        }
    }
}

/// Timers are bounded by `MAX_TIMER_SECS` once settings validate, larger
/// values saturate there.
fn chrono_duration(duration: Duration) -> chrono::Duration {
    let secs = duration.as_secs().min(MAX_TIMER_SECS);
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryBackend;
    use crate::db::test_utils::entity;
    use crate::miner;
    use crate::node::transport::TransportErr;
    use crate::primitives::test_utils::*;
    use crate::primitives::{Action, Role};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;

    /// Records deliveries. Peers listed in `down` refuse them.
    #[derive(Default)]
    struct MockLink {
        opened: Mutex<Vec<(Address, OpenRequest)>>,
        down: Mutex<HashSet<Address>>,
    }

    #[async_trait]
    impl PeerLink for MockLink {
        async fn open(
            &self,
            peer: &AssociatedNodeRow,
            request: &OpenRequest,
            _timeout: Duration,
        ) -> Result<(), TransportErr> {
            if self.down.lock().contains(&peer.address) {
                return Err(TransportErr::Timeout);
            }

            self.opened
                .lock()
                .push((peer.address.clone(), request.clone()));
            Ok(())
        }

        async fn probe(
            &self,
            peer: &AssociatedNodeRow,
            _timeout: Duration,
        ) -> Result<(), TransportErr> {
            if self.down.lock().contains(&peer.address) {
                return Err(TransportErr::Unreachable("down".to_owned()));
            }
            Ok(())
        }
    }

    struct Harness {
        engine: Arc<ConsensusEngine>,
        link: Arc<MockLink>,
        db: MetaStore,
        chain: Arc<ChainStore>,
        peers: Vec<Address>,
    }

    async fn harness(peer_count: usize) -> Harness {
        let db = MetaStore::open_in_memory().unwrap();
        let coordinator = entity(Role::Coordinator, "coordinator");
        db.insert_entity(coordinator.clone()).await.unwrap();

        let mut peers = vec![];
        for i in 0..peer_count {
            let peer = entity(Role::ArchivalPeer, &format!("peer{i}"));
            db.insert_entity(peer.clone()).await.unwrap();
            db.upsert_associated_node(AssociatedNodeRow {
                address: peer.address.clone(),
                host: "127.0.0.1".to_owned(),
                port: 7000 + i as u16,
                certificate: "cert".to_owned(),
                status: NodeStatus::Available,
                last_seen: None,
                registered_at: Utc::now(),
            })
            .await
            .unwrap();
            peers.push(peer.address);
        }
        peers.sort();

        let chain = Arc::new(ChainStore::open(Box::new(MemoryBackend::new()), 1).unwrap());
        chain.append(sealed_genesis()).unwrap();

        let mempool = Arc::new(Mempool::new(64, 2));
        let assembler = Assembler::new(db.clone(), mempool);
        let link = Arc::new(MockLink::default());
        let settings = Consensus {
            soft_threshold: 2,
            ..Consensus::default()
        };
        let engine = Arc::new(ConsensusEngine::new(
            coordinator.address,
            db.clone(),
            chain.clone(),
            assembler,
            link.clone(),
            &settings,
        ));

        Harness {
            engine,
            link,
            db,
            chain,
            peers,
        }
    }

    fn queue(h: &Harness, n: usize) {
        for i in 0..n {
            h.engine.mempool().push(test_tx(&format!("tx{i}"))).unwrap();
        }
    }

    async fn seal(request: &OpenRequest, peer: &Address) -> Block {
        miner::seal_block(
            request.block.clone(),
            peer.clone(),
            1,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn empty_queue_opens_nothing() {
        let h = harness(2).await;
        h.engine.tick(true).await.unwrap();
        assert!(h.link.opened.lock().is_empty());
        assert!(h.engine.round_info().await.is_none());
    }

    #[tokio::test]
    async fn one_round_finalizes() {
        let h = harness(2).await;
        queue(&h, 2);
        h.engine.tick(false).await.unwrap();

        let (peer, request) = h.link.opened.lock()[0].clone();
        // Block 1 goes to the second peer in address order
        assert_eq!(peer, h.peers[1]);
        assert_eq!(request.block.id, 1);

        let info = h.engine.round_info().await.unwrap();
        assert_eq!(info.state, NegotiationState::Delivered);

        let sealed = seal(&request, &peer).await;
        let hash = h
            .engine
            .on_sealed(
                &peer,
                SealRequest {
                    negotiation_id: request.negotiation_id.clone(),
                    block: sealed.clone(),
                },
            )
            .await
            .unwrap();

        assert_eq!(Some(hash), sealed.hash);
        assert_eq!(h.chain.length(), 2);
        assert!(h.engine.round_info().await.is_none());

        let row = h
            .db
            .get_negotiation(request.negotiation_id.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.state, NegotiationState::Finalized);

        // Proof waits for the next round and does not trigger one alone
        let queued = h.engine.mempool().drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].tx.action, Action::NodeConsensusProof);

        // The same seal again is a conflict
        let again = h
            .engine
            .on_sealed(
                &peer,
                SealRequest {
                    negotiation_id: request.negotiation_id.clone(),
                    block: sealed,
                },
            )
            .await;
        assert!(matches!(again, Err(ConsensusErr::Stale { .. })));

        for tx in &request.block.transactions {
            let mapping = h.db.get_tx_mapping(tx.tx_hash).await.unwrap().unwrap();
            assert_eq!(mapping.block_id, Some(1));
        }
    }

    #[tokio::test]
    async fn unrecorded_block_is_retried_then_fatal() {
        let h = harness(1).await;
        queue(&h, 2);
        h.engine.tick(false).await.unwrap();
        let (peer, request) = h.link.opened.lock()[0].clone();
        let sealed = seal(&request, &peer).await;

        h.db.run(|conn| {
            conn.execute_batch("ALTER TABLE file_signatures RENAME TO file_signatures_off")?;
            Ok(())
        })
        .await
        .unwrap();

        h.engine
            .on_sealed(
                &peer,
                SealRequest {
                    negotiation_id: request.negotiation_id.clone(),
                    block: sealed,
                },
            )
            .await
            .unwrap();

        // The block stays on the chain and its transactions are not queued
        // a second time
        assert_eq!(h.chain.length(), 2);
        let queued: Vec<Action> = h.engine.mempool().drain().into_iter().map(|q| q.tx.action).collect();
        assert_eq!(queued, vec![Action::NodeConsensusProof]);

        let err = h.engine.tick(true).await.unwrap_err();
        assert!(matches!(err, ConsensusErr::Unrecorded { block_id: 1, .. }));
        assert!(err.is_fatal());

        h.db.run(|conn| {
            conn.execute_batch("ALTER TABLE file_signatures_off RENAME TO file_signatures")?;
            Ok(())
        })
        .await
        .unwrap();

        h.engine.tick(true).await.unwrap();
        assert_eq!(
            h.db.get_file_signature(CHAIN_FILE).await.unwrap(),
            h.chain.chain_hash()
        );
        let mapping = h
            .db
            .get_tx_mapping(request.block.transactions[0].tx_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapping.block_id, Some(1));
    }

    #[tokio::test]
    async fn failed_delivery_moves_to_next_peer() {
        let h = harness(2).await;
        h.link.down.lock().insert(h.peers[1].clone());
        queue(&h, 2);
        h.engine.tick(false).await.unwrap();

        let opened = h.link.opened.lock().clone();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].0, h.peers[0]);

        let info = h.engine.round_info().await.unwrap();
        assert_eq!(info.attempt, 2);
    }

    #[tokio::test]
    async fn unreachable_single_peer_requeues() {
        let h = harness(1).await;
        h.link.down.lock().insert(h.peers[0].clone());
        queue(&h, 2);

        h.engine.tick(false).await.unwrap();
        assert_eq!(h.engine.mempool().len(), 2);
        assert_eq!(h.engine.faults(), 0);
        assert!(h.engine.round_info().await.is_none());
    }

    #[tokio::test]
    async fn exhausted_block_is_dropped_and_requeued() {
        let h = harness(3).await;
        for peer in &h.peers {
            h.link.down.lock().insert(peer.clone());
        }
        queue(&h, 2);

        h.engine.tick(false).await.unwrap();
        assert_eq!(h.engine.faults(), 1);
        assert!(h.link.opened.lock().is_empty());

        let order: Vec<String> = h
            .engine
            .mempool()
            .drain()
            .into_iter()
            .map(|q| q.tx.decrypt_payload().unwrap())
            .map(|p| match p {
                Payload::DocumentMinted(d) => d.title,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec!["tx0".to_owned(), "tx1".to_owned()]);
    }

    #[tokio::test]
    async fn bad_seals_are_rejected() {
        let h = harness(2).await;
        queue(&h, 2);
        h.engine.tick(false).await.unwrap();
        let (peer, request) = h.link.opened.lock()[0].clone();

        // Sealed by somebody else
        let imposter = seal(&request, &h.peers[0]).await;
        let result = h
            .engine
            .on_sealed(
                &h.peers[0],
                SealRequest {
                    negotiation_id: request.negotiation_id.clone(),
                    block: imposter,
                },
            )
            .await;
        assert!(matches!(result, Err(ConsensusErr::NotAssigned)));

        // Tampered content
        let mut tampered = request.block.clone();
        tampered.transactions.pop();
        let tampered = miner::seal_block(tampered, peer.clone(), 1, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        let result = h
            .engine
            .on_sealed(
                &peer,
                SealRequest {
                    negotiation_id: request.negotiation_id.clone(),
                    block: tampered,
                },
            )
            .await;
        assert!(matches!(result, Err(ConsensusErr::ContentMismatch)));
        assert_eq!(h.chain.length(), 1);

        let row = h
            .db
            .get_negotiation(request.negotiation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.state, NegotiationState::Failed);
    }

    #[tokio::test]
    async fn timed_out_round_is_redispatched() {
        let h = harness(2).await;
        queue(&h, 2);
        h.engine.tick(false).await.unwrap();
        let first = h.engine.round_info().await.unwrap();

        if let Round::Active(active) = &mut *h.engine.round.lock().await {
            active.deadline = Utc::now() - chrono::Duration::seconds(1);
        }

        h.engine.tick(false).await.unwrap();
        let second = h.engine.round_info().await.unwrap();
        assert_ne!(first.negotiation_id, second.negotiation_id);
        assert_ne!(first.peer, second.peer);
        assert_eq!(second.block_id, first.block_id);

        let failed = h
            .db
            .get_negotiation(first.negotiation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.state, NegotiationState::Failed);
    }

    #[tokio::test]
    async fn resume_fails_open_rounds() {
        let h = harness(2).await;
        queue(&h, 2);
        h.engine.tick(false).await.unwrap();
        let first = h.engine.round_info().await.unwrap();

        // Fresh engine over the same stores, as after a restart
        let settings = Consensus {
            soft_threshold: 2,
            ..Consensus::default()
        };
        let restarted = Arc::new(ConsensusEngine::new(
            h.engine.address.clone(),
            h.db.clone(),
            h.chain.clone(),
            Assembler::new(h.db.clone(), Arc::new(Mempool::new(64, 2))),
            h.link.clone(),
            &settings,
        ));
        restarted.resume().await.unwrap();

        let row = h
            .db
            .get_negotiation(first.negotiation_id.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.state, NegotiationState::Failed);

        restarted.tick(false).await.unwrap();
        let info = restarted.round_info().await.unwrap();
        assert_eq!(info.block_id, first.block_id);
        assert_ne!(info.negotiation_id, first.negotiation_id);
    }

    #[tokio::test]
    async fn probes_mark_unreachable() {
        let h = harness(2).await;
        h.link.down.lock().insert(h.peers[0].clone());
        h.engine.probe_peers(Duration::from_secs(1)).await.unwrap();

        let down = h.db.get_associated_node(h.peers[0].clone()).await.unwrap().unwrap();
        let up = h.db.get_associated_node(h.peers[1].clone()).await.unwrap().unwrap();
        assert_eq!(down.status, NodeStatus::Unreachable);
        assert_eq!(up.status, NodeStatus::Available);
        assert!(up.last_seen.is_some());
    }

    #[tokio::test]
    async fn stale_mining_status_is_cleared() {
        let h = harness(2).await;
        queue(&h, 2);
        h.engine.tick(true).await.unwrap();
        let sealing = h.engine.round_info().await.unwrap().peer;
        let idle = h.peers.iter().find(|p| **p != sealing).unwrap().clone();

        // Left over from a round that no longer exists
        h.db.set_node_status(idle.clone(), NodeStatus::Mining, None)
            .await
            .unwrap();

        h.engine.probe_peers(Duration::from_secs(1)).await.unwrap();

        let idle = h.db.get_associated_node(idle).await.unwrap().unwrap();
        let sealing = h.db.get_associated_node(sealing).await.unwrap().unwrap();
        assert_eq!(idle.status, NodeStatus::Available);
        assert_eq!(sealing.status, NodeStatus::Mining);
    }

    #[tokio::test]
    async fn unreachable_mining_peer_without_round() {
        let h = harness(1).await;
        h.db.set_node_status(h.peers[0].clone(), NodeStatus::Mining, None)
            .await
            .unwrap();
        h.link.down.lock().insert(h.peers[0].clone());

        h.engine.probe_peers(Duration::from_secs(1)).await.unwrap();

        let peer = h.db.get_associated_node(h.peers[0].clone()).await.unwrap().unwrap();
        assert_eq!(peer.status, NodeStatus::Unreachable);
    }

    #[test]
    fn durations_saturate_at_timer_bound() {
        assert_eq!(
            chrono_duration(Duration::from_secs(90)),
            chrono::Duration::seconds(90)
        );
        assert_eq!(
            chrono_duration(Duration::from_secs(u64::MAX)),
            chrono::Duration::seconds(86_400)
        );
    }
}
