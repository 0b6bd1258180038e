// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::consensus::ConsensusErr;
use crate::db::{MetaStore, NegotiationRow};
use crate::miner;
use crate::node::transport::CoordinatorLink;
use crate::node::wire::{OpenRequest, ProgressStatus, SealRequest};
use crate::primitives::{Address, Block, NegotiationState};
use crate::settings::Consensus;
use chrono::Utc;
use constant_time_eq::constant_time_eq;
use log::*;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Deadline of a progress report.
const PROGRESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Archival peer side of the sealing protocol. Seals one block at a time.
pub struct PeerSealer {
    address: Address,
    db: MetaStore,
    link: Arc<dyn CoordinatorLink>,
    settings: Consensus,

    /// Certificate the coordinator presents on every call
    certificate: RwLock<Option<String>>,

    /// Negotiation currently being sealed
    busy: Mutex<Option<String>>,
}

impl PeerSealer {
    #[must_use]
    pub fn new(
        address: Address,
        db: MetaStore,
        link: Arc<dyn CoordinatorLink>,
        settings: &Consensus,
    ) -> Self {
        Self {
            address,
            db,
            link,
            settings: settings.clone(),
            certificate: RwLock::new(None),
            busy: Mutex::new(None),
        }
    }

    pub fn set_certificate(&self, certificate: String) {
        *self.certificate.write() = Some(certificate);
    }

    #[must_use]
    pub fn check_certificate(&self, presented: &str) -> bool {
        match &*self.certificate.read() {
            Some(expected) => constant_time_eq(expected.as_bytes(), presented.as_bytes()),
            None => false,
        }
    }

    #[must_use]
    pub fn sealing(&self) -> Option<String> {
        self.busy.lock().clone()
    }

    /// Fails negotiations a previous run left open.
    pub async fn resume(&self) -> Result<(), ConsensusErr> {
        for row in self.db.fail_active_negotiations(Utc::now()).await? {
            warn!(
                "Sealing of block {} (negotiation {}) was interrupted, marked failed",
                row.block_id, row.id
            );
        }

        Ok(())
    }

    /// Accepts a block to seal. Sealing and submission continue in the
    /// background; the coordinator learns the outcome from the submission.
    pub async fn on_open(self: &Arc<Self>, request: OpenRequest) -> Result<(), ConsensusErr> {
        if request.block.is_sealed() || request.block.transactions.is_empty() {
            return Err(ConsensusErr::MalformedBlock);
        }

        {
            let mut busy = self.busy.lock();

            if let Some(current) = busy.as_ref() {
                return Err(ConsensusErr::Busy(current.clone()));
            }

            *busy = Some(request.negotiation_id.clone());
        }

        let now = Utc::now();
        let row = NegotiationRow {
            id: request.negotiation_id.clone(),
            coordinator: request.coordinator_address.clone(),
            peer: self.address.clone(),
            block_id: request.block.id,
            state: NegotiationState::Delivered,
            opened_at: now,
            deadline: request.deadline,
            updated_at: now,
            attempt: 1,
            block: serde_json::to_string(&request.block)?,
        };

        if let Err(err) = self.db.insert_negotiation(row).await {
            self.release();
            return Err(err.into());
        }

        info!(
            "Sealing block {} for negotiation {}",
            request.block.id, request.negotiation_id
        );

        let sealer = self.clone();
        tokio::spawn(async move {
            sealer.seal_and_submit(request).await;
        });

        Ok(())
    }

    async fn seal_and_submit(self: Arc<Self>, request: OpenRequest) {
        let id = request.negotiation_id.clone();
        let started = Instant::now();
        let budget = self.settings.seal_timeout();

        if let Err(err) = self
            .link
            .report_progress(&id, ProgressStatus::Hashing, PROGRESS_TIMEOUT)
            .await
        {
            debug!("Could not report progress of {}: {}", id, err);
        }

        let sealed = match self.seal(request.block, budget).await {
            Ok(sealed) => sealed,
            Err(err) => {
                warn!("Sealing for negotiation {} failed: {}", id, err);
                self.finish(&id, NegotiationState::Delivered, NegotiationState::Failed)
                    .await;

                if let Err(err) = self
                    .link
                    .report_progress(&id, ProgressStatus::Abandoned, PROGRESS_TIMEOUT)
                    .await
                {
                    debug!("Could not report abandoned negotiation {}: {}", id, err);
                }

                return;
            }
        };

        if let Err(err) = self
            .db
            .transition_negotiation(
                id.clone(),
                NegotiationState::Delivered,
                NegotiationState::Sealed,
                None,
                Utc::now(),
            )
            .await
        {
            warn!("Could not record seal of {}: {}", id, err);
        }

        let submission = SealRequest {
            negotiation_id: id.clone(),
            block: sealed,
        };

        for attempt in 1..=self.settings.submit_retries.max(1) {
            let remaining = budget.saturating_sub(started.elapsed());

            if remaining.is_zero() {
                break;
            }

            match self.link.submit_seal(&submission, remaining).await {
                Ok(response) => {
                    info!(
                        "Block {} sealed with hash {} accepted by the coordinator",
                        submission.block.id, response.block_hash
                    );
                    self.finish(&id, NegotiationState::Sealed, NegotiationState::Finalized)
                        .await;
                    return;
                }
                Err(err) if err.is_rejection() => {
                    warn!("Coordinator rejected seal of {}: {}", id, err);
                    break;
                }
                Err(err) => {
                    warn!(
                        "Submitting seal of {} failed (attempt {}): {}",
                        id, attempt, err
                    );
                    let backoff = Duration::from_secs(1 << (attempt - 1).min(5));
                    tokio::time::sleep(backoff.min(budget.saturating_sub(started.elapsed())))
                        .await;
                }
            }
        }

        self.finish(&id, NegotiationState::Sealed, NegotiationState::Failed)
            .await;
    }

    /// Runs the nonce search under `budget`.
    async fn seal(&self, block: Block, budget: Duration) -> Result<Block, ConsensusErr> {
        let cancel = Arc::new(AtomicBool::new(false));
        let search = miner::seal_block(
            block,
            self.address.clone(),
            self.settings.difficulty,
            cancel.clone(),
        );

        match tokio::time::timeout(budget, search).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                Err(ConsensusErr::Miner(miner::MinerErr::Cancelled))
            }
        }
    }

    async fn finish(&self, id: &str, from: NegotiationState, to: NegotiationState) {
        if let Err(err) = self
            .db
            .transition_negotiation(id.to_owned(), from, to, None, Utc::now())
            .await
        {
            debug!("Could not move negotiation {} to {}: {}", id, to, err);
        }

        self.release();
    }

    fn release(&self) {
        *self.busy.lock() = None;
    }
}
