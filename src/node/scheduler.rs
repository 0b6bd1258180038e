// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::node::{resync, Context, NodeErr, RoleContext};
use crate::primitives::Hash256;
use chrono::Utc;
use log::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Periodic node maintenance. Tasks run one at a time, a slot missed while
/// another task runs is skipped.
pub struct Scheduler {
    ctx: Arc<Context>,
}

fn every(secs: u64) -> Interval {
    let mut timer = interval(Duration::from_secs(secs.max(1)));
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

impl Scheduler {
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Runs until a fatal consensus error.
    pub async fn run(&self) -> Result<(), NodeErr> {
        let settings = &self.ctx.settings.scheduler;
        let mut sweep = every(settings.token_sweep_secs);
        let mut tick = every(settings.consensus_tick_secs);
        let mut liveness = every(settings.liveness_secs);

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    self.sweep_tokens().await;
                }
                _ = tick.tick() => {
                    self.consensus_tick(true).await?;
                }
                _ = self.queue_ready() => {
                    self.consensus_tick(false).await?;
                }
                _ = liveness.tick() => {
                    self.liveness().await;
                }
            }
        }
    }

    /// Resolves when the coordinator queue reaches its threshold. Never
    /// resolves on a peer.
    async fn queue_ready(&self) {
        match &self.ctx.role {
            RoleContext::Coordinator { assembler, .. } => assembler.mempool().ready().await,
            RoleContext::Peer { .. } => std::future::pending().await,
        }
    }

    /// Expires tokens past their lifetime. Returns how many were expired.
    pub async fn sweep_tokens(&self) -> usize {
        match self.ctx.db.sweep_tokens(Utc::now()).await {
            Ok(0) => 0,
            Ok(expired) => {
                info!("Expired {} session tokens", expired);
                expired
            }
            Err(err) => {
                warn!("Token sweep failed: {}", err);
                0
            }
        }
    }

    pub async fn consensus_tick(&self, tick_elapsed: bool) -> Result<(), NodeErr> {
        let RoleContext::Coordinator { engine, .. } = &self.ctx.role else {
            return Ok(());
        };

        match engine.tick(tick_elapsed).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => {
                error!("Consensus cannot continue: {}", err);
                Err(NodeErr::Consensus(err))
            }
            Err(err) => {
                warn!("Consensus tick failed: {}", err);
                Ok(())
            }
        }
    }

    /// Coordinator: probes its peers. Peer: checks its chain against the
    /// coordinator and resyncs when they differ.
    pub async fn liveness(&self) {
        let probe_timeout = Duration::from_secs(self.ctx.settings.scheduler.probe_timeout_secs);

        match &self.ctx.role {
            RoleContext::Coordinator { engine, .. } => {
                if let Err(err) = engine.probe_peers(probe_timeout).await {
                    warn!("Peer probe failed: {}", err);
                }
            }
            RoleContext::Peer { upstream, .. } => {
                let local = self.ctx.chain.chain_hash().unwrap_or_else(Hash256::zero);

                match upstream.verify_chain_hash(local, probe_timeout).await {
                    Ok(true) => trace!("Chain matches the coordinator"),
                    Ok(false) => {
                        info!("Chain differs from the coordinator, resyncing");

                        if let Err(err) = resync(
                            &self.ctx.db,
                            &self.ctx.chain,
                            upstream.as_ref(),
                            self.ctx.settings.consensus.seal_timeout(),
                        )
                        .await
                        {
                            warn!("Resync failed: {}", err);
                        }
                    }
                    Err(err) => warn!("Coordinator unreachable: {}", err),
                }
            }
        }
    }
}
