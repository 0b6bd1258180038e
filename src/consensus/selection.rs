// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Deterministic round-robin choice of the sealing peer.

use crate::consensus::rules::backoff_secs;
use crate::db::AssociatedNodeRow;
use crate::primitives::{Address, NodeStatus};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default)]
struct PeerHealth {
    failures: u32,
    until: Option<Instant>,
}

/// In-memory backoff and outstanding-block bookkeeping for archival peers.
#[derive(Debug)]
pub struct PeerTable {
    health: HashMap<Address, PeerHealth>,
    outstanding: HashSet<Address>,
    backoff_base: u64,
    backoff_cap: u64,
}

impl PeerTable {
    #[must_use]
    pub fn new(backoff_base: u64, backoff_cap: u64) -> Self {
        Self {
            health: HashMap::new(),
            outstanding: HashSet::new(),
            backoff_base,
            backoff_cap,
        }
    }

    /// Picks the sealing peer for `block_id`: peers in address order, start
    /// at `block_id mod n`, walk forward past ineligible ones.
    #[must_use]
    pub fn select<'a>(
        &self,
        peers: &'a [AssociatedNodeRow],
        block_id: u64,
        now: Instant,
    ) -> Option<&'a AssociatedNodeRow> {
        if peers.is_empty() {
            return None;
        }

        let mut sorted: Vec<&AssociatedNodeRow> = peers.iter().collect();
        sorted.sort_by(|a, b| a.address.cmp(&b.address));

        let n = sorted.len();
        let start = (block_id % n as u64) as usize;

        (0..n)
            .map(|offset| sorted[(start + offset) % n])
            .find(|peer| self.is_eligible(peer, now))
    }

    fn is_eligible(&self, peer: &AssociatedNodeRow, now: Instant) -> bool {
        peer.status != NodeStatus::Unreachable
            && !self.outstanding.contains(&peer.address)
            && !self.in_backoff(&peer.address, now)
    }

    #[must_use]
    pub fn in_backoff(&self, address: &Address, now: Instant) -> bool {
        self.health
            .get(address)
            .and_then(|h| h.until)
            .map_or(false, |until| now < until)
    }

    /// Records a failed round and returns the backoff applied.
    pub fn penalize(&mut self, address: &Address, now: Instant) -> Duration {
        let health = self.health.entry(address.clone()).or_default();
        health.failures = health.failures.saturating_add(1);
        let backoff =
            Duration::from_secs(backoff_secs(health.failures, self.backoff_base, self.backoff_cap));
        health.until = Some(now + backoff);
        backoff
    }

    pub fn reset(&mut self, address: &Address) {
        self.health.remove(address);
    }

    #[must_use]
    pub fn failures(&self, address: &Address) -> u32 {
        self.health.get(address).map_or(0, |h| h.failures)
    }

    pub fn mark_outstanding(&mut self, address: &Address) {
        self.outstanding.insert(address.clone());
    }

    pub fn release(&mut self, address: &Address) {
        self.outstanding.remove(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn peer(address: &str) -> AssociatedNodeRow {
        AssociatedNodeRow {
            address: Address::parse(address).unwrap(),
            host: "127.0.0.1".to_owned(),
            port: 6002,
            certificate: "cert".to_owned(),
            status: NodeStatus::Available,
            last_seen: None,
            registered_at: Utc::now(),
        }
    }

    fn peers() -> Vec<AssociatedNodeRow> {
        // Deliberately out of order
        vec![
            peer("fl:cccccccccccccccccccccccccccccccc"),
            peer("fl:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            peer("fl:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
        ]
    }

    fn picked(table: &PeerTable, peers: &[AssociatedNodeRow], block_id: u64) -> Option<char> {
        table
            .select(peers, block_id, Instant::now())
            .map(|p| p.address.as_str().chars().last().unwrap())
    }

    #[test]
    fn rotates_by_block_id() {
        let table = PeerTable::new(2, 120);
        let peers = peers();
        assert_eq!(picked(&table, &peers, 0), Some('a'));
        assert_eq!(picked(&table, &peers, 1), Some('b'));
        assert_eq!(picked(&table, &peers, 2), Some('c'));
        assert_eq!(picked(&table, &peers, 3), Some('a'));
    }

    #[test]
    fn skips_ineligible_peers() {
        let mut table = PeerTable::new(2, 120);
        let mut peers = peers();
        let b = peers[2].address.clone();

        table.penalize(&b, Instant::now());
        assert_eq!(picked(&table, &peers, 1), Some('c'));

        table.reset(&b);
        table.mark_outstanding(&b);
        assert_eq!(picked(&table, &peers, 1), Some('c'));

        table.release(&b);
        peers[2].status = NodeStatus::Unreachable;
        assert_eq!(picked(&table, &peers, 1), Some('c'));

        peers[2].status = NodeStatus::Available;
        assert_eq!(picked(&table, &peers, 1), Some('b'));
    }

    #[test]
    fn none_when_all_ineligible() {
        let mut table = PeerTable::new(2, 120);
        let peers = peers();
        for p in &peers {
            table.mark_outstanding(&p.address);
        }
        assert!(table.select(&peers, 7, Instant::now()).is_none());
        assert!(table.select(&[], 7, Instant::now()).is_none());
    }

    #[test]
    fn backoff_expires_and_grows() {
        let mut table = PeerTable::new(2, 120);
        let address = Address::random();
        let now = Instant::now();
        assert_eq!(table.penalize(&address, now), Duration::from_secs(2));
        assert_eq!(table.penalize(&address, now), Duration::from_secs(4));
        assert_eq!(table.failures(&address), 2);
        assert!(table.in_backoff(&address, now));
        assert!(!table.in_backoff(&address, now + Duration::from_secs(5)));
    }
}
