// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Turns typed payloads into signed, encrypted transactions and queues
//! them for the next block.

use crate::crypto::CryptoErr;
use crate::db::{DbErr, MetaStore, TxMappingRow};
use crate::node::mempool::{Mempool, MempoolErr, Reservation};
use crate::primitives::{Action, Address, Hash256, Payload, Role, Transaction};
use chrono::{DateTime, Utc};
use log::*;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Submitted {
    pub tx_hash: Hash256,
    pub action: Action,
    pub ordinal: u64,
    pub timestamp: DateTime<Utc>,
}

/// A transaction holding a queue slot, see [`Assembler::prepare`].
#[derive(Debug)]
pub struct Prepared {
    tx: Transaction,
    from: Address,
    timestamp: DateTime<Utc>,
    slot: Reservation,
}

#[derive(Clone)]
pub struct Assembler {
    db: MetaStore,
    mempool: Arc<Mempool>,
}

impl Assembler {
    #[must_use]
    pub fn new(db: MetaStore, mempool: Arc<Mempool>) -> Self {
        Self { db, mempool }
    }

    /// Accepts `payload` from `from` acting as `role`.
    pub async fn submit(
        &self,
        payload: Payload,
        from: &Address,
        role: Role,
        to: Option<Address>,
    ) -> Result<Submitted, AssembleErr> {
        let prepared = self.prepare(payload, from, role, to).await?;
        Ok(self.commit(prepared).await)
    }

    /// Checks and encrypts `payload` and takes a queue slot for it without
    /// queueing it yet. Writes that must only land together with their
    /// ledger record happen between this and [`Assembler::commit`].
    pub async fn prepare(
        &self,
        payload: Payload,
        from: &Address,
        role: Role,
        to: Option<Address>,
    ) -> Result<Prepared, AssembleErr> {
        check(&payload, role)?;

        if let Some(recipient) = &to {
            if self.db.get_entity(recipient.clone()).await?.is_none() {
                return Err(AssembleErr::UnknownRecipient(recipient.clone()));
            }
        }

        self.build(&payload, from, to)
    }

    /// Like [`Assembler::prepare`] for a recipient that is created in the
    /// same request and does not exist yet.
    pub fn prepare_new(
        &self,
        payload: Payload,
        from: &Address,
        role: Role,
        to: Option<Address>,
    ) -> Result<Prepared, AssembleErr> {
        check(&payload, role)?;
        self.build(&payload, from, to)
    }

    fn build(&self, payload: &Payload, from: &Address, to: Option<Address>) -> Result<Prepared, AssembleErr> {
        let timestamp = Utc::now();
        let tx = Transaction::from_payload(payload, from.clone(), to, timestamp)?;
        let slot = self.mempool.reserve()?;

        Ok(Prepared {
            tx,
            from: from.clone(),
            timestamp,
            slot,
        })
    }

    /// Queues a prepared transaction in its reserved slot.
    pub async fn commit(&self, prepared: Prepared) -> Submitted {
        let Prepared {
            tx,
            from,
            timestamp,
            slot,
        } = prepared;
        let tx_hash = tx.tx_hash;
        let action = tx.action;
        let ordinal = slot.push(tx);

        // The row is rewritten with its block id at finalization, a failure
        // here only delays it.
        let mapping = TxMappingRow {
            tx_hash,
            address_ref: from,
            content_type: action,
            block_id: None,
            timestamp,
        };

        if let Err(err) = self.db.insert_tx_mapping(mapping).await {
            warn!("Could not index transaction {}: {}", tx_hash, err);
        }

        debug!("Queued {} transaction {} (#{})", action, tx_hash, ordinal);

        Submitted {
            tx_hash,
            action,
            ordinal,
            timestamp,
        }
    }

    /// Submits a transaction emitted by the coordinator itself.
    pub async fn submit_internal(
        &self,
        payload: Payload,
        coordinator: &Address,
        to: Option<Address>,
    ) -> Result<Submitted, AssembleErr> {
        self.submit(payload, coordinator, Role::Coordinator, to).await
    }

    /// Prepares a transaction emitted by the coordinator itself.
    pub fn prepare_internal(
        &self,
        payload: Payload,
        coordinator: &Address,
        to: Option<Address>,
    ) -> Result<Prepared, AssembleErr> {
        self.prepare_new(payload, coordinator, Role::Coordinator, to)
    }

    #[must_use]
    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }
}

fn check(payload: &Payload, role: Role) -> Result<(), AssembleErr> {
    let action = payload.action();

    if !action.allowed_for(role) {
        return Err(AssembleErr::Forbidden(action));
    }

    payload
        .validate()
        .map_err(|msg| AssembleErr::InvalidInput(msg.to_owned()))
}

#[derive(Debug)]
pub enum AssembleErr {
    /// Role may not submit this action
    Forbidden(Action),

    /// Payload failed field validation
    InvalidInput(String),

    /// Recipient address is not a known entity
    UnknownRecipient(Address),

    /// Builder queue is full
    QueueFull,

    /// Payload could not be encrypted
    Crypto(CryptoErr),

    /// Metadata store failure
    Db(DbErr),
}

impl fmt::Display for AssembleErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forbidden(action) => write!(f, "not allowed to submit {action}"),
            Self::InvalidInput(msg) => f.write_str(msg),
            Self::UnknownRecipient(address) => write!(f, "unknown recipient {address}"),
            Self::QueueFull => f.write_str("block builder queue is full"),
            Self::Crypto(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl From<CryptoErr> for AssembleErr {
    fn from(other: CryptoErr) -> Self {
        Self::Crypto(other)
    }
}

impl From<DbErr> for AssembleErr {
    fn from(other: DbErr) -> Self {
        Self::Db(other)
    }
}

impl From<MempoolErr> for AssembleErr {
    fn from(other: MempoolErr) -> Self {
        match other {
            MempoolErr::Full => Self::QueueFull,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::entity;
    use crate::primitives::{Document, ExtraRemark};

    fn document(title: &str) -> Payload {
        Payload::DocumentMinted(Document {
            title: title.to_owned(),
            description: "Diploma".to_owned(),
        })
    }

    async fn setup(capacity: usize) -> (Assembler, MetaStore, Address, Address) {
        let db = MetaStore::open_in_memory().unwrap();
        let institution = entity(Role::Institution, "registrar");
        let applicant = entity(Role::Applicant, "student");
        db.insert_entity(institution.clone()).await.unwrap();
        db.insert_entity(applicant.clone()).await.unwrap();
        let assembler = Assembler::new(db.clone(), Arc::new(Mempool::new(capacity, 5)));
        (assembler, db, institution.address, applicant.address)
    }

    #[tokio::test]
    async fn accepted_payload_is_queued_and_indexed() {
        let (assembler, db, institution, applicant) = setup(8).await;
        let submitted = assembler
            .submit(document("T"), &institution, Role::Institution, Some(applicant.clone()))
            .await
            .unwrap();

        assert_eq!(submitted.ordinal, 0);
        assert!(assembler.mempool().contains(&submitted.tx_hash));

        let row = db.get_tx_mapping(submitted.tx_hash).await.unwrap().unwrap();
        assert_eq!(row.address_ref, institution);
        assert_eq!(row.content_type, Action::DocumentMinted);
        assert_eq!(row.block_id, None);

        let queued = assembler.mempool().drain();
        assert_eq!(queued[0].tx.decrypt_payload().unwrap(), document("T"));
        assert_eq!(queued[0].tx.to_address, Some(applicant));
    }

    #[tokio::test]
    async fn role_matrix_is_enforced() {
        let (assembler, _, _, applicant) = setup(8).await;
        let err = assembler
            .submit(document("T"), &applicant, Role::Applicant, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AssembleErr::Forbidden(Action::DocumentMinted)));

        let remark = Payload::ExtraRemarkAdded(ExtraRemark {
            title: "Dean's list".to_owned(),
            description: "2023".to_owned(),
            inserted_by: applicant.clone(),
        });
        assert!(assembler
            .submit(remark, &applicant, Role::Applicant, Some(applicant.clone()))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn invalid_and_unknown_are_rejected() {
        let (assembler, _, institution, _) = setup(8).await;
        assert!(matches!(
            assembler
                .submit(document(" "), &institution, Role::Institution, None)
                .await,
            Err(AssembleErr::InvalidInput(_))
        ));
        assert!(matches!(
            assembler
                .submit(document("T"), &institution, Role::Institution, Some(Address::random()))
                .await,
            Err(AssembleErr::UnknownRecipient(_))
        ));
        assert!(assembler.mempool().is_empty());
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let (assembler, _, institution, applicant) = setup(1).await;
        assembler
            .submit(document("A"), &institution, Role::Institution, Some(applicant.clone()))
            .await
            .unwrap();
        assert!(matches!(
            assembler
                .submit(document("B"), &institution, Role::Institution, Some(applicant))
                .await,
            Err(AssembleErr::QueueFull)
        ));
    }

    #[tokio::test]
    async fn prepared_transaction_holds_a_slot_until_committed() {
        let (assembler, _, institution, applicant) = setup(1).await;
        let prepared = assembler
            .prepare(document("A"), &institution, Role::Institution, Some(applicant.clone()))
            .await
            .unwrap();
        assert!(assembler.mempool().is_empty());
        assert!(matches!(
            assembler
                .prepare(document("B"), &institution, Role::Institution, Some(applicant.clone()))
                .await,
            Err(AssembleErr::QueueFull)
        ));

        drop(prepared);
        let prepared = assembler
            .prepare(document("C"), &institution, Role::Institution, Some(applicant))
            .await
            .unwrap();
        let submitted = assembler.commit(prepared).await;
        assert!(assembler.mempool().contains(&submitted.tx_hash));
        assert_eq!(assembler.mempool().len(), 1);
    }
}
