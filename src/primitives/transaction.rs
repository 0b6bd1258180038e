// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::crypto::{self, CryptoErr};
use crate::primitives::entity::string_enum;
use crate::primitives::{Address, Hash256, Payload, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

string_enum! {
    /// Content type of a transaction.
    pub enum Action {
        EntityRegistered => "entity-registered",
        ApplicantCreated => "applicant-created",
        ApplicantLogAdded => "applicant-log-added",
        ExtraRemarkAdded => "extra-remark-added",
        OrganizationCreated => "organization-created",
        AccessRequestOpened => "access-request-opened",
        AccessRequestProcessed => "access-request-processed",
        AccessRequestClosed => "access-request-closed",
        DocumentMinted => "document-minted",
        DocumentBatchMinted => "document-batch-minted",
        NodeRegistered => "node-registered",
        NodeCertified => "node-certified",
        NodeGenesis => "node-genesis",
        NodeSync => "node-sync",
        NodeConsensusProof => "node-consensus-proof",
    }
}

impl Action {
    /// Two digit code mixed into the payload key context.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::EntityRegistered => 10,
            Self::ApplicantCreated => 11,
            Self::ApplicantLogAdded => 12,
            Self::ExtraRemarkAdded => 13,
            Self::OrganizationCreated => 14,
            Self::AccessRequestOpened => 15,
            Self::AccessRequestProcessed => 16,
            Self::AccessRequestClosed => 17,
            Self::DocumentMinted => 18,
            Self::DocumentBatchMinted => 19,
            Self::NodeRegistered => 20,
            Self::NodeCertified => 21,
            Self::NodeGenesis => 22,
            Self::NodeSync => 23,
            Self::NodeConsensusProof => 24,
        }
    }

    /// Actions only ever emitted by the coordinator itself.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::EntityRegistered
                | Self::OrganizationCreated
                | Self::NodeRegistered
                | Self::NodeCertified
                | Self::NodeGenesis
                | Self::NodeSync
                | Self::NodeConsensusProof
        )
    }

    /// Node bookkeeping that rides along with the next block but never
    /// causes one on its own.
    #[must_use]
    pub fn is_maintenance(&self) -> bool {
        matches!(
            self,
            Self::NodeRegistered | Self::NodeCertified | Self::NodeSync | Self::NodeConsensusProof
        )
    }

    /// Returns true if an entity of `role` may submit this action.
    #[must_use]
    pub fn allowed_for(&self, role: Role) -> bool {
        if self.is_internal() {
            return role == Role::Coordinator;
        }

        match self {
            Self::ApplicantCreated
            | Self::ApplicantLogAdded
            | Self::DocumentMinted
            | Self::DocumentBatchMinted => role == Role::Institution,
            Self::ExtraRemarkAdded | Self::AccessRequestProcessed => {
                matches!(role, Role::Applicant | Role::Institution)
            }
            Self::AccessRequestOpened | Self::AccessRequestClosed => role == Role::Employer,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSignatures {
    /// SHA-256 of the canonical plaintext payload
    pub raw: Hash256,

    /// SHA-256 of the encoded ciphertext
    pub encrypted: Hash256,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_hash: Hash256,
    pub action: Action,
    pub from_address: Address,
    pub to_address: Option<Address>,
    pub timestamp: DateTime<Utc>,
    pub payload: String,
    pub signatures: TxSignatures,
}

/// Every field except `tx_hash`, in hashing order.
#[derive(Serialize)]
struct TxHashView<'a> {
    action: Action,
    from_address: &'a Address,
    to_address: Option<&'a Address>,
    timestamp: &'a DateTime<Utc>,
    payload: &'a str,
    signatures: &'a TxSignatures,
}

impl Transaction {
    /// Encrypts and signs `payload` into a new transaction.
    pub fn from_payload(
        payload: &Payload,
        from_address: Address,
        to_address: Option<Address>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, CryptoErr> {
        let action = payload.action();
        let canonical = crate::codec::encode_to_vec(payload)?;
        let key = crypto::derive_payload_key(action, &from_address, to_address.as_ref(), &timestamp);
        let encrypted = crypto::encrypt_payload(&key, &canonical)?;
        let signatures = TxSignatures {
            raw: Hash256::hash_from_slice(&canonical),
            encrypted: Hash256::hash_from_slice(encrypted.as_bytes()),
        };

        let mut tx = Self {
            tx_hash: Hash256::zero(),
            action,
            from_address,
            to_address,
            timestamp,
            payload: encrypted,
            signatures,
        };
        tx.tx_hash = tx.compute_hash()?;
        Ok(tx)
    }

    pub fn compute_hash(&self) -> Result<Hash256, serde_json::Error> {
        let view = TxHashView {
            action: self.action,
            from_address: &self.from_address,
            to_address: self.to_address.as_ref(),
            timestamp: &self.timestamp,
            payload: &self.payload,
            signatures: &self.signatures,
        };
        let encoded = crate::codec::encode_to_vec(&view)?;
        Ok(Hash256::hash_from_slice(encoded))
    }

    /// Checks the hash and the ciphertext signature. Does not decrypt.
    pub fn verify(&self) -> Result<(), TxVerifyErr> {
        if self.compute_hash().map_err(|_| TxVerifyErr::Codec)? != self.tx_hash {
            return Err(TxVerifyErr::InvalidHash);
        }

        if Hash256::hash_from_slice(self.payload.as_bytes()) != self.signatures.encrypted {
            return Err(TxVerifyErr::InvalidSignature);
        }

        Ok(())
    }

    /// Rebuilds the payload key from the header and decrypts the payload.
    pub fn decrypt_payload(&self) -> Result<Payload, CryptoErr> {
        let key = crypto::derive_payload_key(
            self.action,
            &self.from_address,
            self.to_address.as_ref(),
            &self.timestamp,
        );
        let plaintext = crypto::decrypt_payload(&key, &self.payload)?;

        if Hash256::hash_from_slice(&plaintext) != self.signatures.raw {
            return Err(CryptoErr::Decrypt);
        }

        let payload: Payload = serde_json::from_slice(&plaintext)?;

        if payload.action() != self.action {
            return Err(CryptoErr::Decrypt);
        }

        Ok(payload)
    }

    /// Size of the canonical encoding in bytes.
    pub fn size_bytes(&self) -> Result<usize, serde_json::Error> {
        crate::codec::encode_to_vec(self).map(|encoded| encoded.len())
    }

    /// Returns true if `address` is the sender or the recipient.
    #[must_use]
    pub fn involves(&self, address: &Address) -> bool {
        &self.from_address == address || self.to_address.as_ref() == Some(address)
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum TxVerifyErr {
    InvalidHash,
    InvalidSignature,
    Codec,
}
