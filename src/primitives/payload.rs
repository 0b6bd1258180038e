// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::primitives::entity::string_enum;
use crate::primitives::{Action, Address, AssociationKind, Hash256, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Max length of names and short labels.
pub const MAX_NAME_LEN: usize = 64;

/// Max length of titles.
pub const MAX_TITLE_LEN: usize = 128;

/// Max length of free text fields.
pub const MAX_DESCRIPTION_LEN: usize = 4096;

/// Max documents in a single batch issuance.
pub const MAX_BATCH_DOCUMENTS: usize = 32;

/// Plaintext content of a transaction. The tag selects the action.
///
/// Unknown tags fail deserialization, which is how unknown actions are
/// rejected at the edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "context", rename_all = "kebab-case")]
pub enum Payload {
    EntityRegistered(EntityRegistered),
    ApplicantCreated(ApplicantCreated),
    ApplicantLogAdded(ApplicantLog),
    ExtraRemarkAdded(ExtraRemark),
    OrganizationCreated(OrganizationCreated),
    AccessRequestOpened(AccessRequestOpened),
    AccessRequestProcessed(AccessRequestProcessed),
    AccessRequestClosed(AccessRequestClosed),
    DocumentMinted(Document),
    DocumentBatchMinted(DocumentBatch),
    NodeRegistered(NodeRegistered),
    NodeCertified(NodeCertified),
    NodeGenesis(NodeGenesis),
    NodeSync(NodeSync),
    NodeConsensusProof(NodeConsensusProof),
}

impl Payload {
    #[must_use]
    pub fn action(&self) -> Action {
        match self {
            Self::EntityRegistered(_) => Action::EntityRegistered,
            Self::ApplicantCreated(_) => Action::ApplicantCreated,
            Self::ApplicantLogAdded(_) => Action::ApplicantLogAdded,
            Self::ExtraRemarkAdded(_) => Action::ExtraRemarkAdded,
            Self::OrganizationCreated(_) => Action::OrganizationCreated,
            Self::AccessRequestOpened(_) => Action::AccessRequestOpened,
            Self::AccessRequestProcessed(_) => Action::AccessRequestProcessed,
            Self::AccessRequestClosed(_) => Action::AccessRequestClosed,
            Self::DocumentMinted(_) => Action::DocumentMinted,
            Self::DocumentBatchMinted(_) => Action::DocumentBatchMinted,
            Self::NodeRegistered(_) => Action::NodeRegistered,
            Self::NodeCertified(_) => Action::NodeCertified,
            Self::NodeGenesis(_) => Action::NodeGenesis,
            Self::NodeSync(_) => Action::NodeSync,
            Self::NodeConsensusProof(_) => Action::NodeConsensusProof,
        }
    }

    /// Field level validation. Cross references (existing addresses,
    /// request ownership) are checked by the caller against the stores.
    pub fn validate(&self) -> Result<(), &'static str> {
        match self {
            Self::EntityRegistered(p) => check_text(&p.username, MAX_NAME_LEN),
            Self::ApplicantCreated(p) => {
                check_text(&p.first_name, MAX_NAME_LEN)?;
                check_text(&p.last_name, MAX_NAME_LEN)?;
                check_text(&p.course, MAX_TITLE_LEN)?;
                check_text(&p.prefer_role, MAX_TITLE_LEN)
            }
            Self::ApplicantLogAdded(p) => {
                check_text(&p.name, MAX_TITLE_LEN)?;
                check_text(&p.description, MAX_DESCRIPTION_LEN)?;

                if let Some(role) = &p.role {
                    check_text(role, MAX_NAME_LEN)?;
                }

                match p.duration_end {
                    Some(end) if end < p.duration_start => Err("duration ends before it starts"),
                    _ => Ok(()),
                }
            }
            Self::ExtraRemarkAdded(p) => {
                check_text(&p.title, MAX_TITLE_LEN)?;
                check_text(&p.description, MAX_DESCRIPTION_LEN)
            }
            Self::OrganizationCreated(p) => check_text(&p.name, MAX_TITLE_LEN),
            Self::AccessRequestOpened(p) => {
                check_text(&p.request_id, MAX_NAME_LEN)?;
                check_text(&p.reason, MAX_DESCRIPTION_LEN)
            }
            Self::AccessRequestProcessed(p) => check_text(&p.request_id, MAX_NAME_LEN),
            Self::AccessRequestClosed(p) => check_text(&p.request_id, MAX_NAME_LEN),
            Self::DocumentMinted(p) => p.validate(),
            Self::DocumentBatchMinted(p) => {
                if p.documents.is_empty() {
                    return Err("batch contains no documents");
                }

                if p.documents.len() > MAX_BATCH_DOCUMENTS {
                    return Err("batch contains too many documents");
                }

                p.documents.iter().try_for_each(Document::validate)
            }
            Self::NodeCertified(p) => check_text(&p.host, MAX_TITLE_LEN),
            Self::NodeConsensusProof(p) => {
                check_text(&p.negotiation_id, MAX_TITLE_LEN)
            }
            Self::NodeRegistered(_) | Self::NodeGenesis(_) | Self::NodeSync(_) => Ok(()),
        }
    }
}

fn check_text(value: &str, max: usize) -> Result<(), &'static str> {
    let trimmed = value.trim();

    if trimmed.is_empty() {
        return Err("required text field is empty");
    }

    if value.chars().count() > max {
        return Err("text field is too long");
    }

    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRegistered {
    pub address: Address,
    pub username: String,
    pub role: Role,
    pub association: Option<Address>,
    pub registered: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApplicantCreated {
    pub address: Address,
    pub institution: Address,
    pub first_name: String,
    pub last_name: String,
    pub course: String,
    pub year: u16,
    pub prefer_role: String,
}

string_enum! {
    pub enum ApplicantLogKind {
        Project => "project",
        Activity => "activity",
        Promotion => "promotion",
        Employment => "employment",
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApplicantLog {
    pub kind: ApplicantLogKind,
    pub name: String,
    pub description: String,
    pub role: Option<String>,
    pub duration_start: DateTime<Utc>,
    pub duration_end: Option<DateTime<Utc>>,
    pub validated_by: Address,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtraRemark {
    pub title: String,
    pub description: String,
    pub inserted_by: Address,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrganizationCreated {
    pub association: Address,
    pub name: String,
    pub kind: AssociationKind,
    pub founded_by: Address,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessRequestOpened {
    pub request_id: String,
    pub requestor: Address,
    pub receiver: Address,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessRequestProcessed {
    pub request_id: String,
    pub approved: bool,
    pub processed_by: Address,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessRequestClosed {
    pub request_id: String,
    pub closed_by: Address,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    pub description: String,
}

impl Document {
    pub fn validate(&self) -> Result<(), &'static str> {
        check_text(&self.title, MAX_TITLE_LEN)?;
        check_text(&self.description, MAX_DESCRIPTION_LEN)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentBatch {
    pub documents: Vec<Document>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRegistered {
    pub new_address: Address,
    pub acceptor_address: Address,
    pub role: Role,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeCertified {
    pub requestor_address: Address,
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeGenesis {
    pub block_genesis_no: u64,
    pub generator_address: Address,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSync {
    pub requestor_address: Address,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConsensusProof {
    pub negotiation_id: String,
    pub miner_address: Address,
    pub coordinator_address: Address,
    pub block_id: u64,
    pub block_hash: Hash256,
}
