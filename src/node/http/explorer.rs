// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Read only views over the chain and the registered addresses. Reads
//! never go through consensus.

use crate::chain::Snapshot;
use crate::node::http::{reply, respond, with_ctx, ApiErr, PageQuery, Paged, Reply};
use crate::node::Context;
use crate::primitives::{Action, Address, Block, Hash256, Role, Transaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::Filter;

/// Search terms shorter than this are refused.
const MIN_SEARCH_LEN: usize = 1;

/// Search terms longer than this are refused.
const MAX_SEARCH_LEN: usize = 80;

pub fn routes(ctx: Arc<Context>) -> BoxedFilter<(Reply,)> {
    let chain = warp::path!("explorer" / "chain")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(|ctx: Arc<Context>| async move { respond(chain_info(&ctx)) });

    let blocks = warp::path!("explorer" / "blocks")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(warp::query::<PageQuery>())
        .and_then(|ctx: Arc<Context>, query: PageQuery| async move {
            respond(blocks(&ctx, query))
        });

    let block = warp::path!("explorer" / "block" / u64)
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(|id: u64, ctx: Arc<Context>| async move { respond(block(&ctx, id)) });

    let transactions = warp::path!("explorer" / "transactions")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(warp::query::<PageQuery>())
        .and_then(|ctx: Arc<Context>, query: PageQuery| async move {
            respond(transactions(&ctx, query))
        });

    let transaction = warp::path!("explorer" / "transaction" / String)
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(|hash: String, ctx: Arc<Context>| async move {
            respond(transaction(&ctx, &hash))
        });

    let addresses = warp::path!("explorer" / "addresses")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and(warp::query::<PageQuery>())
        .and_then(|ctx: Arc<Context>, query: PageQuery| async move {
            respond(addresses(ctx, query).await)
        });

    let address = warp::path!("explorer" / "address" / String)
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(|address: String, ctx: Arc<Context>| async move {
            respond(address_info(ctx, &address).await)
        });

    let search = warp::path!("explorer" / "search")
        .and(warp::get())
        .and(with_ctx(ctx))
        .and(warp::query::<SearchQuery>())
        .and_then(|ctx: Arc<Context>, query: SearchQuery| async move {
            respond(search(ctx, query).await)
        });

    chain
        .or(blocks)
        .unify()
        .or(block)
        .unify()
        .or(transactions)
        .unify()
        .or(transaction)
        .unify()
        .or(addresses)
        .unify()
        .or(address)
        .unify()
        .or(search)
        .unify()
        .boxed()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub length: u64,
    pub difficulty: usize,
    pub chain_hash: Option<Hash256>,
    pub tip: Option<BlockSummary>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub id: u64,
    pub hash: Option<Hash256>,
    pub prev_hash: Hash256,
    pub validator: Option<Address>,
    pub nonce: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub transactions: usize,
}

impl From<&Block> for BlockSummary {
    fn from(block: &Block) -> Self {
        Self {
            id: block.id,
            hash: block.hash,
            prev_hash: block.prev_hash,
            validator: block.validator.clone(),
            nonce: block.nonce,
            timestamp: block.timestamp,
            transactions: block.transactions.len(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxSummary {
    pub tx_hash: Hash256,
    pub action: Action,
    pub from_address: Address,
    pub to_address: Option<Address>,
    pub timestamp: DateTime<Utc>,
    pub block_id: u64,
}

impl TxSummary {
    fn new(block_id: u64, tx: &Transaction) -> Self {
        Self {
            tx_hash: tx.tx_hash,
            action: tx.action,
            from_address: tx.from_address.clone(),
            to_address: tx.to_address.clone(),
            timestamp: tx.timestamp,
            block_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxDetail {
    pub block_id: u64,
    pub transaction: Transaction,
}

/// Public view of an address. Contact details are left out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddressSummary {
    pub address: Address,
    pub username: String,
    pub role: Role,
    pub association: Option<Address>,
    pub registered: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddressDetail {
    #[serde(flatten)]
    pub summary: AddressSummary,
    pub transactions: Vec<TxSummary>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SearchQuery {
    pub context: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "result", rename_all = "lowercase")]
pub enum SearchHit {
    Block(BlockSummary),
    Transaction(TxSummary),
    Address(AddressSummary),
}

fn chain_info(ctx: &Context) -> Result<Reply, ApiErr> {
    let snapshot = ctx.chain.snapshot();

    reply(
        StatusCode::OK,
        &ChainInfo {
            length: snapshot.length(),
            difficulty: ctx.chain.difficulty(),
            chain_hash: snapshot.chain_hash(),
            tip: snapshot.tip().map(|b| BlockSummary::from(&**b)),
        },
    )
}

/// Blocks newest first. Page 1 ends at the tip.
fn blocks(ctx: &Context, query: PageQuery) -> Result<Reply, ApiErr> {
    let (limit, offset) = query.resolve()?;
    let snapshot = ctx.chain.snapshot();
    let total = snapshot.length();

    let items = snapshot
        .blocks()
        .iter()
        .rev()
        .skip(offset as usize)
        .take(limit as usize)
        .map(|b| BlockSummary::from(&**b))
        .collect();

    reply(
        StatusCode::OK,
        &Paged {
            page: query.page.unwrap_or(1),
            limit,
            total,
            items,
        },
    )
}

fn block(ctx: &Context, id: u64) -> Result<Reply, ApiErr> {
    let block = ctx
        .chain
        .get(id)
        .ok_or_else(|| ApiErr::not_found(format!("no block {id}")))?;
    reply(StatusCode::OK, &*block)
}

fn transactions(ctx: &Context, query: PageQuery) -> Result<Reply, ApiErr> {
    let (limit, offset) = query.resolve()?;
    let snapshot = ctx.chain.snapshot();
    let total = snapshot
        .blocks()
        .iter()
        .map(|b| b.transactions.len() as u64)
        .sum();

    let items = snapshot
        .recent_transactions()
        .skip(offset as usize)
        .take(limit as usize)
        .map(|(id, tx)| TxSummary::new(id, tx))
        .collect();

    reply(
        StatusCode::OK,
        &Paged {
            page: query.page.unwrap_or(1),
            limit,
            total,
            items,
        },
    )
}

fn parse_hash(encoded: &str) -> Result<Hash256, ApiErr> {
    Hash256::from_hex(encoded).map_err(|_| ApiErr::invalid_input("malformed hash"))
}

fn transaction(ctx: &Context, hash: &str) -> Result<Reply, ApiErr> {
    let hash = parse_hash(hash)?;
    let (block_id, transaction) = ctx
        .chain
        .get_transaction(&hash)
        .ok_or_else(|| ApiErr::not_found(format!("no transaction {hash}")))?;

    reply(
        StatusCode::OK,
        &TxDetail {
            block_id,
            transaction,
        },
    )
}

async fn addresses(ctx: Arc<Context>, query: PageQuery) -> Result<Reply, ApiErr> {
    let (limit, offset) = query.resolve()?;
    let total = ctx.db.count_entities().await?;
    let items = ctx
        .db
        .list_entities(limit, offset)
        .await?
        .into_iter()
        .map(|row| AddressSummary {
            address: row.address,
            username: row.username,
            role: row.role,
            association: row.association,
            registered: row.registered_at,
        })
        .collect();

    reply(
        StatusCode::OK,
        &Paged {
            page: query.page.unwrap_or(1),
            limit,
            total,
            items,
        },
    )
}

async fn address_summary(ctx: &Context, address: Address) -> Result<Option<AddressSummary>, ApiErr> {
    Ok(ctx.db.get_entity(address).await?.map(|row| AddressSummary {
        address: row.address,
        username: row.username,
        role: row.role,
        association: row.association,
        registered: row.registered_at,
    }))
}

async fn address_info(ctx: Arc<Context>, address: &str) -> Result<Reply, ApiErr> {
    let address = Address::parse(address).map_err(ApiErr::invalid_input)?;
    let summary = address_summary(&ctx, address.clone())
        .await?
        .ok_or_else(|| ApiErr::not_found(format!("no entity {address}")))?;

    let transactions = ctx
        .chain
        .snapshot()
        .transactions_of(&address)
        .into_iter()
        .map(|(id, tx)| TxSummary::new(id, tx))
        .collect();

    reply(
        StatusCode::OK,
        &AddressDetail {
            summary,
            transactions,
        },
    )
}

fn block_by_hash(snapshot: &Snapshot, hash: &Hash256) -> Option<BlockSummary> {
    snapshot
        .blocks()
        .iter()
        .find(|b| b.hash.as_ref() == Some(hash))
        .map(|b| BlockSummary::from(&**b))
}

/// Resolves a block id, block hash, transaction hash or address.
async fn search(ctx: Arc<Context>, query: SearchQuery) -> Result<Reply, ApiErr> {
    let term = query.context.trim();
    let len = term.chars().count();

    if !(MIN_SEARCH_LEN..=MAX_SEARCH_LEN).contains(&len) {
        return Err(ApiErr::invalid_input(format!(
            "search context must be {MIN_SEARCH_LEN} to {MAX_SEARCH_LEN} characters"
        )));
    }

    let snapshot = ctx.chain.snapshot();

    let hit = if let Ok(id) = term.parse::<u64>() {
        snapshot
            .get(id)
            .map(|b| SearchHit::Block(BlockSummary::from(&**b)))
    } else if let Ok(address) = Address::parse(term) {
        address_summary(&ctx, address).await?.map(SearchHit::Address)
    } else if let Ok(hash) = Hash256::from_hex(term) {
        snapshot
            .get_transaction(&hash)
            .map(|(id, tx)| SearchHit::Transaction(TxSummary::new(id, tx)))
            .or_else(|| block_by_hash(&snapshot, &hash).map(SearchHit::Block))
    } else {
        return Err(ApiErr::invalid_input(
            "expected a block id, a hash or an address",
        ));
    };

    let hit = hit.ok_or_else(|| ApiErr::not_found(format!("nothing matches {term}")))?;
    reply(StatusCode::OK, &hit)
}
