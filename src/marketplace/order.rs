//! Orders, matches, and escrows: the marketplace's own data model.
//! Owned by the marketplace subsystem, referenced only weakly (by id)
//! from billing entries and credit accounts.

use serde::{Deserialize, Serialize};

use crate::money::MicroUsd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Bid,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Partial,
    Filled,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub wallet: String,
    pub side: Side,
    pub price_micro: u64,
    pub lots: u64,
    pub lots_remaining: u64,
    pub status: OrderStatus,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub updated_at: i64,
}

impl Order {
    pub fn new(
        id: impl Into<String>,
        wallet: impl Into<String>,
        side: Side,
        price_micro: u64,
        lots: u64,
        created_at: i64,
        expires_at: Option<i64>,
    ) -> Self {
        Self {
            id: id.into(),
            wallet: wallet.into(),
            side,
            price_micro,
            lots,
            lots_remaining: lots,
            status: OrderStatus::Open,
            created_at,
            expires_at,
            updated_at: created_at,
        }
    }

    pub fn is_resting(&self) -> bool {
        matches!(self.status, OrderStatus::Open | OrderStatus::Partial)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub credits_to_transfer: u64,
    pub usdc_to_seller: MicroUsd,
    pub usdc_fee: MicroUsd,
    pub escrow_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub bid_order_id: String,
    pub ask_order_id: String,
    pub buyer_wallet: String,
    pub seller_wallet: String,
    pub price_micro: u64,
    pub lots: u64,
    pub total_micro: MicroUsd,
    pub fee_micro: MicroUsd,
    pub seller_proceeds_micro: MicroUsd,
    pub settlement: Settlement,
    pub matched_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Locked,
    Settled,
    Released,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub id: String,
    pub order_id: String,
    pub credits_locked: u64,
    pub credits_remaining: u64,
    pub status: EscrowStatus,
}

/// Result of running one incoming order through the book.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchResult {
    pub matches: Vec<Match>,
    pub self_trades_prevented: u32,
    pub resting_order: Option<Order>,
}
