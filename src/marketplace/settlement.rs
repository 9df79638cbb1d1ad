//! Escrow lock, atomic two-sided settlement, idempotent replay, and
//! rollback. Shares only the credit balance store with the rest of the
//! core; USDC movement here is tracked in its own per-wallet hash
//! rather than the five-balance credit ledger; credits and USDC are
//! deliberately different mass-conservation domains.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::idempotency::IdempotencyCache;
use crate::money::MicroUsd;
use crate::store::SharedStore;

/// Spec §9: idempotency caches are bounded LRUs, not unbounded maps.
const SETTLED_CACHE_CAPACITY: usize = 10_000;

use super::order::{Escrow, EscrowStatus, Match, Order, Side};

fn usdc_key(wallet: &str) -> String {
    format!("x402:usdc:{wallet}")
}

fn credits_key(wallet: &str) -> String {
    format!("credits:{wallet}:balance")
}

const FIELD_AVAILABLE: &str = "available";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleStatus {
    Settled,
    AlreadySettled,
}

#[derive(Debug, Clone)]
pub struct SettleResult {
    pub status: SettleStatus,
    pub credits_transferred: u64,
    pub escrow_status: EscrowStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct ConservationReport {
    pub valid: bool,
    pub total_available: u64,
    pub total_escrowed: u64,
}

/// Settlement engine for one trading pair. Escrows and the per-match
/// idempotency cache are kept in-process (single-writer marketplace
/// state, per the design); only the USDC/credits balances live in the
/// shared store so they compose with the rest of the core.
pub struct SettlementEngine {
    store: Arc<dyn SharedStore>,
    escrows: tokio::sync::Mutex<HashMap<String, Escrow>>,
    settled: IdempotencyCache<SettleResult>,
}

impl SettlementEngine {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            escrows: tokio::sync::Mutex::new(HashMap::new()),
            settled: IdempotencyCache::new(SETTLED_CACHE_CAPACITY),
        }
    }

    /// Credits a wallet's available balance; used by test/demo setup
    /// and by `ReleaseEscrow` to return unconsumed credits.
    pub async fn credit_wallet(&self, wallet: &str, amount: u64) -> CoreResult<()> {
        self.store.hincr_by(&credits_key(wallet), FIELD_AVAILABLE, amount as i64).await?;
        Ok(())
    }

    pub async fn credit_usdc(&self, wallet: &str, amount: MicroUsd) -> CoreResult<()> {
        self.store.incr_by(&usdc_key(wallet), amount.0 as i64).await?;
        Ok(())
    }

    pub async fn available_credits(&self, wallet: &str) -> CoreResult<u64> {
        let map = self.store.hgetall(&credits_key(wallet)).await?;
        Ok(map.get(FIELD_AVAILABLE).and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    pub async fn available_usdc(&self, wallet: &str) -> CoreResult<u64> {
        Ok(self
            .store
            .get(&usdc_key(wallet))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// `LockCredits(askOrder)`: debits the ask wallet's available
    /// credits by `lots * lot_size`, opens an escrow. Only ask orders
    /// carry escrow.
    pub async fn lock_credits(&self, ask_order: &Order, lot_size: u64) -> CoreResult<Escrow> {
        if ask_order.side != Side::Ask {
            return Err(CoreError::AskOnlyEscrow);
        }
        let needed = ask_order.lots * lot_size;
        let key = credits_key(&ask_order.wallet);
        let have: u64 = self
            .store
            .hgetall(&key)
            .await?
            .get(FIELD_AVAILABLE)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if have < needed {
            return Err(CoreError::InsufficientBalance {
                balance: "available",
                have,
                need: needed,
            });
        }
        self.store.hincr_by(&key, FIELD_AVAILABLE, -(needed as i64)).await?;

        let escrow = Escrow {
            id: format!("escrow:{}", ask_order.id),
            order_id: ask_order.id.clone(),
            credits_locked: needed,
            credits_remaining: needed,
            status: EscrowStatus::Locked,
        };
        self.escrows.lock().await.insert(escrow.id.clone(), escrow.clone());
        Ok(escrow)
    }

    /// Atomically turns one `Match` into buyer/seller balance changes.
    /// Every precondition is checked before the first mutation; a
    /// failure at any check leaves all balances untouched. Idempotent
    /// on `match.id`.
    pub async fn settle(&self, m: &Match) -> CoreResult<SettleResult> {
        if let Some(prior) = self.settled.get(&m.id).await {
            return Ok(SettleResult {
                status: SettleStatus::AlreadySettled,
                ..prior
            });
        }

        let escrow_id = m.settlement.escrow_id.clone();
        let mut escrows = self.escrows.lock().await;
        let escrow = escrows
            .get(&escrow_id)
            .ok_or_else(|| CoreError::OrderNotFound(escrow_id.clone()))?
            .clone();
        if escrow.credits_remaining < m.settlement.credits_to_transfer {
            return Err(CoreError::EscrowInsufficient {
                escrow_id: escrow_id.clone(),
                have: escrow.credits_remaining,
                need: m.settlement.credits_to_transfer,
            });
        }

        let buyer_usdc = self.available_usdc(&m.buyer_wallet).await?;
        if buyer_usdc < m.total_micro.0 {
            return Err(CoreError::InsufficientUsdc {
                have: buyer_usdc,
                need: m.total_micro.0,
            });
        }

        // Preconditions verified; now apply every mutation. None of
        // these steps can fail on a well-formed in-memory/Redis store,
        // so there is no partial-apply window to roll back from here —
        // `Rollback` exists for reversing an already-committed Settle,
        // not for recovering mid-sequence.
        self.store.incr_by(&usdc_key(&m.buyer_wallet), -(m.total_micro.0 as i64)).await?;
        self.store
            .incr_by(&usdc_key(&m.seller_wallet), m.seller_proceeds_micro.0 as i64)
            .await?;
        // Fee destination is operator-defined; this core collects it
        // under a reserved wallet id so the amount is still accounted
        // for rather than vanishing.
        self.store.incr_by(&usdc_key("operator:fees"), m.fee_micro.0 as i64).await?;

        self.store
            .hincr_by(
                &credits_key(&m.buyer_wallet),
                FIELD_AVAILABLE,
                m.settlement.credits_to_transfer as i64,
            )
            .await?;

        let mut updated_escrow = escrow;
        updated_escrow.credits_remaining -= m.settlement.credits_to_transfer;
        updated_escrow.status = if updated_escrow.credits_remaining == 0 {
            EscrowStatus::Settled
        } else {
            EscrowStatus::Locked
        };
        escrows.insert(escrow_id, updated_escrow.clone());
        drop(escrows);

        let result = SettleResult {
            status: SettleStatus::Settled,
            credits_transferred: m.settlement.credits_to_transfer,
            escrow_status: updated_escrow.status,
        };
        self.settled.put(&m.id, result.clone()).await;
        Ok(result)
    }

    /// Reverses a prior `Settle`. Idempotent on a match that was never
    /// settled (or already rolled back): a no-op.
    pub async fn rollback(&self, m: &Match) -> CoreResult<()> {
        if self.settled.remove(&m.id).await.is_none() {
            return Ok(());
        }

        self.store.incr_by(&usdc_key(&m.buyer_wallet), m.total_micro.0 as i64).await?;
        self.store
            .incr_by(&usdc_key(&m.seller_wallet), -(m.seller_proceeds_micro.0 as i64))
            .await?;
        self.store.incr_by(&usdc_key("operator:fees"), -(m.fee_micro.0 as i64)).await?;
        self.store
            .hincr_by(
                &credits_key(&m.buyer_wallet),
                FIELD_AVAILABLE,
                -(m.settlement.credits_to_transfer as i64),
            )
            .await?;

        let mut escrows = self.escrows.lock().await;
        if let Some(escrow) = escrows.get_mut(&m.settlement.escrow_id) {
            escrow.credits_remaining += m.settlement.credits_to_transfer;
            escrow.status = EscrowStatus::Locked;
        }
        Ok(())
    }

    /// Returns whatever credits remain in an escrow to the seller and
    /// marks it `released`. Idempotent: returns 0 on a second call.
    pub async fn release_escrow(&self, order_id: &str, seller_wallet: &str) -> CoreResult<u64> {
        let escrow_id = format!("escrow:{order_id}");
        let mut escrows = self.escrows.lock().await;
        let escrow = match escrows.get_mut(&escrow_id) {
            Some(e) => e,
            None => return Ok(0),
        };
        if escrow.status != EscrowStatus::Locked {
            return Ok(0);
        }
        let returned = escrow.credits_remaining;
        escrow.credits_remaining = 0;
        escrow.status = EscrowStatus::Released;
        drop(escrows);

        if returned > 0 {
            self.store.hincr_by(&credits_key(seller_wallet), FIELD_AVAILABLE, returned as i64).await?;
        }
        Ok(returned)
    }

    pub async fn is_settled(&self, match_id: &str) -> bool {
        self.settled.contains(match_id).await
    }

    pub async fn escrow(&self, escrow_id: &str) -> Option<Escrow> {
        self.escrows.lock().await.get(escrow_id).cloned()
    }

    /// `totalAvailable + totalEscrowed == totalSupply` must hold across
    /// any sequence of place/match/settle/rollback/release. Callers
    /// supply `total_supply` (the sum of every wallet's credits at
    /// genesis, which this engine does not itself track across
    /// accounts it has never touched).
    pub async fn verify_conservation(&self, wallets: &[&str], total_supply: u64) -> CoreResult<ConservationReport> {
        let mut total_available = 0u64;
        for wallet in wallets {
            total_available += self.available_credits(wallet).await?;
        }
        let total_escrowed: u64 = self
            .escrows
            .lock()
            .await
            .values()
            .filter(|e| e.status == EscrowStatus::Locked)
            .map(|e| e.credits_remaining)
            .sum();
        Ok(ConservationReport {
            valid: total_available + total_escrowed == total_supply,
            total_available,
            total_escrowed,
        })
    }
}
