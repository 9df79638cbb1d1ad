//! The continuous double auction: price-time priority book, self-trade
//! prevention, and the pre-match anti-abuse validation chain.
//!
//! The book itself is a pair of `Vec<Order>` kept sorted on insert —
//! bids descending by price then ascending by `created_at`, asks the
//! mirror image — rather than a `BinaryHeap`, because the self-trade
//! skip-and-continue rule needs to walk past the top entry without
//! popping it, and a heap makes "peek past the top" awkward.

use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::ids::new_entry_id;
use crate::logging::log_self_trade_prevented;
use crate::store::SharedStore;

use super::order::{Match, MatchResult, Order, OrderStatus, Settlement, Side};

fn rate_limit_key(wallet: &str) -> String {
    format!("x402:rate:{wallet}")
}

fn relist_key(wallet: &str, side: Side, price_micro: u64) -> String {
    format!("x402:relist:{wallet}:{:?}:{price_micro}", side)
}

pub struct MatchConfig {
    pub lot_size: u64,
    pub fee_rate_bps: u64,
    pub min_order_lots: u64,
    pub max_orders_per_hour: u32,
    pub rate_limit_window_ms: i64,
    pub relist_cooldown_ms: i64,
}

impl MatchConfig {
    fn fee_for(&self, total_micro: u64) -> u64 {
        ((total_micro as u128) * (self.fee_rate_bps as u128) / 10_000u128) as u64
    }
}

/// One order book per trading pair. The matcher is logically
/// single-threaded per book (callers serialize access, e.g. one
/// `OrderBook` behind one `tokio::sync::Mutex`); independent books are
/// trivially parallel.
pub struct OrderBook {
    bids: Vec<Order>,
    asks: Vec<Order>,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: MatchConfig,
}

impl OrderBook {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, config: MatchConfig) -> Self {
        Self {
            bids: Vec::new(),
            asks: Vec::new(),
            store,
            clock,
            config,
        }
    }

    fn insert_sorted(book: &mut Vec<Order>, side: Side, order: Order) {
        // Bids: highest price first, ties broken by earliest created_at,
        // then by order id for determinism. Asks: lowest price first,
        // same tiebreak.
        let idx = book.partition_point(|o| match side {
            Side::Bid => {
                (o.price_micro, o.created_at, &o.id) >= (order.price_micro, order.created_at, &order.id)
            }
            Side::Ask => {
                (o.price_micro, o.created_at, &o.id) <= (order.price_micro, order.created_at, &order.id)
            }
        });
        book.insert(idx, order);
    }

    fn crosses(incoming_price: u64, incoming_side: Side, resting_price: u64) -> bool {
        match incoming_side {
            Side::Bid => incoming_price >= resting_price,
            Side::Ask => incoming_price <= resting_price,
        }
    }

    /// Pre-match validation, in priority order: price -> size -> rate
    /// limit -> relist cooldown -> self-trade.
    pub async fn validate(&self, wallet: &str, side: Side, price_micro: u64, lots: u64) -> CoreResult<()> {
        if price_micro == 0 {
            return Err(CoreError::InvalidPrice("price_micro must be > 0".to_string()));
        }
        if lots < self.config.min_order_lots {
            return Err(CoreError::OrderTooSmall { lots });
        }

        let now = self.clock.now_ms();
        let window_start = (now - self.config.rate_limit_window_ms) as f64;
        let rl_key = rate_limit_key(wallet);
        self.store.zremrangebyscore(&rl_key, f64::MIN, window_start).await?;
        let recent = self.store.zcard(&rl_key).await?;
        if recent as u32 >= self.config.max_orders_per_hour {
            return Err(CoreError::RateLimited {
                wallet: wallet.to_string(),
            });
        }

        let cooldown_key = relist_key(wallet, side, price_micro);
        if let Some(cancelled_at) = self.store.get(&cooldown_key).await? {
            if let Ok(cancelled_at) = cancelled_at.parse::<i64>() {
                if now - cancelled_at < self.config.relist_cooldown_ms {
                    return Err(CoreError::RelistCooldown {
                        wallet: wallet.to_string(),
                        side: side.label(),
                        price_micro,
                    });
                }
            }
        }

        let counter_book = match side {
            Side::Bid => &self.asks,
            Side::Ask => &self.bids,
        };
        let would_self_cross = counter_book
            .iter()
            .filter(|o| o.is_resting() && Self::crosses(price_micro, side, o.price_micro))
            .any(|o| o.wallet == wallet);
        if would_self_cross {
            // Only a *pure* self-cross (no other counterparty available
            // ahead of it) is rejected outright; mixed books still go
            // through match() where self-trade-prevention skips just
            // the offending resting order. Anti-abuse validation exists
            // to reject the degenerate case of a wallet crossing only
            // itself.
            let only_self = counter_book
                .iter()
                .filter(|o| o.is_resting() && Self::crosses(price_micro, side, o.price_micro))
                .all(|o| o.wallet == wallet);
            if only_self {
                return Err(CoreError::SelfTrade);
            }
        }

        Ok(())
    }

    /// Records this order's placement for future rate-limit windows.
    async fn record_rate_limit(&self, wallet: &str, order_id: &str) -> CoreResult<()> {
        let now = self.clock.now_ms() as f64;
        self.store.zadd(&rate_limit_key(wallet), now, order_id).await
    }

    /// Runs an incoming order through the book: matches against
    /// crossing counter orders at the resting order's price (the
    /// aggressor gets price improvement), skipping same-wallet resting
    /// orders without consuming them, then posts any remainder.
    pub async fn submit(
        &mut self,
        wallet: &str,
        side: Side,
        price_micro: u64,
        lots: u64,
        created_at: i64,
        expires_at: Option<i64>,
    ) -> CoreResult<MatchResult> {
        self.validate(wallet, side, price_micro, lots).await?;

        let order_id = new_entry_id(created_at);
        let mut incoming = Order::new(&order_id, wallet, side, price_micro, lots, created_at, expires_at);
        let mut result = MatchResult::default();

        let counter_book = match side {
            Side::Bid => &mut self.asks,
            Side::Ask => &mut self.bids,
        };

        let mut i = 0;
        while incoming.lots_remaining > 0 && i < counter_book.len() {
            let resting = &counter_book[i];
            if !resting.is_resting() || !Self::crosses(price_micro, side, resting.price_micro) {
                break; // price-time priority: once the head no longer crosses, nothing behind it does either
            }
            if resting.wallet == wallet {
                result.self_trades_prevented += 1;
                log_self_trade_prevented(wallet, &resting.id);
                i += 1;
                continue;
            }

            let lots_traded = incoming.lots_remaining.min(resting.lots_remaining);
            let total_micro = resting.price_micro.saturating_mul(lots_traded);
            let fee_micro = self.config.fee_for(total_micro);
            let seller_proceeds_micro = total_micro - fee_micro;

            let (bid_order_id, ask_order_id, buyer_wallet, seller_wallet) = match side {
                Side::Bid => (
                    incoming.id.clone(),
                    resting.id.clone(),
                    incoming.wallet.clone(),
                    resting.wallet.clone(),
                ),
                Side::Ask => (
                    resting.id.clone(),
                    incoming.id.clone(),
                    resting.wallet.clone(),
                    incoming.wallet.clone(),
                ),
            };
            let ask_order_id_for_escrow = ask_order_id.clone();

            let m = Match {
                id: new_entry_id(created_at),
                bid_order_id,
                ask_order_id,
                buyer_wallet,
                seller_wallet,
                price_micro: resting.price_micro,
                lots: lots_traded,
                total_micro: crate::money::MicroUsd(total_micro),
                fee_micro: crate::money::MicroUsd(fee_micro),
                seller_proceeds_micro: crate::money::MicroUsd(seller_proceeds_micro),
                settlement: Settlement {
                    credits_to_transfer: lots_traded * self.config.lot_size,
                    usdc_to_seller: crate::money::MicroUsd(seller_proceeds_micro),
                    usdc_fee: crate::money::MicroUsd(fee_micro),
                    escrow_id: format!("escrow:{ask_order_id_for_escrow}"),
                },
                matched_at: created_at,
            };

            incoming.lots_remaining -= lots_traded;
            let resting_mut = &mut counter_book[i];
            resting_mut.lots_remaining -= lots_traded;
            resting_mut.status = if resting_mut.lots_remaining == 0 {
                OrderStatus::Filled
            } else {
                OrderStatus::Partial
            };
            resting_mut.updated_at = created_at;

            result.matches.push(m);
            if resting_mut.lots_remaining == 0 {
                i += 1;
            }
            // A partially-filled resting order stays at the front; the
            // loop re-checks it next iteration (it may no longer cross
            // once prices move, but here price never changes mid-call).
            if incoming.lots_remaining == 0 {
                break;
            }
        }

        counter_book.retain(|o| o.is_resting());

        incoming.status = if incoming.lots_remaining == 0 {
            OrderStatus::Filled
        } else if incoming.lots_remaining < incoming.lots {
            OrderStatus::Partial
        } else {
            OrderStatus::Open
        };

        self.record_rate_limit(wallet, &order_id).await?;

        if incoming.lots_remaining > 0 {
            let own_book = match side {
                Side::Bid => &mut self.bids,
                Side::Ask => &mut self.asks,
            };
            Self::insert_sorted(own_book, side, incoming.clone());
            result.resting_order = Some(incoming);
        } else {
            result.resting_order = Some(incoming);
        }

        Ok(result)
    }

    /// Cancels a resting order by id, starting its relist cooldown.
    pub async fn cancel(&mut self, order_id: &str) -> CoreResult<Order> {
        for book in [&mut self.bids, &mut self.asks] {
            if let Some(pos) = book.iter().position(|o| o.id == order_id) {
                let mut order = book.remove(pos);
                order.status = OrderStatus::Cancelled;
                let now = self.clock.now_ms();
                order.updated_at = now;
                self.store
                    .set(&relist_key(&order.wallet, order.side, order.price_micro), &now.to_string(), None)
                    .await?;
                return Ok(order);
            }
        }
        Err(CoreError::OrderNotFound(order_id.to_string()))
    }

    pub fn best_bid(&self) -> Option<&Order> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&Order> {
        self.asks.first()
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }
}

impl Side {
    fn label(&self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Ask => "ask",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrozenClock;
    use crate::store::memory::InMemoryStore;

    fn default_config() -> MatchConfig {
        MatchConfig {
            lot_size: 100,
            fee_rate_bps: 30,
            min_order_lots: 1,
            max_orders_per_hour: 60,
            rate_limit_window_ms: 60 * 60 * 1000,
            relist_cooldown_ms: 30_000,
        }
    }

    fn book(clock_ms: i64) -> OrderBook {
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(FrozenClock::at(clock_ms));
        OrderBook::new(store, clock, default_config())
    }

    #[tokio::test]
    async fn self_trade_is_skipped_and_resting_order_survives() {
        let mut b = book(0);
        // Alice ask(1000, 5) at t=0, Bob ask(1500, 3) at t=1.
        b.submit("alice", Side::Ask, 1000, 5, 0, None).await.unwrap();
        b.submit("bob", Side::Ask, 1500, 3, 1, None).await.unwrap();

        // Incoming Alice bid(2000, 7): must skip her own ask, match Bob's 3.
        let result = b.submit("alice", Side::Bid, 2000, 7, 2, None).await.unwrap();
        assert_eq!(result.self_trades_prevented, 1);
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].lots, 3);
        assert_eq!(result.matches[0].price_micro, 1500);

        let resting = result.resting_order.unwrap();
        assert_eq!(resting.lots_remaining, 4);
        assert_eq!(resting.status, OrderStatus::Partial);

        // Alice's original ask for 5 lots is untouched.
        assert_eq!(b.best_ask().unwrap().wallet, "alice");
        assert_eq!(b.best_ask().unwrap().lots_remaining, 5);
    }

    #[tokio::test]
    async fn price_improvement_accrues_to_aggressor_at_resting_price() {
        let mut b = book(0);
        b.submit("seller", Side::Ask, 1000, 10, 0, None).await.unwrap();
        let result = b.submit("buyer", Side::Bid, 1500, 10, 1, None).await.unwrap();
        assert_eq!(result.matches[0].price_micro, 1000);
        assert_eq!(result.matches[0].total_micro.0, 10_000);
    }

    #[tokio::test]
    async fn order_too_small_is_rejected_before_matching() {
        let mut b = book(0);
        let result = b.submit("x", Side::Bid, 1000, 0, 0, None).await;
        assert!(matches!(result, Err(CoreError::OrderTooSmall { .. })));
    }

    #[tokio::test]
    async fn zero_price_is_rejected() {
        let mut b = book(0);
        let result = b.submit("x", Side::Bid, 0, 10, 0, None).await;
        assert!(matches!(result, Err(CoreError::InvalidPrice(_))));
    }

    #[tokio::test]
    async fn cumulative_rate_limit_rejects_then_recovers_after_window() {
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FrozenClock::at(0));
        let mut cfg = default_config();
        cfg.max_orders_per_hour = 2;
        let mut b = OrderBook::new(store, clock.clone(), cfg);

        b.submit("w", Side::Bid, 100, 1, 0, None).await.unwrap();
        b.submit("w", Side::Bid, 100, 1, 1, None).await.unwrap();
        let third = b.submit("w", Side::Bid, 100, 1, 2, None).await;
        assert!(matches!(third, Err(CoreError::RateLimited { .. })));

        clock.advance(60 * 60 * 1000 + 1);
        let after_window = b.submit("w", Side::Bid, 100, 1, 3, None).await;
        assert!(after_window.is_ok());
    }

    #[tokio::test]
    async fn relist_cooldown_blocks_immediate_recreate_at_same_price() {
        let mut b = book(0);
        let placed = b.submit("w", Side::Ask, 500, 5, 0, None).await.unwrap();
        let id = placed.resting_order.unwrap().id;
        b.cancel(&id).await.unwrap();
        let retry = b.submit("w", Side::Ask, 500, 5, 1, None).await;
        assert!(matches!(retry, Err(CoreError::RelistCooldown { .. })));
    }
}
