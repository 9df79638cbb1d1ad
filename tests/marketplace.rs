//! Order book and settlement engine wired together: a resting ask gets
//! crossed, escrow is locked ahead of time, and the resulting match
//! settles against it.

use std::sync::Arc;

use meterflow_core::clock::{Clock, FrozenClock};
use meterflow_core::error::CoreError;
use meterflow_core::marketplace::{MatchConfig, Order, OrderBook, Side, SettlementEngine};
use meterflow_core::money::MicroUsd;
use meterflow_core::store::memory::InMemoryStore;
use meterflow_core::store::SharedStore;

fn config() -> MatchConfig {
    MatchConfig {
        lot_size: 100,
        fee_rate_bps: 30,
        min_order_lots: 1,
        max_orders_per_hour: 60,
        rate_limit_window_ms: 60 * 60 * 1000,
        relist_cooldown_ms: 30_000,
    }
}

#[tokio::test]
async fn resting_ask_is_escrowed_then_matched_and_settled() {
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(FrozenClock::at(0));
    let mut book = OrderBook::new(store.clone(), clock.clone(), config());
    let settlement = SettlementEngine::new(store.clone());

    settlement.credit_wallet("seller", 1_000).await.unwrap();
    let placed = book.submit("seller", Side::Ask, 1_000, 10, 0, None).await.unwrap();
    let resting = placed.resting_order.unwrap();
    settlement.lock_credits(&resting, config().lot_size).await.unwrap();

    settlement.credit_usdc("buyer", MicroUsd(1_000_000)).await.unwrap();
    let result = book.submit("buyer", Side::Bid, 1_200, 6, 1, None).await.unwrap();
    assert_eq!(result.matches.len(), 1);
    let m = &result.matches[0];
    assert_eq!(m.lots, 6);
    assert_eq!(m.price_micro, 1_000); // price improvement: aggressor pays resting price

    let settled = settlement.settle(m).await.unwrap();
    assert_eq!(settled.credits_transferred, 600);

    let buyer_credits = settlement.available_credits("buyer").await.unwrap();
    assert_eq!(buyer_credits, 600);
    let escrow = settlement.escrow(&m.settlement.escrow_id).await.unwrap();
    assert_eq!(escrow.credits_remaining, 400);

    let report = settlement.verify_conservation(&["seller", "buyer"], 1_000).await.unwrap();
    assert!(report.valid);
}

#[tokio::test]
async fn settlement_rejects_insufficient_escrow_without_mutating_balances() {
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    let settlement = SettlementEngine::new(store.clone());
    settlement.credit_wallet("seller", 50).await.unwrap();
    let ask = Order::new("a1", "seller", Side::Ask, 1_000, 5, 0, None);
    settlement.lock_credits(&ask, 10).await.unwrap(); // locks 50, exactly what's available

    settlement.credit_usdc("buyer", MicroUsd(1_000_000)).await.unwrap();
    let m = meterflow_core::marketplace::Match {
        id: "m-oversized".to_string(),
        bid_order_id: "b1".to_string(),
        ask_order_id: "a1".to_string(),
        buyer_wallet: "buyer".to_string(),
        seller_wallet: "seller".to_string(),
        price_micro: 1_000,
        lots: 10,
        total_micro: MicroUsd(10_000),
        fee_micro: MicroUsd(30),
        seller_proceeds_micro: MicroUsd(9_970),
        settlement: meterflow_core::marketplace::Settlement {
            credits_to_transfer: 100, // more than the 50 locked
            usdc_to_seller: MicroUsd(9_970),
            usdc_fee: MicroUsd(30),
            escrow_id: "escrow:a1".to_string(),
        },
        matched_at: 0,
    };
    let result = settlement.settle(&m).await;
    assert!(matches!(result, Err(CoreError::EscrowInsufficient { .. })));
    assert_eq!(settlement.available_credits("buyer").await.unwrap(), 0);
}

#[tokio::test]
async fn cancel_then_immediate_relist_at_same_price_is_blocked() {
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(FrozenClock::at(0));
    let mut book = OrderBook::new(store, clock, config());
    let placed = book.submit("w", Side::Bid, 500, 5, 0, None).await.unwrap();
    let id = placed.resting_order.unwrap().id;
    book.cancel(&id).await.unwrap();
    let retry = book.submit("w", Side::Bid, 500, 5, 1, None).await;
    assert!(matches!(retry, Err(CoreError::RelistCooldown { .. })));

    // A different price is unaffected by the cooldown.
    let ok = book.submit("w", Side::Bid, 600, 5, 1, None).await;
    assert!(ok.is_ok());
}
