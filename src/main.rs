//! Demo entry point: wires the shared store, WAL, event stream,
//! billing state machine, credit ledger, and marketplace together
//! using `Config::from_env()`, then runs one reserve -> commit ->
//! finalize cycle plus a sample marketplace match so the wiring can be
//! exercised without a gateway in front of it. The HTTP/dashboard layer
//! that would normally drive these calls lives elsewhere; this binary
//! exists only to prove the core boots and behaves end to end.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use meterflow_core::clock::{Clock, SystemClock};
use meterflow_core::config::Config;
use meterflow_core::credit::CreditLedger;
use meterflow_core::events::EventStore;
use meterflow_core::logging::{self, json_log, obj, v_str, Domain, Level};
use meterflow_core::marketplace::{MatchConfig, OrderBook, Side};
use meterflow_core::money::MicroUsd;
use meterflow_core::store::memory::InMemoryStore;
use meterflow_core::store::SharedStore;
use meterflow_core::wal::Wal;
use meterflow_core::BillingStateMachine;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    json_log(
        "system",
        obj(&[
            ("event", v_str("startup")),
            ("wal_dir", v_str(&cfg.wal_dir)),
            ("events_dir", v_str(&cfg.events_dir)),
        ]),
    );

    // A real deployment wires `store::redis_store::RedisStore::connect`
    // here; the demo uses the in-memory store so it runs without a
    // Redis instance.
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let wal = Arc::new(
        Wal::open(
            &cfg.wal_dir,
            cfg.max_segment_size_bytes,
            store.clone(),
            clock.clone(),
            format!("instance-{}", std::process::id()),
            cfg.wal_writer_lock_ttl_secs,
        )
        .await?,
    );
    let events = Arc::new(EventStore::open(&cfg.events_dir, cfg.max_segment_size_bytes)?);

    let billing = BillingStateMachine::new(
        wal.clone(),
        events.clone(),
        store.clone(),
        clock.clone(),
        cfg.billing_lock_ttl_secs,
    );
    let credit = CreditLedger::with_idempotency_capacity(
        store.clone(),
        wal.clone(),
        events.clone(),
        cfg.idempotency_cache_capacity,
    );

    run_billing_demo(&billing).await?;
    run_credit_demo(&credit).await?;
    run_marketplace_demo(store.clone(), clock.clone(), &cfg).await?;

    let status = wal.status();
    logging::log(
        Level::Info,
        Domain::System,
        "shutdown",
        obj(&[
            ("wal_sequence", json!(status.sequence)),
            ("segment_count", json!(status.segment_count)),
        ]),
    );
    Ok(())
}

async fn run_billing_demo(billing: &BillingStateMachine) -> Result<()> {
    let entry = billing.reserve("acct-demo", MicroUsd(1_000_000), "corr-1").await?;
    let committed = billing.commit(&entry.entry_id, MicroUsd(800_000), "corr-2").await?;
    let finalized = billing.finalize_ack(&committed.entry_id, "corr-3").await?;
    json_log(
        "billing_demo",
        obj(&[
            ("entry_id", v_str(&finalized.entry_id)),
            ("state", v_str(finalized.state.as_str())),
        ]),
    );
    Ok(())
}

async fn run_credit_demo(credit: &CreditLedger) -> Result<()> {
    credit.create_account("acct-demo", "pro", 5_000, "idem-create").await?;
    credit.unlock("acct-demo", 2_000, "idem-unlock").await?;
    let balances = credit.reserve("acct-demo", 500, "idem-reserve").await?;
    let conserved = credit.verify_conservation("acct-demo", 5_000).await?;
    json_log(
        "credit_demo",
        obj(&[
            ("account_id", v_str("acct-demo")),
            ("reserved", json!(balances.reserved)),
            ("conserved", json!(conserved)),
        ]),
    );
    Ok(())
}

async fn run_marketplace_demo(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, cfg: &Config) -> Result<()> {
    let match_config = MatchConfig {
        lot_size: cfg.lot_size,
        fee_rate_bps: cfg.fee_rate_bps,
        min_order_lots: cfg.min_order_lots,
        max_orders_per_hour: cfg.max_orders_per_hour,
        rate_limit_window_ms: cfg.rate_limit_window_ms,
        relist_cooldown_ms: cfg.relist_cooldown_ms,
    };
    let mut book = OrderBook::new(store, clock.clone(), match_config);
    let now = clock.now_ms();
    book.submit("0xseller", Side::Ask, 1_000, 5, now, None).await?;
    let result = book.submit("0xbuyer", Side::Bid, 1_200, 3, now + 1, None).await?;
    json_log(
        "marketplace_demo",
        obj(&[
            ("matches", json!(result.matches.len())),
            ("self_trades_prevented", json!(result.self_trades_prevented)),
        ]),
    );
    Ok(())
}
