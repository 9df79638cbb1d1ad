//! The reserve -> commit -> finalize scenario from spec.md §8, plus the
//! concurrent-commit-contention scenario.

use std::sync::Arc;

use meterflow_core::clock::{Clock, FrozenClock};
use meterflow_core::credit::CreditLedger;
use meterflow_core::error::CoreError;
use meterflow_core::events::EventStore;
use meterflow_core::money::MicroUsd;
use meterflow_core::store::memory::InMemoryStore;
use meterflow_core::store::SharedStore;
use meterflow_core::wal::Wal;
use meterflow_core::BillingStateMachine;

async fn harness(dir: &std::path::Path) -> (BillingStateMachine, Arc<dyn SharedStore>) {
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(FrozenClock::at(1_700_000_000_000));
    let wal = Arc::new(
        Wal::open(dir.join("wal"), 1024 * 1024, store.clone(), clock.clone(), "writer-1", 30)
            .await
            .unwrap(),
    );
    let events = Arc::new(EventStore::open(dir.join("events"), 1024 * 1024).unwrap());
    (BillingStateMachine::new(wal, events, store.clone(), clock, 30), store)
}

#[tokio::test]
async fn reserve_commit_finalize_matches_literal_scenario() {
    let tmp = tempfile::tempdir().unwrap();
    let (machine, _store) = harness(tmp.path()).await;

    let entry = machine.reserve("A", MicroUsd(1_000), "c1").await.unwrap();
    assert_eq!(entry.estimated_cost, MicroUsd(1_000));

    let committed = machine.commit(&entry.entry_id, MicroUsd(800), "c1").await.unwrap();
    assert_eq!(committed.actual_cost, Some(MicroUsd(800)));

    let finalized = machine.finalize_ack(&entry.entry_id, "c1").await.unwrap();
    assert_eq!(finalized.state.as_str(), "finalized");
}

#[tokio::test]
async fn concurrent_commit_contention_never_appends_twice() {
    let tmp = tempfile::tempdir().unwrap();
    let (machine, store) = harness(tmp.path()).await;
    let entry = machine.reserve("A", MicroUsd(1_000), "c1").await.unwrap();

    // Pre-hold the entry lock the way a concurrent in-flight commit would.
    let keys = vec![format!("billing:lock:{}", entry.entry_id)];
    let args = vec!["someone-else".to_string(), "30".to_string()];
    let acquired = store
        .eval(meterflow_core::store::scripts::BILLING_LOCK_ACQUIRE, 1, &keys, &args)
        .await
        .unwrap();
    assert_eq!(acquired.as_int(), Some(1));

    let result = machine.commit(&entry.entry_id, MicroUsd(500), "c2").await;
    assert!(matches!(result, Err(CoreError::LockContention { .. })));
}

#[tokio::test]
async fn void_is_audit_logged_and_only_reachable_from_terminal_states() {
    let tmp = tempfile::tempdir().unwrap();
    let (machine, _store) = harness(tmp.path()).await;
    let entry = machine.reserve("A", MicroUsd(1_000), "c1").await.unwrap();
    let committed = machine.commit(&entry.entry_id, MicroUsd(900), "c1").await.unwrap();
    let finalized = machine.finalize_ack(&committed.entry_id, "c1").await.unwrap();
    let voided = machine.void(&finalized.entry_id, "refund requested", "operator-1", "c1").await.unwrap();
    assert_eq!(voided.state.as_str(), "voided");

    let second_void = machine.void(&voided.entry_id, "again", "operator-1", "c1").await.unwrap();
    assert_eq!(second_void.state.as_str(), "voided");
}

#[tokio::test]
async fn credit_ledger_runs_alongside_billing_on_the_same_wal() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(FrozenClock::at(0));
    let wal = Arc::new(
        Wal::open(tmp.path().join("wal"), 1024 * 1024, store.clone(), clock.clone(), "writer-1", 30)
            .await
            .unwrap(),
    );
    let events = Arc::new(EventStore::open(tmp.path().join("events"), 1024 * 1024).unwrap());
    let billing = BillingStateMachine::new(wal.clone(), events.clone(), store.clone(), clock.clone(), 30);
    let credit = CreditLedger::new(store, wal, events);

    billing.reserve("A", MicroUsd(1_000), "c1").await.unwrap();
    credit.create_account("A", "pro", 5_000, "idem1").await.unwrap();

    // Sequences interleave on the shared WAL but each subsystem only
    // cares about its own envelopes' relative order.
    assert!(credit.balances("A").await.unwrap().allocated == 5_000);
}
