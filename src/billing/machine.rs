//! The billing state machine: `Reserve -> Commit -> FinalizeAck/Fail`,
//! with `Release` and `Void` as the escape hatches, one WAL envelope
//! per transition, and idempotent replay keyed on correlation id.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventEnvelope, EventStore};
use crate::ids::new_entry_id;
use crate::logging::log_billing_transition;
use crate::money::MicroUsd;
use crate::store::{scripts, SharedStore};
use crate::wal::{Wal, WalEventType};

use super::entry::{BillingEntry, BillingState};

fn lock_key(entry_id: &str) -> String {
    format!("billing:lock:{entry_id}")
}

pub struct BillingStateMachine {
    wal: Arc<Wal>,
    events: Arc<EventStore>,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    lock_ttl_secs: u64,
    entries: Mutex<HashMap<String, BillingEntry>>,
}

impl BillingStateMachine {
    pub fn new(
        wal: Arc<Wal>,
        events: Arc<EventStore>,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        lock_ttl_secs: u64,
    ) -> Self {
        Self {
            wal,
            events,
            store,
            clock,
            lock_ttl_secs,
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire_entry_lock(&self, entry_id: &str, correlation_id: &str) -> CoreResult<()> {
        let keys = vec![lock_key(entry_id)];
        let args = vec![correlation_id.to_string(), self.lock_ttl_secs.to_string()];
        let acquired = self
            .store
            .eval(scripts::BILLING_LOCK_ACQUIRE, 1, &keys, &args)
            .await?
            .as_int()
            .unwrap_or(0);
        if acquired != 1 {
            return Err(CoreError::LockContention {
                entry_id: entry_id.to_string(),
            });
        }
        Ok(())
    }

    /// Released on every exit path of the calling transition, success
    /// or failure alike — callers must hold onto the `CoreResult` they
    /// computed under the lock and release before returning it.
    async fn release_entry_lock(&self, entry_id: &str, correlation_id: &str) {
        let keys = vec![lock_key(entry_id)];
        let args = vec![correlation_id.to_string()];
        let _ = self.store.eval(scripts::BILLING_LOCK_RELEASE, 1, &keys, &args).await;
    }

    async fn append_and_mirror(
        &self,
        event_type: WalEventType,
        entry_id: &str,
        correlation_id: &str,
        payload: serde_json::Value,
    ) -> CoreResult<u64> {
        let envelope = self
            .wal
            .append(event_type, entry_id, correlation_id, payload)
            .await?;
        self.events.emit_billing_mirror(&EventEnvelope::from_wal(&envelope));
        Ok(envelope.wal_sequence)
    }

    /// `Reserve`: account exists, `estimated_cost >= 0` (enforced by
    /// the type). No per-entry lock yet — the entry does not exist
    /// until this call creates it. `exchange_rate_micro` (micro-USD per
    /// 1,000,000 priced units) is frozen onto the entry for its entire
    /// lifetime; use [`Self::reserve`] for the common case of a fiat
    /// request priced directly in micro-USD (rate `1_000_000`, i.e. 1:1).
    pub async fn reserve_with_rate(
        &self,
        account_id: &str,
        estimated_cost: MicroUsd,
        exchange_rate_micro: u64,
        correlation_id: &str,
    ) -> CoreResult<BillingEntry> {
        let now = self.clock.now_ms();
        let entry_id = new_entry_id(now);
        let mut entry = BillingEntry {
            entry_id: entry_id.clone(),
            account_id: account_id.to_string(),
            state: BillingState::ReserveHeld,
            estimated_cost,
            actual_cost: None,
            exchange_rate_micro,
            finalize_attempts: 0,
            correlation_id: correlation_id.to_string(),
            created_at: now,
            updated_at: now,
            wal_offset: None,
        };
        let seq = self
            .append_and_mirror(
                WalEventType::BillingReserve,
                &entry_id,
                correlation_id,
                json!({
                    "account_id": account_id,
                    "estimated_cost": estimated_cost,
                    "exchange_rate_micro": exchange_rate_micro,
                }),
            )
            .await?;
        entry.wal_offset = Some(seq);
        self.entries.lock().await.insert(entry_id.clone(), entry.clone());
        log_billing_transition(&entry_id, correlation_id, "-", entry.state.as_str());
        Ok(entry)
    }

    /// `Reserve` at a 1:1 micro-USD exchange rate, the common case for a
    /// request already priced in fiat.
    pub async fn reserve(
        &self,
        account_id: &str,
        estimated_cost: MicroUsd,
        correlation_id: &str,
    ) -> CoreResult<BillingEntry> {
        self.reserve_with_rate(account_id, estimated_cost, crate::money::MICROS_PER_USD, correlation_id)
            .await
    }

    fn get(&self, entries: &HashMap<String, BillingEntry>, entry_id: &str) -> CoreResult<BillingEntry> {
        entries
            .get(entry_id)
            .cloned()
            .ok_or_else(|| CoreError::EntryNotFound(entry_id.to_string()))
    }

    /// `Commit(actual)`: `RESERVE_HELD -> FINALIZE_PENDING`, guarded by
    /// `actual <= estimated`. Idempotent on replay with the same
    /// correlation id; `CorrelationMismatch` on a different one.
    pub async fn commit(
        &self,
        entry_id: &str,
        actual_cost: MicroUsd,
        correlation_id: &str,
    ) -> CoreResult<BillingEntry> {
        self.acquire_entry_lock(entry_id, correlation_id).await?;
        let result = self.commit_locked(entry_id, actual_cost, correlation_id).await;
        self.release_entry_lock(entry_id, correlation_id).await;
        result
    }

    async fn commit_locked(
        &self,
        entry_id: &str,
        actual_cost: MicroUsd,
        correlation_id: &str,
    ) -> CoreResult<BillingEntry> {
        let mut entries = self.entries.lock().await;
        let entry = self.get(&entries, entry_id)?;
        if entry.state == BillingState::FinalizePending {
            if entry.correlation_id == correlation_id {
                return Ok(entry);
            }
            return Err(CoreError::CorrelationMismatch {
                expected: entry.correlation_id,
                got: correlation_id.to_string(),
            });
        }
        if entry.state != BillingState::ReserveHeld {
            return Err(CoreError::InvalidState(format!("commit from {}", entry.state.as_str())));
        }
        if actual_cost > entry.estimated_cost {
            return Err(CoreError::InvalidState(
                "actual_cost exceeds estimated_cost".to_string(),
            ));
        }
        let seq = self
            .append_and_mirror(
                WalEventType::BillingCommit,
                entry_id,
                correlation_id,
                json!({ "actual_cost": actual_cost }),
            )
            .await?;
        let mut updated = entry;
        updated.state = BillingState::FinalizePending;
        updated.actual_cost = Some(actual_cost);
        updated.correlation_id = correlation_id.to_string();
        updated.updated_at = self.clock.now_ms();
        updated.wal_offset = Some(seq);
        entries.insert(entry_id.to_string(), updated.clone());
        log_billing_transition(entry_id, correlation_id, "reserve_held", updated.state.as_str());
        Ok(updated)
    }

    /// `Release(reason)`: `RESERVE_HELD -> RELEASED`.
    pub async fn release(
        &self,
        entry_id: &str,
        reason: &str,
        correlation_id: &str,
    ) -> CoreResult<BillingEntry> {
        self.acquire_entry_lock(entry_id, correlation_id).await?;
        let result = self.release_locked(entry_id, reason, correlation_id).await;
        self.release_entry_lock(entry_id, correlation_id).await;
        result
    }

    async fn release_locked(
        &self,
        entry_id: &str,
        reason: &str,
        correlation_id: &str,
    ) -> CoreResult<BillingEntry> {
        let mut entries = self.entries.lock().await;
        let entry = self.get(&entries, entry_id)?;
        if entry.state == BillingState::Released {
            return Ok(entry);
        }
        if entry.state != BillingState::ReserveHeld {
            return Err(CoreError::InvalidState(format!("release from {}", entry.state.as_str())));
        }
        let seq = self
            .append_and_mirror(
                WalEventType::BillingRelease,
                entry_id,
                correlation_id,
                json!({ "reason": reason }),
            )
            .await?;
        let mut updated = entry;
        updated.state = BillingState::Released;
        updated.updated_at = self.clock.now_ms();
        updated.wal_offset = Some(seq);
        entries.insert(entry_id.to_string(), updated.clone());
        log_billing_transition(entry_id, correlation_id, "reserve_held", updated.state.as_str());
        Ok(updated)
    }

    /// `FinalizeAck`: `FINALIZE_PENDING -> FINALIZED`.
    pub async fn finalize_ack(&self, entry_id: &str, correlation_id: &str) -> CoreResult<BillingEntry> {
        self.acquire_entry_lock(entry_id, correlation_id).await?;
        let result = self.finalize_ack_locked(entry_id, correlation_id).await;
        self.release_entry_lock(entry_id, correlation_id).await;
        result
    }

    async fn finalize_ack_locked(&self, entry_id: &str, correlation_id: &str) -> CoreResult<BillingEntry> {
        let mut entries = self.entries.lock().await;
        let entry = self.get(&entries, entry_id)?;
        if entry.state == BillingState::Finalized {
            return Ok(entry);
        }
        if entry.state != BillingState::FinalizePending {
            return Err(CoreError::InvalidState(format!(
                "finalize_ack from {}",
                entry.state.as_str()
            )));
        }
        let seq = self
            .append_and_mirror(WalEventType::BillingFinalizeAck, entry_id, correlation_id, json!({}))
            .await?;
        let mut updated = entry;
        updated.state = BillingState::Finalized;
        updated.updated_at = self.clock.now_ms();
        updated.wal_offset = Some(seq);
        entries.insert(entry_id.to_string(), updated.clone());
        log_billing_transition(entry_id, correlation_id, "finalize_pending", updated.state.as_str());
        Ok(updated)
    }

    /// `FinalizeFail`: `FINALIZE_PENDING -> FINALIZE_FAILED`, bumping
    /// `finalize_attempts`.
    pub async fn finalize_fail(&self, entry_id: &str, correlation_id: &str) -> CoreResult<BillingEntry> {
        self.acquire_entry_lock(entry_id, correlation_id).await?;
        let result = self.finalize_fail_locked(entry_id, correlation_id).await;
        self.release_entry_lock(entry_id, correlation_id).await;
        result
    }

    async fn finalize_fail_locked(&self, entry_id: &str, correlation_id: &str) -> CoreResult<BillingEntry> {
        let mut entries = self.entries.lock().await;
        let entry = self.get(&entries, entry_id)?;
        if entry.state != BillingState::FinalizePending {
            return Err(CoreError::InvalidState(format!(
                "finalize_fail from {}",
                entry.state.as_str()
            )));
        }
        let attempts = entry.finalize_attempts + 1;
        let seq = self
            .append_and_mirror(
                WalEventType::BillingFinalizeFail,
                entry_id,
                correlation_id,
                json!({ "finalize_attempts": attempts }),
            )
            .await?;
        let mut updated = entry;
        updated.state = BillingState::FinalizeFailed;
        updated.finalize_attempts = attempts;
        updated.updated_at = self.clock.now_ms();
        updated.wal_offset = Some(seq);
        entries.insert(entry_id.to_string(), updated.clone());
        log_billing_transition(entry_id, correlation_id, "finalize_pending", updated.state.as_str());
        Ok(updated)
    }

    /// `Void(reason, actor)`: `FINALIZED | FINALIZE_FAILED -> VOIDED`.
    pub async fn void(
        &self,
        entry_id: &str,
        reason: &str,
        actor: &str,
        correlation_id: &str,
    ) -> CoreResult<BillingEntry> {
        self.acquire_entry_lock(entry_id, correlation_id).await?;
        let result = self.void_locked(entry_id, reason, actor, correlation_id).await;
        self.release_entry_lock(entry_id, correlation_id).await;
        result
    }

    async fn void_locked(
        &self,
        entry_id: &str,
        reason: &str,
        actor: &str,
        correlation_id: &str,
    ) -> CoreResult<BillingEntry> {
        let mut entries = self.entries.lock().await;
        let entry = self.get(&entries, entry_id)?;
        if entry.state == BillingState::Voided {
            return Ok(entry);
        }
        if !matches!(entry.state, BillingState::Finalized | BillingState::FinalizeFailed) {
            return Err(CoreError::InvalidState(format!("void from {}", entry.state.as_str())));
        }
        let seq = self
            .append_and_mirror(
                WalEventType::BillingVoid,
                entry_id,
                correlation_id,
                json!({ "reason": reason, "actor": actor }),
            )
            .await?;
        let from = entry.state.as_str();
        let mut updated = entry;
        updated.state = BillingState::Voided;
        updated.updated_at = self.clock.now_ms();
        updated.wal_offset = Some(seq);
        entries.insert(entry_id.to_string(), updated.clone());
        log_billing_transition(entry_id, correlation_id, from, updated.state.as_str());
        Ok(updated)
    }

    pub async fn get_entry(&self, entry_id: &str) -> CoreResult<BillingEntry> {
        let entries = self.entries.lock().await;
        self.get(&entries, entry_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrozenClock;
    use crate::events::EventStore;
    use crate::store::memory::InMemoryStore;

    async fn test_machine(dir: &std::path::Path) -> BillingStateMachine {
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(FrozenClock::at(1_700_000_000_000));
        let wal = Arc::new(
            Wal::open(
                dir.join("wal"),
                1024 * 1024,
                store.clone(),
                clock.clone(),
                "writer-1",
                30,
            )
            .await
            .unwrap(),
        );
        let events = Arc::new(EventStore::open(dir.join("events"), 1024 * 1024).unwrap());
        BillingStateMachine::new(wal, events, store, clock, 30)
    }

    #[tokio::test]
    async fn reserve_commit_finalize_ack_happy_path() {
        let tmp = tempfile::tempdir().unwrap();
        let machine = test_machine(tmp.path()).await;
        let entry = machine
            .reserve("acct-1", MicroUsd(1000), "corr-1")
            .await
            .unwrap();
        assert_eq!(entry.state, BillingState::ReserveHeld);

        let committed = machine.commit(&entry.entry_id, MicroUsd(800), "corr-2").await.unwrap();
        assert_eq!(committed.state, BillingState::FinalizePending);
        assert_eq!(committed.actual_cost, Some(MicroUsd(800)));

        let finalized = machine.finalize_ack(&entry.entry_id, "corr-3").await.unwrap();
        assert_eq!(finalized.state, BillingState::Finalized);
    }

    #[tokio::test]
    async fn commit_exceeding_estimate_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let machine = test_machine(tmp.path()).await;
        let entry = machine.reserve("acct-1", MicroUsd(100), "corr-1").await.unwrap();
        let result = machine.commit(&entry.entry_id, MicroUsd(200), "corr-2").await;
        assert!(matches!(result, Err(CoreError::InvalidState(_))));
    }

    #[tokio::test]
    async fn commit_replay_with_same_correlation_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let machine = test_machine(tmp.path()).await;
        let entry = machine.reserve("acct-1", MicroUsd(1000), "corr-1").await.unwrap();
        let first = machine.commit(&entry.entry_id, MicroUsd(800), "corr-2").await.unwrap();
        let second = machine.commit(&entry.entry_id, MicroUsd(800), "corr-2").await.unwrap();
        assert_eq!(first.actual_cost, second.actual_cost);
    }

    #[tokio::test]
    async fn commit_replay_with_different_correlation_mismatches() {
        let tmp = tempfile::tempdir().unwrap();
        let machine = test_machine(tmp.path()).await;
        let entry = machine.reserve("acct-1", MicroUsd(1000), "corr-1").await.unwrap();
        machine.commit(&entry.entry_id, MicroUsd(800), "corr-2").await.unwrap();
        let result = machine.commit(&entry.entry_id, MicroUsd(800), "corr-different").await;
        assert!(matches!(result, Err(CoreError::CorrelationMismatch { .. })));
    }

    #[tokio::test]
    async fn void_requires_finalized_or_finalize_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let machine = test_machine(tmp.path()).await;
        let entry = machine.reserve("acct-1", MicroUsd(1000), "corr-1").await.unwrap();
        let result = machine.void(&entry.entry_id, "refund", "operator-1", "corr-2").await;
        assert!(matches!(result, Err(CoreError::InvalidState(_))));
    }

    #[tokio::test]
    async fn reserve_with_rate_freezes_rate_and_advances_wal_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let machine = test_machine(tmp.path()).await;
        let entry = machine
            .reserve_with_rate("acct-1", MicroUsd(1000), 2_000_000, "corr-1")
            .await
            .unwrap();
        assert_eq!(entry.exchange_rate_micro, 2_000_000);
        let reserve_offset = entry.wal_offset.expect("reserve records a wal offset");

        let committed = machine.commit(&entry.entry_id, MicroUsd(900), "corr-2").await.unwrap();
        assert_eq!(committed.exchange_rate_micro, 2_000_000);
        let commit_offset = committed.wal_offset.expect("commit records a wal offset");
        assert!(commit_offset > reserve_offset);
    }
}
