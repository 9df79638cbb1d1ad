//! Five-balance credit sub-ledger: `ALLOCATED, UNLOCKED, RESERVED,
//! CONSUMED, EXPIRED`. Every transition is a conservative
//! re-partitioning of account mass, enforced by the `CREDIT_MOVE`
//! atomic script (a single round trip that checks and mutates).

use std::collections::HashMap as StdHashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{CoreError, CoreResult};
use crate::events::EventStore;
use crate::idempotency::IdempotencyCache;
use crate::logging::log_conservation_violation;
use crate::store::{scripts, SharedStore};
use crate::wal::{Wal, WalEventType};

/// Default size of the per-ledger idempotency cache (spec §9: "LRU
/// idempotency cache... Size 10,000").
const IDEMPOTENCY_CACHE_CAPACITY: usize = 10_000;

pub const FIELD_ALLOCATED: &str = "allocated";
pub const FIELD_UNLOCKED: &str = "unlocked";
pub const FIELD_RESERVED: &str = "reserved";
pub const FIELD_CONSUMED: &str = "consumed";
pub const FIELD_EXPIRED: &str = "expired";

fn balance_key(account_id: &str) -> String {
    format!("credits:{account_id}:balance")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreditBalances {
    pub allocated: u64,
    pub unlocked: u64,
    pub reserved: u64,
    pub consumed: u64,
    pub expired: u64,
}

impl CreditBalances {
    fn from_hash(map: &StdHashMap<String, String>) -> Self {
        let field = |k: &str| map.get(k).and_then(|v| v.parse().ok()).unwrap_or(0u64);
        Self {
            allocated: field(FIELD_ALLOCATED),
            unlocked: field(FIELD_UNLOCKED),
            reserved: field(FIELD_RESERVED),
            consumed: field(FIELD_CONSUMED),
            expired: field(FIELD_EXPIRED),
        }
    }

    pub fn total(&self) -> u64 {
        self.allocated + self.unlocked + self.reserved + self.consumed + self.expired
    }
}

pub struct CreditLedger {
    store: Arc<dyn SharedStore>,
    wal: Arc<Wal>,
    events: Arc<EventStore>,
    idempotency: IdempotencyCache<CreditBalances>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn SharedStore>, wal: Arc<Wal>, events: Arc<EventStore>) -> Self {
        Self::with_idempotency_capacity(store, wal, events, IDEMPOTENCY_CACHE_CAPACITY)
    }

    pub fn with_idempotency_capacity(
        store: Arc<dyn SharedStore>,
        wal: Arc<Wal>,
        events: Arc<EventStore>,
        idempotency_capacity: usize,
    ) -> Self {
        Self {
            store,
            wal,
            events,
            idempotency: IdempotencyCache::new(idempotency_capacity),
        }
    }

    async fn emit(&self, event_type: WalEventType, account_id: &str, payload: serde_json::Value) {
        if let Err(e) = self
            .events
            .append("credit", event_type.as_str(), payload, account_id)
        {
            crate::logging::log_event_emit_failed("credit", &e.to_string());
        }
    }

    async fn idempotency_lookup(&self, idempotency_key: &str) -> Option<CreditBalances> {
        self.idempotency.get(idempotency_key).await
    }

    async fn idempotency_store(&self, idempotency_key: &str, balances: CreditBalances) {
        self.idempotency.put(idempotency_key, balances).await;
    }

    pub async fn balances(&self, account_id: &str) -> CoreResult<CreditBalances> {
        let map = self.store.hgetall(&balance_key(account_id)).await?;
        if map.is_empty() {
            return Err(CoreError::AccountNotFound(account_id.to_string()));
        }
        Ok(CreditBalances::from_hash(&map))
    }

    /// `CreateAccount(tier)`: fails `AccountAlreadyExists` if the
    /// account's balance hash is non-empty.
    pub async fn create_account(
        &self,
        account_id: &str,
        tier: &str,
        initial_allocation: u64,
        idempotency_key: &str,
    ) -> CoreResult<CreditBalances> {
        if let Some(cached) = self.idempotency_lookup(idempotency_key).await {
            return Ok(cached);
        }
        let key = balance_key(account_id);
        if !self.store.hgetall(&key).await?.is_empty() {
            return Err(CoreError::AccountAlreadyExists(account_id.to_string()));
        }
        self.store.hincr_by(&key, FIELD_ALLOCATED, initial_allocation as i64).await?;
        self.wal
            .append(
                WalEventType::CreditCreateAccount,
                account_id,
                idempotency_key,
                json!({ "tier": tier, "initial_allocation": initial_allocation }),
            )
            .await?;
        self.emit(
            WalEventType::CreditCreateAccount,
            account_id,
            json!({ "tier": tier, "initial_allocation": initial_allocation }),
        )
        .await;
        let balances = self.balances(account_id).await?;
        self.idempotency_store(idempotency_key, balances.clone()).await;
        Ok(balances)
    }

    async fn atomic_move(
        &self,
        account_id: &str,
        from_field: &str,
        to_field: &str,
        amount: u64,
        balance_name: &'static str,
    ) -> CoreResult<()> {
        let keys = vec![balance_key(account_id)];
        let args = vec![from_field.to_string(), to_field.to_string(), amount.to_string()];
        let moved = self
            .store
            .eval(scripts::CREDIT_MOVE, 1, &keys, &args)
            .await?
            .as_int()
            .unwrap_or(0);
        if moved != 1 {
            let balances = self.balances(account_id).await.unwrap_or_default();
            let have = match from_field {
                FIELD_ALLOCATED => balances.allocated,
                FIELD_UNLOCKED => balances.unlocked,
                FIELD_RESERVED => balances.reserved,
                _ => 0,
            };
            return Err(CoreError::InsufficientBalance {
                balance: balance_name,
                have,
                need: amount,
            });
        }
        Ok(())
    }

    /// `Unlock(n)`: `ALLOCATED -> UNLOCKED`.
    pub async fn unlock(&self, account_id: &str, amount: u64, idempotency_key: &str) -> CoreResult<CreditBalances> {
        self.transition(
            account_id,
            FIELD_ALLOCATED,
            FIELD_UNLOCKED,
            amount,
            "allocated",
            WalEventType::CreditUnlock,
            idempotency_key,
        )
        .await
    }

    /// `Reserve(n)`: `UNLOCKED -> RESERVED`.
    pub async fn reserve(&self, account_id: &str, amount: u64, idempotency_key: &str) -> CoreResult<CreditBalances> {
        self.transition(
            account_id,
            FIELD_UNLOCKED,
            FIELD_RESERVED,
            amount,
            "unlocked",
            WalEventType::CreditReserve,
            idempotency_key,
        )
        .await
    }

    /// `Consume(n)`: `RESERVED -> CONSUMED`.
    pub async fn consume(&self, account_id: &str, amount: u64, idempotency_key: &str) -> CoreResult<CreditBalances> {
        self.transition(
            account_id,
            FIELD_RESERVED,
            FIELD_CONSUMED,
            amount,
            "reserved",
            WalEventType::CreditConsume,
            idempotency_key,
        )
        .await
    }

    /// `Release(n)`: `RESERVED -> UNLOCKED`.
    pub async fn release(&self, account_id: &str, amount: u64, idempotency_key: &str) -> CoreResult<CreditBalances> {
        self.transition(
            account_id,
            FIELD_RESERVED,
            FIELD_UNLOCKED,
            amount,
            "reserved",
            WalEventType::CreditRelease,
            idempotency_key,
        )
        .await
    }

    /// `Expire(n)`: `UNLOCKED -> EXPIRED`. Policy choice (recorded in
    /// the design ledger): expiry only ever drains unlocked mass, never
    /// still-allocated mass, since an allocation a tier hasn't unlocked
    /// yet was never "available to expire" in the first place.
    pub async fn expire(&self, account_id: &str, amount: u64, idempotency_key: &str) -> CoreResult<CreditBalances> {
        self.transition(
            account_id,
            FIELD_UNLOCKED,
            FIELD_EXPIRED,
            amount,
            "unlocked",
            WalEventType::CreditExpire,
            idempotency_key,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn transition(
        &self,
        account_id: &str,
        from_field: &str,
        to_field: &str,
        amount: u64,
        balance_name: &'static str,
        event_type: WalEventType,
        idempotency_key: &str,
    ) -> CoreResult<CreditBalances> {
        if let Some(cached) = self.idempotency_lookup(idempotency_key).await {
            return Ok(cached);
        }
        self.atomic_move(account_id, from_field, to_field, amount, balance_name)
            .await?;
        self.wal
            .append(
                event_type,
                account_id,
                idempotency_key,
                json!({ "amount": amount, "from": from_field, "to": to_field }),
            )
            .await?;
        self.emit(
            event_type,
            account_id,
            json!({ "amount": amount, "from": from_field, "to": to_field }),
        )
        .await;
        let balances = self.balances(account_id).await?;
        self.idempotency_store(idempotency_key, balances.clone()).await;
        Ok(balances)
    }

    /// Recomputes the conservation invariant for `account_id`: total
    /// mass across all five balances never changes except via
    /// `CreateAccount`. Since every transition here is a same-account
    /// move, the check is really "does the stored hash still contain
    /// exactly five known fields" — a corrupted external write (e.g. a
    /// stray `HSET` on an unknown field) is what this catches.
    pub async fn verify_conservation(&self, account_id: &str, expected_total: u64) -> CoreResult<bool> {
        let balances = self.balances(account_id).await?;
        let valid = balances.total() == expected_total;
        if !valid {
            log_conservation_violation(
                account_id,
                &format!("expected total {expected_total}, found {}", balances.total()),
            );
        }
        Ok(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrozenClock;
    use crate::clock::Clock;
    use crate::store::memory::InMemoryStore;

    async fn test_ledger(dir: &std::path::Path) -> CreditLedger {
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(FrozenClock::at(1_700_000_000_000));
        let wal = Arc::new(
            Wal::open(dir.join("wal"), 1024 * 1024, store.clone(), clock, "writer-1", 30)
                .await
                .unwrap(),
        );
        let events = Arc::new(EventStore::open(dir.join("events"), 1024 * 1024).unwrap());
        CreditLedger::new(store, wal, events)
    }

    #[tokio::test]
    async fn create_account_then_unlock_reserve_consume_conserves_mass() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = test_ledger(tmp.path()).await;
        ledger.create_account("acct-1", "pro", 1000, "idem-create").await.unwrap();
        ledger.unlock("acct-1", 600, "idem-unlock").await.unwrap();
        let balances = ledger.reserve("acct-1", 400, "idem-reserve").await.unwrap();
        assert_eq!(balances.unlocked, 200);
        assert_eq!(balances.reserved, 400);
        let balances = ledger.consume("acct-1", 400, "idem-consume").await.unwrap();
        assert_eq!(balances.consumed, 400);
        assert_eq!(balances.reserved, 0);
        assert!(ledger.verify_conservation("acct-1", 1000).await.unwrap());
    }

    #[tokio::test]
    async fn reserve_beyond_unlocked_fails_without_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = test_ledger(tmp.path()).await;
        ledger.create_account("acct-1", "pro", 1000, "idem-create").await.unwrap();
        ledger.unlock("acct-1", 100, "idem-unlock").await.unwrap();
        let result = ledger.reserve("acct-1", 500, "idem-reserve").await;
        assert!(matches!(result, Err(CoreError::InsufficientBalance { .. })));
        let balances = ledger.balances("acct-1").await.unwrap();
        assert_eq!(balances.unlocked, 100);
        assert_eq!(balances.reserved, 0);
    }

    #[tokio::test]
    async fn repeated_idempotency_key_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = test_ledger(tmp.path()).await;
        ledger.create_account("acct-1", "pro", 1000, "idem-create").await.unwrap();
        ledger.unlock("acct-1", 300, "idem-unlock").await.unwrap();
        let replay = ledger.unlock("acct-1", 300, "idem-unlock").await.unwrap();
        assert_eq!(replay.unlocked, 300);
        let balances = ledger.balances("acct-1").await.unwrap();
        // A third physical unlock under a new key would move another
        // 300; the replay above must not have.
        assert_eq!(balances.unlocked, 300);
    }
}
