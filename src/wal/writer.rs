//! The WAL segment manager's writer half: lock acquisition, fencing
//! token validation, sequence assignment, and append. A single writer
//! process owns the active segment at any time; every other process
//! either fails `WalWriterLockHeld` on acquire or `StaleFence` on a
//! later validation once its lease has been stolen.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::ids::SequenceCounter;
use crate::logging::{log_wal_append, Domain, Level};
use crate::segment::SegmentManager;
use crate::store::{scripts, SharedStore};

use super::envelope::{WalEnvelope, WalEventType};

const WAL_LOCK_KEY: &str = "wal:writer:lock";
const WAL_FENCE_KEY: &str = "wal:writer:fence";

#[derive(Debug, Clone, Copy)]
pub struct WalStatus {
    pub sequence: u64,
    pub segment_count: usize,
}

pub struct Wal {
    segments: SegmentManager<WalEnvelope>,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    instance_id: String,
    lock_ttl_secs: u64,
    fence_token: AtomicU64,
    sequence: SequenceCounter,
}

impl Wal {
    pub async fn open(
        dir: impl AsRef<std::path::Path>,
        max_segment_size: u64,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        instance_id: impl Into<String>,
        lock_ttl_secs: u64,
    ) -> CoreResult<Self> {
        let segments = SegmentManager::open(dir, "wal", max_segment_size)?;
        let max_seq = segments.max_sequence()?;
        let wal = Self {
            segments,
            store,
            clock,
            instance_id: instance_id.into(),
            lock_ttl_secs,
            fence_token: AtomicU64::new(0),
            sequence: SequenceCounter::starting_after(max_seq),
        };
        wal.acquire().await?;
        Ok(wal)
    }

    /// Acquires the distributed writer lock and fencing token. Safe to
    /// call again from the same instance: the fence counter still
    /// advances (so a stale holder's cached token is invalidated) even
    /// when the lock itself is already held by someone else.
    pub async fn acquire(&self) -> CoreResult<u64> {
        let keys = vec![WAL_LOCK_KEY.to_string(), WAL_FENCE_KEY.to_string()];
        let args = vec![self.instance_id.clone(), self.lock_ttl_secs.to_string()];
        let result = self
            .store
            .eval(scripts::WAL_LOCK_ACQUIRE, 2, &keys, &args)
            .await?;
        let arr = result
            .as_array()
            .ok_or_else(|| CoreError::SharedStoreUnavailable("malformed lock script result".into()))?;
        let acquired = arr.first().and_then(|v| v.as_int()).unwrap_or(0);
        let fence = arr.get(1).and_then(|v| v.as_int()).unwrap_or(0) as u64;
        self.fence_token.store(fence, Ordering::SeqCst);
        if acquired != 1 {
            return Err(CoreError::WalWriterLockHeld);
        }
        Ok(fence)
    }

    /// Fail-closed fencing validation: any store error is treated as
    /// STALE, never as "assume still valid".
    async fn validate_fence(&self) -> CoreResult<()> {
        let held_by = self
            .store
            .get(WAL_LOCK_KEY)
            .await
            .map_err(|_| CoreError::StaleFence)?;
        match held_by {
            Some(v) if v == self.instance_id => {
                // Heartbeat: refresh the lease while we still hold it.
                let _ = self.store.expire(WAL_LOCK_KEY, self.lock_ttl_secs).await;
                Ok(())
            }
            _ => Err(CoreError::StaleFence),
        }
    }

    pub async fn release(&self) -> CoreResult<()> {
        let keys = vec![WAL_LOCK_KEY.to_string()];
        let args = vec![self.instance_id.clone()];
        self.store
            .eval(scripts::WAL_LOCK_RELEASE, 1, &keys, &args)
            .await?;
        Ok(())
    }

    /// Appends an envelope and returns it (with its assigned
    /// `wal_sequence`) so the caller can mirror it onto the event
    /// stream without duplicating storage semantics.
    pub async fn append(
        &self,
        event_type: WalEventType,
        billing_entry_id: &str,
        correlation_id: &str,
        payload: Value,
    ) -> CoreResult<WalEnvelope> {
        self.validate_fence().await?;
        let seq = self.sequence.next();
        let envelope = WalEnvelope::new(
            event_type,
            self.clock.now_ms(),
            billing_entry_id,
            correlation_id,
            seq,
            payload,
        );
        let line = serde_json::to_string(&envelope)?;
        self.segments.append_line(&line)?;
        log_wal_append(&self.segments.active_segment_id(), seq, event_type.as_str());
        Ok(envelope)
    }

    pub fn replay(&self, from_sequence: u64, visit: impl FnMut(WalEnvelope)) -> CoreResult<()> {
        self.segments.replay(from_sequence, visit)
    }

    pub fn entries_since(&self, from_sequence: u64) -> CoreResult<Vec<WalEnvelope>> {
        self.segments.entries_since(from_sequence)
    }

    pub fn rotate(&self) -> CoreResult<String> {
        let id = self.segments.rotate()?;
        crate::logging::log(
            Level::Info,
            Domain::Wal,
            "rotate",
            crate::logging::obj(&[("segment", crate::logging::v_str(&id))]),
        );
        Ok(id)
    }

    pub fn mark_prunable(&self, segment_ids: &[String]) {
        self.segments.mark_prunable(segment_ids)
    }

    pub fn prune(&self) -> CoreResult<usize> {
        self.segments.prune()
    }

    pub fn compact(&self) -> CoreResult<()> {
        self.segments.compact()
    }

    pub fn status(&self) -> WalStatus {
        WalStatus {
            sequence: self.sequence.peek(),
            segment_count: self.segments.segment_count(),
        }
    }

    pub fn active_segment(&self) -> String {
        self.segments.active_segment_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrozenClock;
    use crate::store::memory::InMemoryStore;
    use serde_json::json;

    async fn test_wal(dir: &std::path::Path) -> Wal {
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(FrozenClock::at(1_700_000_000_000));
        Wal::open(dir, 1024 * 1024, store, clock, "writer-1", 30)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn append_assigns_strictly_monotonic_sequences() {
        let tmp = tempfile::tempdir().unwrap();
        let wal = test_wal(tmp.path()).await;
        let s1 = wal
            .append(WalEventType::BillingReserve, "E1", "c1", json!({"a":1}))
            .await
            .unwrap();
        let s2 = wal
            .append(WalEventType::BillingCommit, "E1", "c1", json!({"a":2}))
            .await
            .unwrap();
        assert!(s2.wal_sequence > s1.wal_sequence);
    }

    #[tokio::test]
    async fn second_writer_fails_to_acquire_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(FrozenClock::at(1_700_000_000_000));
        let _w1 = Wal::open(tmp.path(), 1024 * 1024, store.clone(), clock.clone(), "writer-1", 30)
            .await
            .unwrap();
        let w2 = Wal::open(tmp.path(), 1024 * 1024, store, clock, "writer-2", 30).await;
        assert!(matches!(w2, Err(CoreError::WalWriterLockHeld)));
    }

    #[tokio::test]
    async fn replay_reconstructs_sequence_after_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(FrozenClock::at(1_700_000_000_000));
        {
            let wal = Wal::open(tmp.path(), 1024 * 1024, store.clone(), clock.clone(), "writer-1", 30)
                .await
                .unwrap();
            wal.append(WalEventType::BillingReserve, "E1", "c1", json!({"a":1}))
                .await
                .unwrap();
            wal.append(WalEventType::BillingCommit, "E1", "c1", json!({"a":2}))
                .await
                .unwrap();
            wal.release().await.unwrap();
        }
        let wal2 = Wal::open(tmp.path(), 1024 * 1024, store, clock, "writer-2", 30)
            .await
            .unwrap();
        let entries = wal2.entries_since(0).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].wal_sequence < entries[1].wal_sequence);
        // New writer must continue numbering past what it found.
        let next = wal2
            .append(WalEventType::BillingVoid, "E1", "c1", json!({}))
            .await
            .unwrap();
        assert!(next.wal_sequence > entries[1].wal_sequence);
    }
}
