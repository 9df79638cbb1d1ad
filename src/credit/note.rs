//! Credit-note compensation: when a commit has already moved money but
//! downstream inference fails, issue a credit note for the full or
//! residual amount, under a per-wallet daily cap checked atomically
//! before the note is persisted.
//!
//! The cap window is a rolling 24h bucket keyed by wallet rather than a
//! calendar-day bucket; see DESIGN.md for why.

use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::ids::new_entry_id;
use crate::money::MicroUsd;
use crate::store::{scripts, SharedStore};

const CAP_WINDOW_SECS: u64 = 24 * 60 * 60;

fn daily_key(wallet: &str) -> String {
    format!("cn:wallet:{wallet}:daily")
}

fn note_key(note_id: &str) -> String {
    format!("cn:note:{note_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditNote {
    pub id: String,
    pub wallet: String,
    pub amount: MicroUsd,
    pub reason: String,
    pub issued_at: i64,
}

pub struct CreditNoteIssuer {
    store: Arc<dyn SharedStore>,
    daily_cap_micro: u64,
}

impl CreditNoteIssuer {
    pub fn new(store: Arc<dyn SharedStore>, daily_cap_micro: u64) -> Self {
        Self { store, daily_cap_micro }
    }

    /// Atomically checks the wallet's rolling-24h cap before persisting
    /// anything; rejects `CAP_EXCEEDED` with no note ever written.
    /// Note ids embed a random suffix so concurrent issuance can never
    /// collide even within the same millisecond.
    pub async fn issue(&self, wallet: &str, amount: MicroUsd, reason: &str, now_ms: i64) -> CoreResult<CreditNote> {
        let keys = vec![daily_key(wallet)];
        let args = vec![
            amount.0.to_string(),
            self.daily_cap_micro.to_string(),
            CAP_WINDOW_SECS.to_string(),
        ];
        let ok = self
            .store
            .eval(scripts::CREDIT_NOTE_CAP_CHECK, 1, &keys, &args)
            .await?
            .as_int()
            .unwrap_or(0);
        if ok != 1 {
            return Err(CoreError::CapExceeded {
                wallet: wallet.to_string(),
            });
        }

        let mut suffix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut suffix);
        let note_id = format!("{}-{}", new_entry_id(now_ms), hex::encode(suffix));
        let note = CreditNote {
            id: note_id.clone(),
            wallet: wallet.to_string(),
            amount,
            reason: reason.to_string(),
            issued_at: now_ms,
        };
        let serialized = serde_json::to_string(&note)?;
        self.store.set(&note_key(&note_id), &serialized, None).await?;
        Ok(note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    #[tokio::test]
    async fn issues_under_cap() {
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let issuer = CreditNoteIssuer::new(store, 1_000_000);
        let note = issuer.issue("0xabc", MicroUsd(500_000), "inference_failed", 0).await.unwrap();
        assert_eq!(note.wallet, "0xabc");
        assert_eq!(note.amount, MicroUsd(500_000));
    }

    #[tokio::test]
    async fn rejects_before_persisting_once_cap_exceeded() {
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let issuer = CreditNoteIssuer::new(store, 1_000_000);
        issuer.issue("0xabc", MicroUsd(700_000), "r1", 0).await.unwrap();
        let second = issuer.issue("0xabc", MicroUsd(700_000), "r2", 1).await;
        assert!(matches!(second, Err(CoreError::CapExceeded { .. })));
    }

    #[tokio::test]
    async fn concurrent_note_ids_never_collide() {
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let issuer = CreditNoteIssuer::new(store, 10_000_000);
        let n1 = issuer.issue("0xabc", MicroUsd(1), "r", 1000).await.unwrap();
        let n2 = issuer.issue("0xabc", MicroUsd(1), "r", 1000).await.unwrap();
        assert_ne!(n1.id, n2.id);
    }
}
