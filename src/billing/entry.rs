//! The billing entry and its state machine's six states.

use serde::{Deserialize, Serialize};

use crate::money::MicroUsd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingState {
    ReserveHeld,
    FinalizePending,
    Finalized,
    FinalizeFailed,
    Released,
    Voided,
}

impl BillingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingState::ReserveHeld => "reserve_held",
            BillingState::FinalizePending => "finalize_pending",
            BillingState::Finalized => "finalized",
            BillingState::FinalizeFailed => "finalize_failed",
            BillingState::Released => "released",
            BillingState::Voided => "voided",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEntry {
    pub entry_id: String,
    pub account_id: String,
    pub state: BillingState,
    pub estimated_cost: MicroUsd,
    pub actual_cost: Option<MicroUsd>,
    /// Micro-USD price per 1,000,000 priced units (tokens or credits),
    /// frozen at `Reserve` time and never updated afterward — later
    /// rate changes must not retroactively reprice an in-flight entry.
    pub exchange_rate_micro: u64,
    pub finalize_attempts: u32,
    pub correlation_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    /// Pointer into the WAL: the `wal_sequence` of this entry's most
    /// recent transition envelope.
    pub wal_offset: Option<u64>,
}
