//! Crate-wide error taxonomy.
//!
//! Variants map 1:1 onto the error kinds named in the design: invariant
//! violations are fatal, contention/preconditions are caller-visible and
//! mutate nothing, external failures preserve the underlying cause, and
//! corruption kinds are only ever seen during WAL/event replay.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // --- Invariant violations: fatal, operator intervention required ---
    #[error("conservation invariant broken for {subject}: {detail}")]
    ConservationBroken { subject: String, detail: String },

    #[error("writer fencing token is stale, writer must stop accepting appends")]
    StaleFence,

    #[error("WAL writer lock is held by another instance")]
    WalWriterLockHeld,

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    // --- Contention: transient, caller retries or treats as already-done ---
    #[error("lock contention on {entry_id}")]
    LockContention { entry_id: String },

    #[error("idempotent replay of already-applied operation")]
    IdempotencyReplay,

    // --- Preconditions: caller-visible, no mutation occurred ---
    #[error("insufficient {balance} balance: have {have}, need {need}")]
    InsufficientBalance {
        balance: &'static str,
        have: u64,
        need: u64,
    },

    #[error("insufficient USDC: have {have}, need {need}")]
    InsufficientUsdc { have: u64, need: u64 },

    #[error("escrow {escrow_id} has insufficient credits: have {have}, need {need}")]
    EscrowInsufficient {
        escrow_id: String,
        have: u64,
        need: u64,
    },

    #[error("daily credit-note cap exceeded for wallet {wallet}")]
    CapExceeded { wallet: String },

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("order too small: {lots} lots below minimum")]
    OrderTooSmall { lots: u64 },

    #[error("wallet {wallet} is rate limited")]
    RateLimited { wallet: String },

    #[error("order would cross the placer's own resting order")]
    SelfTrade,

    #[error("wallet {wallet} is in relist cooldown for ({side:?}, {price_micro})")]
    RelistCooldown {
        wallet: String,
        side: &'static str,
        price_micro: u64,
    },

    #[error("correlation id mismatch: expected {expected}, got {got}")]
    CorrelationMismatch { expected: String, got: String },

    // --- External failures: caller-visible, underlying cause preserved ---
    #[error("facilitator timed out: facilitator={0}")]
    FacilitatorTimeout(String),

    #[error("direct submit failed: direct={0}")]
    DirectSubmitFailed(String),

    #[error("shared store unavailable: {0}")]
    SharedStoreUnavailable(String),

    // --- Corruption: non-fatal during replay, entry skipped with warning ---
    #[error("CRC mismatch on replay")]
    CrcMismatch,

    #[error("torn write at end of segment")]
    TornWrite,

    // --- Misc boundary errors ---
    #[error("unknown event stream {0:?}")]
    UnknownStream(String),

    #[error("writer closed")]
    WriterClosed,

    #[error("account {0} not found")]
    AccountNotFound(String),

    #[error("account {0} already exists")]
    AccountAlreadyExists(String),

    #[error("entry {0} not found")]
    EntryNotFound(String),

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("only ask orders require escrow")]
    AskOnlyEscrow,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
