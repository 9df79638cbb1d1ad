//! `meterflow-core`: the transactional billing & credit subsystem of
//! an AI inference gateway — a durable, crash-recoverable state
//! machine coordinating reserve -> commit -> finalize across a
//! write-ahead log, a per-stream event store, a Redis-class hot-state
//! store, a USD billing ledger, a credit-unit ledger, and a
//! marketplace matching/settlement engine for transferable credits.
//!
//! Out of scope here (external collaborators only, see
//! [`facilitator`]): HTTP routes, OpenAPI schema, dashboard rendering,
//! wallet/JWT auth, NFT ownership lookups, model routing, and metrics
//! exposition.

pub mod billing;
pub mod clock;
pub mod config;
pub mod credit;
pub mod error;
pub mod events;
pub mod facilitator;
pub mod idempotency;
pub mod ids;
pub mod logging;
pub mod marketplace;
pub mod money;
pub mod segment;
pub mod store;
pub mod wal;

pub use billing::BillingStateMachine;
pub use config::Config;
pub use credit::CreditLedger;
pub use error::{CoreError, CoreResult};
pub use events::EventStore;
pub use marketplace::{OrderBook, SettlementEngine};
pub use wal::Wal;
