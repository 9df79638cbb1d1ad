//! The billing write-ahead log: segments, envelopes, and the
//! distributed-lock-fenced writer.

pub mod envelope;
pub mod writer;

pub use envelope::{WalEnvelope, WalEventType, SCHEMA_VERSION};
pub use writer::{Wal, WalStatus};
