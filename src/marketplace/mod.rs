//! The marketplace subsystem: a price-time-priority order book plus
//! its settlement engine. Independent of billing/credit except for the
//! credit balance store the settlement engine shares with the credit
//! sub-ledger's `credits:{account}:balance` hash.

pub mod book;
pub mod order;
pub mod settlement;

pub use book::{MatchConfig, OrderBook};
pub use order::{Escrow, EscrowStatus, Match, MatchResult, Order, OrderStatus, Settlement, Side};
pub use settlement::{ConservationReport, SettleResult, SettleStatus, SettlementEngine};
