//! The billing state machine: `Reserve -> Commit -> Finalize{Ack,Fail}`,
//! with `Release` and `Void` as escape hatches.

pub mod entry;
pub mod machine;

pub use entry::{BillingEntry, BillingState};
pub use machine::BillingStateMachine;
