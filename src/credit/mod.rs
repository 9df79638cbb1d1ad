//! The credit sub-ledger: `ALLOCATED -> UNLOCKED -> RESERVED ->
//! CONSUMED`, with `RELEASE`/`EXPIRE` as the return paths.

pub mod ledger;
pub mod note;

pub use ledger::{CreditBalances, CreditLedger};
pub use note::{CreditNote, CreditNoteIssuer};
