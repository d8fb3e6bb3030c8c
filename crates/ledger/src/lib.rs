//! Token ledger (prepaid agency token balances).
//!
//! Pure domain logic only: no IO, no locking, no persistence. The infra layer
//! wraps each [`TokenAccount`] in a per-agency lock and runs `handle` + `apply`
//! as one atomic step.

pub mod account;
pub mod entry;

pub use account::{CommitReceipt, LedgerCommand, LedgerError, Reservation, TokenAccount};
pub use entry::{
    EntryKind, LedgerEntry, TokensCommitted, TokensCredited, TokensRefunded, TokensReserved,
};
