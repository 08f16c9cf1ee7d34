//! Signed transactions, sealed blocks, and the hash-chained ledger.

pub mod block;
pub mod chain;
pub mod transaction;
