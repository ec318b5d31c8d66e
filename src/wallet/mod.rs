//! Wallet domain module
//!
//! Ledger store (append-only postings) and the wallet service built on it.

pub(crate) mod ledger;
mod model;
mod service;

pub use model::*;
pub use service::{positive_amount, WalletService};
