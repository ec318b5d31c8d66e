//! Lendbridge ledger engine
//!
//! Wallet ledger, loan lifecycle, funding aggregation, repayment scheduling
//! and the audit trail for a peer-to-peer lending platform, on PostgreSQL.

pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod loan;
pub mod money;
pub mod permission;
pub mod repayment;
pub mod state;
pub mod wallet;

pub use error::{EngineError, EngineResult};
pub use state::Engine;
