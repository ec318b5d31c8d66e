//! Repayment domain module
//!
//! Amortized schedules, late fees, pro-rata distribution to lenders and the
//! scheduler service that settles installments.

pub mod distribution;
pub mod late_fee;
mod model;
pub mod policy;
pub mod schedule;
mod service;

pub use distribution::{split_pro_rata, Payout};
pub use late_fee::LateFeePolicy;
pub use model::*;
pub use policy::{DefaultPolicy, MissedInstallmentsPolicy};
pub(crate) use service::generate_schedule_in;
pub use service::RepaymentService;
