//! Audit trail domain module
//!
//! Append-only record of every state-changing engine operation.

mod model;
mod service;

pub use model::*;
pub use service::AuditService;
