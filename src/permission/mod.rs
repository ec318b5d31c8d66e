//! Permission oracle domain module
//!
//! Maps (actor, permission) to granted/denied ahead of privileged mutations.

mod model;
mod service;

pub use model::*;
pub use service::PermissionService;
