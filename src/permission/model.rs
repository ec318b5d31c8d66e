//! Actor identity and permission models

use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identity on whose behalf an engine operation runs.
///
/// Resolved by the external identity subsystem. An unresolvable identity
/// becomes `Anonymous`, which is denied every privileged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    Anonymous,
    User(Uuid),
    /// Trusted in-process caller: background jobs, confirmed upstream flows
    System,
}

impl Actor {
    /// Map an optional authenticated user id onto an actor
    pub fn from_identity(user_id: Option<Uuid>) -> Self {
        match user_id {
            Some(id) => Actor::User(id),
            None => Actor::Anonymous,
        }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Actor::User(id) => Some(*id),
            _ => None,
        }
    }

    /// True when the actor is the given user
    pub fn is(&self, user_id: Uuid) -> bool {
        matches!(self, Actor::User(id) if *id == user_id)
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Actor::System)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Actor::Anonymous => "anonymous",
            Actor::User(_) => "user",
            Actor::System => "system",
        }
    }
}

/// Named capabilities known to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionName {
    ApproveLoan,
    ManageUsers,
    ViewAnyWallet,
    ViewAnyLoan,
    ManageWallets,
}

impl PermissionName {
    pub const ALL: [PermissionName; 5] = [
        PermissionName::ApproveLoan,
        PermissionName::ManageUsers,
        PermissionName::ViewAnyWallet,
        PermissionName::ViewAnyLoan,
        PermissionName::ManageWallets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionName::ApproveLoan => "ApproveLoan",
            PermissionName::ManageUsers => "ManageUsers",
            PermissionName::ViewAnyWallet => "ViewAnyWallet",
            PermissionName::ViewAnyLoan => "ViewAnyLoan",
            PermissionName::ManageWallets => "ManageWallets",
        }
    }
}

impl fmt::Display for PermissionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PermissionName::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("Unknown permission: {}", s))
    }
}

/// Permission row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Permission {
    pub id: Uuid,
    pub name: String,
}

/// Grant of a permission to a user, unique per pair
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserPermission {
    pub user_id: Uuid,
    pub permission_id: Uuid,
    pub granted_at: DateTime<Utc>,
}
