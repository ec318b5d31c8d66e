//! Permission oracle - grant lookups and administration

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use super::{Actor, PermissionName};
use crate::audit::{actions, AuditEntry, AuditService};
use crate::error::{EngineError, EngineResult};

/// Outcome decided from the actor alone, before any store lookup
fn decide_without_store(actor: &Actor) -> Option<bool> {
    match actor {
        Actor::Anonymous => Some(false),
        Actor::System => Some(true),
        Actor::User(_) => None,
    }
}

/// Permission oracle backed by the `user_permissions` table
#[derive(Clone)]
pub struct PermissionService {
    db_pool: PgPool,
    audit: AuditService,
}

impl PermissionService {
    pub fn new(db_pool: PgPool, audit: AuditService) -> Self {
        Self { db_pool, audit }
    }

    /// Whether `actor` currently holds `permission`.
    ///
    /// Never errors: anonymous actors and store failures are both denied.
    pub async fn authorize(&self, actor: &Actor, permission: PermissionName) -> bool {
        if let Some(decision) = decide_without_store(actor) {
            return decision;
        }
        let Some(user_id) = actor.user_id() else {
            return false;
        };

        let granted = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM user_permissions up
                JOIN permissions p ON p.id = up.permission_id
                WHERE up.user_id = $1 AND p.name = $2
            )
            "#,
        )
        .bind(user_id)
        .bind(permission.as_str())
        .fetch_one(&self.db_pool)
        .await;

        match granted {
            Ok(granted) => granted,
            Err(e) => {
                tracing::error!(error = %e, %user_id, %permission, "Permission lookup failed, denying");
                false
            }
        }
    }

    /// Fail with `NotAuthorized` (and a denial audit entry) unless granted
    pub async fn require(
        &self,
        actor: &Actor,
        permission: PermissionName,
        attempted: &str,
    ) -> EngineResult<()> {
        if self.authorize(actor, permission).await {
            return Ok(());
        }

        tracing::warn!(actor = ?actor, %permission, attempted, "Permission denied");
        self.audit
            .record_denial(actor, attempted, permission.as_str())
            .await;

        Err(EngineError::NotAuthorized(format!(
            "{} requires the {} permission",
            attempted, permission
        )))
    }

    /// Allow the owning user directly, anyone else only with `permission`
    pub async fn require_owner_or(
        &self,
        actor: &Actor,
        owner_id: Uuid,
        permission: PermissionName,
        attempted: &str,
    ) -> EngineResult<()> {
        if actor.is(owner_id) {
            return Ok(());
        }
        self.require(actor, permission, attempted).await
    }

    /// Ownership gate: only `user_id` itself (or the System actor) may proceed
    pub async fn require_self(
        &self,
        actor: &Actor,
        user_id: Uuid,
        attempted: &str,
    ) -> EngineResult<()> {
        if actor.is(user_id) || actor.is_system() {
            return Ok(());
        }
        Err(self.deny(actor, attempted, "ownership").await)
    }

    /// Record a refusal and build the matching error
    pub async fn deny(&self, actor: &Actor, attempted: &str, reason: &str) -> EngineError {
        tracing::warn!(actor = ?actor, attempted, reason, "Operation refused");
        self.audit.record_denial(actor, attempted, reason).await;
        EngineError::NotAuthorized(format!("{} refused: {}", attempted, reason))
    }

    /// Grant a permission. Idempotent. Requires `ManageUsers`.
    pub async fn grant(
        &self,
        actor: &Actor,
        user_id: Uuid,
        permission: PermissionName,
    ) -> EngineResult<()> {
        self.require(actor, PermissionName::ManageUsers, "GrantPermission")
            .await?;

        let mut tx = self.db_pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO user_permissions (user_id, permission_id, granted_at)
            SELECT $1, id, $3 FROM permissions WHERE name = $2
            ON CONFLICT (user_id, permission_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(permission.as_str())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted > 0 {
            AuditService::record(
                &mut *tx,
                AuditEntry::new(
                    actor,
                    "permission",
                    actions::PERMISSION_GRANTED,
                    format!("{} granted to {}", permission, user_id),
                ),
            )
            .await?;
        }

        tx.commit().await?;

        tracing::info!(%user_id, %permission, "Permission granted");
        Ok(())
    }

    /// Revoke a permission. Revoking an absent grant is a no-op.
    pub async fn revoke(
        &self,
        actor: &Actor,
        user_id: Uuid,
        permission: PermissionName,
    ) -> EngineResult<()> {
        self.require(actor, PermissionName::ManageUsers, "RevokePermission")
            .await?;

        let mut tx = self.db_pool.begin().await?;

        let removed = sqlx::query(
            r#"
            DELETE FROM user_permissions up
            USING permissions p
            WHERE up.permission_id = p.id AND up.user_id = $1 AND p.name = $2
            "#,
        )
        .bind(user_id)
        .bind(permission.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if removed > 0 {
            AuditService::record(
                &mut *tx,
                AuditEntry::new(
                    actor,
                    "permission",
                    actions::PERMISSION_REVOKED,
                    format!("{} revoked from {}", permission, user_id),
                ),
            )
            .await?;
        }

        tx.commit().await?;

        tracing::info!(%user_id, %permission, "Permission revoked");
        Ok(())
    }

    /// Permissions currently granted to a user
    pub async fn permissions_of(&self, user_id: Uuid) -> EngineResult<Vec<PermissionName>> {
        let names = sqlx::query_scalar::<_, String>(
            r#"
            SELECT p.name
            FROM user_permissions up
            JOIN permissions p ON p.id = up.permission_id
            WHERE up.user_id = $1
            ORDER BY p.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(names
            .iter()
            .filter_map(|name| name.parse::<PermissionName>().ok())
            .collect())
    }
}
