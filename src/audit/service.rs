//! Audit service - appends and reads the audit trail

use chrono::Utc;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use super::{actions, AuditEntry, AuditLog};
use crate::error::EngineResult;
use crate::permission::Actor;

/// Audit recorder
#[derive(Clone)]
pub struct AuditService {
    db_pool: PgPool,
}

impl AuditService {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Append an entry using the caller's executor.
    ///
    /// Pass the open transaction so the entry commits or rolls back together
    /// with the mutation it describes.
    pub async fn record<'e, E>(executor: E, entry: AuditEntry) -> Result<Uuid, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, user_id, action, details, origin, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(entry.user_id)
        .bind(entry.action)
        .bind(&entry.details)
        .bind(&entry.origin)
        .bind(Utc::now())
        .execute(executor)
        .await?;

        Ok(id)
    }

    /// Record a refused privileged action.
    ///
    /// Written outside any business transaction. A failure here is logged
    /// and swallowed so the caller still sees the authorization rejection.
    pub async fn record_denial(&self, actor: &Actor, attempted: &str, permission: &str) {
        let entry = AuditEntry::new(
            actor,
            "permission",
            actions::PERMISSION_DENIED,
            format!("{} denied: {}", attempted, permission),
        );

        if let Err(e) = Self::record(&self.db_pool, entry).await {
            tracing::error!(error = %e, action = attempted, "Failed to record permission denial");
        }
    }

    /// Trail for a single user, oldest first
    pub async fn trail_for_user(&self, user_id: Uuid) -> EngineResult<Vec<AuditLog>> {
        let entries = sqlx::query_as::<_, AuditLog>(
            "SELECT * FROM audit_logs WHERE user_id = $1 ORDER BY created_at, id",
        )
        .bind(user_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(entries)
    }

    /// Entries for an action whose details mention `subject` (e.g. a loan id)
    pub async fn trail_for_action(&self, action: &str, subject: Option<Uuid>) -> EngineResult<Vec<AuditLog>> {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> =
            sqlx::QueryBuilder::new("SELECT * FROM audit_logs WHERE action = ");
        query_builder.push_bind(action);

        if let Some(subject) = subject {
            query_builder.push(" AND details LIKE ");
            query_builder.push_bind(format!("%{}%", subject));
        }

        query_builder.push(" ORDER BY created_at, id");

        let entries = query_builder
            .build_query_as::<AuditLog>()
            .fetch_all(&self.db_pool)
            .await?;

        Ok(entries)
    }
}
