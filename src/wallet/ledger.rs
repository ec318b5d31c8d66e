//! Ledger store primitives
//!
//! Row-locking reads and posting writes that run inside a caller-owned
//! transaction. Every posting updates the materialized balance, appends the
//! signed ledger row and writes the audit entry on the same connection, so
//! they commit or roll back as one unit.

use chrono::Utc;
use sqlx::PgConnection;
use uuid::Uuid;

use super::{Direction, Posting, Wallet, WalletTransaction};
use crate::audit::{actions, AuditEntry, AuditService};
use crate::error::{EngineError, EngineResult};
use crate::money::{Currency, Money};
use crate::permission::Actor;

/// Balance after applying `posting`, or the rejection it causes
pub(crate) fn apply_to_balance(
    wallet_id: Uuid,
    balance: Money,
    posting: &Posting,
) -> EngineResult<Money> {
    if posting.amount.is_zero() {
        return Err(EngineError::InvalidAmount(
            "Amount must be greater than 0".to_string(),
        ));
    }
    if !posting.kind.allows(posting.direction) {
        return Err(EngineError::InvalidAmount(format!(
            "{:?} entries cannot be posted as a {:?}",
            posting.kind, posting.direction
        )));
    }

    match posting.direction {
        Direction::Credit => balance
            .checked_add(posting.amount)
            .ok_or_else(|| EngineError::InvalidAmount("Balance overflow".to_string())),
        Direction::Debit => balance
            .checked_sub(posting.amount)
            .ok_or(EngineError::InsufficientFunds { wallet_id }),
    }
}

/// Lock a single wallet row for the rest of the transaction
pub(crate) async fn lock_wallet(conn: &mut PgConnection, wallet_id: Uuid) -> EngineResult<Wallet> {
    sqlx::query_as::<_, Wallet>("SELECT * FROM wallets WHERE id = $1 FOR UPDATE")
        .bind(wallet_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("Wallet {} not found", wallet_id)))
}

/// Lock several wallet rows in ascending id order.
///
/// Fixed ordering keeps concurrent multi-wallet transactions from
/// deadlocking against each other.
pub(crate) async fn lock_wallets(
    conn: &mut PgConnection,
    wallet_ids: &[Uuid],
) -> EngineResult<Vec<Wallet>> {
    let mut ids = wallet_ids.to_vec();
    ids.sort();
    ids.dedup();

    let wallets = sqlx::query_as::<_, Wallet>(
        "SELECT * FROM wallets WHERE id = ANY($1) ORDER BY id FOR UPDATE",
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await?;

    if wallets.len() != ids.len() {
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !wallets.iter().any(|w| w.id == **id))
            .map(|id| id.to_string())
            .collect();
        return Err(EngineError::NotFound(format!(
            "Wallet(s) not found: {}",
            missing.join(", ")
        )));
    }

    Ok(wallets)
}

/// Id of the user's wallet in `currency`
pub(crate) async fn wallet_id_for(
    conn: &mut PgConnection,
    user_id: Uuid,
    currency: &Currency,
) -> EngineResult<Uuid> {
    sqlx::query_scalar::<_, Uuid>("SELECT id FROM wallets WHERE user_id = $1 AND currency = $2")
        .bind(user_id)
        .bind(currency)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| {
            EngineError::NotFound(format!("No {} wallet for user {}", currency, user_id))
        })
}

/// Apply a posting to a wallet locked by this transaction.
///
/// `wallet` is updated in place so later postings in the same transaction
/// see the new balance.
pub(crate) async fn post(
    conn: &mut PgConnection,
    wallet: &mut Wallet,
    posting: Posting,
    actor: &Actor,
) -> EngineResult<WalletTransaction> {
    let new_balance = apply_to_balance(wallet.id, wallet.balance, &posting)?;
    let now = Utc::now();

    sqlx::query("UPDATE wallets SET balance = $1, updated_at = $2 WHERE id = $3")
        .bind(new_balance)
        .bind(now)
        .bind(wallet.id)
        .execute(&mut *conn)
        .await?;

    let entry = sqlx::query_as::<_, WalletTransaction>(
        r#"
        INSERT INTO wallet_transactions (id, wallet_id, kind, amount, currency, related_loan_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(wallet.id)
    .bind(posting.kind)
    .bind(posting.signed_amount())
    .bind(&wallet.currency)
    .bind(posting.related_loan_id)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    let action = match posting.direction {
        Direction::Credit => actions::WALLET_CREDITED,
        Direction::Debit => actions::WALLET_DEBITED,
    };
    AuditService::record(
        &mut *conn,
        AuditEntry::new(
            actor,
            "wallet",
            action,
            format!(
                "wallet={} txn={} kind={:?} amount={} {} loan={}",
                wallet.id,
                entry.id,
                posting.kind,
                entry.amount,
                wallet.currency,
                posting
                    .related_loan_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string())
            ),
        ),
    )
    .await?;

    tracing::debug!(
        wallet_id = %wallet.id,
        txn_id = %entry.id,
        kind = ?posting.kind,
        amount = %entry.amount,
        balance = %new_balance,
        "Ledger posting applied"
    );

    wallet.balance = new_balance;
    wallet.updated_at = now;

    Ok(entry)
}
