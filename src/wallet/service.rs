//! Wallet service layer - credits, debits and balance reads

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use super::ledger;
use super::{BalanceCheck, Posting, TransactionKind, Wallet, WalletTransaction};
use crate::audit::{actions, AuditEntry, AuditService};
use crate::error::{retry_on_conflict, EngineError, EngineResult};
use crate::money::{Currency, Money};
use crate::permission::{Actor, PermissionName, PermissionService};

/// Validate a caller-supplied amount: positive, at most two fraction digits
pub fn positive_amount(amount: Decimal) -> EngineResult<Money> {
    let money = Money::new(amount)?;
    if money.is_zero() {
        return Err(EngineError::InvalidAmount(
            "Amount must be greater than 0".to_string(),
        ));
    }
    Ok(money)
}

/// Wallet service
#[derive(Clone)]
pub struct WalletService {
    db_pool: PgPool,
    permissions: PermissionService,
    max_tx_retries: u32,
}

impl WalletService {
    pub fn new(db_pool: PgPool, permissions: PermissionService, max_tx_retries: u32) -> Self {
        Self {
            db_pool,
            permissions,
            max_tx_retries,
        }
    }

    /// Open a wallet for `user_id` with an explicit opening balance.
    ///
    /// Opening is idempotent per (user, currency) as long as no opening
    /// balance is requested for an existing wallet.
    pub async fn open_wallet(
        &self,
        actor: &Actor,
        user_id: Uuid,
        currency: &str,
        opening_balance: Decimal,
    ) -> EngineResult<Wallet> {
        self.permissions
            .require_owner_or(actor, user_id, PermissionName::ManageWallets, "OpenWallet")
            .await?;

        let currency = Currency::new(currency)?;
        let opening_balance = Money::new(opening_balance)?;
        let now = Utc::now();

        let mut tx = self.db_pool.begin().await?;

        let created = sqlx::query_as::<_, Wallet>(
            r#"
            INSERT INTO wallets (id, user_id, currency, balance, opening_balance, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4, $5, $5)
            ON CONFLICT (user_id, currency) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(&currency)
        .bind(opening_balance)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let wallet = match created {
            Some(wallet) => {
                AuditService::record(
                    &mut *tx,
                    AuditEntry::new(
                        actor,
                        "wallet",
                        actions::WALLET_OPENED,
                        format!(
                            "wallet={} user={} currency={} opening={}",
                            wallet.id, user_id, currency, opening_balance
                        ),
                    ),
                )
                .await?;
                tracing::info!(wallet_id = %wallet.id, %user_id, %currency, "Wallet opened");
                wallet
            }
            None => {
                if opening_balance.is_positive() {
                    return Err(EngineError::InvalidAmount(format!(
                        "User {} already has a {} wallet; opening balance can only be set at creation",
                        user_id, currency
                    )));
                }
                sqlx::query_as::<_, Wallet>(
                    "SELECT * FROM wallets WHERE user_id = $1 AND currency = $2",
                )
                .bind(user_id)
                .bind(&currency)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;
        Ok(wallet)
    }

    /// Append a positive ledger entry. Returns the transaction id.
    pub async fn credit(
        &self,
        actor: &Actor,
        wallet_id: Uuid,
        amount: Decimal,
        kind: TransactionKind,
        related_loan_id: Option<Uuid>,
    ) -> EngineResult<Uuid> {
        let amount = positive_amount(amount)?;
        let posting = Posting::credit(amount, kind, related_loan_id);
        self.post_single(actor, wallet_id, posting, "CreditWallet")
            .await
    }

    /// Append a negative ledger entry. Fails with `InsufficientFunds` if
    /// the balance would go negative. Returns the transaction id.
    pub async fn debit(
        &self,
        actor: &Actor,
        wallet_id: Uuid,
        amount: Decimal,
        kind: TransactionKind,
        related_loan_id: Option<Uuid>,
    ) -> EngineResult<Uuid> {
        let amount = positive_amount(amount)?;
        let posting = Posting::debit(amount, kind, related_loan_id);
        self.post_single(actor, wallet_id, posting, "DebitWallet")
            .await
    }

    async fn post_single(
        &self,
        actor: &Actor,
        wallet_id: Uuid,
        posting: Posting,
        attempted: &str,
    ) -> EngineResult<Uuid> {
        let owner_id = self.owner_of(wallet_id).await?;
        self.permissions
            .require_owner_or(actor, owner_id, PermissionName::ManageWallets, attempted)
            .await?;

        let entry = retry_on_conflict(self.max_tx_retries, || {
            self.post_single_once(actor, wallet_id, posting)
        })
        .await
        .map_err(|e| {
            if let EngineError::InsufficientFunds { .. } = e {
                tracing::debug!(%wallet_id, amount = %posting.amount, "Debit rejected, insufficient funds");
            }
            e
        })?;

        tracing::info!(
            %wallet_id,
            txn_id = %entry.id,
            kind = ?posting.kind,
            amount = %entry.amount,
            "Wallet posting committed"
        );

        Ok(entry.id)
    }

    async fn post_single_once(
        &self,
        actor: &Actor,
        wallet_id: Uuid,
        posting: Posting,
    ) -> EngineResult<WalletTransaction> {
        let mut tx = self.db_pool.begin().await?;

        let mut wallet = ledger::lock_wallet(&mut tx, wallet_id).await?;
        let entry = ledger::post(&mut tx, &mut wallet, posting, actor).await?;

        tx.commit().await?;
        Ok(entry)
    }

    /// Current balance. Owner or `ViewAnyWallet`.
    pub async fn balance(&self, actor: &Actor, wallet_id: Uuid) -> EngineResult<Money> {
        let wallet = self.wallet(actor, wallet_id).await?;
        Ok(wallet.balance)
    }

    /// Wallet record. Owner or `ViewAnyWallet`.
    pub async fn wallet(&self, actor: &Actor, wallet_id: Uuid) -> EngineResult<Wallet> {
        let wallet = self.find_wallet(wallet_id).await?;
        self.permissions
            .require_owner_or(actor, wallet.user_id, PermissionName::ViewAnyWallet, "GetWalletBalance")
            .await?;
        Ok(wallet)
    }

    /// Wallet of `user_id` in `currency`, if opened
    pub async fn wallet_for_user(
        &self,
        actor: &Actor,
        user_id: Uuid,
        currency: &str,
    ) -> EngineResult<Option<Wallet>> {
        self.permissions
            .require_owner_or(actor, user_id, PermissionName::ViewAnyWallet, "GetWallet")
            .await?;
        let currency = Currency::new(currency)?;

        let wallet = sqlx::query_as::<_, Wallet>(
            "SELECT * FROM wallets WHERE user_id = $1 AND currency = $2",
        )
        .bind(user_id)
        .bind(&currency)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(wallet)
    }

    /// Ledger history, oldest first. Owner or `ViewAnyWallet`.
    pub async fn transactions(
        &self,
        actor: &Actor,
        wallet_id: Uuid,
    ) -> EngineResult<Vec<WalletTransaction>> {
        let owner_id = self.owner_of(wallet_id).await?;
        self.permissions
            .require_owner_or(actor, owner_id, PermissionName::ViewAnyWallet, "ListWalletTransactions")
            .await?;

        let entries = sqlx::query_as::<_, WalletTransaction>(
            "SELECT * FROM wallet_transactions WHERE wallet_id = $1 ORDER BY created_at, id",
        )
        .bind(wallet_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(entries)
    }

    /// Recompute opening balance + signed ledger sum and compare it with
    /// the stored balance.
    pub async fn verify_balance(&self, wallet_id: Uuid) -> EngineResult<BalanceCheck> {
        let (stored, derived) = sqlx::query_as::<_, (Decimal, Decimal)>(
            r#"
            SELECT w.balance,
                   w.opening_balance + COALESCE(SUM(t.amount), 0)
            FROM wallets w
            LEFT JOIN wallet_transactions t ON t.wallet_id = w.id
            WHERE w.id = $1
            GROUP BY w.id
            "#,
        )
        .bind(wallet_id)
        .fetch_optional(&self.db_pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("Wallet {} not found", wallet_id)))?;

        let check = BalanceCheck {
            wallet_id,
            stored,
            derived,
        };

        if !check.is_consistent() {
            tracing::error!(%wallet_id, %stored, %derived, "Wallet balance diverges from ledger");
        }

        Ok(check)
    }

    async fn find_wallet(&self, wallet_id: Uuid) -> EngineResult<Wallet> {
        sqlx::query_as::<_, Wallet>("SELECT * FROM wallets WHERE id = $1")
            .bind(wallet_id)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Wallet {} not found", wallet_id)))
    }

    async fn owner_of(&self, wallet_id: Uuid) -> EngineResult<Uuid> {
        sqlx::query_scalar::<_, Uuid>("SELECT user_id FROM wallets WHERE id = $1")
            .bind(wallet_id)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Wallet {} not found", wallet_id)))
    }
}
