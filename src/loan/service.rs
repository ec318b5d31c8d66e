//! Loan service layer - lifecycle transitions and funding aggregation

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;
use validator::Validate;

use super::lifecycle::{check_contribution, ensure_transition};
use super::{FundingOutcome, FundingStatus, LenderShare, LoanFunding, LoanRequest, LoanStatus, NewLoanRequest};
use crate::audit::{actions, AuditEntry, AuditService};
use crate::error::{retry_on_conflict, EngineError, EngineResult};
use crate::money::{Currency, Money};
use crate::permission::{Actor, PermissionName, PermissionService};
use crate::repayment::generate_schedule_in;
use crate::wallet::ledger;
use crate::wallet::{Posting, TransactionKind};

/// Lock a loan row for the rest of the transaction.
///
/// Every operation touching a loan's funding total or status takes this
/// lock first, which serializes them per loan.
pub(crate) async fn lock_loan(conn: &mut PgConnection, loan_id: Uuid) -> EngineResult<LoanRequest> {
    sqlx::query_as::<_, LoanRequest>("SELECT * FROM loan_requests WHERE id = $1 FOR UPDATE")
        .bind(loan_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("Loan {} not found", loan_id)))
}

/// Sum of accepted contributions
pub(crate) async fn funded_total(conn: &mut PgConnection, loan_id: Uuid) -> EngineResult<Money> {
    let total = sqlx::query_scalar::<_, Decimal>(
        "SELECT COALESCE(SUM(amount), 0) FROM loan_fundings WHERE loan_id = $1",
    )
    .bind(loan_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(Money::round(total))
}

/// Contributions aggregated per lender, ordered by lender id
pub(crate) async fn lender_shares(
    conn: &mut PgConnection,
    loan_id: Uuid,
) -> EngineResult<Vec<LenderShare>> {
    let shares = sqlx::query_as::<_, LenderShare>(
        r#"
        SELECT lender_id, SUM(amount) AS amount
        FROM loan_fundings
        WHERE loan_id = $1
        GROUP BY lender_id
        ORDER BY lender_id
        "#,
    )
    .bind(loan_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(shares)
}

/// Move a locked loan to `to`, stamping the matching timestamp columns and
/// writing the audit entry.
pub(crate) async fn transition(
    conn: &mut PgConnection,
    loan: &mut LoanRequest,
    to: LoanStatus,
    actor: &Actor,
    details: &str,
) -> EngineResult<()> {
    ensure_transition(loan.id, loan.status, to)?;

    let now = Utc::now();
    let from = loan.status;
    match to {
        LoanStatus::Approved => {
            loan.approved_at = Some(now);
            loan.approved_by = actor.user_id();
        }
        LoanStatus::Active => loan.activated_at = Some(now),
        LoanStatus::Rejected | LoanStatus::Completed | LoanStatus::Defaulted => {
            loan.closed_at = Some(now)
        }
        LoanStatus::Pending | LoanStatus::Funded => {}
    }
    loan.status = to;
    loan.updated_at = now;

    sqlx::query(
        r#"
        UPDATE loan_requests
        SET status = $2, approved_at = $3, approved_by = $4,
            activated_at = $5, closed_at = $6, updated_at = $7
        WHERE id = $1
        "#,
    )
    .bind(loan.id)
    .bind(loan.status)
    .bind(loan.approved_at)
    .bind(loan.approved_by)
    .bind(loan.activated_at)
    .bind(loan.closed_at)
    .bind(loan.updated_at)
    .execute(&mut *conn)
    .await?;

    let action = match to {
        LoanStatus::Approved => actions::LOAN_APPROVED,
        LoanStatus::Rejected => actions::LOAN_REJECTED,
        LoanStatus::Funded => actions::LOAN_FUNDED,
        LoanStatus::Active => actions::LOAN_ACTIVATED,
        LoanStatus::Completed => actions::LOAN_COMPLETED,
        LoanStatus::Defaulted => actions::LOAN_DEFAULTED,
        LoanStatus::Pending => actions::LOAN_REQUESTED,
    };
    AuditService::record(
        &mut *conn,
        AuditEntry::new(
            actor,
            "loan",
            action,
            format!("loan={} {} -> {} {}", loan.id, from.as_str(), to.as_str(), details),
        ),
    )
    .await?;

    tracing::info!(loan_id = %loan.id, from = from.as_str(), to = to.as_str(), "Loan status changed");
    Ok(())
}

/// Funded -> Active plus schedule generation, in the caller's transaction
pub(crate) async fn activate_in(
    conn: &mut PgConnection,
    loan: &mut LoanRequest,
    actor: &Actor,
) -> EngineResult<()> {
    transition(conn, loan, LoanStatus::Active, actor, "").await?;
    let start = loan.activated_at.unwrap_or_else(Utc::now).date_naive();
    generate_schedule_in(conn, loan, start, actor).await?;
    Ok(())
}

/// Borrower, any lender who funded the loan, or `ViewAnyLoan`
pub(crate) async fn require_loan_viewer(
    db_pool: &PgPool,
    permissions: &PermissionService,
    actor: &Actor,
    loan: &LoanRequest,
    attempted: &str,
) -> EngineResult<()> {
    if actor.is(loan.borrower_id) || actor.is_system() {
        return Ok(());
    }
    if let Some(user_id) = actor.user_id() {
        let is_lender = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM loan_fundings WHERE loan_id = $1 AND lender_id = $2)",
        )
        .bind(loan.id)
        .bind(user_id)
        .fetch_one(db_pool)
        .await?;
        if is_lender {
            return Ok(());
        }
    }
    permissions
        .require(actor, PermissionName::ViewAnyLoan, attempted)
        .await
}

/// Loan service for lifecycle and funding
#[derive(Clone)]
pub struct LoanService {
    db_pool: PgPool,
    permissions: PermissionService,
    max_tx_retries: u32,
    activate_on_full_funding: bool,
}

impl LoanService {
    pub fn new(
        db_pool: PgPool,
        permissions: PermissionService,
        max_tx_retries: u32,
        activate_on_full_funding: bool,
    ) -> Self {
        Self {
            db_pool,
            permissions,
            max_tx_retries,
            activate_on_full_funding,
        }
    }

    /// Create a Pending loan request on behalf of the borrower
    pub async fn request_loan(&self, actor: &Actor, request: NewLoanRequest) -> EngineResult<LoanRequest> {
        self.permissions
            .require_self(actor, request.borrower_id, "RequestLoan")
            .await?;
        request.validate()?;

        let amount = crate::wallet::positive_amount(request.amount)?;
        let currency = Currency::new(&request.currency)?;
        let now = Utc::now();

        let mut tx = self.db_pool.begin().await?;

        let loan = sqlx::query_as::<_, LoanRequest>(
            r#"
            INSERT INTO loan_requests (
                id, borrower_id, amount_requested, currency, term_months,
                interest_rate, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.borrower_id)
        .bind(amount)
        .bind(&currency)
        .bind(request.term_months)
        .bind(request.interest_rate)
        .bind(LoanStatus::Pending)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        AuditService::record(
            &mut *tx,
            AuditEntry::new(
                actor,
                "loan",
                actions::LOAN_REQUESTED,
                format!(
                    "loan={} amount={} {} term={} rate={}",
                    loan.id, amount, currency, loan.term_months, loan.interest_rate
                ),
            ),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(loan_id = %loan.id, borrower_id = %loan.borrower_id, %amount, "Loan requested");
        Ok(loan)
    }

    /// Pending -> Approved. Requires `ApproveLoan`; borrowers cannot
    /// approve their own request.
    pub async fn approve_loan(&self, actor: &Actor, loan_id: Uuid) -> EngineResult<LoanRequest> {
        self.permissions
            .require(actor, PermissionName::ApproveLoan, "ApproveLoan")
            .await?;

        retry_on_conflict(self.max_tx_retries, || {
            self.decide_once(actor, loan_id, LoanStatus::Approved)
        })
        .await
    }

    /// Pending/Approved -> Rejected. Requires `ApproveLoan`.
    pub async fn reject_loan(&self, actor: &Actor, loan_id: Uuid) -> EngineResult<LoanRequest> {
        self.permissions
            .require(actor, PermissionName::ApproveLoan, "RejectLoan")
            .await?;

        retry_on_conflict(self.max_tx_retries, || {
            self.decide_once(actor, loan_id, LoanStatus::Rejected)
        })
        .await
    }

    async fn decide_once(&self, actor: &Actor, loan_id: Uuid, to: LoanStatus) -> EngineResult<LoanRequest> {
        let mut tx = self.db_pool.begin().await?;
        let mut loan = lock_loan(&mut tx, loan_id).await?;

        if to == LoanStatus::Approved && actor.is(loan.borrower_id) {
            // release row locks and the connection before the denial is audited
            tx.rollback().await?;
            return Err(self
                .permissions
                .deny(actor, "ApproveLoan", "borrower cannot approve own loan")
                .await);
        }

        transition(&mut tx, &mut loan, to, actor, "").await?;
        tx.commit().await?;
        Ok(loan)
    }

    /// Accept a lender contribution.
    ///
    /// Rejects with `FundingExceedsRequestedAmount` when the contribution
    /// would push the total past the requested amount. On exact fill the
    /// loan becomes Funded (and Active with its schedule when auto-activation
    /// is on), all in the same transaction as the money movement.
    pub async fn fund_loan(
        &self,
        actor: &Actor,
        loan_id: Uuid,
        lender_id: Uuid,
        amount: Decimal,
    ) -> EngineResult<FundingOutcome> {
        self.permissions
            .require_self(actor, lender_id, "FundLoan")
            .await?;

        let outcome = retry_on_conflict(self.max_tx_retries, || {
            self.fund_loan_once(actor, loan_id, lender_id, amount)
        })
        .await?;

        tracing::info!(
            %loan_id,
            %lender_id,
            amount = %outcome.funding.amount,
            funded = %outcome.funded_total,
            remaining = %outcome.remaining,
            status = outcome.loan_status.as_str(),
            "Loan contribution accepted"
        );

        Ok(outcome)
    }

    async fn fund_loan_once(
        &self,
        actor: &Actor,
        loan_id: Uuid,
        lender_id: Uuid,
        amount: Decimal,
    ) -> EngineResult<FundingOutcome> {
        let mut tx = self.db_pool.begin().await?;

        // 1. Serialize on the loan and re-read the funded sum under the lock
        let mut loan = lock_loan(&mut tx, loan_id).await?;
        if loan.status != LoanStatus::Approved {
            return Err(EngineError::InvalidLoanState(format!(
                "Loan {} is {} and cannot accept funding",
                loan_id,
                loan.status.as_str()
            )));
        }
        let amount = Money::new(amount)?;
        if lender_id == loan.borrower_id {
            // release row locks and the connection before the denial is audited
            tx.rollback().await?;
            return Err(self
                .permissions
                .deny(actor, "FundLoan", "borrower cannot fund own loan")
                .await);
        }
        let funded = funded_total(&mut tx, loan_id).await?;

        // 2. Overshoot guard
        let check = check_contribution(loan_id, loan.status, loan.amount_requested, funded, amount)?;

        // 3-4. Move the money: lender -> borrower
        let lender_wallet_id = ledger::wallet_id_for(&mut tx, lender_id, &loan.currency).await?;
        let borrower_wallet_id = ledger::wallet_id_for(&mut tx, loan.borrower_id, &loan.currency).await?;
        let mut wallets = ledger::lock_wallets(&mut tx, &[lender_wallet_id, borrower_wallet_id]).await?;

        for wallet in wallets.iter_mut().filter(|w| w.id == lender_wallet_id) {
            ledger::post(
                &mut tx,
                wallet,
                Posting::debit(amount, TransactionKind::LoanFunding, Some(loan_id)),
                actor,
            )
            .await?;
        }
        for wallet in wallets.iter_mut().filter(|w| w.id == borrower_wallet_id) {
            ledger::post(
                &mut tx,
                wallet,
                Posting::credit(amount, TransactionKind::LoanFunding, Some(loan_id)),
                actor,
            )
            .await?;
        }

        // 5. Record the contribution
        let funding = sqlx::query_as::<_, LoanFunding>(
            r#"
            INSERT INTO loan_fundings (id, loan_id, lender_id, amount, funded_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(loan_id)
        .bind(lender_id)
        .bind(amount)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        AuditService::record(
            &mut *tx,
            AuditEntry::new(
                actor,
                "loan",
                actions::LOAN_CONTRIBUTION,
                format!(
                    "loan={} funding={} lender={} amount={} total={} remaining={}",
                    loan_id, funding.id, lender_id, amount, check.new_total, check.remaining
                ),
            ),
        )
        .await?;

        // 6. Exact fill closes funding
        if check.fills_loan {
            transition(&mut tx, &mut loan, LoanStatus::Funded, actor, "").await?;
            if self.activate_on_full_funding {
                activate_in(&mut tx, &mut loan, actor).await?;
            }
        }

        tx.commit().await?;

        Ok(FundingOutcome {
            funding,
            funded_total: check.new_total,
            remaining: check.remaining,
            loan_status: loan.status,
            completed_funding: check.fills_loan,
        })
    }

    /// Funded -> Active with schedule generation, for deployments that
    /// settle funding before activating. Requires `ApproveLoan`.
    pub async fn activate_loan(&self, actor: &Actor, loan_id: Uuid) -> EngineResult<LoanRequest> {
        self.permissions
            .require(actor, PermissionName::ApproveLoan, "ActivateLoan")
            .await?;

        retry_on_conflict(self.max_tx_retries, || async move {
            let mut tx = self.db_pool.begin().await?;
            let mut loan = lock_loan(&mut tx, loan_id).await?;
            activate_in(&mut tx, &mut loan, actor).await?;
            tx.commit().await?;
            Ok(loan)
        })
        .await
    }

    /// Active -> Defaulted on an explicit decision. Requires `ApproveLoan`.
    pub async fn mark_defaulted(
        &self,
        actor: &Actor,
        loan_id: Uuid,
        reason: &str,
    ) -> EngineResult<LoanRequest> {
        self.permissions
            .require(actor, PermissionName::ApproveLoan, "MarkLoanDefaulted")
            .await?;

        let loan = retry_on_conflict(self.max_tx_retries, || async move {
            let mut tx = self.db_pool.begin().await?;
            let mut loan = lock_loan(&mut tx, loan_id).await?;
            transition(&mut tx, &mut loan, LoanStatus::Defaulted, actor, reason).await?;
            tx.commit().await?;
            Ok(loan)
        })
        .await?;

        tracing::warn!(%loan_id, reason, "Loan marked defaulted");
        Ok(loan)
    }

    /// Loan record. Borrower, a lender of the loan, or `ViewAnyLoan`.
    pub async fn get_loan(&self, actor: &Actor, loan_id: Uuid) -> EngineResult<LoanRequest> {
        let loan = self.find_loan(loan_id).await?;
        require_loan_viewer(&self.db_pool, &self.permissions, actor, &loan, "GetLoan").await?;
        Ok(loan)
    }

    /// Funding progress. Borrower, a lender of the loan, or `ViewAnyLoan`.
    pub async fn funding_status(&self, actor: &Actor, loan_id: Uuid) -> EngineResult<FundingStatus> {
        let loan = self.find_loan(loan_id).await?;
        require_loan_viewer(&self.db_pool, &self.permissions, actor, &loan, "GetLoanFundingStatus")
            .await?;

        let contributions = sqlx::query_as::<_, LoanFunding>(
            "SELECT * FROM loan_fundings WHERE loan_id = $1 ORDER BY funded_at, id",
        )
        .bind(loan_id)
        .fetch_all(&self.db_pool)
        .await?;

        let funded: Money = contributions.iter().map(|c| c.amount).sum();
        let remaining = loan
            .amount_requested
            .checked_sub(funded)
            .unwrap_or(Money::ZERO);

        Ok(FundingStatus {
            loan_id,
            status: loan.status,
            currency: loan.currency,
            amount_requested: loan.amount_requested,
            funded,
            remaining,
            contributions,
        })
    }

    /// Loans filtered by borrower and/or status. Own loans, or `ViewAnyLoan`.
    pub async fn list_loans(
        &self,
        actor: &Actor,
        borrower_id: Option<Uuid>,
        status: Option<LoanStatus>,
    ) -> EngineResult<Vec<LoanRequest>> {
        match borrower_id {
            Some(borrower_id) => {
                self.permissions
                    .require_owner_or(actor, borrower_id, PermissionName::ViewAnyLoan, "ListLoans")
                    .await?
            }
            None => {
                self.permissions
                    .require(actor, PermissionName::ViewAnyLoan, "ListLoans")
                    .await?
            }
        }

        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> =
            sqlx::QueryBuilder::new("SELECT * FROM loan_requests WHERE 1=1");

        if let Some(borrower_id) = borrower_id {
            query_builder.push(" AND borrower_id = ");
            query_builder.push_bind(borrower_id);
        }
        if let Some(status) = status {
            query_builder.push(" AND status = ");
            query_builder.push_bind(status);
        }
        query_builder.push(" ORDER BY created_at DESC");

        let loans = query_builder
            .build_query_as::<LoanRequest>()
            .fetch_all(&self.db_pool)
            .await?;

        Ok(loans)
    }

    async fn find_loan(&self, loan_id: Uuid) -> EngineResult<LoanRequest> {
        sqlx::query_as::<_, LoanRequest>("SELECT * FROM loan_requests WHERE id = $1")
            .bind(loan_id)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Loan {} not found", loan_id)))
    }
}
