//! Repayment scheduler - schedule generation, settlement and sweeps

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::schedule::amortize;
use super::{
    split_pro_rata, DefaultPolicy, LateFeePolicy, Repayment, RepaymentStatus, SettlementReceipt,
};
use crate::audit::{actions, AuditEntry, AuditService};
use crate::error::{retry_on_conflict, EngineError, EngineResult};
use crate::loan::{lender_shares, lock_loan, require_loan_viewer, transition, LoanRequest, LoanStatus};
use crate::money::Money;
use crate::permission::{Actor, PermissionName, PermissionService};
use crate::wallet::ledger;
use crate::wallet::{Posting, TransactionKind, Wallet};

/// Insert the amortized schedule of `loan` on the caller's connection.
///
/// Fails with `ScheduleAlreadyExists` if any installment exists already.
pub(crate) async fn generate_schedule_in(
    conn: &mut PgConnection,
    loan: &LoanRequest,
    start: NaiveDate,
    actor: &Actor,
) -> EngineResult<Vec<Repayment>> {
    if schedule_exists(conn, loan.id).await? {
        return Err(EngineError::ScheduleAlreadyExists(loan.id));
    }

    let term = u32::try_from(loan.term_months).map_err(|_| {
        EngineError::InvalidLoanState(format!("Loan {} has an invalid term", loan.id))
    })?;
    let installments = amortize(loan.amount_requested, loan.interest_rate, term, start)?;

    let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO repayments (id, loan_id, installment_number, due_date, principal, interest, late_fee, status) ",
    );
    query_builder.push_values(&installments, |mut row, installment| {
        row.push_bind(Uuid::new_v4())
            .push_bind(loan.id)
            .push_bind(installment.number as i32)
            .push_bind(installment.due_date)
            .push_bind(installment.principal)
            .push_bind(installment.interest)
            .push_bind(Money::ZERO)
            .push_bind(RepaymentStatus::Pending);
    });
    query_builder.push(" RETURNING *");

    let mut rows = query_builder
        .build_query_as::<Repayment>()
        .fetch_all(&mut *conn)
        .await?;
    rows.sort_by_key(|r| r.installment_number);

    let payment = installments
        .first()
        .map(|i| i.total())
        .unwrap_or(Money::ZERO);
    AuditService::record(
        &mut *conn,
        AuditEntry::new(
            actor,
            "repayment",
            actions::SCHEDULE_GENERATED,
            format!(
                "loan={} installments={} payment={} first_due={}",
                loan.id,
                rows.len(),
                payment,
                start
            ),
        ),
    )
    .await?;

    tracing::info!(loan_id = %loan.id, installments = rows.len(), %payment, "Repayment schedule generated");
    Ok(rows)
}

async fn schedule_exists(conn: &mut PgConnection, loan_id: Uuid) -> EngineResult<bool> {
    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM repayments WHERE loan_id = $1)",
    )
    .bind(loan_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

async fn load_schedule(conn: &mut PgConnection, loan_id: Uuid) -> EngineResult<Vec<Repayment>> {
    let rows = sqlx::query_as::<_, Repayment>(
        "SELECT * FROM repayments WHERE loan_id = $1 ORDER BY installment_number",
    )
    .bind(loan_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

fn locked<'a>(wallets: &'a mut [Wallet], wallet_id: Uuid) -> EngineResult<&'a mut Wallet> {
    wallets
        .iter_mut()
        .find(|w| w.id == wallet_id)
        .ok_or_else(|| EngineError::NotFound(format!("Wallet {} not locked", wallet_id)))
}

/// Repayment scheduler
#[derive(Clone)]
pub struct RepaymentService {
    db_pool: PgPool,
    permissions: PermissionService,
    late_fee: LateFeePolicy,
    default_policy: Arc<dyn DefaultPolicy>,
    max_tx_retries: u32,
}

impl RepaymentService {
    pub fn new(
        db_pool: PgPool,
        permissions: PermissionService,
        late_fee: LateFeePolicy,
        default_policy: Arc<dyn DefaultPolicy>,
        max_tx_retries: u32,
    ) -> Self {
        Self {
            db_pool,
            permissions,
            late_fee,
            default_policy,
            max_tx_retries,
        }
    }

    /// Generate the schedule of an Active loan whose schedule was not
    /// created at activation. Requires `ApproveLoan`.
    pub async fn generate_schedule(&self, actor: &Actor, loan_id: Uuid) -> EngineResult<Vec<Repayment>> {
        self.permissions
            .require(actor, PermissionName::ApproveLoan, "GenerateSchedule")
            .await?;

        retry_on_conflict(self.max_tx_retries, || async move {
            let mut tx = self.db_pool.begin().await?;
            let loan = lock_loan(&mut tx, loan_id).await?;

            if schedule_exists(&mut tx, loan_id).await? {
                return Err(EngineError::ScheduleAlreadyExists(loan_id));
            }
            if loan.status != LoanStatus::Active {
                return Err(EngineError::InvalidLoanState(format!(
                    "Loan {} is {}; schedules are generated for active loans",
                    loan_id,
                    loan.status.as_str()
                )));
            }

            let start = loan.activated_at.unwrap_or_else(Utc::now).date_naive();
            let rows = generate_schedule_in(&mut tx, &loan, start, actor).await?;
            tx.commit().await?;
            Ok(rows)
        })
        .await
    }

    /// Settle an installment as of today
    pub async fn settle_payment(&self, actor: &Actor, repayment_id: Uuid) -> EngineResult<SettlementReceipt> {
        self.settle_payment_on(actor, repayment_id, Utc::now().date_naive())
            .await
    }

    /// Settle an installment as of `today`.
    ///
    /// Debits the borrower for the installment plus any late fee, credits
    /// every lender its pro-rata share, marks the row Paid and completes the
    /// loan when nothing remains unpaid. All in one transaction.
    pub async fn settle_payment_on(
        &self,
        actor: &Actor,
        repayment_id: Uuid,
        today: NaiveDate,
    ) -> EngineResult<SettlementReceipt> {
        let receipt = retry_on_conflict(self.max_tx_retries, || {
            self.settle_once(actor, repayment_id, today)
        })
        .await?;

        tracing::info!(
            %repayment_id,
            loan_id = %receipt.repayment.loan_id,
            installment = receipt.repayment.installment_number,
            total = %receipt.total_paid,
            late_fee = %receipt.late_fee,
            lenders = receipt.payouts.len(),
            loan_status = receipt.loan_status.as_str(),
            "Repayment settled"
        );

        Ok(receipt)
    }

    async fn settle_once(
        &self,
        actor: &Actor,
        repayment_id: Uuid,
        today: NaiveDate,
    ) -> EngineResult<SettlementReceipt> {
        let mut tx = self.db_pool.begin().await?;

        let loan_id = sqlx::query_scalar::<_, Uuid>("SELECT loan_id FROM repayments WHERE id = $1")
            .bind(repayment_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Repayment {} not found", repayment_id)))?;

        // Lock order: loan, repayment, wallets
        let mut loan = lock_loan(&mut tx, loan_id).await?;
        let repayment = sqlx::query_as::<_, Repayment>("SELECT * FROM repayments WHERE id = $1 FOR UPDATE")
            .bind(repayment_id)
            .fetch_one(&mut *tx)
            .await?;

        if !(actor.is(loan.borrower_id) || actor.is_system()) {
            // release row locks and the connection before the denial is audited
            tx.rollback().await?;
            return Err(self
                .permissions
                .deny(actor, "SettlePayment", "payer is not the borrower")
                .await);
        }
        if repayment.is_settled() {
            return Err(EngineError::AlreadySettled(repayment_id));
        }
        if loan.status != LoanStatus::Active {
            return Err(EngineError::InvalidLoanState(format!(
                "Loan {} is {} and cannot take repayments",
                loan_id,
                loan.status.as_str()
            )));
        }

        let installment = repayment.installment_amount();
        let late_fee = self.late_fee.fee_for(installment, repayment.due_date, today);
        let total = installment
            .checked_add(late_fee)
            .ok_or_else(|| EngineError::InvalidAmount("Repayment total overflow".to_string()))?;

        let shares = lender_shares(&mut tx, loan_id).await?;
        let payouts = split_pro_rata(total, &shares)?;

        let borrower_wallet_id = ledger::wallet_id_for(&mut tx, loan.borrower_id, &loan.currency).await?;
        let mut lender_wallet_ids = HashMap::with_capacity(payouts.len());
        for payout in &payouts {
            let wallet_id = ledger::wallet_id_for(&mut tx, payout.lender_id, &loan.currency).await?;
            lender_wallet_ids.insert(payout.lender_id, wallet_id);
        }
        let mut all_ids: Vec<Uuid> = lender_wallet_ids.values().copied().collect();
        all_ids.push(borrower_wallet_id);
        let mut wallets = ledger::lock_wallets(&mut tx, &all_ids).await?;

        ledger::post(
            &mut tx,
            locked(&mut wallets, borrower_wallet_id)?,
            Posting::debit(total, TransactionKind::RepaymentDebit, Some(loan_id)),
            actor,
        )
        .await?;

        for payout in payouts.iter().filter(|p| p.amount.is_positive()) {
            let wallet_id = lender_wallet_ids
                .get(&payout.lender_id)
                .copied()
                .ok_or_else(|| EngineError::NotFound(format!("No wallet for lender {}", payout.lender_id)))?;
            ledger::post(
                &mut tx,
                locked(&mut wallets, wallet_id)?,
                Posting::credit(payout.amount, TransactionKind::RepaymentReceived, Some(loan_id)),
                actor,
            )
            .await?;
        }

        let repayment = sqlx::query_as::<_, Repayment>(
            r#"
            UPDATE repayments
            SET status = $2, late_fee = $3, paid_at = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(repayment_id)
        .bind(RepaymentStatus::Paid)
        .bind(late_fee)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        AuditService::record(
            &mut *tx,
            AuditEntry::new(
                actor,
                "repayment",
                actions::REPAYMENT_SETTLED,
                format!(
                    "loan={} repayment={} installment={} amount={} late_fee={} total={}",
                    loan_id, repayment_id, repayment.installment_number, installment, late_fee, total
                ),
            ),
        )
        .await?;

        let unpaid = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM repayments WHERE loan_id = $1 AND status <> $2",
        )
        .bind(loan_id)
        .bind(RepaymentStatus::Paid)
        .fetch_one(&mut *tx)
        .await?;

        if unpaid == 0 {
            transition(&mut tx, &mut loan, LoanStatus::Completed, actor, "all installments paid").await?;
        }

        tx.commit().await?;

        Ok(SettlementReceipt {
            repayment,
            late_fee,
            total_paid: total,
            payouts: payouts.into_iter().filter(|p| p.amount.is_positive()).collect(),
            loan_status: loan.status,
        })
    }

    /// Persist Overdue for Pending installments of active loans due before
    /// `today`. Returns the number of rows changed. Requires `ApproveLoan`.
    pub async fn mark_overdue(&self, actor: &Actor, today: NaiveDate) -> EngineResult<u64> {
        self.permissions
            .require(actor, PermissionName::ApproveLoan, "MarkOverdue")
            .await?;

        let mut tx = self.db_pool.begin().await?;

        let marked = sqlx::query(
            r#"
            UPDATE repayments r
            SET status = $1
            FROM loan_requests l
            WHERE r.loan_id = l.id
              AND l.status = $2
              AND r.status = $3
              AND r.due_date < $4
            "#,
        )
        .bind(RepaymentStatus::Overdue)
        .bind(LoanStatus::Active)
        .bind(RepaymentStatus::Pending)
        .bind(today)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if marked > 0 {
            AuditService::record(
                &mut *tx,
                AuditEntry::new(
                    actor,
                    "repayment",
                    actions::REPAYMENTS_OVERDUE,
                    format!("{} installments overdue as of {}", marked, today),
                ),
            )
            .await?;
        }

        tx.commit().await?;

        if marked > 0 {
            tracing::warn!(count = marked, %today, "Installments marked overdue");
        }
        Ok(marked)
    }

    /// Run the default policy over every active loan and transition the
    /// flagged ones to Defaulted. Returns the ids that defaulted.
    /// Requires `ApproveLoan`.
    pub async fn evaluate_defaults(&self, actor: &Actor, today: NaiveDate) -> EngineResult<Vec<Uuid>> {
        self.permissions
            .require(actor, PermissionName::ApproveLoan, "EvaluateDefaults")
            .await?;

        let active = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM loan_requests WHERE status = $1 ORDER BY id",
        )
        .bind(LoanStatus::Active)
        .fetch_all(&self.db_pool)
        .await?;

        let mut defaulted = Vec::new();
        for loan_id in active {
            let outcome = retry_on_conflict(self.max_tx_retries, || {
                self.default_if_due(actor, loan_id, today)
            })
            .await;

            match outcome {
                Ok(true) => defaulted.push(loan_id),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(%loan_id, error = %e, "Default evaluation failed");
                }
            }
        }

        if !defaulted.is_empty() {
            tracing::warn!(count = defaulted.len(), policy = %self.default_policy.describe(), "Loans defaulted");
        }
        Ok(defaulted)
    }

    async fn default_if_due(&self, actor: &Actor, loan_id: Uuid, today: NaiveDate) -> EngineResult<bool> {
        let mut tx = self.db_pool.begin().await?;
        let mut loan = lock_loan(&mut tx, loan_id).await?;
        if loan.status != LoanStatus::Active {
            return Ok(false);
        }

        let schedule = load_schedule(&mut tx, loan_id).await?;
        if !self.default_policy.should_default(&schedule, today) {
            return Ok(false);
        }

        let reason = format!("policy: {}", self.default_policy.describe());
        transition(&mut tx, &mut loan, LoanStatus::Defaulted, actor, &reason).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Installments of a loan in order. Borrower, a lender, or `ViewAnyLoan`.
    pub async fn schedule(&self, actor: &Actor, loan_id: Uuid) -> EngineResult<Vec<Repayment>> {
        let loan = sqlx::query_as::<_, LoanRequest>("SELECT * FROM loan_requests WHERE id = $1")
            .bind(loan_id)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Loan {} not found", loan_id)))?;
        require_loan_viewer(&self.db_pool, &self.permissions, actor, &loan, "GetSchedule").await?;

        let mut conn = self.db_pool.acquire().await?;
        load_schedule(&mut conn, loan_id).await
    }
}
