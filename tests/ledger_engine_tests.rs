//! Ledger engine property tests against PostgreSQL
//!
//! Run with `TEST_DATABASE_URL` pointing at a scratch database and
//! `cargo test -- --ignored`.

#[cfg(test)]
mod tests {
    use futures_util::future::join_all;
    use rand::Rng;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use sqlx::PgPool;
    use uuid::Uuid;

    use lendbridge::audit::actions;
    use lendbridge::config::EngineSettings;
    use lendbridge::loan::{LoanRequest, LoanStatus, NewLoanRequest};
    use lendbridge::money::Money;
    use lendbridge::permission::{Actor, PermissionName};
    use lendbridge::repayment::RepaymentStatus;
    use lendbridge::wallet::{TransactionKind, Wallet};
    use lendbridge::{db, Engine, EngineError};

    /// Helper to create a migrated test database pool
    async fn setup_test_db() -> PgPool {
        setup_test_db_with(10).await
    }

    async fn setup_test_db_with(max_connections: u32) -> PgPool {
        let database_url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/lendbridge_test".to_string());

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(&database_url)
            .await
            .expect("Failed to connect to test database");

        db::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        pool
    }

    async fn setup_engine() -> (Engine, PgPool) {
        let pool = setup_test_db().await;
        (Engine::new(pool.clone(), EngineSettings::default()), pool)
    }

    async fn open_wallet(engine: &Engine, user_id: Uuid, opening: Decimal) -> Wallet {
        engine
            .wallets
            .open_wallet(&Actor::System, user_id, "USD", opening)
            .await
            .expect("open wallet")
    }

    /// Borrower with an empty wallet and an approved loan
    async fn approved_loan(engine: &Engine, amount: Decimal, rate: Decimal, term: i32) -> LoanRequest {
        let borrower = Uuid::new_v4();
        open_wallet(engine, borrower, Decimal::ZERO).await;

        let loan = engine
            .loans
            .request_loan(
                &Actor::User(borrower),
                NewLoanRequest {
                    borrower_id: borrower,
                    amount,
                    currency: "USD".to_string(),
                    term_months: term,
                    interest_rate: rate,
                },
            )
            .await
            .expect("request loan");

        engine
            .loans
            .approve_loan(&Actor::System, loan.id)
            .await
            .expect("approve loan")
    }

    async fn balance_of(engine: &Engine, wallet_id: Uuid) -> Money {
        engine
            .wallets
            .balance(&Actor::System, wallet_id)
            .await
            .expect("balance")
    }

    // ========================================================================
    // Wallet Ledger
    // ========================================================================

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_random_postings_keep_balance_equal_to_ledger() {
        let (engine, _pool) = setup_engine().await;
        let user = Uuid::new_v4();
        let actor = Actor::User(user);
        let wallet = open_wallet(&engine, user, dec!(100)).await;

        let mut rng = rand::thread_rng();
        for _ in 0..60 {
            let amount = Decimal::new(rng.gen_range(1..=5_000), 2);
            let result = if rng.gen_bool(0.5) {
                engine
                    .wallets
                    .credit(&actor, wallet.id, amount, TransactionKind::Deposit, None)
                    .await
            } else {
                engine
                    .wallets
                    .debit(&actor, wallet.id, amount, TransactionKind::Withdraw, None)
                    .await
            };

            match result {
                Ok(_) | Err(EngineError::InsufficientFunds { .. }) => {}
                Err(e) => panic!("unexpected error: {:?}", e),
            }

            let check = engine.wallets.verify_balance(wallet.id).await.unwrap();
            assert!(check.is_consistent(), "{:?}", check);
            assert!(check.stored >= Decimal::ZERO);
        }
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_concurrent_debits_never_overdraw() {
        let (engine, _pool) = setup_engine().await;
        let user = Uuid::new_v4();
        let actor = Actor::User(user);
        let wallet = open_wallet(&engine, user, dec!(100)).await;

        let attempts = (0..8).map(|_| {
            engine
                .wallets
                .debit(&actor, wallet.id, dec!(30), TransactionKind::Withdraw, None)
        });
        let results = join_all(attempts).await;

        let accepted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(accepted, 3);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, EngineError::InsufficientFunds { .. })));
        assert_eq!(balance_of(&engine, wallet.id).await, Money::new(dec!(10)).unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_zero_and_fractional_cent_amounts_are_rejected() {
        let (engine, _pool) = setup_engine().await;
        let user = Uuid::new_v4();
        let wallet = open_wallet(&engine, user, Decimal::ZERO).await;

        for amount in [dec!(0), dec!(-5), dec!(0.001)] {
            let err = engine
                .wallets
                .credit(&Actor::System, wallet.id, amount, TransactionKind::Deposit, None)
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidAmount(_)), "{}: {:?}", amount, err);
        }
    }

    // ========================================================================
    // Funding Aggregation
    // ========================================================================

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_concurrent_funding_never_exceeds_requested() {
        let (engine, _pool) = setup_engine().await;
        let loan = approved_loan(&engine, dec!(1000), dec!(12), 12).await;

        let lenders: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();
        for lender in &lenders {
            open_wallet(&engine, *lender, dec!(500)).await;
        }

        let actors: Vec<Actor> = lenders.iter().map(|id| Actor::User(*id)).collect();
        let attempts = lenders.iter().zip(actors.iter()).map(|(lender, actor)| {
            engine.loans.fund_loan(actor, loan.id, *lender, dec!(250))
        });
        let results = join_all(attempts).await;

        let accepted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(accepted, 4);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(
                matches!(
                    err,
                    EngineError::FundingExceedsRequestedAmount { .. } | EngineError::InvalidLoanState(_)
                ),
                "{:?}",
                err
            );
        }

        let status = engine.loans.funding_status(&Actor::System, loan.id).await.unwrap();
        assert_eq!(status.funded, loan.amount_requested);
        assert!(status.remaining.is_zero());
        assert_eq!(status.status, LoanStatus::Active);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_exact_fill_activates_and_generates_schedule_once() {
        let (engine, _pool) = setup_engine().await;
        let loan = approved_loan(&engine, dec!(1000), dec!(12), 12).await;
        let lender = Uuid::new_v4();
        open_wallet(&engine, lender, dec!(1000)).await;

        let outcome = engine
            .loans
            .fund_loan(&Actor::User(lender), loan.id, lender, dec!(1000))
            .await
            .unwrap();
        assert!(outcome.completed_funding);
        assert_eq!(outcome.loan_status, LoanStatus::Active);

        let schedule = engine.repayments.schedule(&Actor::User(lender), loan.id).await.unwrap();
        assert_eq!(schedule.len(), 12);
        assert_eq!(schedule[0].installment_amount(), Money::new(dec!(88.85)).unwrap());

        let again = engine.repayments.generate_schedule(&Actor::System, loan.id).await;
        assert!(matches!(again, Err(EngineError::ScheduleAlreadyExists(id)) if id == loan.id));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_partial_then_exact_fill() {
        let (engine, _pool) = setup_engine().await;
        let loan = approved_loan(&engine, dec!(1000), dec!(12), 12).await;
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        open_wallet(&engine, first, dec!(400)).await;
        open_wallet(&engine, second, dec!(600)).await;

        let partial = engine
            .loans
            .fund_loan(&Actor::User(first), loan.id, first, dec!(400))
            .await
            .unwrap();
        assert!(!partial.completed_funding);
        assert_eq!(partial.loan_status, LoanStatus::Approved);
        assert_eq!(partial.remaining, Money::new(dec!(600)).unwrap());

        let fill = engine
            .loans
            .fund_loan(&Actor::User(second), loan.id, second, dec!(600))
            .await
            .unwrap();
        assert!(fill.completed_funding);
        assert!(fill.remaining.is_zero());
        assert_eq!(fill.loan_status, LoanStatus::Active);

        let funded = engine
            .audit
            .trail_for_action(actions::LOAN_FUNDED, Some(loan.id))
            .await
            .unwrap();
        assert_eq!(funded.len(), 1);

        let borrower_wallet = engine
            .wallets
            .wallet_for_user(&Actor::System, loan.borrower_id, "USD")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(borrower_wallet.balance, Money::new(dec!(1000)).unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_overshoot_is_rejected_and_rolls_back() {
        let (engine, _pool) = setup_engine().await;
        let loan = approved_loan(&engine, dec!(1000), dec!(12), 12).await;
        let lender = Uuid::new_v4();
        let wallet = open_wallet(&engine, lender, dec!(2000)).await;
        let actor = Actor::User(lender);

        engine.loans.fund_loan(&actor, loan.id, lender, dec!(950)).await.unwrap();
        let err = engine
            .loans
            .fund_loan(&actor, loan.id, lender, dec!(100))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::FundingExceedsRequestedAmount { remaining, .. } if remaining == dec!(50)
        ));
        assert_eq!(balance_of(&engine, wallet.id).await, Money::new(dec!(1050)).unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_borrower_cannot_fund_own_loan() {
        let (engine, _pool) = setup_engine().await;
        let loan = approved_loan(&engine, dec!(500), dec!(10), 6).await;
        let borrower = Actor::User(loan.borrower_id);

        let err = engine
            .loans
            .fund_loan(&borrower, loan.id, loan.borrower_id, dec!(100))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotAuthorized(_)));
    }

    // ========================================================================
    // Repayment Settlement
    // ========================================================================

    /// Active 1000 @ 12% / 12 loan funded 700/300; borrower holds `cash`
    async fn active_loan(engine: &Engine, cash: Decimal) -> (LoanRequest, Uuid, Uuid) {
        let loan = approved_loan(engine, dec!(1000), dec!(12), 12).await;
        let lender_a = Uuid::new_v4();
        let lender_b = Uuid::new_v4();
        open_wallet(engine, lender_a, dec!(700)).await;
        open_wallet(engine, lender_b, dec!(300)).await;

        engine.loans.fund_loan(&Actor::User(lender_a), loan.id, lender_a, dec!(700)).await.unwrap();
        engine.loans.fund_loan(&Actor::User(lender_b), loan.id, lender_b, dec!(300)).await.unwrap();

        // the borrower spends the principal, leaving `cash`
        let spent = loan.amount_requested.value() - cash;
        if spent > Decimal::ZERO {
            let wallet = engine
                .wallets
                .wallet_for_user(&Actor::System, loan.borrower_id, "USD")
                .await
                .unwrap()
                .unwrap();
            engine
                .wallets
                .debit(&Actor::System, wallet.id, spent, TransactionKind::Withdraw, None)
                .await
                .unwrap();
        }

        (loan, lender_a, lender_b)
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_settlement_moves_money_to_lenders_pro_rata() {
        let (engine, _pool) = setup_engine().await;
        let (loan, lender_a, lender_b) = active_loan(&engine, dec!(500)).await;
        let borrower = Actor::User(loan.borrower_id);

        let schedule = engine.repayments.schedule(&borrower, loan.id).await.unwrap();
        let receipt = engine
            .repayments
            .settle_payment_on(&borrower, schedule[0].id, schedule[0].due_date)
            .await
            .unwrap();

        assert!(receipt.late_fee.is_zero());
        assert_eq!(receipt.total_paid, Money::new(dec!(88.85)).unwrap());
        assert_eq!(receipt.repayment.status, RepaymentStatus::Paid);

        let paid_out: Money = receipt.payouts.iter().map(|p| p.amount).sum();
        assert_eq!(paid_out, receipt.total_paid);
        let to_a = receipt.payouts.iter().find(|p| p.lender_id == lender_a).unwrap();
        let to_b = receipt.payouts.iter().find(|p| p.lender_id == lender_b).unwrap();
        assert_eq!(to_a.amount, Money::new(dec!(62.20)).unwrap());
        assert_eq!(to_b.amount, Money::new(dec!(26.65)).unwrap());

        let again = engine
            .repayments
            .settle_payment(&borrower, schedule[0].id)
            .await;
        assert!(matches!(again, Err(EngineError::AlreadySettled(_))));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_late_settlement_charges_fee() {
        let (engine, pool) = setup_engine().await;
        let (loan, _, _) = active_loan(&engine, dec!(500)).await;
        let borrower = Actor::User(loan.borrower_id);

        let schedule = engine.repayments.schedule(&borrower, loan.id).await.unwrap();
        let today = chrono::Utc::now().date_naive();
        sqlx::query("UPDATE repayments SET due_date = $2 WHERE id = $1")
            .bind(schedule[0].id)
            .bind(today - chrono::Duration::days(30))
            .execute(&pool)
            .await
            .unwrap();

        let receipt = engine
            .repayments
            .settle_payment_on(&borrower, schedule[0].id, today)
            .await
            .unwrap();

        assert_eq!(receipt.late_fee, Money::new(dec!(1.33)).unwrap());
        assert_eq!(receipt.total_paid, Money::new(dec!(90.18)).unwrap());
        assert_eq!(receipt.repayment.late_fee, receipt.late_fee);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_insufficient_funds_leaves_installment_unpaid() {
        let (engine, _pool) = setup_engine().await;
        let (loan, lender_a, _) = active_loan(&engine, dec!(10)).await;
        let borrower = Actor::User(loan.borrower_id);

        let schedule = engine.repayments.schedule(&borrower, loan.id).await.unwrap();
        let lender_wallet = engine
            .wallets
            .wallet_for_user(&Actor::System, lender_a, "USD")
            .await
            .unwrap()
            .unwrap();
        let before = lender_wallet.balance;

        let err = engine
            .repayments
            .settle_payment(&borrower, schedule[0].id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));

        let after = engine.repayments.schedule(&borrower, loan.id).await.unwrap();
        assert_eq!(after[0].status, RepaymentStatus::Pending);
        assert_eq!(balance_of(&engine, lender_wallet.id).await, before);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_paying_every_installment_completes_loan() {
        let (engine, _pool) = setup_engine().await;
        let loan = approved_loan(&engine, dec!(300), dec!(0), 3).await;
        let lender = Uuid::new_v4();
        open_wallet(&engine, lender, dec!(300)).await;
        engine.loans.fund_loan(&Actor::User(lender), loan.id, lender, dec!(300)).await.unwrap();

        let borrower = Actor::User(loan.borrower_id);
        let schedule = engine.repayments.schedule(&borrower, loan.id).await.unwrap();
        let mut last_status = LoanStatus::Active;
        for repayment in &schedule {
            let receipt = engine
                .repayments
                .settle_payment_on(&borrower, repayment.id, repayment.due_date)
                .await
                .unwrap();
            last_status = receipt.loan_status;
        }
        assert_eq!(last_status, LoanStatus::Completed);

        let borrower_wallet = engine
            .wallets
            .wallet_for_user(&borrower, loan.borrower_id, "USD")
            .await
            .unwrap()
            .unwrap();
        assert!(borrower_wallet.balance.is_zero());
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_only_the_borrower_settles() {
        let (engine, _pool) = setup_engine().await;
        let (loan, lender_a, _) = active_loan(&engine, dec!(500)).await;

        let schedule = engine
            .repayments
            .schedule(&Actor::User(loan.borrower_id), loan.id)
            .await
            .unwrap();
        let err = engine
            .repayments
            .settle_payment(&Actor::User(lender_a), schedule[0].id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotAuthorized(_)));

        // trusted upstream auto-debit runs as System
        let receipt = engine
            .repayments
            .settle_payment_on(&Actor::System, schedule[0].id, schedule[0].due_date)
            .await
            .unwrap();
        assert_eq!(receipt.repayment.status, RepaymentStatus::Paid);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_missed_installments_default_the_loan() {
        let (engine, pool) = setup_engine().await;
        let (loan, _, _) = active_loan(&engine, dec!(0)).await;

        let today = chrono::Utc::now().date_naive();
        sqlx::query(
            "UPDATE repayments SET due_date = $2 - (200 - installment_number * 30) WHERE loan_id = $1 AND installment_number <= 3",
        )
        .bind(loan.id)
        .bind(today)
        .execute(&pool)
        .await
        .unwrap();

        let marked = engine.repayments.mark_overdue(&Actor::System, today).await.unwrap();
        assert!(marked >= 3);

        let defaulted = engine
            .repayments
            .evaluate_defaults(&Actor::System, today)
            .await
            .unwrap();
        assert!(defaulted.contains(&loan.id));

        let loan = engine.loans.get_loan(&Actor::System, loan.id).await.unwrap();
        assert_eq!(loan.status, LoanStatus::Defaulted);
        assert!(loan.closed_at.is_some());
    }

    // ========================================================================
    // Permissions And Audit
    // ========================================================================

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_denied_approval_is_audited() {
        let (engine, _pool) = setup_engine().await;
        let borrower = Uuid::new_v4();
        let loan = engine
            .loans
            .request_loan(
                &Actor::User(borrower),
                NewLoanRequest {
                    borrower_id: borrower,
                    amount: dec!(100),
                    currency: "USD".to_string(),
                    term_months: 3,
                    interest_rate: dec!(5),
                },
            )
            .await
            .unwrap();

        let outsider = Uuid::new_v4();
        let err = engine
            .loans
            .approve_loan(&Actor::User(outsider), loan.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotAuthorized(_)));

        let err = engine.loans.approve_loan(&Actor::Anonymous, loan.id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotAuthorized(_)));

        let trail = engine.audit.trail_for_user(outsider).await.unwrap();
        assert!(trail.iter().any(|e| e.action == actions::PERMISSION_DENIED));

        let approvals = engine
            .audit
            .trail_for_action(actions::LOAN_APPROVED, Some(loan.id))
            .await
            .unwrap();
        assert!(approvals.is_empty());

        let loan = engine.loans.get_loan(&Actor::User(borrower), loan.id).await.unwrap();
        assert_eq!(loan.status, LoanStatus::Pending);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_granted_approver_records_approval() {
        let (engine, _pool) = setup_engine().await;
        let approver = Uuid::new_v4();
        engine
            .permissions
            .grant(&Actor::System, approver, PermissionName::ApproveLoan)
            .await
            .unwrap();

        let borrower = Uuid::new_v4();
        let loan = engine
            .loans
            .request_loan(
                &Actor::User(borrower),
                NewLoanRequest {
                    borrower_id: borrower,
                    amount: dec!(250),
                    currency: "USD".to_string(),
                    term_months: 6,
                    interest_rate: dec!(8),
                },
            )
            .await
            .unwrap();

        let approved = engine
            .loans
            .approve_loan(&Actor::User(approver), loan.id)
            .await
            .unwrap();
        assert_eq!(approved.status, LoanStatus::Approved);
        assert_eq!(approved.approved_by, Some(approver));
        assert!(approved.approved_at.is_some());

        let trail = engine
            .audit
            .trail_for_action(actions::LOAN_APPROVED, Some(loan.id))
            .await
            .unwrap();
        assert_eq!(trail.len(), 1);

        engine
            .permissions
            .revoke(&Actor::System, approver, PermissionName::ApproveLoan)
            .await
            .unwrap();
        assert!(!engine
            .permissions
            .authorize(&Actor::User(approver), PermissionName::ApproveLoan)
            .await);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_refused_settlement_is_audited_on_a_single_connection_pool() {
        let pool = setup_test_db_with(1).await;
        let engine = Engine::new(pool.clone(), EngineSettings::default());
        let (loan, lender_a, _) = active_loan(&engine, dec!(500)).await;

        let schedule = engine
            .repayments
            .schedule(&Actor::User(loan.borrower_id), loan.id)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let err = engine
            .repayments
            .settle_payment(&Actor::User(lender_a), schedule[0].id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotAuthorized(_)));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));

        let trail = engine.audit.trail_for_user(lender_a).await.unwrap();
        assert!(trail
            .iter()
            .any(|e| e.action == actions::PERMISSION_DENIED && e.details.contains("SettlePayment")));

        let pending = approved_loan(&engine, dec!(100), dec!(5), 3).await;
        let borrower = pending.borrower_id;
        let err = engine
            .loans
            .fund_loan(&Actor::User(borrower), pending.id, borrower, dec!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotAuthorized(_)));

        let trail = engine.audit.trail_for_user(borrower).await.unwrap();
        assert!(trail
            .iter()
            .any(|e| e.action == actions::PERMISSION_DENIED && e.details.contains("FundLoan")));

        let after = engine
            .repayments
            .schedule(&Actor::User(loan.borrower_id), loan.id)
            .await
            .unwrap();
        assert_eq!(after[0].status, RepaymentStatus::Pending);
    }
}
