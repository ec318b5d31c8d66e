//! Engine handle bundling every service over one pool

use std::sync::Arc;

use axum::extract::FromRef;
use sqlx::PgPool;

use crate::audit::AuditService;
use crate::config::EngineSettings;
use crate::loan::LoanService;
use crate::permission::PermissionService;
use crate::repayment::{DefaultPolicy, RepaymentService};
use crate::wallet::WalletService;

/// Services sharing one pool and one set of engine settings.
///
/// Cheap to clone; a host API can hand it to axum as router state and
/// extract the individual services through `FromRef`.
#[derive(Clone)]
pub struct Engine {
    pub audit: Arc<AuditService>,
    pub permissions: Arc<PermissionService>,
    pub wallets: Arc<WalletService>,
    pub loans: Arc<LoanService>,
    pub repayments: Arc<RepaymentService>,
    pub settings: Arc<EngineSettings>,
}

impl Engine {
    /// Build the engine with the settings' missed-installments default policy
    pub fn new(db_pool: PgPool, settings: EngineSettings) -> Self {
        let policy: Arc<dyn DefaultPolicy> = Arc::new(settings.default_policy.clone());
        Self::with_default_policy(db_pool, settings, policy)
    }

    /// Build the engine with a custom default policy
    pub fn with_default_policy(
        db_pool: PgPool,
        settings: EngineSettings,
        default_policy: Arc<dyn DefaultPolicy>,
    ) -> Self {
        let audit = AuditService::new(db_pool.clone());
        let permissions = PermissionService::new(db_pool.clone(), audit.clone());

        let wallets = WalletService::new(
            db_pool.clone(),
            permissions.clone(),
            settings.max_tx_retries,
        );
        let loans = LoanService::new(
            db_pool.clone(),
            permissions.clone(),
            settings.max_tx_retries,
            settings.activate_on_full_funding,
        );
        let repayments = RepaymentService::new(
            db_pool,
            permissions.clone(),
            settings.late_fee.clone(),
            default_policy,
            settings.max_tx_retries,
        );

        tracing::debug!(
            max_tx_retries = settings.max_tx_retries,
            activate_on_full_funding = settings.activate_on_full_funding,
            "Engine services initialized"
        );

        Self {
            audit: Arc::new(audit),
            permissions: Arc::new(permissions),
            wallets: Arc::new(wallets),
            loans: Arc::new(loans),
            repayments: Arc::new(repayments),
            settings: Arc::new(settings),
        }
    }
}

impl FromRef<Engine> for Arc<WalletService> {
    fn from_ref(engine: &Engine) -> Self {
        engine.wallets.clone()
    }
}

impl FromRef<Engine> for Arc<LoanService> {
    fn from_ref(engine: &Engine) -> Self {
        engine.loans.clone()
    }
}

impl FromRef<Engine> for Arc<RepaymentService> {
    fn from_ref(engine: &Engine) -> Self {
        engine.repayments.clone()
    }
}

impl FromRef<Engine> for Arc<PermissionService> {
    fn from_ref(engine: &Engine) -> Self {
        engine.permissions.clone()
    }
}

impl FromRef<Engine> for Arc<AuditService> {
    fn from_ref(engine: &Engine) -> Self {
        engine.audit.clone()
    }
}
