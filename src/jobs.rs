//! Background sweeps
//!
//! Overdue marking and default evaluation, run as the System actor on the
//! configured cron schedule.

use chrono::{NaiveDate, Utc};
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::permission::Actor;
use crate::state::Engine;

/// Result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub overdue_marked: u64,
    pub defaulted: Vec<Uuid>,
}

/// Mark overdue installments, then evaluate defaults, as of `today`
pub async fn run_sweep(engine: &Engine, today: NaiveDate) -> EngineResult<SweepReport> {
    let overdue_marked = engine.repayments.mark_overdue(&Actor::System, today).await?;
    let defaulted = engine
        .repayments
        .evaluate_defaults(&Actor::System, today)
        .await?;

    Ok(SweepReport {
        overdue_marked,
        defaulted,
    })
}

/// Register the sweep on the engine's cron expression and start the scheduler
pub async fn start_scheduler(engine: Engine) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;
    let cron = engine.settings.sweep_cron.clone();

    let job = Job::new_async(cron.as_str(), move |_id, _scheduler| {
        let engine = engine.clone();
        Box::pin(async move {
            let today = Utc::now().date_naive();
            match run_sweep(&engine, today).await {
                Ok(report) => {
                    tracing::info!(
                        %today,
                        overdue = report.overdue_marked,
                        defaulted = report.defaulted.len(),
                        "Repayment sweep finished"
                    );
                    for loan_id in report.defaulted {
                        tracing::warn!(%loan_id, "Loan defaulted by sweep");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Repayment sweep failed");
                }
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    tracing::info!(cron = %cron, "Repayment sweep scheduled");
    Ok(scheduler)
}
