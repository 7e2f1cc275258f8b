//! services/billing/src/scheduler.rs
//!
//! Cron jobs of the billing worker: the recurring billing cycle and the daily
//! sweeps for expired offers and overdue invoices.

use freelance_core::evaluator::BillingCycleEvaluator;
use freelance_core::lifecycle::StatusLifecycle;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info};

pub struct BillingScheduler {
    scheduler: JobScheduler,
    evaluator: Arc<BillingCycleEvaluator>,
    lifecycle: Arc<StatusLifecycle>,
    evaluator_cron: String,
    sweep_cron: String,
}

impl BillingScheduler {
    pub async fn new(
        evaluator: Arc<BillingCycleEvaluator>,
        lifecycle: Arc<StatusLifecycle>,
        evaluator_cron: String,
        sweep_cron: String,
    ) -> Result<Self, JobSchedulerError> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler,
            evaluator,
            lifecycle,
            evaluator_cron,
            sweep_cron,
        })
    }

    /// Registers every job and starts ticking.
    pub async fn start(&self) -> Result<(), JobSchedulerError> {
        info!("Starting scheduled jobs...");

        self.add_billing_cycle_job().await?;
        self.add_daily_sweep_job().await?;

        self.scheduler.start().await?;
        info!("All scheduled jobs started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), JobSchedulerError> {
        self.scheduler.shutdown().await
    }

    async fn add_billing_cycle_job(&self) -> Result<(), JobSchedulerError> {
        let evaluator = self.evaluator.clone();

        let job = Job::new_async(self.evaluator_cron.as_str(), move |_uuid, _l| {
            let evaluator = evaluator.clone();
            Box::pin(async move {
                match evaluator.run_once().await {
                    Ok(report) if !report.generated.is_empty() => {
                        info!(invoices = ?report.generated, "Billing cycle generated invoices")
                    }
                    Ok(_) => {}
                    Err(e) => error!("Billing cycle could not list projects: {}", e),
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!(cron = %self.evaluator_cron, "Added billing cycle job");
        Ok(())
    }

    async fn add_daily_sweep_job(&self) -> Result<(), JobSchedulerError> {
        let lifecycle = self.lifecycle.clone();

        let job = Job::new_async(self.sweep_cron.as_str(), move |_uuid, _l| {
            let lifecycle = lifecycle.clone();
            Box::pin(async move {
                run_daily_sweep(&lifecycle).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!(cron = %self.sweep_cron, "Added daily sweep job");
        Ok(())
    }
}

/// Expires stale offers, then flags overdue invoices and sends reminders.
pub async fn run_daily_sweep(lifecycle: &StatusLifecycle) {
    info!("Running daily sweep...");

    match lifecycle.expire_offers().await {
        Ok(count) => info!("Expired {} offers", count),
        Err(e) => error!("Error expiring offers: {}", e),
    }

    match lifecycle.process_overdue_invoices().await {
        Ok(report) => info!(
            flagged = report.flagged_overdue,
            reminded = report.reminders_sent,
            capped = report.reminders_capped,
            failed = report.failed,
            "Overdue sweep finished"
        ),
        Err(e) => error!("Error processing overdue invoices: {}", e),
    }
}
