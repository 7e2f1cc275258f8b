//! crates/freelance_core/src/evaluator.rs
//!
//! The recurring billing cycle: picks the projects whose auto-generation
//! interval has elapsed and builds one invoice per project, each in its own
//! unit of work.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::builder::InvoiceBuilder;
use crate::domain::{DocumentRef, Invoice, Project};
use crate::error::BillingResult;
use crate::numbering::NumberingAssigner;
use crate::policy::BillingPolicy;
use crate::ports::{BillingPorts, PortResult};

/// Whether `project` should get an automatic invoice at `now`.
pub fn is_due(project: &Project, now: DateTime<Utc>) -> bool {
    if !project.auto_generate_invoice {
        return false;
    }
    let Some(interval) = project.auto_generation_interval() else {
        return false;
    };
    match project.last_auto_generated_at {
        None => true,
        Some(last) => now - last >= interval,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Generated { invoice_id: i64, number: Option<String> },
    NothingToBill,
    /// An overlapping cycle claimed the project first.
    AlreadyClaimed,
    /// Skipped after too many consecutive failures.
    Suspended,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub evaluated: usize,
    pub generated: Vec<i64>,
    pub nothing_to_bill: usize,
    pub already_claimed: usize,
    pub suspended: usize,
    pub failed: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: GenerationOutcome) {
        match outcome {
            GenerationOutcome::Generated { invoice_id, .. } => self.generated.push(invoice_id),
            GenerationOutcome::NothingToBill => self.nothing_to_bill += 1,
            GenerationOutcome::AlreadyClaimed => self.already_claimed += 1,
            GenerationOutcome::Suspended => self.suspended += 1,
            GenerationOutcome::Failed(_) => self.failed += 1,
        }
    }
}

pub struct BillingCycleEvaluator {
    ports: BillingPorts,
    builder: InvoiceBuilder,
    numbering: NumberingAssigner,
    policy: BillingPolicy,
}

impl BillingCycleEvaluator {
    pub fn new(ports: BillingPorts, policy: BillingPolicy) -> Self {
        let builder = InvoiceBuilder::new(Arc::clone(&ports.repository), policy.clone());
        let numbering = NumberingAssigner::new(Arc::clone(&ports.repository));
        Self {
            ports,
            builder,
            numbering,
            policy,
        }
    }

    /// Runs one billing cycle over every due project.
    pub async fn run_once(&self) -> PortResult<CycleReport> {
        let now = self.ports.clock.now();
        let due: Vec<Project> = self
            .ports
            .repository
            .list_auto_invoicing_projects()
            .await?
            .into_iter()
            .filter(|project| is_due(project, now))
            .collect();

        let mut report = CycleReport {
            evaluated: due.len(),
            ..CycleReport::default()
        };
        let outcomes: Vec<GenerationOutcome> = stream::iter(due)
            .map(|project| self.generate_for(project, now))
            .buffer_unordered(self.policy.evaluator_concurrency.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            report.record(outcome);
        }
        report.generated.sort_unstable();

        info!(
            evaluated = report.evaluated,
            generated = report.generated.len(),
            already_claimed = report.already_claimed,
            failed = report.failed,
            suspended = report.suspended,
            "Billing cycle finished"
        );
        Ok(report)
    }

    /// One isolated unit of work. Never returns an error; failures are recorded
    /// on the project so the next cycle retries, up to the configured cap.
    pub async fn generate_for(&self, project: Project, now: DateTime<Utc>) -> GenerationOutcome {
        let repository = &self.ports.repository;
        let failures = project.auto_generation_failures;

        if failures >= self.policy.max_auto_generation_failures {
            warn!(
                project_id = project.id,
                tenant_id = %project.tenant_id,
                failures,
                "Automatic invoicing suspended for project"
            );
            return GenerationOutcome::Suspended;
        }

        // Claim against the stamp this cycle listed; an overlapping cycle loses.
        match repository
            .claim_auto_generation(project.id, project.last_auto_generated_at, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(project_id = project.id, "Project already claimed by another billing cycle");
                return GenerationOutcome::AlreadyClaimed;
            }
            Err(e) => {
                error!(project_id = project.id, "Failed to stamp project before invoicing: {:?}", e);
                return GenerationOutcome::Failed(e.to_string());
            }
        }

        match self.generate(&project, now).await {
            Ok(Some(invoice)) => {
                if failures != 0 {
                    if let Err(e) = repository
                        .set_auto_generation_state(project.id, Some(now), 0)
                        .await
                    {
                        warn!(project_id = project.id, "Failed to reset failure counter: {:?}", e);
                    }
                }
                info!(
                    project_id = project.id,
                    invoice_id = invoice.id,
                    number = invoice.number.as_deref().unwrap_or_default(),
                    "Generated automatic invoice"
                );
                GenerationOutcome::Generated {
                    invoice_id: invoice.id,
                    number: invoice.number,
                }
            }
            Ok(None) => {
                info!(project_id = project.id, "No billable time in the current window");
                GenerationOutcome::NothingToBill
            }
            Err(e) => {
                let failures = failures + 1;
                error!(
                    project_id = project.id,
                    tenant_id = %project.tenant_id,
                    failures,
                    "Automatic invoice generation failed: {}",
                    e
                );
                if let Err(reset_err) = repository
                    .set_auto_generation_state(project.id, None, failures)
                    .await
                {
                    error!(project_id = project.id, "Failed to reset generation stamp: {:?}", reset_err);
                }
                if failures >= self.policy.max_auto_generation_failures {
                    error!(
                        project_id = project.id,
                        "Automatic invoicing suspended after {} consecutive failures",
                        failures
                    );
                }
                GenerationOutcome::Failed(e.to_string())
            }
        }
    }

    async fn generate(&self, project: &Project, now: DateTime<Utc>) -> BillingResult<Option<Invoice>> {
        let repository = &self.ports.repository;
        let aggregate = repository
            .get_project_aggregate(project.tenant_id, project.id)
            .await?;
        let settings = repository.get_tenant_settings(project.tenant_id).await?;

        let Some(mut invoice) = self.builder.build(&aggregate, &settings, now).await? else {
            return Ok(None);
        };
        self.numbering.assign_invoice(&mut invoice).await?;

        if let Err(e) = self
            .ports
            .jobs
            .enqueue_render(DocumentRef::invoice(invoice.tenant_id, invoice.id))
            .await
        {
            warn!(invoice_id = invoice.id, "Failed to queue invoice render: {:?}", e);
        }
        Ok(Some(invoice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn project(last: Option<DateTime<Utc>>, days: Option<i32>) -> Project {
        Project {
            id: 1,
            tenant_id: Uuid::nil(),
            client_id: 1,
            name: "Retainer".into(),
            hourly_rate: dec!(90),
            auto_generate_invoice: true,
            auto_generate_amount: days,
            last_auto_generated_at: last,
            auto_generation_failures: 0,
        }
    }

    #[test]
    fn never_generated_projects_are_due() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert!(is_due(&project(None, Some(30)), now));
    }

    #[test]
    fn interval_must_fully_elapse() {
        let now = Utc.with_ymd_and_hms(2024, 5, 31, 0, 0, 0).unwrap();
        let almost = project(Some(now - Duration::days(30) + Duration::minutes(1)), Some(30));
        let exactly = project(Some(now - Duration::days(30)), Some(30));
        assert!(!is_due(&almost, now));
        assert!(is_due(&exactly, now));
    }

    #[test]
    fn disabled_or_unconfigured_projects_are_never_due() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let mut disabled = project(None, Some(30));
        disabled.auto_generate_invoice = false;
        assert!(!is_due(&disabled, now));
        assert!(!is_due(&project(None, None), now));
    }
}
