//! crates/freelance_core/src/builder.rs
//!
//! Turns a project's tracked time into an invoice. Drafting is pure; persisting
//! the invoice together with its items is a single atomic repository call.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::domain::{
    ClientSnapshot, Invoice, InvoiceStatus, NewInvoice, NewLineItem, ProjectAggregate,
    TenantSettings, TimeEntry,
};
use crate::error::{BillingError, BillingResult};
use crate::policy::BillingPolicy;
use crate::ports::BillingRepository;

pub struct InvoiceBuilder {
    repository: Arc<dyn BillingRepository>,
    policy: BillingPolicy,
}

impl InvoiceBuilder {
    pub fn new(repository: Arc<dyn BillingRepository>, policy: BillingPolicy) -> Self {
        Self { repository, policy }
    }

    /// Drafts the invoice for the trailing auto-generation window ending at `now`.
    ///
    /// Returns `Ok(None)` when no time entry started inside the window.
    pub fn draft(
        &self,
        aggregate: &ProjectAggregate,
        settings: &TenantSettings,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<NewInvoice>> {
        let project = &aggregate.project;
        if project.hourly_rate.is_sign_negative() {
            return Err(BillingError::Validation(format!(
                "project {} has a negative hourly rate",
                project.id
            )));
        }
        let interval = project.auto_generation_interval().ok_or_else(|| {
            BillingError::Validation(format!(
                "project {} has no auto-generation interval",
                project.id
            ))
        })?;

        let billable = billable_entries(&aggregate.time_entries, now, interval);
        if billable.is_empty() {
            return Ok(None);
        }

        let items = billable
            .into_iter()
            .map(|entry| self.line_for(aggregate, entry))
            .collect::<BillingResult<Vec<_>>>()?;

        let (service_period_start, service_period_end) = service_period(&aggregate.time_entries);

        Ok(Some(NewInvoice {
            tenant_id: project.tenant_id,
            client_id: aggregate.client.id,
            project_id: Some(project.id),
            status: InvoiceStatus::Open,
            issued_at: now,
            due_at: now + Duration::days(settings.payment_terms_days),
            client: ClientSnapshot::from(&aggregate.client),
            currency: settings.currency.clone(),
            tax_rate: settings.sales_tax_rate,
            service_period_start,
            service_period_end,
            created_at: now,
            items,
        }))
    }

    /// Drafts and persists the invoice and its items in one transaction.
    pub async fn build(
        &self,
        aggregate: &ProjectAggregate,
        settings: &TenantSettings,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Invoice>> {
        match self.draft(aggregate, settings, now)? {
            Some(draft) => Ok(Some(self.repository.create_invoice(draft).await?)),
            None => Ok(None),
        }
    }

    fn line_for(&self, aggregate: &ProjectAggregate, entry: &TimeEntry) -> BillingResult<NewLineItem> {
        if entry.duration_minutes < 0 {
            return Err(BillingError::Validation(format!(
                "time entry {} has a negative duration",
                entry.id
            )));
        }
        let quantity: Decimal = self.policy.hour_rounding.hours_from_minutes(entry.duration_minutes);
        let description = entry.description.clone().unwrap_or_else(|| {
            format!(
                "{}: {}",
                aggregate.project.name,
                entry.started_at.format("%Y-%m-%d")
            )
        });
        Ok(NewLineItem::new(
            self.policy.hour_unit.clone(),
            description,
            quantity,
            aggregate.project.hourly_rate,
        ))
    }
}

/// Entries whose start lies within `[now - interval, now]`, oldest first.
pub fn billable_entries(
    entries: &[TimeEntry],
    now: DateTime<Utc>,
    interval: Duration,
) -> Vec<&TimeEntry> {
    let window_start = now - interval;
    let mut billable: Vec<&TimeEntry> = entries
        .iter()
        .filter(|entry| entry.started_at >= window_start && entry.started_at <= now)
        .collect();
    billable.sort_by_key(|entry| (entry.started_at, entry.id));
    billable
}

/// Earliest start and latest end across the given entries.
pub fn service_period(
    entries: &[TimeEntry],
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let start = entries.iter().map(|entry| entry.started_at).min();
    let end = entries.iter().map(|entry| entry.ended_at).max();
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(id: i64, started_at: DateTime<Utc>, minutes: i64) -> TimeEntry {
        TimeEntry {
            id,
            project_id: 1,
            started_at,
            ended_at: started_at + Duration::minutes(minutes),
            duration_minutes: minutes,
            description: None,
        }
    }

    #[test]
    fn window_excludes_entries_older_than_interval() {
        let now = Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap();
        let entries = vec![
            entry(1, now - Duration::days(31), 60),
            entry(2, now - Duration::days(29), 60),
            entry(3, now - Duration::days(1), 60),
        ];
        let ids: Vec<i64> = billable_entries(&entries, now, Duration::days(30))
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn service_period_spans_all_entries() {
        let now = Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap();
        let first = now - Duration::days(40);
        let entries = vec![entry(1, first, 30), entry(2, now - Duration::hours(2), 90)];
        let (start, end) = service_period(&entries);
        assert_eq!(start, Some(first));
        assert_eq!(end, Some(now - Duration::hours(2) + Duration::minutes(90)));
    }

    #[test]
    fn empty_entries_have_no_service_period() {
        assert_eq!(service_period(&[]), (None, None));
    }
}
