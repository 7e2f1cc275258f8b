//! Integration tests for automatic invoice generation.

mod common;

use chrono::Duration;
use common::{Harness, CLIENT_EMAIL};
use freelance_core::evaluator::GenerationOutcome;
use freelance_core::policy::BillingPolicy;
use freelance_core::{DocumentRef, InvoiceStatus, RenderState};
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_generates_invoice_from_recent_time_entries() {
    let h = Harness::new();
    let now = h.now();
    h.add_project(10, dec!(100), Some(30));
    h.add_entry(1, 10, now - Duration::days(10), 30);
    h.add_entry(2, 10, now - Duration::days(5), 60);
    h.add_entry(3, 10, now - Duration::days(1), 90);

    let report = h.evaluator().run_once().await.unwrap();

    assert_eq!(report.evaluated, 1);
    assert_eq!(report.generated.len(), 1);
    let invoices = h.repo.invoices();
    assert_eq!(invoices.len(), 1);
    let invoice = &invoices[0];

    let quantities: Vec<_> = invoice.items.iter().map(|i| i.quantity).collect();
    let totals: Vec<_> = invoice.items.iter().map(|i| i.total).collect();
    assert_eq!(quantities, vec![dec!(1), dec!(1), dec!(2)]);
    assert_eq!(totals, vec![dec!(100), dec!(100), dec!(200)]);
    assert_eq!(invoice.totals().net, dec!(400));

    assert_eq!(invoice.status, InvoiceStatus::Open);
    assert_eq!(invoice.issued_at, now);
    assert_eq!(invoice.due_at, now + Duration::days(14));
    assert_eq!(invoice.number.as_deref(), Some("06-2024-01"));
    assert_eq!(invoice.client.email.as_deref(), Some(CLIENT_EMAIL));
    assert_eq!(invoice.service_period_start, Some(now - Duration::days(10)));
    assert_eq!(
        invoice.service_period_end,
        Some(now - Duration::days(1) + Duration::minutes(90))
    );
    assert_eq!(invoice.render_state, RenderState::Idle);

    let project = h.repo.project(10).unwrap();
    assert_eq!(project.last_auto_generated_at, Some(now));
    assert_eq!(project.auto_generation_failures, 0);
    assert_eq!(h.jobs.queued(), vec![DocumentRef::invoice(h.tenant, invoice.id)]);
}

#[tokio::test]
async fn test_line_totals_are_quantity_times_rate() {
    let h = Harness::new();
    let now = h.now();
    h.add_project(10, dec!(87.50), Some(7));
    for (id, minutes) in [(1, 45), (2, 180), (3, 200), (4, 61)] {
        h.add_entry(id, 10, now - Duration::days(id), minutes);
    }

    h.evaluator().run_once().await.unwrap();

    let invoice = h.repo.invoices().remove(0);
    let mut sum = dec!(0);
    for item in &invoice.items {
        assert_eq!(item.total, item.quantity * item.unit_price);
        assert_eq!(item.unit_price, dec!(87.50));
        sum += item.total;
    }
    assert_eq!(invoice.totals().net, sum);
}

#[tokio::test]
async fn test_each_due_project_is_selected_once_per_run() {
    let h = Harness::new();
    let now = h.now();
    h.add_project(10, dec!(100), Some(30));
    h.add_project(11, dec!(120), Some(14));
    h.add_entry(1, 10, now - Duration::days(2), 60);
    h.add_entry(2, 11, now - Duration::days(3), 120);
    // Projects without time entries are never candidates.
    h.add_project(12, dec!(100), Some(30));

    let evaluator = h.evaluator();
    let first = evaluator.run_once().await.unwrap();
    assert_eq!(first.evaluated, 2);
    assert_eq!(first.generated.len(), 2);

    let second = evaluator.run_once().await.unwrap();
    assert_eq!(second.evaluated, 0);
    assert_eq!(h.repo.invoices().len(), 2);

    let numbers: Vec<_> = h
        .repo
        .invoices()
        .into_iter()
        .filter_map(|invoice| invoice.number)
        .collect();
    assert_eq!(numbers, vec!["06-2024-01".to_string(), "06-2024-02".to_string()]);
}

#[tokio::test]
async fn test_project_is_due_again_after_interval() {
    let h = Harness::new();
    let now = h.now();
    h.add_project(10, dec!(100), Some(7));
    h.add_entry(1, 10, now - Duration::days(1), 60);

    let evaluator = h.evaluator();
    evaluator.run_once().await.unwrap();

    h.clock.advance(Duration::days(6));
    assert_eq!(evaluator.run_once().await.unwrap().evaluated, 0);

    h.add_entry(2, 10, h.now() - Duration::hours(3), 120);
    h.clock.advance(Duration::days(1));
    let report = evaluator.run_once().await.unwrap();
    assert_eq!(report.generated.len(), 1);

    let latest = h.repo.invoices().pop().unwrap();
    assert_eq!(latest.items.len(), 1);
    assert_eq!(latest.items[0].quantity, dec!(2));
}

#[tokio::test]
async fn test_nothing_to_bill_keeps_the_stamp() {
    let h = Harness::new();
    let now = h.now();
    h.add_project(10, dec!(100), Some(30));
    h.add_entry(1, 10, now - Duration::days(45), 60);

    let report = h.evaluator().run_once().await.unwrap();

    assert_eq!(report.nothing_to_bill, 1);
    assert!(h.repo.invoices().is_empty());
    assert_eq!(h.repo.project(10).unwrap().last_auto_generated_at, Some(now));
}

#[tokio::test]
async fn test_overlapping_cycles_bill_a_project_once() {
    let h = Harness::new();
    let now = h.now();
    let project = h.add_project(10, dec!(100), Some(30));
    h.add_entry(1, 10, now - Duration::days(1), 60);
    let evaluator = h.evaluator();

    // Both cycles listed the project before either of them stamped it.
    let first = evaluator.generate_for(project.clone(), now).await;
    let second = evaluator.generate_for(project, now).await;

    assert!(matches!(first, GenerationOutcome::Generated { .. }));
    assert_eq!(second, GenerationOutcome::AlreadyClaimed);
    assert_eq!(h.repo.invoices().len(), 1);
    assert_eq!(h.repo.project(10).unwrap().last_auto_generated_at, Some(now));
}

#[tokio::test]
async fn test_failure_resets_stamp_and_does_not_block_other_projects() {
    let h = Harness::new();
    let now = h.now();
    h.add_project(10, dec!(100), Some(30));
    h.add_project(11, dec!(100), Some(30));
    h.add_entry(1, 10, now - Duration::days(1), 60);
    h.add_entry(2, 11, now - Duration::days(1), 60);
    h.repo.fail_invoice_creation(10);

    let report = h.evaluator().run_once().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.generated.len(), 1);
    let failed = h.repo.project(10).unwrap();
    assert_eq!(failed.last_auto_generated_at, None);
    assert_eq!(failed.auto_generation_failures, 1);
    assert_eq!(h.repo.project(11).unwrap().last_auto_generated_at, Some(now));
}

#[tokio::test]
async fn test_retries_stop_after_failure_cap() {
    let h = Harness::new();
    let now = h.now();
    h.add_project(10, dec!(100), Some(30));
    h.add_entry(1, 10, now - Duration::days(1), 60);
    h.repo.fail_invoice_creation(10);
    let evaluator = h.evaluator_with(BillingPolicy {
        max_auto_generation_failures: 2,
        ..BillingPolicy::default()
    });

    assert_eq!(evaluator.run_once().await.unwrap().failed, 1);
    assert_eq!(evaluator.run_once().await.unwrap().failed, 1);

    h.repo.heal_invoice_creation(10);
    let report = evaluator.run_once().await.unwrap();
    assert_eq!(report.suspended, 1);
    assert!(h.repo.invoices().is_empty());
    assert_eq!(h.repo.project(10).unwrap().auto_generation_failures, 2);
}

#[tokio::test]
async fn test_success_after_failure_clears_counter() {
    let h = Harness::new();
    let now = h.now();
    h.add_project(10, dec!(100), Some(30));
    h.add_entry(1, 10, now - Duration::days(1), 60);
    h.repo.fail_invoice_creation(10);

    let evaluator = h.evaluator();
    evaluator.run_once().await.unwrap();
    h.repo.heal_invoice_creation(10);
    let report = evaluator.run_once().await.unwrap();

    assert_eq!(report.generated.len(), 1);
    let project = h.repo.project(10).unwrap();
    assert_eq!(project.auto_generation_failures, 0);
    assert_eq!(project.last_auto_generated_at, Some(now));
}

#[tokio::test]
async fn test_rounding_policy_is_configurable() {
    let h = Harness::new();
    let now = h.now();
    h.add_project(10, dec!(100), Some(30));
    h.add_entry(1, 10, now - Duration::days(1), 20);

    let evaluator = h.evaluator_with(BillingPolicy {
        hour_rounding: freelance_core::policy::HourRounding::Up,
        ..BillingPolicy::default()
    });
    evaluator.run_once().await.unwrap();

    let invoice = h.repo.invoices().remove(0);
    assert_eq!(invoice.items[0].quantity, dec!(1));
    assert_eq!(invoice.items[0].total, dec!(100));
}
