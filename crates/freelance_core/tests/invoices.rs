//! Integration tests for manual invoices, the overdue sweep, retention and
//! the document render guard.

mod common;

use chrono::{Duration, Months};
use common::{Harness, CLIENT_EMAIL, CLIENT_ID};
use freelance_core::documents::RenderOutcome;
use freelance_core::lifecycle::OverdueReport;
use freelance_core::services::NewInvoiceRequest;
use freelance_core::{
    BillingError, BillingRepository, DocumentRef, Invoice, InvoiceStatus, NewLineItem,
    NotificationKind, RenderState,
};
use rust_decimal_macros::dec;
use std::sync::atomic::Ordering;

fn request(status: Option<InvoiceStatus>) -> NewInvoiceRequest {
    NewInvoiceRequest {
        client_id: CLIENT_ID,
        project_id: None,
        status,
        issued_at: None,
        due_at: None,
        service_period_start: None,
        service_period_end: None,
        items: vec![NewLineItem::new("h", "Consulting", dec!(4), dec!(120))],
    }
}

async fn create(h: &Harness, status: InvoiceStatus) -> Invoice {
    h.billing()
        .create_invoice(h.tenant, request(Some(status)))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_create_invoice_defaults_to_draft_with_terms() {
    let h = Harness::new();

    let invoice = h
        .billing()
        .create_invoice(h.tenant, request(None))
        .await
        .unwrap();

    assert_eq!(invoice.status, InvoiceStatus::Draft);
    assert_eq!(invoice.number.as_deref(), Some("06-2024-01"));
    assert_eq!(invoice.due_at, h.now() + Duration::days(14));
    let totals = invoice.totals();
    assert_eq!(totals.net, dec!(480));
    assert_eq!(totals.tax, dec!(91.20));
    assert_eq!(totals.gross, dec!(571.20));
    assert_eq!(h.jobs.queued(), vec![DocumentRef::invoice(h.tenant, invoice.id)]);
}

#[tokio::test]
async fn test_invoice_numbers_are_unique() {
    let h = Harness::new();
    let first = create(&h, InvoiceStatus::Open).await;
    let second = create(&h, InvoiceStatus::Open).await;

    assert_ne!(first.number, second.number);
    let err = h
        .repo
        .set_invoice_number(second.id, first.number.as_deref().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, freelance_core::PortError::Conflict(_)));
}

#[tokio::test]
async fn test_due_date_before_issue_is_rejected() {
    let h = Harness::new();
    let mut bad = request(None);
    bad.due_at = Some(h.now() - Duration::days(1));

    let err = h.billing().create_invoice(h.tenant, bad).await.unwrap_err();

    assert!(matches!(err, BillingError::Validation(_)));
    assert!(h.repo.invoices().is_empty());
}

#[tokio::test]
async fn test_review_and_approval_flow() {
    let h = Harness::new();
    let invoice = create(&h, InvoiceStatus::Open).await;
    let lifecycle = h.lifecycle();

    let reviewed = lifecycle
        .submit_invoice_for_review(h.tenant, invoice.id)
        .await
        .unwrap();
    assert_eq!(reviewed.status, InvoiceStatus::UnderReview);

    let err = lifecycle
        .mark_invoice_paid(h.tenant, invoice.id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Forbidden(_)));

    let approved = lifecycle.approve_invoice(h.tenant, invoice.id).await.unwrap();
    assert_eq!(approved.status, InvoiceStatus::Approved);
}

#[tokio::test]
async fn test_send_invoice_requires_rendered_pdf() {
    let h = Harness::new();
    let invoice = create(&h, InvoiceStatus::Open).await;

    let notice = h.lifecycle().send_invoice_to_client(h.tenant, invoice.id).await;
    assert!(!notice.is_success());
    assert!(notice
        .message()
        .contains("invoice_2024-06-30_1_acme-gmbh.pdf"));

    h.documents()
        .render(DocumentRef::invoice(h.tenant, invoice.id))
        .await;
    let notice = h.lifecycle().send_invoice_to_client(h.tenant, invoice.id).await;

    assert!(notice.is_success(), "{}", notice.message());
    let stored = h.repo.get_invoice(h.tenant, invoice.id).await.unwrap();
    assert_eq!(stored.status, InvoiceStatus::Sent);
    assert_eq!(stored.sent_at, Some(h.now()));
    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::InvoiceSent);
    assert_eq!(sent[0].document_number, "06-2024-01");
}

#[tokio::test]
async fn test_paying_twice_is_refused() {
    let h = Harness::new();
    let invoice = create(&h, InvoiceStatus::Open).await;
    let lifecycle = h.lifecycle();

    let paid = lifecycle.mark_invoice_paid(h.tenant, invoice.id).await.unwrap();
    assert_eq!(paid.status, InvoiceStatus::Paid);
    assert_eq!(paid.paid_at, Some(h.now()));

    let err = lifecycle
        .mark_invoice_paid(h.tenant, invoice.id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Forbidden(_)));
}

// ============================================================================
// Overdue sweep
// ============================================================================

#[tokio::test]
async fn test_overdue_invoice_is_flagged_and_reminders_are_capped() {
    let h = Harness::new();
    let invoice = create(&h, InvoiceStatus::Open).await;
    h.clock.advance(Duration::days(15));
    let lifecycle = h.lifecycle();

    let first = lifecycle.process_overdue_invoices().await.unwrap();
    assert_eq!(first.flagged_overdue, 1);
    assert_eq!(first.reminders_sent, 1);
    let stored = h.repo.get_invoice(h.tenant, invoice.id).await.unwrap();
    assert_eq!(stored.status, InvoiceStatus::Overdue);

    for _ in 0..4 {
        h.clock.advance(Duration::days(1));
        lifecycle.process_overdue_invoices().await.unwrap();
    }

    assert_eq!(h.repo.reminder_count(invoice.id), 3);
    let reminders: Vec<_> = h
        .notifier
        .sent()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::InvoiceReminder)
        .collect();
    assert_eq!(reminders.len(), 3);
    assert!(reminders.iter().all(|n| n.recipient == CLIENT_EMAIL));

    let last = lifecycle.process_overdue_invoices().await.unwrap();
    assert_eq!(last.reminders_sent, 0);
    assert_eq!(last.reminders_capped, 1);
    assert_eq!(last.flagged_overdue, 0);
}

#[tokio::test]
async fn test_failed_reminder_is_retried_next_sweep() {
    let h = Harness::new();
    let invoice = create(&h, InvoiceStatus::Sent).await;
    h.clock.advance(Duration::days(20));
    h.notifier.fail_delivery();

    let report = h.lifecycle().process_overdue_invoices().await.unwrap();

    assert_eq!(report.flagged_overdue, 1);
    assert_eq!(report.reminders_sent, 0);
    assert_eq!(h.repo.reminder_count(invoice.id), 0);
}

#[tokio::test]
async fn test_drafts_and_paid_invoices_are_left_alone() {
    let h = Harness::new();
    let draft = create(&h, InvoiceStatus::Draft).await;
    let paid = create(&h, InvoiceStatus::Open).await;
    h.lifecycle().mark_invoice_paid(h.tenant, paid.id).await.unwrap();
    h.clock.advance(Duration::days(60));

    let report = h.lifecycle().process_overdue_invoices().await.unwrap();

    assert_eq!(report, OverdueReport::default());
    let draft = h.repo.get_invoice(h.tenant, draft.id).await.unwrap();
    assert_eq!(draft.status, InvoiceStatus::Draft);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_invoice_not_yet_due_is_not_reminded() {
    let h = Harness::new();
    create(&h, InvoiceStatus::Open).await;
    h.clock.advance(Duration::days(13));

    let report = h.lifecycle().process_overdue_invoices().await.unwrap();

    assert_eq!(report.flagged_overdue, 0);
    assert!(h.notifier.sent().is_empty());
}

// ============================================================================
// Retention
// ============================================================================

#[tokio::test]
async fn test_purge_requires_soft_delete_and_ten_years() {
    let h = Harness::new();
    let invoice = create(&h, InvoiceStatus::Open).await;
    let retention = h.retention();

    let err = retention.purge_invoice(h.tenant, invoice.id).await.unwrap_err();
    assert!(matches!(err, BillingError::Forbidden(_)));

    retention.soft_delete_invoice(h.tenant, invoice.id).await.unwrap();
    h.clock.set(h.now() + Months::new(119));
    let err = retention.purge_invoice(h.tenant, invoice.id).await.unwrap_err();
    assert!(matches!(err, BillingError::Forbidden(_)));
    assert!(h.repo.get_invoice(h.tenant, invoice.id).await.is_ok());

    h.clock.set(invoice.issued_at + Months::new(120));
    retention.purge_invoice(h.tenant, invoice.id).await.unwrap();
    assert!(h.repo.get_invoice(h.tenant, invoice.id).await.is_err());
}

#[tokio::test]
async fn test_deleted_invoices_cannot_change_status() {
    let h = Harness::new();
    let invoice = create(&h, InvoiceStatus::Open).await;
    h.retention()
        .soft_delete_invoice(h.tenant, invoice.id)
        .await
        .unwrap();

    let err = h
        .lifecycle()
        .mark_invoice_paid(h.tenant, invoice.id)
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::Forbidden(_)));
}

#[tokio::test]
async fn test_offers_purge_once_deleted() {
    let h = Harness::new();
    let offer = h
        .billing()
        .create_offer(
            h.tenant,
            freelance_core::services::NewOfferRequest {
                client_id: CLIENT_ID,
                project_id: None,
                status: None,
                valid_until: None,
                items: vec![NewLineItem::new("h", "Audit", dec!(1), dec!(900))],
            },
        )
        .await
        .unwrap();
    let retention = h.retention();

    assert!(retention.purge_offer(h.tenant, offer.id).await.is_err());
    retention.soft_delete_offer(h.tenant, offer.id).await.unwrap();
    retention.purge_offer(h.tenant, offer.id).await.unwrap();

    assert!(h.repo.offers().is_empty());
}

// ============================================================================
// Render guard
// ============================================================================

#[tokio::test]
async fn test_render_stores_path_and_returns_to_idle() {
    let h = Harness::new();
    let invoice = create(&h, InvoiceStatus::Open).await;
    let document = DocumentRef::invoice(h.tenant, invoice.id);

    let outcome = h.documents().render(document).await;

    assert_eq!(
        outcome,
        RenderOutcome::Rendered("invoices/2024/invoice_2024-06-30_1_acme-gmbh.pdf".into())
    );
    let stored = h.repo.get_invoice(h.tenant, invoice.id).await.unwrap();
    assert_eq!(stored.render_state, RenderState::Idle);
    assert_eq!(stored.pdf_path, outcome_path(&outcome));
}

#[tokio::test]
async fn test_concurrent_render_is_skipped() {
    let h = Harness::new();
    let invoice = create(&h, InvoiceStatus::Open).await;
    let document = DocumentRef::invoice(h.tenant, invoice.id);
    assert!(h.repo.try_begin_render(document).await.unwrap());

    let outcome = h.documents().render(document).await;

    assert_eq!(outcome, RenderOutcome::AlreadyInProgress);
    assert_eq!(h.renderer.calls.load(Ordering::SeqCst), 0);
    let stored = h.repo.get_invoice(h.tenant, invoice.id).await.unwrap();
    assert_eq!(stored.render_state, RenderState::Generating);
}

#[tokio::test]
async fn test_failed_render_releases_guard() {
    let h = Harness::new();
    let invoice = create(&h, InvoiceStatus::Open).await;
    let document = DocumentRef::invoice(h.tenant, invoice.id);
    h.renderer.fail_renders();

    let outcome = h.documents().render(document).await;

    assert!(matches!(outcome, RenderOutcome::Failed(_)));
    let stored = h.repo.get_invoice(h.tenant, invoice.id).await.unwrap();
    assert_eq!(stored.render_state, RenderState::Idle);
    assert_eq!(stored.pdf_path, None);
    assert!(h.repo.try_begin_render(document).await.unwrap());
}

#[tokio::test]
async fn test_startup_recovers_renders_left_by_a_crash() {
    let h = Harness::new();
    let invoice = create(&h, InvoiceStatus::Open).await;
    let document = DocumentRef::invoice(h.tenant, invoice.id);
    // Claimed by a worker that never got to release it.
    assert!(h.repo.try_begin_render(document).await.unwrap());
    let documents = h.documents();
    assert_eq!(documents.render(document).await, RenderOutcome::AlreadyInProgress);

    assert_eq!(documents.recover_interrupted_renders().await.unwrap(), 1);

    assert!(matches!(documents.render(document).await, RenderOutcome::Rendered(_)));
    let stored = h.repo.get_invoice(h.tenant, invoice.id).await.unwrap();
    assert_eq!(stored.render_state, RenderState::Idle);
    assert_eq!(documents.recover_interrupted_renders().await.unwrap(), 0);
}

fn outcome_path(outcome: &RenderOutcome) -> Option<String> {
    match outcome {
        RenderOutcome::Rendered(path) => Some(path.clone()),
        _ => None,
    }
}
