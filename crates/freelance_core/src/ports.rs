//! crates/freelance_core/src/ports.rs
//!
//! Defines the service contracts (traits) the billing core depends on.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the database, the PDF renderer, the mail transport and the clock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::domain::{
    Client, DocumentKind, DocumentRef, Invoice, NewInvoice, NewOffer, Offer,
    OfferStatus, Project, ProjectAggregate, TenantId, TenantSettings,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Conflicting state: {0}")]
    Conflict(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Persistence
//=========================================================================================

#[async_trait]
pub trait BillingRepository: Send + Sync {
    // --- Tenants ---
    async fn get_tenant_settings(&self, tenant_id: TenantId) -> PortResult<TenantSettings>;

    // --- Clients ---
    async fn get_client(&self, tenant_id: TenantId, client_id: i64) -> PortResult<Client>;

    // --- Projects ---
    /// Projects with auto-generation enabled and at least one time entry, across all tenants.
    async fn list_auto_invoicing_projects(&self) -> PortResult<Vec<Project>>;

    async fn get_project_aggregate(
        &self,
        tenant_id: TenantId,
        project_id: i64,
    ) -> PortResult<ProjectAggregate>;

    /// Compare-and-swap on the generation stamp: sets `last_auto_generated_at = now`
    /// only while the stored stamp still equals `expected_last`. Returns whether
    /// this caller won the claim.
    async fn claim_auto_generation(
        &self,
        project_id: i64,
        expected_last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> PortResult<bool>;

    /// Writes the generation stamp and the consecutive failure counter.
    async fn set_auto_generation_state(
        &self,
        project_id: i64,
        last_generated_at: Option<DateTime<Utc>>,
        failures: i32,
    ) -> PortResult<()>;

    // --- Invoices ---
    /// Persists the invoice and all of its items atomically.
    async fn create_invoice(&self, invoice: NewInvoice) -> PortResult<Invoice>;

    async fn get_invoice(&self, tenant_id: TenantId, invoice_id: i64) -> PortResult<Invoice>;

    async fn set_invoice_number(&self, invoice_id: i64, number: &str) -> PortResult<()>;

    /// Quiet write of status, `sent_at` and `paid_at`.
    async fn persist_invoice_status(&self, invoice: &Invoice) -> PortResult<()>;

    /// Invoices not deleted, due before `now`, whose status is reminder eligible.
    async fn list_overdue_candidates(&self, now: DateTime<Utc>) -> PortResult<Vec<Invoice>>;

    async fn count_reminders(&self, invoice_id: i64) -> PortResult<u32>;

    async fn record_reminder(&self, invoice_id: i64, sent_at: DateTime<Utc>) -> PortResult<()>;

    async fn soft_delete_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: i64,
        deleted_at: DateTime<Utc>,
    ) -> PortResult<()>;

    async fn purge_invoice(&self, tenant_id: TenantId, invoice_id: i64) -> PortResult<()>;

    // --- Offers ---
    /// Persists the offer and all of its items atomically.
    async fn create_offer(&self, offer: NewOffer) -> PortResult<Offer>;

    async fn get_offer(&self, tenant_id: TenantId, offer_id: i64) -> PortResult<Offer>;

    /// Sets the number only if none is stored yet. Returns whether a write happened.
    async fn set_offer_number_if_absent(&self, offer_id: i64, number: &str) -> PortResult<bool>;

    /// Quiet write of status and the sent / accepted / rejected fields.
    async fn persist_offer_status(&self, offer: &Offer) -> PortResult<()>;

    /// Same write as `persist_offer_status`, applied only while the stored offer is
    /// not deleted and still in status `from`. Returns whether the write happened.
    async fn transition_offer_status(&self, offer: &Offer, from: OfferStatus) -> PortResult<bool>;

    /// Offers not deleted, not terminal, with a validity deadline before `now`.
    async fn list_expirable_offers(&self, now: DateTime<Utc>) -> PortResult<Vec<Offer>>;

    async fn soft_delete_offer(
        &self,
        tenant_id: TenantId,
        offer_id: i64,
        deleted_at: DateTime<Utc>,
    ) -> PortResult<()>;

    async fn purge_offer(&self, tenant_id: TenantId, offer_id: i64) -> PortResult<()>;

    // --- Document generation guard ---
    /// Compare-and-swap `idle -> generating`. Returns `false` if a render is already running.
    async fn try_begin_render(&self, document: DocumentRef) -> PortResult<bool>;

    /// Returns the record to `idle`, storing `pdf_path` when the render succeeded.
    async fn finish_render(&self, document: DocumentRef, pdf_path: Option<&str>)
        -> PortResult<()>;

    /// Returns every record left in `generating` to `idle`. Only safe while no
    /// render is running, i.e. at startup. Returns the number of records reset.
    async fn reset_interrupted_renders(&self) -> PortResult<u64>;
}

//=========================================================================================
// Documents, notifications, jobs
//=========================================================================================

/// A fully loaded record handed to the renderer.
#[derive(Debug, Clone)]
pub enum RenderableDocument {
    Invoice(Invoice),
    Offer(Offer),
}

impl RenderableDocument {
    pub fn kind(&self) -> DocumentKind {
        match self {
            RenderableDocument::Invoice(_) => DocumentKind::Invoice,
            RenderableDocument::Offer(_) => DocumentKind::Offer,
        }
    }
}

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    /// Renders the document to a PDF at the relative `path`.
    async fn render(&self, document: &RenderableDocument, path: &str) -> PortResult<()>;

    /// Whether a rendered PDF exists at the relative `path`.
    async fn exists(&self, path: &str) -> PortResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    OfferSent,
    OfferAccepted,
    InvoiceSent,
    InvoiceReminder,
}

/// A message to a client, optionally carrying the rendered document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipient: String,
    pub recipient_name: String,
    pub document_number: String,
    pub attachment: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> PortResult<()>;
}

/// Queue for downstream work triggered by a state change.
#[async_trait]
pub trait DocumentJobs: Send + Sync {
    async fn enqueue_render(&self, document: DocumentRef) -> PortResult<()>;
}

//=========================================================================================
// Clock and secrets
//=========================================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Symmetric encryption for values stored encrypted at rest.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> PortResult<String>;
    fn decrypt(&self, ciphertext: &str) -> PortResult<String>;
}

/// The set of ports the billing services are wired with.
#[derive(Clone)]
pub struct BillingPorts {
    pub repository: Arc<dyn BillingRepository>,
    pub renderer: Arc<dyn DocumentRenderer>,
    pub notifier: Arc<dyn Notifier>,
    pub jobs: Arc<dyn DocumentJobs>,
    pub clock: Arc<dyn Clock>,
    pub cipher: Arc<dyn SecretCipher>,
}
