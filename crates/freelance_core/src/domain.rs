//! crates/freelance_core/src/domain.rs
//!
//! Defines the pure, core data structures of the billing engine.
//! These structs are independent of any database or serialization format.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The freelancer account that owns clients, projects, invoices and offers.
pub type TenantId = Uuid;

/// Rounds a money amount to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

//=========================================================================================
// Tenant, Client, Project, TimeEntry
//=========================================================================================

/// Billing defaults of a tenant, consumed when computing totals and due dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantSettings {
    pub tenant_id: TenantId,
    pub currency: String,
    /// Sales tax in percent, `19` meaning 19 %.
    pub sales_tax_rate: Decimal,
    pub payment_terms_days: i64,
    pub offer_validity_days: i64,
}

impl TenantSettings {
    pub const DEFAULT_PAYMENT_TERMS_DAYS: i64 = 14;
    pub const DEFAULT_OFFER_VALIDITY_DAYS: i64 = 30;

    pub fn with_defaults(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            currency: "EUR".to_string(),
            sales_tax_rate: Decimal::from(19),
            payment_terms_days: Self::DEFAULT_PAYMENT_TERMS_DAYS,
            offer_validity_days: Self::DEFAULT_OFFER_VALIDITY_DAYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub tenant_id: TenantId,
    pub name: String,
    pub email: Option<String>,
    pub street: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

/// Copy of the client's contact fields taken when an invoice or offer is created,
/// so later edits to the client never rewrite historical documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub name: String,
    pub email: Option<String>,
    pub street: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

impl From<&Client> for ClientSnapshot {
    fn from(client: &Client) -> Self {
        Self {
            name: client.name.clone(),
            email: client.email.clone(),
            street: client.street.clone(),
            postal_code: client.postal_code.clone(),
            city: client.city.clone(),
            country: client.country.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub tenant_id: TenantId,
    pub client_id: i64,
    pub name: String,
    pub hourly_rate: Decimal,
    pub auto_generate_invoice: bool,
    /// Auto-generation interval in days.
    pub auto_generate_amount: Option<i32>,
    pub last_auto_generated_at: Option<DateTime<Utc>>,
    /// Consecutive failed auto-generation attempts.
    pub auto_generation_failures: i32,
}

impl Project {
    pub fn auto_generation_interval(&self) -> Option<Duration> {
        self.auto_generate_amount
            .filter(|days| *days > 0)
            .map(|days| Duration::days(i64::from(days)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: i64,
    pub project_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub description: Option<String>,
}

/// A project together with its client and every time entry, loaded in one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectAggregate {
    pub project: Project,
    pub client: Client,
    pub time_entries: Vec<TimeEntry>,
}

//=========================================================================================
// Statuses
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    Open,
    UnderReview,
    Approved,
    Sent,
    Paid,
    Overdue,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "DRAFT",
            InvoiceStatus::Open => "OPEN",
            InvoiceStatus::UnderReview => "UNDER_REVIEW",
            InvoiceStatus::Approved => "APPROVED",
            InvoiceStatus::Sent => "SENT",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Overdue => "OVERDUE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(InvoiceStatus::Draft),
            "OPEN" => Some(InvoiceStatus::Open),
            "UNDER_REVIEW" => Some(InvoiceStatus::UnderReview),
            "APPROVED" => Some(InvoiceStatus::Approved),
            "SENT" => Some(InvoiceStatus::Sent),
            "PAID" => Some(InvoiceStatus::Paid),
            "OVERDUE" => Some(InvoiceStatus::Overdue),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid)
    }

    /// Whether the overdue sweep looks at invoices in this status.
    pub fn is_reminder_eligible(&self) -> bool {
        !matches!(
            self,
            InvoiceStatus::Paid | InvoiceStatus::Draft | InvoiceStatus::UnderReview
        )
    }

    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (*self, next),
            (Draft, Open)
                | (Open, UnderReview)
                | (Open, Sent)
                | (UnderReview, Approved)
                | (UnderReview, Open)
                | (Approved, Sent)
                | (Open, Paid)
                | (Sent, Paid)
                | (Overdue, Paid)
                | (Open, Overdue)
                | (Approved, Overdue)
                | (Sent, Overdue)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferStatus {
    Draft,
    Sent,
    Accepted,
    Rejected,
    Expired,
}

impl OfferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferStatus::Draft => "DRAFT",
            OfferStatus::Sent => "SENT",
            OfferStatus::Accepted => "ACCEPTED",
            OfferStatus::Rejected => "REJECTED",
            OfferStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(OfferStatus::Draft),
            "SENT" => Some(OfferStatus::Sent),
            "ACCEPTED" => Some(OfferStatus::Accepted),
            "REJECTED" => Some(OfferStatus::Rejected),
            "EXPIRED" => Some(OfferStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OfferStatus::Accepted | OfferStatus::Rejected | OfferStatus::Expired
        )
    }
}

/// Per-record document generation state. Only `Idle -> Generating` may start a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderState {
    Idle,
    Generating,
}

impl RenderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderState::Idle => "idle",
            RenderState::Generating => "generating",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(RenderState::Idle),
            "generating" => Some(RenderState::Generating),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentKind {
    Invoice,
    Offer,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Invoice => "invoice",
            DocumentKind::Offer => "offer",
        }
    }
}

/// Identifies a renderable record and the tenant owning it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub kind: DocumentKind,
    pub tenant_id: TenantId,
    pub id: i64,
}

impl DocumentRef {
    pub fn invoice(tenant_id: TenantId, id: i64) -> Self {
        Self {
            kind: DocumentKind::Invoice,
            tenant_id,
            id,
        }
    }

    pub fn offer(tenant_id: TenantId, id: i64) -> Self {
        Self {
            kind: DocumentKind::Offer,
            tenant_id,
            id,
        }
    }
}

//=========================================================================================
// Line items and totals
//=========================================================================================

/// A persisted invoice or offer line. `document_id` points at the owning record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: i64,
    pub document_id: i64,
    pub unit: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total: Decimal,
}

pub type InvoiceItem = LineItem;
pub type OfferItem = LineItem;

/// A line before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLineItem {
    pub unit: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

impl NewLineItem {
    pub fn new(
        unit: impl Into<String>,
        description: impl Into<String>,
        quantity: Decimal,
        unit_price: Decimal,
    ) -> Self {
        Self {
            unit: unit.into(),
            description: description.into(),
            quantity,
            unit_price,
        }
    }

    /// quantity x unit price, rounded to cents.
    pub fn total(&self) -> Decimal {
        round_money(self.quantity * self.unit_price)
    }
}

/// Net, tax and gross amounts of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub net: Decimal,
    pub tax: Decimal,
    pub gross: Decimal,
}

impl Totals {
    /// Sums line totals and applies `tax_rate` (in percent) to the net amount.
    pub fn compute<I>(line_totals: I, tax_rate: Decimal) -> Self
    where
        I: IntoIterator<Item = Decimal>,
    {
        let net: Decimal = line_totals.into_iter().sum();
        let tax = round_money(net * tax_rate / Decimal::ONE_HUNDRED);
        Self {
            net,
            tax,
            gross: net + tax,
        }
    }
}

//=========================================================================================
// Invoice
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: i64,
    pub tenant_id: TenantId,
    pub client_id: i64,
    pub project_id: Option<i64>,
    pub number: Option<String>,
    pub status: InvoiceStatus,
    pub issued_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub client: ClientSnapshot,
    pub currency: String,
    pub tax_rate: Decimal,
    pub service_period_start: Option<DateTime<Utc>>,
    pub service_period_end: Option<DateTime<Utc>>,
    pub render_state: RenderState,
    pub pdf_path: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub items: Vec<InvoiceItem>,
}

impl Invoice {
    pub fn totals(&self) -> Totals {
        Totals::compute(self.items.iter().map(|item| item.total), self.tax_rate)
    }

    pub fn is_past_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at < now
    }
}

/// An invoice with its items, ready to be persisted in one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInvoice {
    pub tenant_id: TenantId,
    pub client_id: i64,
    pub project_id: Option<i64>,
    pub status: InvoiceStatus,
    pub issued_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub client: ClientSnapshot,
    pub currency: String,
    pub tax_rate: Decimal,
    pub service_period_start: Option<DateTime<Utc>>,
    pub service_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub items: Vec<NewLineItem>,
}

//=========================================================================================
// Offer
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: i64,
    pub tenant_id: TenantId,
    pub client_id: i64,
    pub project_id: Option<i64>,
    pub number: Option<String>,
    pub status: OfferStatus,
    pub client: ClientSnapshot,
    pub currency: String,
    pub tax_rate: Decimal,
    pub net_total: Decimal,
    pub tax_total: Decimal,
    pub gross_total: Decimal,
    pub valid_until: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    /// Accepting IP address, encrypted at rest.
    pub accepted_ip: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub render_state: RenderState,
    pub pdf_path: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub items: Vec<OfferItem>,
}

impl Offer {
    pub fn totals(&self) -> Totals {
        Totals {
            net: self.net_total,
            tax: self.tax_total,
            gross: self.gross_total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOffer {
    pub tenant_id: TenantId,
    pub client_id: i64,
    pub project_id: Option<i64>,
    pub status: OfferStatus,
    pub client: ClientSnapshot,
    pub currency: String,
    pub tax_rate: Decimal,
    pub totals: Totals,
    pub valid_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub items: Vec<NewLineItem>,
}

//=========================================================================================
// User-facing outcomes
//=========================================================================================

/// Result of a client-facing action, shown to the tenant as a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Success(String),
    Failure(String),
}

impl Notice {
    pub fn is_success(&self) -> bool {
        matches!(self, Notice::Success(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Notice::Success(message) | Notice::Failure(message) => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn totals_apply_tax_to_net_sum() {
        let totals = Totals::compute([dec!(100.00), dec!(250.50)], dec!(19));
        assert_eq!(totals.net, dec!(350.50));
        assert_eq!(totals.tax, dec!(66.60));
        assert_eq!(totals.gross, dec!(417.10));
    }

    #[test]
    fn line_total_rounds_to_cents() {
        let item = NewLineItem::new("h", "Consulting", dec!(1.5), dec!(33.333));
        assert_eq!(item.total(), dec!(50.00));
    }

    #[test]
    fn paid_invoices_cannot_move() {
        for next in [
            InvoiceStatus::Open,
            InvoiceStatus::Sent,
            InvoiceStatus::Overdue,
            InvoiceStatus::Draft,
        ] {
            assert!(!InvoiceStatus::Paid.can_transition_to(next));
        }
    }

    #[test]
    fn drafts_and_reviews_never_go_overdue() {
        assert!(!InvoiceStatus::Draft.can_transition_to(InvoiceStatus::Overdue));
        assert!(!InvoiceStatus::UnderReview.can_transition_to(InvoiceStatus::Overdue));
        assert!(InvoiceStatus::Sent.can_transition_to(InvoiceStatus::Overdue));
    }

    #[test]
    fn status_strings_round_trip_through_parse() {
        for status in [InvoiceStatus::UnderReview, InvoiceStatus::Overdue] {
            assert_eq!(InvoiceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OfferStatus::parse("EXPIRED"), Some(OfferStatus::Expired));
        assert_eq!(OfferStatus::parse("bogus"), None);
    }

    #[test]
    fn interval_requires_positive_days() {
        let mut project = Project {
            id: 1,
            tenant_id: Uuid::nil(),
            client_id: 1,
            name: "Site".into(),
            hourly_rate: dec!(100),
            auto_generate_invoice: true,
            auto_generate_amount: Some(0),
            last_auto_generated_at: None,
            auto_generation_failures: 0,
        };
        assert_eq!(project.auto_generation_interval(), None);
        project.auto_generate_amount = Some(30);
        assert_eq!(project.auto_generation_interval(), Some(Duration::days(30)));
    }
}
