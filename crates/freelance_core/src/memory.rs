//! crates/freelance_core/src/memory.rs
//!
//! In-memory implementations of the persistence and clock ports.
//! Every method takes the single state lock, so multi-record writes such as
//! "invoice plus items" are atomic just like a database transaction.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::domain::{
    Client, DocumentKind, DocumentRef, Invoice, LineItem, NewInvoice, NewLineItem, NewOffer,
    Offer, OfferStatus, Project, ProjectAggregate, RenderState, TenantId, TenantSettings, TimeEntry,
};
use crate::ports::{BillingRepository, Clock, PortError, PortResult};

#[derive(Default)]
struct State {
    settings: HashMap<TenantId, TenantSettings>,
    clients: BTreeMap<i64, Client>,
    projects: BTreeMap<i64, Project>,
    time_entries: Vec<TimeEntry>,
    invoices: BTreeMap<i64, Invoice>,
    offers: BTreeMap<i64, Offer>,
    reminders: Vec<(i64, DateTime<Utc>)>,
    failing_projects: HashSet<i64>,
    stale_offers: HashMap<i64, Offer>,
    next_invoice_id: i64,
    next_offer_id: i64,
    next_item_id: i64,
}

impl State {
    fn items(&mut self, document_id: i64, items: Vec<NewLineItem>) -> Vec<LineItem> {
        items
            .into_iter()
            .map(|item| {
                self.next_item_id += 1;
                LineItem {
                    id: self.next_item_id,
                    document_id,
                    total: item.total(),
                    unit: item.unit,
                    description: item.description,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                }
            })
            .collect()
    }
}

/// A thread-safe repository backed by in-process maps.
#[derive(Clone, Default)]
pub struct InMemoryBillingRepository {
    state: Arc<Mutex<State>>,
}

impl InMemoryBillingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_settings(&self, settings: TenantSettings) {
        self.state.lock().settings.insert(settings.tenant_id, settings);
    }

    pub fn insert_client(&self, client: Client) {
        self.state.lock().clients.insert(client.id, client);
    }

    pub fn insert_project(&self, project: Project) {
        self.state.lock().projects.insert(project.id, project);
    }

    pub fn insert_time_entry(&self, entry: TimeEntry) {
        self.state.lock().time_entries.push(entry);
    }

    /// Makes every subsequent invoice creation for `project_id` fail.
    pub fn fail_invoice_creation(&self, project_id: i64) {
        self.state.lock().failing_projects.insert(project_id);
    }

    pub fn heal_invoice_creation(&self, project_id: i64) {
        self.state.lock().failing_projects.remove(&project_id);
    }

    pub fn project(&self, project_id: i64) -> Option<Project> {
        self.state.lock().projects.get(&project_id).cloned()
    }

    pub fn invoices(&self) -> Vec<Invoice> {
        self.state.lock().invoices.values().cloned().collect()
    }

    pub fn offers(&self) -> Vec<Offer> {
        self.state.lock().offers.values().cloned().collect()
    }

    pub fn reminder_count(&self, invoice_id: i64) -> usize {
        self.state
            .lock()
            .reminders
            .iter()
            .filter(|(id, _)| *id == invoice_id)
            .count()
    }

    /// Overwrites a stored invoice, bypassing every rule.
    pub fn put_invoice(&self, invoice: Invoice) {
        self.state.lock().invoices.insert(invoice.id, invoice);
    }

    /// Overwrites a stored offer, bypassing every rule.
    pub fn put_offer(&self, offer: Offer) {
        self.state.lock().offers.insert(offer.id, offer);
    }

    /// Makes `get_offer` return `snapshot` instead of the stored offer, the way a
    /// request that loaded the offer before a concurrent write would see it.
    pub fn serve_stale_offer(&self, snapshot: Offer) {
        self.state.lock().stale_offers.insert(snapshot.id, snapshot);
    }
}

fn not_found(what: &str, id: i64) -> PortError {
    PortError::NotFound(format!("{} {} not found", what, id))
}

#[async_trait]
impl BillingRepository for InMemoryBillingRepository {
    async fn get_tenant_settings(&self, tenant_id: TenantId) -> PortResult<TenantSettings> {
        Ok(self
            .state
            .lock()
            .settings
            .get(&tenant_id)
            .cloned()
            .unwrap_or_else(|| TenantSettings::with_defaults(tenant_id)))
    }

    async fn get_client(&self, tenant_id: TenantId, client_id: i64) -> PortResult<Client> {
        self.state
            .lock()
            .clients
            .get(&client_id)
            .filter(|client| client.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| not_found("Client", client_id))
    }

    async fn list_auto_invoicing_projects(&self) -> PortResult<Vec<Project>> {
        let state = self.state.lock();
        Ok(state
            .projects
            .values()
            .filter(|project| project.auto_generate_invoice)
            .filter(|project| {
                state
                    .time_entries
                    .iter()
                    .any(|entry| entry.project_id == project.id)
            })
            .cloned()
            .collect())
    }

    async fn get_project_aggregate(
        &self,
        tenant_id: TenantId,
        project_id: i64,
    ) -> PortResult<ProjectAggregate> {
        let state = self.state.lock();
        let project = state
            .projects
            .get(&project_id)
            .filter(|project| project.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| not_found("Project", project_id))?;
        let client = state
            .clients
            .get(&project.client_id)
            .cloned()
            .ok_or_else(|| not_found("Client", project.client_id))?;
        let time_entries = state
            .time_entries
            .iter()
            .filter(|entry| entry.project_id == project_id)
            .cloned()
            .collect();
        Ok(ProjectAggregate {
            project,
            client,
            time_entries,
        })
    }

    async fn claim_auto_generation(
        &self,
        project_id: i64,
        expected_last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> PortResult<bool> {
        let mut state = self.state.lock();
        let project = state
            .projects
            .get_mut(&project_id)
            .ok_or_else(|| not_found("Project", project_id))?;
        if project.last_auto_generated_at != expected_last {
            return Ok(false);
        }
        project.last_auto_generated_at = Some(now);
        Ok(true)
    }

    async fn set_auto_generation_state(
        &self,
        project_id: i64,
        last_generated_at: Option<DateTime<Utc>>,
        failures: i32,
    ) -> PortResult<()> {
        let mut state = self.state.lock();
        let project = state
            .projects
            .get_mut(&project_id)
            .ok_or_else(|| not_found("Project", project_id))?;
        project.last_auto_generated_at = last_generated_at;
        project.auto_generation_failures = failures;
        Ok(())
    }

    async fn create_invoice(&self, invoice: NewInvoice) -> PortResult<Invoice> {
        let mut state = self.state.lock();
        if let Some(project_id) = invoice.project_id {
            if state.failing_projects.contains(&project_id) {
                return Err(PortError::Unexpected(format!(
                    "insert into invoices failed for project {}",
                    project_id
                )));
            }
        }
        state.next_invoice_id += 1;
        let id = state.next_invoice_id;
        let items = state.items(id, invoice.items);
        let stored = Invoice {
            id,
            tenant_id: invoice.tenant_id,
            client_id: invoice.client_id,
            project_id: invoice.project_id,
            number: None,
            status: invoice.status,
            issued_at: invoice.issued_at,
            due_at: invoice.due_at,
            client: invoice.client,
            currency: invoice.currency,
            tax_rate: invoice.tax_rate,
            service_period_start: invoice.service_period_start,
            service_period_end: invoice.service_period_end,
            render_state: RenderState::Idle,
            pdf_path: None,
            sent_at: None,
            paid_at: None,
            deleted_at: None,
            created_at: invoice.created_at,
            items,
        };
        state.invoices.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get_invoice(&self, tenant_id: TenantId, invoice_id: i64) -> PortResult<Invoice> {
        self.state
            .lock()
            .invoices
            .get(&invoice_id)
            .filter(|invoice| invoice.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| not_found("Invoice", invoice_id))
    }

    async fn set_invoice_number(&self, invoice_id: i64, number: &str) -> PortResult<()> {
        let mut state = self.state.lock();
        if state
            .invoices
            .values()
            .any(|other| other.id != invoice_id && other.number.as_deref() == Some(number))
        {
            return Err(PortError::Conflict(format!("invoice number {} is taken", number)));
        }
        let invoice = state
            .invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| not_found("Invoice", invoice_id))?;
        invoice.number = Some(number.to_string());
        Ok(())
    }

    async fn persist_invoice_status(&self, invoice: &Invoice) -> PortResult<()> {
        let mut state = self.state.lock();
        let stored = state
            .invoices
            .get_mut(&invoice.id)
            .filter(|stored| stored.tenant_id == invoice.tenant_id)
            .ok_or_else(|| not_found("Invoice", invoice.id))?;
        stored.status = invoice.status;
        stored.sent_at = invoice.sent_at;
        stored.paid_at = invoice.paid_at;
        Ok(())
    }

    async fn list_overdue_candidates(&self, now: DateTime<Utc>) -> PortResult<Vec<Invoice>> {
        Ok(self
            .state
            .lock()
            .invoices
            .values()
            .filter(|invoice| {
                invoice.deleted_at.is_none()
                    && invoice.status.is_reminder_eligible()
                    && invoice.due_at < now
            })
            .cloned()
            .collect())
    }

    async fn count_reminders(&self, invoice_id: i64) -> PortResult<u32> {
        Ok(self.reminder_count(invoice_id) as u32)
    }

    async fn record_reminder(&self, invoice_id: i64, sent_at: DateTime<Utc>) -> PortResult<()> {
        self.state.lock().reminders.push((invoice_id, sent_at));
        Ok(())
    }

    async fn soft_delete_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: i64,
        deleted_at: DateTime<Utc>,
    ) -> PortResult<()> {
        let mut state = self.state.lock();
        let invoice = state
            .invoices
            .get_mut(&invoice_id)
            .filter(|invoice| invoice.tenant_id == tenant_id)
            .ok_or_else(|| not_found("Invoice", invoice_id))?;
        invoice.deleted_at.get_or_insert(deleted_at);
        Ok(())
    }

    async fn purge_invoice(&self, tenant_id: TenantId, invoice_id: i64) -> PortResult<()> {
        let mut state = self.state.lock();
        let owned = state
            .invoices
            .get(&invoice_id)
            .is_some_and(|invoice| invoice.tenant_id == tenant_id);
        if !owned {
            return Err(not_found("Invoice", invoice_id));
        }
        state.invoices.remove(&invoice_id);
        state.reminders.retain(|(id, _)| *id != invoice_id);
        Ok(())
    }

    async fn create_offer(&self, offer: NewOffer) -> PortResult<Offer> {
        let mut state = self.state.lock();
        state.next_offer_id += 1;
        let id = state.next_offer_id;
        let items = state.items(id, offer.items);
        let stored = Offer {
            id,
            tenant_id: offer.tenant_id,
            client_id: offer.client_id,
            project_id: offer.project_id,
            number: None,
            status: offer.status,
            client: offer.client,
            currency: offer.currency,
            tax_rate: offer.tax_rate,
            net_total: offer.totals.net,
            tax_total: offer.totals.tax,
            gross_total: offer.totals.gross,
            valid_until: offer.valid_until,
            sent_at: None,
            accepted_at: None,
            accepted_ip: None,
            rejected_at: None,
            render_state: RenderState::Idle,
            pdf_path: None,
            deleted_at: None,
            created_at: offer.created_at,
            items,
        };
        state.offers.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get_offer(&self, tenant_id: TenantId, offer_id: i64) -> PortResult<Offer> {
        let state = self.state.lock();
        state
            .stale_offers
            .get(&offer_id)
            .or_else(|| state.offers.get(&offer_id))
            .filter(|offer| offer.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| not_found("Offer", offer_id))
    }

    async fn set_offer_number_if_absent(&self, offer_id: i64, number: &str) -> PortResult<bool> {
        let mut state = self.state.lock();
        let offer = state
            .offers
            .get_mut(&offer_id)
            .ok_or_else(|| not_found("Offer", offer_id))?;
        if offer.number.is_some() {
            return Ok(false);
        }
        offer.number = Some(number.to_string());
        Ok(true)
    }

    async fn persist_offer_status(&self, offer: &Offer) -> PortResult<()> {
        let mut state = self.state.lock();
        let stored = state
            .offers
            .get_mut(&offer.id)
            .filter(|stored| stored.tenant_id == offer.tenant_id)
            .ok_or_else(|| not_found("Offer", offer.id))?;
        stored.status = offer.status;
        stored.sent_at = offer.sent_at;
        stored.accepted_at = offer.accepted_at;
        stored.accepted_ip = offer.accepted_ip.clone();
        stored.rejected_at = offer.rejected_at;
        Ok(())
    }

    async fn transition_offer_status(&self, offer: &Offer, from: OfferStatus) -> PortResult<bool> {
        let mut state = self.state.lock();
        let stored = state
            .offers
            .get_mut(&offer.id)
            .filter(|stored| stored.tenant_id == offer.tenant_id)
            .ok_or_else(|| not_found("Offer", offer.id))?;
        if stored.deleted_at.is_some() || stored.status != from {
            return Ok(false);
        }
        stored.status = offer.status;
        stored.sent_at = offer.sent_at;
        stored.accepted_at = offer.accepted_at;
        stored.accepted_ip = offer.accepted_ip.clone();
        stored.rejected_at = offer.rejected_at;
        Ok(true)
    }

    async fn list_expirable_offers(&self, now: DateTime<Utc>) -> PortResult<Vec<Offer>> {
        Ok(self
            .state
            .lock()
            .offers
            .values()
            .filter(|offer| {
                offer.deleted_at.is_none() && !offer.status.is_terminal() && offer.valid_until < now
            })
            .cloned()
            .collect())
    }

    async fn soft_delete_offer(
        &self,
        tenant_id: TenantId,
        offer_id: i64,
        deleted_at: DateTime<Utc>,
    ) -> PortResult<()> {
        let mut state = self.state.lock();
        let offer = state
            .offers
            .get_mut(&offer_id)
            .filter(|offer| offer.tenant_id == tenant_id)
            .ok_or_else(|| not_found("Offer", offer_id))?;
        offer.deleted_at.get_or_insert(deleted_at);
        Ok(())
    }

    async fn purge_offer(&self, tenant_id: TenantId, offer_id: i64) -> PortResult<()> {
        let mut state = self.state.lock();
        let owned = state
            .offers
            .get(&offer_id)
            .is_some_and(|offer| offer.tenant_id == tenant_id);
        if !owned {
            return Err(not_found("Offer", offer_id));
        }
        state.offers.remove(&offer_id);
        Ok(())
    }

    async fn try_begin_render(&self, document: DocumentRef) -> PortResult<bool> {
        let mut state = self.state.lock();
        let render_state = match document.kind {
            DocumentKind::Invoice => state
                .invoices
                .get_mut(&document.id)
                .map(|invoice| &mut invoice.render_state),
            DocumentKind::Offer => state
                .offers
                .get_mut(&document.id)
                .map(|offer| &mut offer.render_state),
        }
        .ok_or_else(|| not_found(document.kind.as_str(), document.id))?;
        if *render_state != RenderState::Idle {
            return Ok(false);
        }
        *render_state = RenderState::Generating;
        Ok(true)
    }

    async fn finish_render(&self, document: DocumentRef, pdf_path: Option<&str>) -> PortResult<()> {
        let mut state = self.state.lock();
        let (render_state, stored_path) = match document.kind {
            DocumentKind::Invoice => state
                .invoices
                .get_mut(&document.id)
                .map(|invoice| (&mut invoice.render_state, &mut invoice.pdf_path)),
            DocumentKind::Offer => state
                .offers
                .get_mut(&document.id)
                .map(|offer| (&mut offer.render_state, &mut offer.pdf_path)),
        }
        .ok_or_else(|| not_found(document.kind.as_str(), document.id))?;
        *render_state = RenderState::Idle;
        if let Some(path) = pdf_path {
            *stored_path = Some(path.to_string());
        }
        Ok(())
    }

    async fn reset_interrupted_renders(&self) -> PortResult<u64> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut reset = 0;
        let render_states = state
            .invoices
            .values_mut()
            .map(|invoice| &mut invoice.render_state)
            .chain(state.offers.values_mut().map(|offer| &mut offer.render_state));
        for render_state in render_states {
            if *render_state == RenderState::Generating {
                *render_state = RenderState::Idle;
                reset += 1;
            }
        }
        Ok(reset)
    }
}

//=========================================================================================
// Clock
//=========================================================================================

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
