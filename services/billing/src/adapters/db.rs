//! services/billing/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `BillingRepository` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use freelance_core::domain::{
    Client, ClientSnapshot, DocumentKind, DocumentRef, Invoice, InvoiceStatus, LineItem,
    NewInvoice, NewLineItem, NewOffer, Offer, OfferStatus, Project, ProjectAggregate,
    RenderState, TenantId, TenantSettings, TimeEntry,
};
use freelance_core::ports::{BillingRepository, PortError, PortResult};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `BillingRepository` port.
#[derive(Clone)]
pub struct PgBillingRepository {
    pool: PgPool,
}

impl PgBillingRepository {
    /// Creates a new `PgBillingRepository`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

fn not_found_or_unexpected(what: &str, id: impl std::fmt::Display) -> impl FnOnce(sqlx::Error) -> PortError {
    let what = format!("{} {} not found", what, id);
    move |e| match e {
        sqlx::Error::RowNotFound => PortError::NotFound(what),
        _ => PortError::Unexpected(e.to_string()),
    }
}

fn conflict_or_unexpected(e: sqlx::Error) -> PortError {
    let is_unique_violation = e
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION);
    if is_unique_violation {
        PortError::Conflict(e.to_string())
    } else {
        PortError::Unexpected(e.to_string())
    }
}

fn parse_status<T>(raw: &str, parse: fn(&str) -> Option<T>) -> PortResult<T> {
    parse(raw).ok_or_else(|| PortError::Unexpected(format!("unknown status '{}' in database", raw)))
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct SettingsRecord {
    tenant_id: Uuid,
    currency: String,
    sales_tax_rate: Decimal,
    payment_terms_days: i64,
    offer_validity_days: i64,
}
impl SettingsRecord {
    fn to_domain(self) -> TenantSettings {
        TenantSettings {
            tenant_id: self.tenant_id,
            currency: self.currency,
            sales_tax_rate: self.sales_tax_rate,
            payment_terms_days: self.payment_terms_days,
            offer_validity_days: self.offer_validity_days,
        }
    }
}

#[derive(FromRow)]
struct ClientRecord {
    id: i64,
    tenant_id: Uuid,
    name: String,
    email: Option<String>,
    street: Option<String>,
    postal_code: Option<String>,
    city: Option<String>,
    country: Option<String>,
}
impl ClientRecord {
    fn to_domain(self) -> Client {
        Client {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name,
            email: self.email,
            street: self.street,
            postal_code: self.postal_code,
            city: self.city,
            country: self.country,
        }
    }
}

#[derive(FromRow)]
struct ProjectRecord {
    id: i64,
    tenant_id: Uuid,
    client_id: i64,
    name: String,
    hourly_rate: Decimal,
    auto_generate_invoice: bool,
    auto_generate_amount: Option<i32>,
    last_auto_generated_at: Option<DateTime<Utc>>,
    auto_generation_failures: i32,
}
impl ProjectRecord {
    fn to_domain(self) -> Project {
        Project {
            id: self.id,
            tenant_id: self.tenant_id,
            client_id: self.client_id,
            name: self.name,
            hourly_rate: self.hourly_rate,
            auto_generate_invoice: self.auto_generate_invoice,
            auto_generate_amount: self.auto_generate_amount,
            last_auto_generated_at: self.last_auto_generated_at,
            auto_generation_failures: self.auto_generation_failures,
        }
    }
}

#[derive(FromRow)]
struct TimeEntryRecord {
    id: i64,
    project_id: i64,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    duration_minutes: i64,
    description: Option<String>,
}
impl TimeEntryRecord {
    fn to_domain(self) -> TimeEntry {
        TimeEntry {
            id: self.id,
            project_id: self.project_id,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_minutes: self.duration_minutes,
            description: self.description,
        }
    }
}

#[derive(FromRow)]
struct ItemRecord {
    id: i64,
    document_id: i64,
    unit: String,
    description: String,
    quantity: Decimal,
    unit_price: Decimal,
    total: Decimal,
}
impl ItemRecord {
    fn to_domain(self) -> LineItem {
        LineItem {
            id: self.id,
            document_id: self.document_id,
            unit: self.unit,
            description: self.description,
            quantity: self.quantity,
            unit_price: self.unit_price,
            total: self.total,
        }
    }
}

#[derive(FromRow)]
struct InvoiceRecord {
    id: i64,
    tenant_id: Uuid,
    client_id: i64,
    project_id: Option<i64>,
    number: Option<String>,
    status: String,
    issued_at: DateTime<Utc>,
    due_at: DateTime<Utc>,
    client_name: String,
    client_email: Option<String>,
    client_street: Option<String>,
    client_postal_code: Option<String>,
    client_city: Option<String>,
    client_country: Option<String>,
    currency: String,
    tax_rate: Decimal,
    service_period_start: Option<DateTime<Utc>>,
    service_period_end: Option<DateTime<Utc>>,
    render_state: String,
    pdf_path: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}
impl InvoiceRecord {
    fn to_domain(self, items: Vec<LineItem>) -> PortResult<Invoice> {
        Ok(Invoice {
            id: self.id,
            tenant_id: self.tenant_id,
            client_id: self.client_id,
            project_id: self.project_id,
            number: self.number,
            status: parse_status(&self.status, InvoiceStatus::parse)?,
            issued_at: self.issued_at,
            due_at: self.due_at,
            client: ClientSnapshot {
                name: self.client_name,
                email: self.client_email,
                street: self.client_street,
                postal_code: self.client_postal_code,
                city: self.client_city,
                country: self.client_country,
            },
            currency: self.currency,
            tax_rate: self.tax_rate,
            service_period_start: self.service_period_start,
            service_period_end: self.service_period_end,
            render_state: parse_status(&self.render_state, RenderState::parse)?,
            pdf_path: self.pdf_path,
            sent_at: self.sent_at,
            paid_at: self.paid_at,
            deleted_at: self.deleted_at,
            created_at: self.created_at,
            items,
        })
    }
}

#[derive(FromRow)]
struct OfferRecord {
    id: i64,
    tenant_id: Uuid,
    client_id: i64,
    project_id: Option<i64>,
    number: Option<String>,
    status: String,
    client_name: String,
    client_email: Option<String>,
    client_street: Option<String>,
    client_postal_code: Option<String>,
    client_city: Option<String>,
    client_country: Option<String>,
    currency: String,
    tax_rate: Decimal,
    net_total: Decimal,
    tax_total: Decimal,
    gross_total: Decimal,
    valid_until: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    accepted_at: Option<DateTime<Utc>>,
    accepted_ip: Option<String>,
    rejected_at: Option<DateTime<Utc>>,
    render_state: String,
    pdf_path: Option<String>,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}
impl OfferRecord {
    fn to_domain(self, items: Vec<LineItem>) -> PortResult<Offer> {
        Ok(Offer {
            id: self.id,
            tenant_id: self.tenant_id,
            client_id: self.client_id,
            project_id: self.project_id,
            number: self.number,
            status: parse_status(&self.status, OfferStatus::parse)?,
            client: ClientSnapshot {
                name: self.client_name,
                email: self.client_email,
                street: self.client_street,
                postal_code: self.client_postal_code,
                city: self.client_city,
                country: self.client_country,
            },
            currency: self.currency,
            tax_rate: self.tax_rate,
            net_total: self.net_total,
            tax_total: self.tax_total,
            gross_total: self.gross_total,
            valid_until: self.valid_until,
            sent_at: self.sent_at,
            accepted_at: self.accepted_at,
            accepted_ip: self.accepted_ip,
            rejected_at: self.rejected_at,
            render_state: parse_status(&self.render_state, RenderState::parse)?,
            pdf_path: self.pdf_path,
            deleted_at: self.deleted_at,
            created_at: self.created_at,
            items,
        })
    }
}

//=========================================================================================
// SQL
//=========================================================================================

const INVOICE_COLUMNS: &str = "id, tenant_id, client_id, project_id, number, status, issued_at, due_at, \
     client_name, client_email, client_street, client_postal_code, client_city, client_country, \
     currency, tax_rate, service_period_start, service_period_end, render_state, pdf_path, \
     sent_at, paid_at, deleted_at, created_at";

const OFFER_COLUMNS: &str = "id, tenant_id, client_id, project_id, number, status, \
     client_name, client_email, client_street, client_postal_code, client_city, client_country, \
     currency, tax_rate, net_total, tax_total, gross_total, valid_until, sent_at, accepted_at, \
     accepted_ip, rejected_at, render_state, pdf_path, deleted_at, created_at";

/// Table names per document kind: (records, items, item foreign key).
fn tables(kind: DocumentKind) -> (&'static str, &'static str, &'static str) {
    match kind {
        DocumentKind::Invoice => ("invoices", "invoice_items", "invoice_id"),
        DocumentKind::Offer => ("offers", "offer_items", "offer_id"),
    }
}

impl PgBillingRepository {
    /// Items of every listed document, grouped by owner and kept in position order.
    async fn load_items(
        &self,
        kind: DocumentKind,
        document_ids: &[i64],
    ) -> PortResult<HashMap<i64, Vec<LineItem>>> {
        let (_, items_table, owner) = tables(kind);
        let sql = format!(
            "SELECT id, {owner} AS document_id, unit, description, quantity, unit_price, total \
             FROM {items_table} WHERE {owner} = ANY($1) ORDER BY {owner}, position"
        );
        let records = sqlx::query_as::<_, ItemRecord>(&sql)
            .bind(document_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?;

        let mut grouped: HashMap<i64, Vec<LineItem>> = HashMap::new();
        for record in records {
            grouped
                .entry(record.document_id)
                .or_default()
                .push(record.to_domain());
        }
        Ok(grouped)
    }

    async fn invoices_with_items(&self, records: Vec<InvoiceRecord>) -> PortResult<Vec<Invoice>> {
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        let mut items = self.load_items(DocumentKind::Invoice, &ids).await?;
        records
            .into_iter()
            .map(|r| {
                let lines = items.remove(&r.id).unwrap_or_default();
                r.to_domain(lines)
            })
            .collect()
    }

    async fn offers_with_items(&self, records: Vec<OfferRecord>) -> PortResult<Vec<Offer>> {
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        let mut items = self.load_items(DocumentKind::Offer, &ids).await?;
        records
            .into_iter()
            .map(|r| {
                let lines = items.remove(&r.id).unwrap_or_default();
                r.to_domain(lines)
            })
            .collect()
    }

    async fn insert_items(
        tx: &mut Transaction<'static, Postgres>,
        kind: DocumentKind,
        document_id: i64,
        items: &[NewLineItem],
    ) -> PortResult<Vec<LineItem>> {
        let (_, items_table, owner) = tables(kind);
        let sql = format!(
            "INSERT INTO {items_table} ({owner}, position, unit, description, quantity, unit_price, total) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING id, {owner} AS document_id, unit, description, quantity, unit_price, total"
        );
        let mut stored = Vec::with_capacity(items.len());
        for (position, item) in items.iter().enumerate() {
            let record = sqlx::query_as::<_, ItemRecord>(&sql)
                .bind(document_id)
                .bind(position as i32)
                .bind(&item.unit)
                .bind(&item.description)
                .bind(item.quantity)
                .bind(item.unit_price)
                .bind(item.total())
                .fetch_one(&mut **tx)
                .await
                .map_err(unexpected)?;
            stored.push(record.to_domain());
        }
        Ok(stored)
    }
}

//=========================================================================================
// `BillingRepository` Trait Implementation
//=========================================================================================

#[async_trait]
impl BillingRepository for PgBillingRepository {
    async fn get_tenant_settings(&self, tenant_id: TenantId) -> PortResult<TenantSettings> {
        let record = sqlx::query_as::<_, SettingsRecord>(
            "SELECT tenant_id, currency, sales_tax_rate, payment_terms_days, offer_validity_days \
             FROM tenant_settings WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;

        Ok(record
            .map(SettingsRecord::to_domain)
            .unwrap_or_else(|| TenantSettings::with_defaults(tenant_id)))
    }

    async fn get_client(&self, tenant_id: TenantId, client_id: i64) -> PortResult<Client> {
        let record = sqlx::query_as::<_, ClientRecord>(
            "SELECT id, tenant_id, name, email, street, postal_code, city, country \
             FROM clients WHERE id = $1 AND tenant_id = $2",
        )
        .bind(client_id)
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found_or_unexpected("Client", client_id))?;
        Ok(record.to_domain())
    }

    async fn list_auto_invoicing_projects(&self) -> PortResult<Vec<Project>> {
        let records = sqlx::query_as::<_, ProjectRecord>(
            "SELECT p.id, p.tenant_id, p.client_id, p.name, p.hourly_rate, p.auto_generate_invoice, \
                    p.auto_generate_amount, p.last_auto_generated_at, p.auto_generation_failures \
             FROM projects p \
             WHERE p.auto_generate_invoice \
               AND EXISTS (SELECT 1 FROM time_entries t WHERE t.project_id = p.id) \
             ORDER BY p.id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn get_project_aggregate(
        &self,
        tenant_id: TenantId,
        project_id: i64,
    ) -> PortResult<ProjectAggregate> {
        let project = sqlx::query_as::<_, ProjectRecord>(
            "SELECT id, tenant_id, client_id, name, hourly_rate, auto_generate_invoice, \
                    auto_generate_amount, last_auto_generated_at, auto_generation_failures \
             FROM projects WHERE id = $1 AND tenant_id = $2",
        )
        .bind(project_id)
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found_or_unexpected("Project", project_id))?
        .to_domain();

        let client = self.get_client(tenant_id, project.client_id).await?;

        let time_entries = sqlx::query_as::<_, TimeEntryRecord>(
            "SELECT id, project_id, started_at, ended_at, duration_minutes, description \
             FROM time_entries WHERE project_id = $1 ORDER BY started_at ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?
        .into_iter()
        .map(|r| r.to_domain())
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
        let result = sqlx::query(
            "UPDATE projects SET last_auto_generated_at = $1 \
             WHERE id = $2 AND last_auto_generated_at IS NOT DISTINCT FROM $3",
        )
        .bind(now)
        .bind(project_id)
        .bind(expected_last)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_auto_generation_state(
        &self,
        project_id: i64,
        last_generated_at: Option<DateTime<Utc>>,
        failures: i32,
    ) -> PortResult<()> {
        sqlx::query(
            "UPDATE projects SET last_auto_generated_at = $1, auto_generation_failures = $2 \
             WHERE id = $3",
        )
        .bind(last_generated_at)
        .bind(failures)
        .bind(project_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(())
    }

    async fn create_invoice(&self, invoice: NewInvoice) -> PortResult<Invoice> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;

        let sql = format!(
            "INSERT INTO invoices (tenant_id, client_id, project_id, status, issued_at, due_at, \
                 client_name, client_email, client_street, client_postal_code, client_city, \
                 client_country, currency, tax_rate, service_period_start, service_period_end, \
                 created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             RETURNING {INVOICE_COLUMNS}"
        );
        let record = sqlx::query_as::<_, InvoiceRecord>(&sql)
            .bind(invoice.tenant_id)
            .bind(invoice.client_id)
            .bind(invoice.project_id)
            .bind(invoice.status.as_str())
            .bind(invoice.issued_at)
            .bind(invoice.due_at)
            .bind(&invoice.client.name)
            .bind(&invoice.client.email)
            .bind(&invoice.client.street)
            .bind(&invoice.client.postal_code)
            .bind(&invoice.client.city)
            .bind(&invoice.client.country)
            .bind(&invoice.currency)
            .bind(invoice.tax_rate)
            .bind(invoice.service_period_start)
            .bind(invoice.service_period_end)
            .bind(invoice.created_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(unexpected)?;

        let items = Self::insert_items(&mut tx, DocumentKind::Invoice, record.id, &invoice.items).await?;
        tx.commit().await.map_err(unexpected)?;

        debug!(invoice_id = record.id, items = items.len(), "Inserted invoice");
        record.to_domain(items)
    }

    async fn get_invoice(&self, tenant_id: TenantId, invoice_id: i64) -> PortResult<Invoice> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1 AND tenant_id = $2");
        let record = sqlx::query_as::<_, InvoiceRecord>(&sql)
            .bind(invoice_id)
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found_or_unexpected("Invoice", invoice_id))?;
        let mut invoices = self.invoices_with_items(vec![record]).await?;
        invoices
            .pop()
            .ok_or_else(|| PortError::NotFound(format!("Invoice {} not found", invoice_id)))
    }

    async fn set_invoice_number(&self, invoice_id: i64, number: &str) -> PortResult<()> {
        let result = sqlx::query("UPDATE invoices SET number = $1 WHERE id = $2")
            .bind(number)
            .bind(invoice_id)
            .execute(&self.pool)
            .await
            .map_err(conflict_or_unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Invoice {} not found", invoice_id)));
        }
        Ok(())
    }

    async fn persist_invoice_status(&self, invoice: &Invoice) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE invoices SET status = $1, sent_at = $2, paid_at = $3 \
             WHERE id = $4 AND tenant_id = $5",
        )
        .bind(invoice.status.as_str())
        .bind(invoice.sent_at)
        .bind(invoice.paid_at)
        .bind(invoice.id)
        .bind(invoice.tenant_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Invoice {} not found", invoice.id)));
        }
        Ok(())
    }

    async fn list_overdue_candidates(&self, now: DateTime<Utc>) -> PortResult<Vec<Invoice>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE deleted_at IS NULL AND due_at < $1 AND status = ANY($2) \
             ORDER BY due_at ASC"
        );
        let eligible: Vec<&str> = [
            InvoiceStatus::Open,
            InvoiceStatus::Approved,
            InvoiceStatus::Sent,
            InvoiceStatus::Overdue,
        ]
        .iter()
        .filter(|status| status.is_reminder_eligible())
        .map(|status| status.as_str())
        .collect();
        let records = sqlx::query_as::<_, InvoiceRecord>(&sql)
            .bind(now)
            .bind(&eligible)
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?;
        self.invoices_with_items(records).await
    }

    async fn count_reminders(&self, invoice_id: i64) -> PortResult<u32> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM invoice_reminders WHERE invoice_id = $1")
                .bind(invoice_id)
                .fetch_one(&self.pool)
                .await
                .map_err(unexpected)?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn record_reminder(&self, invoice_id: i64, sent_at: DateTime<Utc>) -> PortResult<()> {
        sqlx::query("INSERT INTO invoice_reminders (invoice_id, sent_at) VALUES ($1, $2)")
            .bind(invoice_id)
            .bind(sent_at)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn soft_delete_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: i64,
        deleted_at: DateTime<Utc>,
    ) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE invoices SET deleted_at = COALESCE(deleted_at, $1) \
             WHERE id = $2 AND tenant_id = $3",
        )
        .bind(deleted_at)
        .bind(invoice_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Invoice {} not found", invoice_id)));
        }
        Ok(())
    }

    async fn purge_invoice(&self, tenant_id: TenantId, invoice_id: i64) -> PortResult<()> {
        let result = sqlx::query(
            "DELETE FROM invoices WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NOT NULL",
        )
        .bind(invoice_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Invoice {} not found", invoice_id)));
        }
        Ok(())
    }

    async fn create_offer(&self, offer: NewOffer) -> PortResult<Offer> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;

        let sql = format!(
            "INSERT INTO offers (tenant_id, client_id, project_id, status, client_name, \
                 client_email, client_street, client_postal_code, client_city, client_country, \
                 currency, tax_rate, net_total, tax_total, gross_total, valid_until, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             RETURNING {OFFER_COLUMNS}"
        );
        let record = sqlx::query_as::<_, OfferRecord>(&sql)
            .bind(offer.tenant_id)
            .bind(offer.client_id)
            .bind(offer.project_id)
            .bind(offer.status.as_str())
            .bind(&offer.client.name)
            .bind(&offer.client.email)
            .bind(&offer.client.street)
            .bind(&offer.client.postal_code)
            .bind(&offer.client.city)
            .bind(&offer.client.country)
            .bind(&offer.currency)
            .bind(offer.tax_rate)
            .bind(offer.totals.net)
            .bind(offer.totals.tax)
            .bind(offer.totals.gross)
            .bind(offer.valid_until)
            .bind(offer.created_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(unexpected)?;

        let items = Self::insert_items(&mut tx, DocumentKind::Offer, record.id, &offer.items).await?;
        tx.commit().await.map_err(unexpected)?;

        debug!(offer_id = record.id, items = items.len(), "Inserted offer");
        record.to_domain(items)
    }

    async fn get_offer(&self, tenant_id: TenantId, offer_id: i64) -> PortResult<Offer> {
        let sql = format!("SELECT {OFFER_COLUMNS} FROM offers WHERE id = $1 AND tenant_id = $2");
        let record = sqlx::query_as::<_, OfferRecord>(&sql)
            .bind(offer_id)
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found_or_unexpected("Offer", offer_id))?;
        let mut offers = self.offers_with_items(vec![record]).await?;
        offers
            .pop()
            .ok_or_else(|| PortError::NotFound(format!("Offer {} not found", offer_id)))
    }

    async fn set_offer_number_if_absent(&self, offer_id: i64, number: &str) -> PortResult<bool> {
        let result = sqlx::query("UPDATE offers SET number = $1 WHERE id = $2 AND number IS NULL")
            .bind(number)
            .bind(offer_id)
            .execute(&self.pool)
            .await
            .map_err(conflict_or_unexpected)?;
        Ok(result.rows_affected() == 1)
    }

    async fn persist_offer_status(&self, offer: &Offer) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE offers SET status = $1, sent_at = $2, accepted_at = $3, accepted_ip = $4, \
                 rejected_at = $5 \
             WHERE id = $6 AND tenant_id = $7",
        )
        .bind(offer.status.as_str())
        .bind(offer.sent_at)
        .bind(offer.accepted_at)
        .bind(&offer.accepted_ip)
        .bind(offer.rejected_at)
        .bind(offer.id)
        .bind(offer.tenant_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Offer {} not found", offer.id)));
        }
        Ok(())
    }

    async fn transition_offer_status(&self, offer: &Offer, from: OfferStatus) -> PortResult<bool> {
        let result = sqlx::query(
            "UPDATE offers SET status = $1, sent_at = $2, accepted_at = $3, accepted_ip = $4, \
                 rejected_at = $5 \
             WHERE id = $6 AND tenant_id = $7 AND status = $8 AND deleted_at IS NULL",
        )
        .bind(offer.status.as_str())
        .bind(offer.sent_at)
        .bind(offer.accepted_at)
        .bind(&offer.accepted_ip)
        .bind(offer.rejected_at)
        .bind(offer.id)
        .bind(offer.tenant_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_expirable_offers(&self, now: DateTime<Utc>) -> PortResult<Vec<Offer>> {
        let sql = format!(
            "SELECT {OFFER_COLUMNS} FROM offers \
             WHERE deleted_at IS NULL AND valid_until < $1 AND status = ANY($2) \
             ORDER BY valid_until ASC"
        );
        let open: Vec<&str> = [OfferStatus::Draft, OfferStatus::Sent]
            .iter()
            .map(|status| status.as_str())
            .collect();
        let records = sqlx::query_as::<_, OfferRecord>(&sql)
            .bind(now)
            .bind(&open)
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?;
        self.offers_with_items(records).await
    }

    async fn soft_delete_offer(
        &self,
        tenant_id: TenantId,
        offer_id: i64,
        deleted_at: DateTime<Utc>,
    ) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE offers SET deleted_at = COALESCE(deleted_at, $1) \
             WHERE id = $2 AND tenant_id = $3",
        )
        .bind(deleted_at)
        .bind(offer_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Offer {} not found", offer_id)));
        }
        Ok(())
    }

    async fn purge_offer(&self, tenant_id: TenantId, offer_id: i64) -> PortResult<()> {
        let result = sqlx::query(
            "DELETE FROM offers WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NOT NULL",
        )
        .bind(offer_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Offer {} not found", offer_id)));
        }
        Ok(())
    }

    async fn try_begin_render(&self, document: DocumentRef) -> PortResult<bool> {
        let (table, _, _) = tables(document.kind);
        let sql = format!(
            "UPDATE {table} SET render_state = $1 \
             WHERE id = $2 AND tenant_id = $3 AND render_state = $4"
        );
        let result = sqlx::query(&sql)
            .bind(RenderState::Generating.as_str())
            .bind(document.id)
            .bind(document.tenant_id)
            .bind(RenderState::Idle.as_str())
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_render(&self, document: DocumentRef, pdf_path: Option<&str>) -> PortResult<()> {
        let (table, _, _) = tables(document.kind);
        let sql = format!(
            "UPDATE {table} SET render_state = $1, pdf_path = COALESCE($2, pdf_path) \
             WHERE id = $3 AND tenant_id = $4"
        );
        sqlx::query(&sql)
            .bind(RenderState::Idle.as_str())
            .bind(pdf_path)
            .bind(document.id)
            .bind(document.tenant_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn reset_interrupted_renders(&self) -> PortResult<u64> {
        let mut reset = 0;
        for kind in [DocumentKind::Invoice, DocumentKind::Offer] {
            let (table, _, _) = tables(kind);
            let sql = format!("UPDATE {table} SET render_state = $1 WHERE render_state = $2");
            let result = sqlx::query(&sql)
                .bind(RenderState::Idle.as_str())
                .bind(RenderState::Generating.as_str())
                .execute(&self.pool)
                .await
                .map_err(unexpected)?;
            reset += result.rows_affected();
        }
        debug!(reset, "Cleared interrupted renders");
        Ok(reset)
    }
}
