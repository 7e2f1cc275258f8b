//! crates/freelance_core/src/retention.rs
//!
//! Soft deletion and permanent purge. Invoices must be kept for ten years
//! after issue before they may be removed for good.

use chrono::{DateTime, Months, Utc};
use tracing::info;

use crate::domain::{Invoice, TenantId};
use crate::error::{BillingError, BillingResult};
use crate::ports::BillingPorts;

pub const INVOICE_RETENTION_YEARS: u32 = 10;

/// Earliest moment `invoice` may be purged.
pub fn invoice_purgeable_from(invoice: &Invoice) -> DateTime<Utc> {
    invoice
        .issued_at
        .checked_add_months(Months::new(INVOICE_RETENTION_YEARS * 12))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct RetentionService {
    ports: BillingPorts,
}

impl RetentionService {
    pub fn new(ports: BillingPorts) -> Self {
        Self { ports }
    }

    pub async fn soft_delete_invoice(&self, tenant_id: TenantId, invoice_id: i64) -> BillingResult<()> {
        let now = self.ports.clock.now();
        self.ports
            .repository
            .soft_delete_invoice(tenant_id, invoice_id, now)
            .await?;
        info!(%tenant_id, invoice_id, "Invoice moved to trash");
        Ok(())
    }

    pub async fn purge_invoice(&self, tenant_id: TenantId, invoice_id: i64) -> BillingResult<()> {
        let invoice = self.ports.repository.get_invoice(tenant_id, invoice_id).await?;
        if invoice.deleted_at.is_none() {
            return Err(BillingError::Forbidden(format!(
                "invoice {} must be deleted before it can be purged",
                invoice_id
            )));
        }
        let purgeable_from = invoice_purgeable_from(&invoice);
        if self.ports.clock.now() < purgeable_from {
            return Err(BillingError::Forbidden(format!(
                "invoice {} is retained until {}",
                invoice_id,
                purgeable_from.format("%Y-%m-%d")
            )));
        }
        self.ports.repository.purge_invoice(tenant_id, invoice_id).await?;
        info!(%tenant_id, invoice_id, "Invoice purged");
        Ok(())
    }

    pub async fn soft_delete_offer(&self, tenant_id: TenantId, offer_id: i64) -> BillingResult<()> {
        let now = self.ports.clock.now();
        self.ports
            .repository
            .soft_delete_offer(tenant_id, offer_id, now)
            .await?;
        info!(%tenant_id, offer_id, "Offer moved to trash");
        Ok(())
    }

    pub async fn purge_offer(&self, tenant_id: TenantId, offer_id: i64) -> BillingResult<()> {
        let offer = self.ports.repository.get_offer(tenant_id, offer_id).await?;
        if offer.deleted_at.is_none() {
            return Err(BillingError::Forbidden(format!(
                "offer {} must be deleted before it can be purged",
                offer_id
            )));
        }
        self.ports.repository.purge_offer(tenant_id, offer_id).await?;
        info!(%tenant_id, offer_id, "Offer purged");
        Ok(())
    }
}
