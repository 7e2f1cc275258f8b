//! crates/freelance_core/src/services.rs
//!
//! Creation of offers and manual invoices: validation, client snapshot,
//! totals, atomic persistence, numbering and the single initial render.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::domain::{
    ClientSnapshot, DocumentRef, Invoice, InvoiceStatus, NewInvoice, NewLineItem, NewOffer,
    Offer, OfferStatus, TenantId, Totals,
};
use crate::error::{BillingError, BillingResult};
use crate::numbering::NumberingAssigner;
use crate::ports::BillingPorts;

#[derive(Debug, Clone, PartialEq)]
pub struct NewOfferRequest {
    pub client_id: i64,
    pub project_id: Option<i64>,
    pub status: Option<OfferStatus>,
    pub valid_until: Option<DateTime<Utc>>,
    pub items: Vec<NewLineItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewInvoiceRequest {
    pub client_id: i64,
    pub project_id: Option<i64>,
    pub status: Option<InvoiceStatus>,
    pub issued_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub service_period_start: Option<DateTime<Utc>>,
    pub service_period_end: Option<DateTime<Utc>>,
    pub items: Vec<NewLineItem>,
}

/// Quantities and unit prices are stored with two decimal places.
const MAX_ITEM_SCALE: u32 = 2;

/// Rejects empty or malformed line items before anything is persisted.
pub fn validate_items(items: &[NewLineItem]) -> BillingResult<()> {
    if items.is_empty() {
        return Err(BillingError::Validation("at least one item is required".into()));
    }
    for (index, item) in items.iter().enumerate() {
        let position = index + 1;
        if item.description.trim().is_empty() {
            return Err(BillingError::Validation(format!(
                "item {} needs a description",
                position
            )));
        }
        if item.unit.trim().is_empty() {
            return Err(BillingError::Validation(format!("item {} needs a unit", position)));
        }
        if item.quantity <= rust_decimal::Decimal::ZERO {
            return Err(BillingError::Validation(format!(
                "item {} must have a positive quantity",
                position
            )));
        }
        if item.unit_price.is_sign_negative() {
            return Err(BillingError::Validation(format!(
                "item {} must not have a negative unit price",
                position
            )));
        }
        if item.quantity.normalize().scale() > MAX_ITEM_SCALE
            || item.unit_price.normalize().scale() > MAX_ITEM_SCALE
        {
            return Err(BillingError::Validation(format!(
                "item {} may have at most {} decimal places",
                position, MAX_ITEM_SCALE
            )));
        }
    }
    Ok(())
}

pub struct BillingService {
    ports: BillingPorts,
    numbering: NumberingAssigner,
}

impl BillingService {
    pub fn new(ports: BillingPorts) -> Self {
        let numbering = NumberingAssigner::new(Arc::clone(&ports.repository));
        Self { ports, numbering }
    }

    pub async fn create_offer(
        &self,
        tenant_id: TenantId,
        request: NewOfferRequest,
    ) -> BillingResult<Offer> {
        validate_items(&request.items)?;
        self.ensure_project_belongs_to_client(tenant_id, request.project_id, request.client_id)
            .await?;

        let repository = &self.ports.repository;
        let settings = repository.get_tenant_settings(tenant_id).await?;
        let client = repository.get_client(tenant_id, request.client_id).await?;
        let now = self.ports.clock.now();

        let valid_until = request
            .valid_until
            .unwrap_or_else(|| now + Duration::days(settings.offer_validity_days));
        if valid_until <= now {
            return Err(BillingError::Validation(
                "the validity deadline must lie in the future".into(),
            ));
        }

        let totals = Totals::compute(
            request.items.iter().map(NewLineItem::total),
            settings.sales_tax_rate,
        );
        let draft = NewOffer {
            tenant_id,
            client_id: client.id,
            project_id: request.project_id,
            status: request.status.unwrap_or(OfferStatus::Draft),
            client: ClientSnapshot::from(&client),
            currency: settings.currency.clone(),
            tax_rate: settings.sales_tax_rate,
            totals,
            valid_until,
            created_at: now,
            items: request.items,
        };

        let mut offer = repository.create_offer(draft).await.map_err(|e| {
            error!(%tenant_id, "Failed to create offer: {:?}", e);
            e
        })?;
        self.numbering.assign_offer(&mut offer).await.map_err(|e| {
            error!(%tenant_id, offer_id = offer.id, "Failed to number offer: {:?}", e);
            e
        })?;
        self.enqueue_render(DocumentRef::offer(tenant_id, offer.id)).await;

        info!(%tenant_id, offer_id = offer.id, "Offer created");
        Ok(offer)
    }

    pub async fn create_invoice(
        &self,
        tenant_id: TenantId,
        request: NewInvoiceRequest,
    ) -> BillingResult<Invoice> {
        validate_items(&request.items)?;
        self.ensure_project_belongs_to_client(tenant_id, request.project_id, request.client_id)
            .await?;

        let repository = &self.ports.repository;
        let settings = repository.get_tenant_settings(tenant_id).await?;
        let client = repository.get_client(tenant_id, request.client_id).await?;
        let now = self.ports.clock.now();

        let issued_at = request.issued_at.unwrap_or(now);
        let due_at = request
            .due_at
            .unwrap_or_else(|| issued_at + Duration::days(settings.payment_terms_days));
        if due_at < issued_at {
            return Err(BillingError::Validation(
                "the due date must not precede the issue date".into(),
            ));
        }
        if let (Some(start), Some(end)) = (request.service_period_start, request.service_period_end) {
            if end < start {
                return Err(BillingError::Validation(
                    "the service period ends before it starts".into(),
                ));
            }
        }

        let draft = NewInvoice {
            tenant_id,
            client_id: client.id,
            project_id: request.project_id,
            status: request.status.unwrap_or(InvoiceStatus::Draft),
            issued_at,
            due_at,
            client: ClientSnapshot::from(&client),
            currency: settings.currency.clone(),
            tax_rate: settings.sales_tax_rate,
            service_period_start: request.service_period_start,
            service_period_end: request.service_period_end,
            created_at: now,
            items: request.items,
        };

        let mut invoice = repository.create_invoice(draft).await.map_err(|e| {
            error!(%tenant_id, "Failed to create invoice: {:?}", e);
            e
        })?;
        self.numbering.assign_invoice(&mut invoice).await.map_err(|e| {
            error!(%tenant_id, invoice_id = invoice.id, "Failed to number invoice: {:?}", e);
            e
        })?;
        self.enqueue_render(DocumentRef::invoice(tenant_id, invoice.id)).await;

        info!(%tenant_id, invoice_id = invoice.id, "Invoice created");
        Ok(invoice)
    }

    async fn ensure_project_belongs_to_client(
        &self,
        tenant_id: TenantId,
        project_id: Option<i64>,
        client_id: i64,
    ) -> BillingResult<()> {
        let Some(project_id) = project_id else {
            return Ok(());
        };
        let aggregate = self
            .ports
            .repository
            .get_project_aggregate(tenant_id, project_id)
            .await?;
        if aggregate.project.client_id != client_id {
            return Err(BillingError::Validation(format!(
                "project {} does not belong to client {}",
                project_id, client_id
            )));
        }
        Ok(())
    }

    async fn enqueue_render(&self, document: DocumentRef) {
        if let Err(e) = self.ports.jobs.enqueue_render(document).await {
            warn!(kind = document.kind.as_str(), id = document.id, "Failed to queue render: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn items_need_positive_quantities() {
        let items = vec![NewLineItem::new("h", "Design", dec!(0), dec!(80))];
        assert!(matches!(validate_items(&items), Err(BillingError::Validation(_))));
    }

    #[test]
    fn empty_item_lists_are_rejected() {
        assert!(validate_items(&[]).is_err());
    }

    #[test]
    fn sub_cent_prices_are_rejected() {
        let items = vec![NewLineItem::new("h", "Review", dec!(3), dec!(33.333))];
        assert!(matches!(validate_items(&items), Err(BillingError::Validation(_))));
    }

    #[test]
    fn trailing_zeros_do_not_count_as_precision() {
        let items = vec![NewLineItem::new("h", "Review", dec!(1.500), dec!(80.000))];
        assert!(validate_items(&items).is_ok());
    }

    #[test]
    fn free_items_are_allowed() {
        let items = vec![NewLineItem::new("pcs", "Kick-off workshop", dec!(1), dec!(0))];
        assert!(validate_items(&items).is_ok());
    }
}
