//! crates/freelance_core/src/lifecycle.rs
//!
//! Status transitions of invoices and offers, both the explicit client actions
//! (send, accept, reject, pay) and the scheduled sweeps (offer expiry, overdue
//! invoices with reminders).
//!
//! Persisting a status is always a quiet write. When a transition should also
//! regenerate the document, the caller enqueues the render explicitly. Offer
//! transitions are conditional on the status they were checked against.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::documents::DocumentService;
use crate::domain::{DocumentRef, Invoice, InvoiceStatus, Notice, Offer, OfferStatus, TenantId};
use crate::error::{BillingError, BillingResult};
use crate::policy::BillingPolicy;
use crate::ports::{
    BillingPorts, Notification, NotificationKind, PortResult, RenderableDocument,
};

/// Counters reported by the overdue sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverdueReport {
    pub flagged_overdue: usize,
    pub reminders_sent: usize,
    pub reminders_capped: usize,
    pub failed: usize,
}

pub struct StatusLifecycle {
    ports: BillingPorts,
    documents: Arc<DocumentService>,
    policy: BillingPolicy,
}

impl StatusLifecycle {
    pub fn new(ports: BillingPorts, documents: Arc<DocumentService>, policy: BillingPolicy) -> Self {
        Self {
            ports,
            documents,
            policy,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.ports.clock.now()
    }

    //=====================================================================================
    // Persistence: quiet vs. with downstream work
    //=====================================================================================

    pub async fn persist_offer(&self, offer: &Offer) -> PortResult<()> {
        self.ports.repository.persist_offer_status(offer).await
    }

    /// Persists the offer and queues a regeneration of its document.
    pub async fn persist_offer_and_rerender(&self, offer: &Offer) -> PortResult<()> {
        self.persist_offer(offer).await?;
        self.ports
            .jobs
            .enqueue_render(DocumentRef::offer(offer.tenant_id, offer.id))
            .await
    }

    pub async fn persist_invoice(&self, invoice: &Invoice) -> PortResult<()> {
        self.ports.repository.persist_invoice_status(invoice).await
    }

    //=====================================================================================
    // Offers
    //=====================================================================================

    /// Sends the rendered offer to the client. Every failure becomes a `Notice`.
    pub async fn send_offer_to_client(&self, tenant_id: TenantId, offer_id: i64) -> Notice {
        let mut offer = match self.ports.repository.get_offer(tenant_id, offer_id).await {
            Ok(offer) => offer,
            Err(e) => {
                error!(%tenant_id, offer_id, "Failed to load offer for sending: {:?}", e);
                return Notice::Failure("The offer could not be sent.".to_string());
            }
        };
        if offer.deleted_at.is_some() || offer.status.is_terminal() {
            return Notice::Failure(format!(
                "Offer {} is {} and can no longer be sent.",
                display_number(offer.number.as_deref(), offer.id),
                offer.status.as_str()
            ));
        }

        let document = RenderableDocument::Offer(offer.clone());
        let attachment = match self.require_rendered(&document).await {
            Ok(path) => path,
            Err(notice) => return notice,
        };
        let Some(recipient) = offer.client.email.clone() else {
            return Notice::Failure(format!(
                "Client {} has no email address.",
                offer.client.name
            ));
        };

        let from = offer.status;
        offer.status = OfferStatus::Sent;
        offer.sent_at = Some(self.now());
        match self.ports.repository.transition_offer_status(&offer, from).await {
            Ok(true) => {}
            Ok(false) => {
                return Notice::Failure(format!(
                    "Offer {} was changed in the meantime and was not sent.",
                    display_number(offer.number.as_deref(), offer.id)
                ));
            }
            Err(e) => {
                error!(%tenant_id, offer_id, "Failed to mark offer as sent: {:?}", e);
                return Notice::Failure("The offer could not be sent.".to_string());
            }
        }

        let number = display_number(offer.number.as_deref(), offer.id);
        let notification = Notification {
            kind: NotificationKind::OfferSent,
            recipient: recipient.clone(),
            recipient_name: offer.client.name.clone(),
            document_number: number.clone(),
            attachment: Some(attachment),
        };
        match self.ports.notifier.notify(notification).await {
            Ok(()) => {
                info!(%tenant_id, offer_id, "Offer sent to client");
                Notice::Success(format!("Offer {} was sent to {}.", number, recipient))
            }
            Err(e) => {
                warn!(%tenant_id, offer_id, "Offer marked as sent but email failed: {:?}", e);
                Notice::Failure(format!(
                    "Offer {} was marked as sent, but the email to {} could not be delivered.",
                    number, recipient
                ))
            }
        }
    }

    /// Accepts a SENT offer on behalf of the client and confirms it by email.
    pub async fn accept_offer(
        &self,
        tenant_id: TenantId,
        offer_id: i64,
        ip_address: &str,
    ) -> BillingResult<Offer> {
        let mut offer = self.ports.repository.get_offer(tenant_id, offer_id).await?;
        ensure_answerable(&offer)?;

        let encrypted_ip = self.ports.cipher.encrypt(ip_address)?;
        offer.status = OfferStatus::Accepted;
        offer.accepted_at = Some(self.now());
        offer.accepted_ip = Some(encrypted_ip);
        self.answer(&offer).await?;
        info!(%tenant_id, offer_id, "Offer accepted");

        if let Err(e) = self
            .ports
            .jobs
            .enqueue_render(DocumentRef::offer(tenant_id, offer_id))
            .await
        {
            warn!(%tenant_id, offer_id, "Failed to queue render of accepted offer: {:?}", e);
        }

        match offer.client.email.clone() {
            Some(recipient) => {
                let document = RenderableDocument::Offer(offer.clone());
                let attachment = match self.documents.is_rendered(&document).await {
                    Ok(true) => Some(document.storage_path()),
                    _ => None,
                };
                let notification = Notification {
                    kind: NotificationKind::OfferAccepted,
                    recipient,
                    recipient_name: offer.client.name.clone(),
                    document_number: display_number(offer.number.as_deref(), offer.id),
                    attachment,
                };
                if let Err(e) = self.ports.notifier.notify(notification).await {
                    warn!(%tenant_id, offer_id, "Failed to send acceptance confirmation: {:?}", e);
                }
            }
            None => warn!(%tenant_id, offer_id, "Accepted offer has no client email"),
        }

        Ok(offer)
    }

    pub async fn reject_offer(&self, tenant_id: TenantId, offer_id: i64) -> BillingResult<Offer> {
        let mut offer = self.ports.repository.get_offer(tenant_id, offer_id).await?;
        ensure_answerable(&offer)?;
        offer.status = OfferStatus::Rejected;
        offer.rejected_at = Some(self.now());
        self.answer(&offer).await?;
        info!(%tenant_id, offer_id, "Offer rejected");
        Ok(offer)
    }

    /// Writes the client's answer only if the offer is still SENT, so of two
    /// concurrent answers exactly one takes effect.
    async fn answer(&self, offer: &Offer) -> BillingResult<()> {
        let written = self
            .ports
            .repository
            .transition_offer_status(offer, OfferStatus::Sent)
            .await?;
        if !written {
            return Err(BillingError::Forbidden(format!(
                "offer {} was already answered",
                offer.id
            )));
        }
        Ok(())
    }

    /// Decrypts the IP address recorded when the offer was accepted.
    pub fn accepted_ip(&self, offer: &Offer) -> BillingResult<Option<String>> {
        offer
            .accepted_ip
            .as_deref()
            .map(|ciphertext| self.ports.cipher.decrypt(ciphertext))
            .transpose()
            .map_err(BillingError::from)
    }

    /// Moves every non-terminal offer past its validity deadline to EXPIRED.
    pub async fn expire_offers(&self) -> PortResult<usize> {
        let now = self.now();
        let candidates = self.ports.repository.list_expirable_offers(now).await?;
        let mut expired = 0;
        for mut offer in candidates {
            if offer.status.is_terminal() || offer.valid_until >= now {
                continue;
            }
            let from = offer.status;
            offer.status = OfferStatus::Expired;
            match self.ports.repository.transition_offer_status(&offer, from).await {
                Ok(true) => expired += 1,
                Ok(false) => info!(offer_id = offer.id, "Offer changed before it could expire"),
                Err(e) => error!(offer_id = offer.id, "Failed to expire offer: {:?}", e),
            }
        }
        Ok(expired)
    }

    //=====================================================================================
    // Invoices
    //=====================================================================================

    /// Sends the rendered invoice to the client. Every failure becomes a `Notice`.
    pub async fn send_invoice_to_client(&self, tenant_id: TenantId, invoice_id: i64) -> Notice {
        let mut invoice = match self.ports.repository.get_invoice(tenant_id, invoice_id).await {
            Ok(invoice) => invoice,
            Err(e) => {
                error!(%tenant_id, invoice_id, "Failed to load invoice for sending: {:?}", e);
                return Notice::Failure("The invoice could not be sent.".to_string());
            }
        };
        let number = display_number(invoice.number.as_deref(), invoice.id);
        let resend = invoice.status == InvoiceStatus::Sent;
        if invoice.deleted_at.is_some()
            || (!resend && !invoice.status.can_transition_to(InvoiceStatus::Sent))
        {
            return Notice::Failure(format!(
                "Invoice {} is {} and cannot be sent.",
                number,
                invoice.status.as_str()
            ));
        }

        let document = RenderableDocument::Invoice(invoice.clone());
        let attachment = match self.require_rendered(&document).await {
            Ok(path) => path,
            Err(notice) => return notice,
        };
        let Some(recipient) = invoice.client.email.clone() else {
            return Notice::Failure(format!(
                "Client {} has no email address.",
                invoice.client.name
            ));
        };

        if !resend {
            invoice.status = InvoiceStatus::Sent;
            invoice.sent_at = Some(self.now());
            if let Err(e) = self.persist_invoice(&invoice).await {
                error!(%tenant_id, invoice_id, "Failed to mark invoice as sent: {:?}", e);
                return Notice::Failure("The invoice could not be sent.".to_string());
            }
        }

        let notification = Notification {
            kind: NotificationKind::InvoiceSent,
            recipient: recipient.clone(),
            recipient_name: invoice.client.name.clone(),
            document_number: number.clone(),
            attachment: Some(attachment),
        };
        match self.ports.notifier.notify(notification).await {
            Ok(()) => Notice::Success(format!("Invoice {} was sent to {}.", number, recipient)),
            Err(e) => {
                warn!(%tenant_id, invoice_id, "Invoice marked as sent but email failed: {:?}", e);
                Notice::Failure(format!(
                    "Invoice {} was marked as sent, but the email to {} could not be delivered.",
                    number, recipient
                ))
            }
        }
    }

    pub async fn submit_invoice_for_review(
        &self,
        tenant_id: TenantId,
        invoice_id: i64,
    ) -> BillingResult<Invoice> {
        self.transition_invoice(tenant_id, invoice_id, InvoiceStatus::UnderReview)
            .await
    }

    pub async fn approve_invoice(&self, tenant_id: TenantId, invoice_id: i64) -> BillingResult<Invoice> {
        self.transition_invoice(tenant_id, invoice_id, InvoiceStatus::Approved)
            .await
    }

    pub async fn mark_invoice_paid(&self, tenant_id: TenantId, invoice_id: i64) -> BillingResult<Invoice> {
        self.transition_invoice(tenant_id, invoice_id, InvoiceStatus::Paid)
            .await
    }

    async fn transition_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: i64,
        next: InvoiceStatus,
    ) -> BillingResult<Invoice> {
        let mut invoice = self.ports.repository.get_invoice(tenant_id, invoice_id).await?;
        if invoice.deleted_at.is_some() {
            return Err(BillingError::Forbidden(format!(
                "invoice {} is deleted",
                invoice_id
            )));
        }
        if !invoice.status.can_transition_to(next) {
            return Err(BillingError::Forbidden(format!(
                "invoice {} cannot move from {} to {}",
                invoice_id,
                invoice.status.as_str(),
                next.as_str()
            )));
        }
        invoice.status = next;
        match next {
            InvoiceStatus::Paid => invoice.paid_at = Some(self.now()),
            InvoiceStatus::Sent => invoice.sent_at = Some(self.now()),
            _ => {}
        }
        self.persist_invoice(&invoice).await?;
        info!(%tenant_id, invoice_id, status = next.as_str(), "Invoice status changed");
        Ok(invoice)
    }

    /// Flags past-due invoices as OVERDUE and reminds the client, at most
    /// `max_reminders` times per invoice.
    pub async fn process_overdue_invoices(&self) -> PortResult<OverdueReport> {
        let now = self.now();
        let candidates = self.ports.repository.list_overdue_candidates(now).await?;
        let mut report = OverdueReport::default();
        for mut invoice in candidates {
            if !invoice.status.is_reminder_eligible() || !invoice.is_past_due(now) {
                continue;
            }
            if let Err(e) = self.remind(&mut invoice, now, &mut report).await {
                error!(invoice_id = invoice.id, "Failed to process overdue invoice: {:?}", e);
                report.failed += 1;
            }
        }
        Ok(report)
    }

    async fn remind(
        &self,
        invoice: &mut Invoice,
        now: DateTime<Utc>,
        report: &mut OverdueReport,
    ) -> PortResult<()> {
        if invoice.status != InvoiceStatus::Overdue
            && invoice.status.can_transition_to(InvoiceStatus::Overdue)
        {
            invoice.status = InvoiceStatus::Overdue;
            self.persist_invoice(invoice).await?;
            report.flagged_overdue += 1;
            info!(invoice_id = invoice.id, "Invoice is overdue");
        }

        let sent = self.ports.repository.count_reminders(invoice.id).await?;
        if sent >= self.policy.max_reminders {
            report.reminders_capped += 1;
            return Ok(());
        }
        let Some(recipient) = invoice.client.email.clone() else {
            warn!(invoice_id = invoice.id, "Overdue invoice has no client email");
            return Ok(());
        };

        let document = RenderableDocument::Invoice(invoice.clone());
        let attachment = match self.documents.is_rendered(&document).await {
            Ok(true) => Some(document.storage_path()),
            _ => None,
        };
        let notification = Notification {
            kind: NotificationKind::InvoiceReminder,
            recipient,
            recipient_name: invoice.client.name.clone(),
            document_number: display_number(invoice.number.as_deref(), invoice.id),
            attachment,
        };
        match self.ports.notifier.notify(notification).await {
            Ok(()) => {
                self.ports.repository.record_reminder(invoice.id, now).await?;
                report.reminders_sent += 1;
            }
            // Not logged as sent, so the next sweep tries again.
            Err(e) => warn!(invoice_id = invoice.id, "Failed to send reminder: {:?}", e),
        }
        Ok(())
    }

    //=====================================================================================
    // Helpers
    //=====================================================================================

    /// Returns the stored PDF path, or the notice explaining why it is missing.
    async fn require_rendered(&self, document: &RenderableDocument) -> Result<String, Notice> {
        match self.documents.is_rendered(document).await {
            Ok(true) => Ok(document.storage_path()),
            Ok(false) => Err(Notice::Failure(format!(
                "The PDF {} has not been generated yet.",
                document.file_name()
            ))),
            Err(e) => {
                error!("Failed to check for rendered document: {:?}", e);
                Err(Notice::Failure(format!(
                    "The PDF {} could not be found.",
                    document.file_name()
                )))
            }
        }
    }
}

fn ensure_answerable(offer: &Offer) -> BillingResult<()> {
    if offer.deleted_at.is_some() || offer.status != OfferStatus::Sent {
        return Err(BillingError::Forbidden(format!(
            "offer {} is {}, only SENT offers can be answered",
            offer.id,
            offer.status.as_str()
        )));
    }
    Ok(())
}

fn display_number(number: Option<&str>, id: i64) -> String {
    number.map(str::to_string).unwrap_or_else(|| format!("#{}", id))
}
