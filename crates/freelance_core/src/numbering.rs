//! crates/freelance_core/src/numbering.rs
//!
//! Human readable invoice and offer numbers, assigned right after the record is
//! first persisted and derived from its creation month and sequence id.

use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::domain::{Invoice, Offer};
use crate::ports::{BillingRepository, PortResult};

const OFFER_PREFIX: &str = "AN";

/// `MM-YYYY-NN`, with the sequence padded to at least two digits.
pub fn invoice_number(created_at: DateTime<Utc>, sequence: i64) -> String {
    format!(
        "{:02}-{:04}-{:02}",
        created_at.month(),
        created_at.year(),
        sequence
    )
}

/// `AN-MM-YYYY-NN`.
pub fn offer_number(created_at: DateTime<Utc>, sequence: i64) -> String {
    format!("{}-{}", OFFER_PREFIX, invoice_number(created_at, sequence))
}

pub struct NumberingAssigner {
    repository: Arc<dyn BillingRepository>,
}

impl NumberingAssigner {
    pub fn new(repository: Arc<dyn BillingRepository>) -> Self {
        Self { repository }
    }

    /// Invoices always get their number (re)computed on creation.
    pub async fn assign_invoice(&self, invoice: &mut Invoice) -> PortResult<()> {
        let number = invoice_number(invoice.created_at, invoice.id);
        self.repository.set_invoice_number(invoice.id, &number).await?;
        debug!(invoice_id = invoice.id, %number, "Assigned invoice number");
        invoice.number = Some(number);
        Ok(())
    }

    /// Offers keep the first number they were given.
    pub async fn assign_offer(&self, offer: &mut Offer) -> PortResult<()> {
        if offer.number.is_some() {
            return Ok(());
        }
        let number = offer_number(offer.created_at, offer.id);
        if self
            .repository
            .set_offer_number_if_absent(offer.id, &number)
            .await?
        {
            debug!(offer_id = offer.id, %number, "Assigned offer number");
            offer.number = Some(number);
        } else {
            // Someone else numbered it first; reload the stored value.
            let stored = self.repository.get_offer(offer.tenant_id, offer.id).await?;
            offer.number = stored.number;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn invoice_number_pads_month_and_sequence() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(invoice_number(at, 7), "03-2024-07");
        assert_eq!(invoice_number(at, 1234), "03-2024-1234");
    }

    #[test]
    fn offer_number_has_prefix() {
        let at = Utc.with_ymd_and_hms(2025, 11, 30, 0, 0, 0).unwrap();
        assert_eq!(offer_number(at, 42), "AN-11-2025-42");
    }
}
