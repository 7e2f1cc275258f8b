//! crates/freelance_core/src/documents.rs
//!
//! Coordinates PDF generation for invoices and offers. The storage path of a
//! document is derived deterministically from its issue date, sequence id and
//! client name; a compare-and-swap on the record's render state keeps two
//! renders of the same record from overlapping.

use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::domain::{DocumentKind, DocumentRef};
use crate::ports::{BillingRepository, DocumentRenderer, PortResult, RenderableDocument};

/// `<kind>_<YYYY-MM-DD>_<id>_<client>.pdf`
pub fn document_file_name(
    kind: DocumentKind,
    issued_at: DateTime<Utc>,
    id: i64,
    client_name: &str,
) -> String {
    format!(
        "{}_{}_{}_{}.pdf",
        kind.as_str(),
        issued_at.format("%Y-%m-%d"),
        id,
        client_slug(client_name)
    )
}

/// `<kind>s/<YYYY>/<file name>`, relative to the document store.
pub fn document_path(
    kind: DocumentKind,
    issued_at: DateTime<Utc>,
    id: i64,
    client_name: &str,
) -> String {
    format!(
        "{}s/{}/{}",
        kind.as_str(),
        issued_at.year(),
        document_file_name(kind, issued_at, id, client_name)
    )
}

impl RenderableDocument {
    pub fn storage_path(&self) -> String {
        match self {
            RenderableDocument::Invoice(invoice) => document_path(
                DocumentKind::Invoice,
                invoice.issued_at,
                invoice.id,
                &invoice.client.name,
            ),
            RenderableDocument::Offer(offer) => document_path(
                DocumentKind::Offer,
                offer.created_at,
                offer.id,
                &offer.client.name,
            ),
        }
    }

    pub fn file_name(&self) -> String {
        let path = self.storage_path();
        match path.rsplit_once('/') {
            Some((_, name)) => name.to_string(),
            None => path,
        }
    }
}

/// Transliterated client name for file names; `client` when nothing is left.
fn client_slug(name: &str) -> String {
    let slug = slug::slugify(name);
    if slug.is_empty() {
        "client".to_string()
    } else {
        slug
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    Rendered(String),
    AlreadyInProgress,
    Failed(String),
}

pub struct DocumentService {
    repository: Arc<dyn BillingRepository>,
    renderer: Arc<dyn DocumentRenderer>,
}

impl DocumentService {
    pub fn new(repository: Arc<dyn BillingRepository>, renderer: Arc<dyn DocumentRenderer>) -> Self {
        Self {
            repository,
            renderer,
        }
    }

    /// Loads the full record behind `document`.
    pub async fn load(&self, document: DocumentRef) -> PortResult<RenderableDocument> {
        Ok(match document.kind {
            DocumentKind::Invoice => RenderableDocument::Invoice(
                self.repository
                    .get_invoice(document.tenant_id, document.id)
                    .await?,
            ),
            DocumentKind::Offer => RenderableDocument::Offer(
                self.repository
                    .get_offer(document.tenant_id, document.id)
                    .await?,
            ),
        })
    }

    /// Whether the rendered PDF for `document` is present in the store.
    pub async fn is_rendered(&self, document: &RenderableDocument) -> PortResult<bool> {
        self.renderer.exists(&document.storage_path()).await
    }

    /// Releases render guards left behind by a process that died mid-render.
    /// Call once at startup, before any render runs.
    pub async fn recover_interrupted_renders(&self) -> PortResult<u64> {
        let reset = self.repository.reset_interrupted_renders().await?;
        if reset > 0 {
            warn!(reset, "Released renders interrupted by a previous shutdown");
        }
        Ok(reset)
    }

    /// Renders `document` unless a render of the same record is already running.
    ///
    /// The render state always returns to idle, whether or not the renderer succeeded.
    pub async fn render(&self, document: DocumentRef) -> RenderOutcome {
        match self.repository.try_begin_render(document).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(kind = document.kind.as_str(), id = document.id, "Render already in progress");
                return RenderOutcome::AlreadyInProgress;
            }
            Err(e) => {
                error!(kind = document.kind.as_str(), id = document.id, "Failed to claim render: {:?}", e);
                return RenderOutcome::Failed(e.to_string());
            }
        }

        let result = async {
            let loaded = self.load(document).await?;
            let path = loaded.storage_path();
            self.renderer.render(&loaded, &path).await?;
            Ok::<_, crate::ports::PortError>(path)
        }
        .await;

        let (outcome, stored_path) = match result {
            Ok(path) => {
                info!(kind = document.kind.as_str(), id = document.id, %path, "Rendered document");
                (RenderOutcome::Rendered(path.clone()), Some(path))
            }
            Err(e) => {
                error!(kind = document.kind.as_str(), id = document.id, "Failed to render document: {:?}", e);
                (RenderOutcome::Failed(e.to_string()), None)
            }
        };

        if let Err(e) = self
            .repository
            .finish_render(document, stored_path.as_deref())
            .await
        {
            error!(kind = document.kind.as_str(), id = document.id, "Failed to clear render state: {:?}", e);
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_name_is_derived_from_date_id_and_client() {
        let at = Utc.with_ymd_and_hms(2024, 2, 5, 8, 0, 0).unwrap();
        assert_eq!(
            document_file_name(DocumentKind::Offer, at, 12, "Müller & Söhne GmbH"),
            "offer_2024-02-05_12_muller-sohne-gmbh.pdf"
        );
    }

    #[test]
    fn path_groups_by_kind_and_year() {
        let at = Utc.with_ymd_and_hms(2023, 12, 31, 23, 0, 0).unwrap();
        assert_eq!(
            document_path(DocumentKind::Invoice, at, 3, "ACME"),
            "invoices/2023/invoice_2023-12-31_3_acme.pdf"
        );
    }

    #[test]
    fn non_ascii_client_names_are_transliterated() {
        let at = Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap();
        assert_eq!(
            document_file_name(DocumentKind::Invoice, at, 5, "Łódź Studio"),
            "invoice_2024-06-30_5_lodz-studio.pdf"
        );
        assert_ne!(client_slug("株式会社テスト"), "client");
    }

    #[test]
    fn blank_client_names_fall_back() {
        assert_eq!(client_slug("  !! "), "client");
    }
}
