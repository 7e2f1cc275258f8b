//! services/billing/src/adapters/queue.rs
//!
//! The render queue behind the `DocumentJobs` port: a bounded channel feeding a
//! background worker that renders documents one after another.

use async_trait::async_trait;
use freelance_core::documents::{DocumentService, RenderOutcome};
use freelance_core::domain::DocumentRef;
use freelance_core::ports::{DocumentJobs, PortError, PortResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct RenderQueue {
    sender: mpsc::Sender<DocumentRef>,
}

impl RenderQueue {
    /// Creates the queue and the receiving end to hand to [`render_worker`].
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DocumentRef>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DocumentJobs for RenderQueue {
    async fn enqueue_render(&self, document: DocumentRef) -> PortResult<()> {
        self.sender
            .send(document)
            .await
            .map_err(|_| PortError::Unexpected("Render queue is closed".to_string()))?;
        debug!(kind = document.kind.as_str(), id = document.id, "Render queued");
        Ok(())
    }
}

/// Drains the queue until it is closed or `cancellation_token` fires.
///
/// A render that is already running when cancellation is requested finishes first.
pub async fn render_worker(
    mut receiver: mpsc::Receiver<DocumentRef>,
    documents: Arc<DocumentService>,
    cancellation_token: CancellationToken,
) {
    info!("Render worker started.");
    loop {
        let document = tokio::select! {
            _ = cancellation_token.cancelled() => {
                info!("Render worker cancelled.");
                break;
            }
            next = receiver.recv() => match next {
                Some(document) => document,
                None => {
                    info!("Render queue closed.");
                    break;
                }
            },
        };

        match documents.render(document).await {
            RenderOutcome::Rendered(_) => {}
            RenderOutcome::AlreadyInProgress => {
                debug!(kind = document.kind.as_str(), id = document.id, "Skipped duplicate render");
            }
            RenderOutcome::Failed(reason) => {
                warn!(kind = document.kind.as_str(), id = document.id, %reason, "Render job failed");
            }
        }
    }
}
