//! services/billing/src/adapters/mailer.rs
//!
//! SMTP implementation of the `Notifier` port. Subjects and bodies come from an
//! embedded JSON file so wording changes never touch the code.

use async_trait::async_trait;
use freelance_core::ports::{Notification, NotificationKind, Notifier, PortError, PortResult};
use lettre::message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::info;

use crate::config::SmtpConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct EmailTemplate {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
struct EmailTemplatesFile {
    offer_sent: EmailTemplate,
    offer_accepted: EmailTemplate,
    invoice_sent: EmailTemplate,
    invoice_reminder: EmailTemplate,
}

static EMAIL_TEMPLATES: OnceLock<Result<EmailTemplatesFile, String>> = OnceLock::new();

fn templates() -> PortResult<&'static EmailTemplatesFile> {
    EMAIL_TEMPLATES
        .get_or_init(|| {
            let json = include_str!("../../templates/email_templates.json");
            serde_json::from_str::<EmailTemplatesFile>(json)
                .map_err(|e| format!("Failed to parse embedded email_templates.json: {e}"))
        })
        .as_ref()
        .map_err(|e| PortError::Unexpected(e.clone()))
}

/// Subject and plain-text body for `notification`, placeholders filled in.
pub fn compose(notification: &Notification) -> PortResult<(String, String)> {
    let file = templates()?;
    let template = match notification.kind {
        NotificationKind::OfferSent => &file.offer_sent,
        NotificationKind::OfferAccepted => &file.offer_accepted,
        NotificationKind::InvoiceSent => &file.invoice_sent,
        NotificationKind::InvoiceReminder => &file.invoice_reminder,
    };
    let fill = |text: &str| {
        text.replace("{name}", &notification.recipient_name)
            .replace("{number}", &notification.document_number)
    };
    Ok((fill(&template.subject), fill(&template.body)))
}

pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    documents_root: PathBuf,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig, documents_root: PathBuf) -> PortResult<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|_| PortError::Unexpected(format!("Invalid sender address '{}'", config.from)))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| PortError::Unexpected(format!("Invalid SMTP host: {e}")))?
            .port(config.port);
        if let Some(username) = config.username.as_ref() {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                config.password.clone().unwrap_or_default(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            documents_root,
        })
    }

    async fn attachment(&self, relative: &str) -> PortResult<SinglePart> {
        let path = self.documents_root.join(relative);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| PortError::Unexpected(format!("Failed to read {}: {}", path.display(), e)))?;
        let filename = Path::new(relative)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string());
        let content_type = ContentType::parse("application/pdf")
            .map_err(|e| PortError::Unexpected(format!("Failed to build PDF content type: {e}")))?;
        Ok(Attachment::new(filename).body(bytes, content_type))
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, notification: Notification) -> PortResult<()> {
        let to: Mailbox = notification.recipient.parse().map_err(|_| {
            PortError::Unexpected(format!("Invalid recipient address '{}'", notification.recipient))
        })?;
        let (subject, body) = compose(&notification)?;

        let builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject);
        let email = match notification.attachment.as_deref() {
            Some(relative) => {
                let attachment = self.attachment(relative).await?;
                builder.multipart(
                    MultiPart::mixed()
                        .singlepart(SinglePart::plain(body))
                        .singlepart(attachment),
                )
            }
            None => builder.singlepart(SinglePart::plain(body)),
        }
        .map_err(|e| PortError::Unexpected(format!("Failed to build email: {e}")))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| PortError::Unexpected(format!("Failed to send email: {e}")))?;

        info!(
            kind = ?notification.kind,
            number = %notification.document_number,
            "Email delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(kind: NotificationKind) -> Notification {
        Notification {
            kind,
            recipient: "billing@acme.example".into(),
            recipient_name: "ACME GmbH".into(),
            document_number: "AN-06-2024-01".into(),
            attachment: None,
        }
    }

    #[test]
    fn embedded_templates_parse() {
        assert!(templates().is_ok());
    }

    #[test]
    fn placeholders_are_filled() {
        let (subject, body) = compose(&notification(NotificationKind::OfferAccepted)).unwrap();
        assert_eq!(subject, "Confirmation of offer AN-06-2024-01");
        assert!(body.starts_with("Hello ACME GmbH,"));
        assert!(!body.contains('{'));
    }

    #[test]
    fn reminders_use_their_own_wording() {
        let (subject, _) = compose(&notification(NotificationKind::InvoiceReminder)).unwrap();
        assert!(subject.starts_with("Payment reminder"));
    }
}
