//! services/billing/src/adapters/renderer.rs
//!
//! Implements the `DocumentRenderer` port by writing an HTML version of the
//! document and printing it to PDF with a headless Chromium process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use freelance_core::domain::{ClientSnapshot, LineItem, Totals};
use freelance_core::ports::{DocumentRenderer, PortError, PortResult, RenderableDocument};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

pub struct ChromePdfRenderer {
    chrome_bin: String,
    documents_root: PathBuf,
    timeout: Duration,
}

impl ChromePdfRenderer {
    pub fn new(chrome_bin: String, documents_root: PathBuf, timeout: Duration) -> Self {
        Self {
            chrome_bin,
            documents_root,
            timeout,
        }
    }

    fn absolute(&self, relative: &str) -> PathBuf {
        self.documents_root.join(relative)
    }

    async fn print_to_pdf(&self, html_path: &Path, pdf_path: &Path) -> PortResult<()> {
        let mut command = Command::new(&self.chrome_bin);
        command
            .arg("--headless")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--no-pdf-header-footer")
            .arg(format!("--print-to-pdf={}", pdf_path.display()))
            .arg(format!("file://{}", html_path.display()))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                PortError::Unexpected(format!(
                    "PDF rendering timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| PortError::Unexpected(format!("Failed to start {}: {}", self.chrome_bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PortError::Unexpected(format!(
                "{} exited with {}: {}",
                self.chrome_bin,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentRenderer for ChromePdfRenderer {
    async fn render(&self, document: &RenderableDocument, path: &str) -> PortResult<()> {
        let pdf_path = self.absolute(path);
        if let Some(parent) = pdf_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PortError::Unexpected(e.to_string()))?;
        }

        let html_path = pdf_path.with_extension("html");
        tokio::fs::write(&html_path, render_html(document))
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let result = self.print_to_pdf(&html_path, &pdf_path).await;
        if let Err(e) = tokio::fs::remove_file(&html_path).await {
            warn!(path = %html_path.display(), "Failed to remove intermediate HTML: {}", e);
        }
        result?;

        debug!(path = %pdf_path.display(), "PDF written");
        Ok(())
    }

    async fn exists(&self, path: &str) -> PortResult<bool> {
        tokio::fs::try_exists(self.absolute(path))
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))
    }
}

//=========================================================================================
// HTML
//=========================================================================================

struct Layout<'a> {
    title: &'a str,
    number: String,
    client: &'a ClientSnapshot,
    currency: &'a str,
    tax_rate: Decimal,
    dates: Vec<(&'static str, String)>,
    items: &'a [LineItem],
    totals: Totals,
    footer: Option<String>,
}

fn date(at: DateTime<Utc>) -> String {
    at.format("%d.%m.%Y").to_string()
}

fn layout(document: &RenderableDocument) -> Layout<'_> {
    match document {
        RenderableDocument::Invoice(invoice) => {
            let mut dates = vec![
                ("Invoice date", date(invoice.issued_at)),
                ("Due date", date(invoice.due_at)),
            ];
            if let (Some(start), Some(end)) = (invoice.service_period_start, invoice.service_period_end) {
                dates.push(("Service period", format!("{} - {}", date(start), date(end))));
            }
            Layout {
                title: "Invoice",
                number: invoice.number.clone().unwrap_or_default(),
                client: &invoice.client,
                currency: &invoice.currency,
                tax_rate: invoice.tax_rate,
                dates,
                items: &invoice.items,
                totals: invoice.totals(),
                footer: None,
            }
        }
        RenderableDocument::Offer(offer) => Layout {
            title: "Offer",
            number: offer.number.clone().unwrap_or_default(),
            client: &offer.client,
            currency: &offer.currency,
            tax_rate: offer.tax_rate,
            dates: vec![
                ("Offer date", date(offer.created_at)),
                ("Valid until", date(offer.valid_until)),
            ],
            items: &offer.items,
            totals: offer.totals(),
            footer: offer
                .accepted_at
                .map(|at| format!("Accepted on {}", date(at))),
        },
    }
}

/// Renders the printable HTML page of an invoice or offer.
pub fn render_html(document: &RenderableDocument) -> String {
    let doc = layout(document);
    let currency = escape_html(doc.currency);

    let mut html = String::new();
    html.push_str("<!doctype html><html><head><meta charset=\"utf-8\">");
    html.push_str(&format!(
        "<title>{} {}</title>",
        doc.title,
        escape_html(&doc.number)
    ));
    html.push_str(
        "<style>body{font-family:Arial,Helvetica,sans-serif;font-size:12px;color:#111;margin:40px;}\
         table{width:100%;border-collapse:collapse;}th,td{padding:6px 4px;text-align:left;}\
         .num{text-align:right;}.items th{border-bottom:1px solid #999;}\
         .totals td{border-top:1px solid #ddd;}</style></head><body>",
    );

    // Recipient block
    html.push_str("<div class=\"recipient\">");
    html.push_str(&format!("<div>{}</div>", escape_html(&doc.client.name)));
    let city_line = [doc.client.postal_code.as_deref(), doc.client.city.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    let address = [
        doc.client.street.clone(),
        Some(city_line).filter(|line| !line.is_empty()),
        doc.client.country.clone(),
    ];
    for line in address.iter().flatten() {
        html.push_str(&format!("<div>{}</div>", escape_html(line)));
    }
    html.push_str("</div>");

    html.push_str(&format!(
        "<h1>{} {}</h1>",
        doc.title,
        escape_html(&doc.number)
    ));
    html.push_str("<table class=\"meta\">");
    for (label, value) in &doc.dates {
        html.push_str(&format!("<tr><td>{}</td><td>{}</td></tr>", label, escape_html(value)));
    }
    html.push_str("</table>");

    html.push_str(
        "<table class=\"items\"><thead><tr><th>#</th><th>Description</th>\
         <th class=\"num\">Quantity</th><th>Unit</th><th class=\"num\">Unit price</th>\
         <th class=\"num\">Total</th></tr></thead><tbody>",
    );
    for (index, item) in doc.items.iter().enumerate() {
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td class=\"num\">{}</td><td>{}</td>\
             <td class=\"num\">{} {}</td><td class=\"num\">{} {}</td></tr>",
            index + 1,
            escape_html(&item.description),
            item.quantity.normalize(),
            escape_html(&item.unit),
            format_money(item.unit_price),
            currency,
            format_money(item.total),
            currency
        ));
    }
    html.push_str("</tbody></table>");

    html.push_str("<table class=\"totals\">");
    html.push_str(&format!(
        "<tr><td>Net</td><td class=\"num\">{} {}</td></tr>",
        format_money(doc.totals.net),
        currency
    ));
    html.push_str(&format!(
        "<tr><td>Tax {}%</td><td class=\"num\">{} {}</td></tr>",
        doc.tax_rate.normalize(),
        format_money(doc.totals.tax),
        currency
    ));
    html.push_str(&format!(
        "<tr><td><strong>Total</strong></td><td class=\"num\"><strong>{} {}</strong></td></tr>",
        format_money(doc.totals.gross),
        currency
    ));
    html.push_str("</table>");

    if let Some(footer) = doc.footer {
        html.push_str(&format!("<p class=\"footer\">{}</p>", escape_html(&footer)));
    }
    html.push_str("</body></html>");
    html
}

/// Two decimals with `,` as thousands separator.
pub fn format_money(amount: Decimal) -> String {
    let s = format!("{:.2}", amount.abs());
    let (int_part, dec_part) = s.split_once('.').unwrap_or((s.as_str(), "00"));

    let mut out = String::new();
    for (i, ch) in int_part.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    let int_with_sep: String = out.chars().rev().collect();
    let sign = if amount.is_sign_negative() && !amount.is_zero() { "-" } else { "" };
    format!("{}{}.{}", sign, int_with_sep, dec_part)
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
