pub mod builder;
pub mod documents;
pub mod domain;
pub mod error;
pub mod evaluator;
pub mod lifecycle;
pub mod memory;
pub mod numbering;
pub mod policy;
pub mod ports;
pub mod retention;
pub mod services;

pub use domain::{
    Client, ClientSnapshot, DocumentKind, DocumentRef, Invoice, InvoiceItem, InvoiceStatus,
    LineItem, NewInvoice, NewLineItem, NewOffer, Notice, Offer, OfferItem, OfferStatus, Project,
    ProjectAggregate, RenderState, TenantId, TenantSettings, TimeEntry, Totals,
};
pub use error::{BillingError, BillingResult};
pub use ports::{
    BillingPorts, BillingRepository, Clock, DocumentJobs, DocumentRenderer, Notification,
    NotificationKind, Notifier, PortError, PortResult, RenderableDocument, SecretCipher,
    SystemClock,
};
