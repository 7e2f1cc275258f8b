pub mod cipher;
pub mod db;
pub mod mailer;
pub mod queue;
pub mod renderer;

pub use cipher::AesGcmCipher;
pub use db::PgBillingRepository;
pub use mailer::SmtpNotifier;
pub use queue::{render_worker, RenderQueue};
pub use renderer::ChromePdfRenderer;
