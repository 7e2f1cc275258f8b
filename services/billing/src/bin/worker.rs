//! services/billing/src/bin/worker.rs

use billing_lib::{
    adapters::{render_worker, AesGcmCipher, ChromePdfRenderer, PgBillingRepository, RenderQueue, SmtpNotifier},
    config::Config,
    error::ServiceError,
    scheduler::BillingScheduler,
};
use freelance_core::{
    documents::DocumentService, evaluator::BillingCycleEvaluator, lifecycle::StatusLifecycle,
    BillingPorts, SystemClock,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RENDER_QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting billing worker...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    let repository = Arc::new(PgBillingRepository::new(db_pool.clone()));
    info!("Running database migrations...");
    repository.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize Service Adapters ---
    tokio::fs::create_dir_all(&config.documents_path).await?;
    let renderer = Arc::new(ChromePdfRenderer::new(
        config.chrome_bin.clone(),
        config.documents_path.clone(),
        config.render_timeout,
    ));
    let notifier = Arc::new(SmtpNotifier::new(&config.smtp, config.documents_path.clone())?);
    let cipher = Arc::new(AesGcmCipher::from_base64_key(&config.ip_encryption_key)?);
    let (render_queue, render_receiver) = RenderQueue::new(RENDER_QUEUE_CAPACITY);

    let ports = BillingPorts {
        repository,
        renderer,
        notifier,
        jobs: Arc::new(render_queue),
        clock: Arc::new(SystemClock),
        cipher,
    };

    // --- 4. Build the Core Services ---
    let documents = Arc::new(DocumentService::new(
        ports.repository.clone(),
        ports.renderer.clone(),
    ));
    let evaluator = Arc::new(BillingCycleEvaluator::new(ports.clone(), config.policy.clone()));
    let lifecycle = Arc::new(StatusLifecycle::new(
        ports.clone(),
        documents.clone(),
        config.policy.clone(),
    ));

    // --- 5. Start the Render Worker and the Scheduler ---
    documents.recover_interrupted_renders().await?;
    let cancellation_token = CancellationToken::new();
    let worker = tokio::spawn(render_worker(
        render_receiver,
        documents,
        cancellation_token.clone(),
    ));

    let mut scheduler = BillingScheduler::new(
        evaluator,
        lifecycle,
        config.evaluator_cron.clone(),
        config.sweep_cron.clone(),
    )
    .await?;
    scheduler.start().await?;
    info!("Billing worker running. Press Ctrl+C to stop.");

    // --- 6. Wait for Shutdown ---
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested.");

    if let Err(e) = scheduler.shutdown().await {
        error!("Failed to stop scheduler cleanly: {}", e);
    }
    cancellation_token.cancel();
    if let Err(e) = worker.await {
        error!("Render worker ended abnormally: {}", e);
    }
    db_pool.close().await;

    info!("Billing worker stopped.");
    Ok(())
}
