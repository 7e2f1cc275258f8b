//! Shared fixtures for the billing integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use freelance_core::documents::DocumentService;
use freelance_core::evaluator::BillingCycleEvaluator;
use freelance_core::lifecycle::StatusLifecycle;
use freelance_core::memory::{FixedClock, InMemoryBillingRepository};
use freelance_core::policy::BillingPolicy;
use freelance_core::retention::RetentionService;
use freelance_core::services::BillingService;
use freelance_core::{
    BillingPorts, Client, DocumentJobs, DocumentRef, DocumentRenderer, Notification, Notifier,
    PortError, PortResult, Project, RenderableDocument, SecretCipher, TenantId, TimeEntry,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub const CLIENT_ID: i64 = 1;
pub const CLIENT_EMAIL: &str = "billing@acme.example";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap()
}

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Default)]
pub struct StubRenderer {
    rendered: Mutex<HashSet<String>>,
    fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl StubRenderer {
    pub fn mark_rendered(&self, path: &str) {
        self.rendered.lock().insert(path.to_string());
    }

    pub fn fail_renders(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentRenderer for StubRenderer {
    async fn render(&self, _document: &RenderableDocument, path: &str) -> PortResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("browser crashed".into()));
        }
        self.mark_rendered(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> PortResult<bool> {
        Ok(self.rendered.lock().contains(path))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn fail_delivery(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> PortResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("smtp relay refused".into()));
        }
        self.sent.lock().push(notification);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingJobs {
    queued: Mutex<Vec<DocumentRef>>,
}

impl RecordingJobs {
    pub fn queued(&self) -> Vec<DocumentRef> {
        self.queued.lock().clone()
    }
}

#[async_trait]
impl DocumentJobs for RecordingJobs {
    async fn enqueue_render(&self, document: DocumentRef) -> PortResult<()> {
        self.queued.lock().push(document);
        Ok(())
    }
}

/// Reverses the text behind a marker; enough to prove values are not stored in clear.
pub struct ReversingCipher;

impl SecretCipher for ReversingCipher {
    fn encrypt(&self, plaintext: &str) -> PortResult<String> {
        Ok(format!("enc:{}", plaintext.chars().rev().collect::<String>()))
    }

    fn decrypt(&self, ciphertext: &str) -> PortResult<String> {
        ciphertext
            .strip_prefix("enc:")
            .map(|rest| rest.chars().rev().collect())
            .ok_or_else(|| PortError::Unexpected("not encrypted".into()))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub tenant: TenantId,
    pub repo: InMemoryBillingRepository,
    pub clock: FixedClock,
    pub renderer: Arc<StubRenderer>,
    pub notifier: Arc<RecordingNotifier>,
    pub jobs: Arc<RecordingJobs>,
    pub ports: BillingPorts,
}

impl Harness {
    pub fn new() -> Self {
        let tenant = Uuid::new_v4();
        let repo = InMemoryBillingRepository::new();
        let clock = FixedClock::new(start_time());
        let renderer = Arc::new(StubRenderer::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let jobs = Arc::new(RecordingJobs::default());
        let ports = BillingPorts {
            repository: Arc::new(repo.clone()),
            renderer: renderer.clone(),
            notifier: notifier.clone(),
            jobs: jobs.clone(),
            clock: Arc::new(clock.clone()),
            cipher: Arc::new(ReversingCipher),
        };
        repo.insert_client(client(tenant, "ACME GmbH"));
        Self {
            tenant,
            repo,
            clock,
            renderer,
            notifier,
            jobs,
            ports,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        use freelance_core::Clock;
        self.clock.now()
    }

    pub fn documents(&self) -> Arc<DocumentService> {
        Arc::new(DocumentService::new(
            self.ports.repository.clone(),
            self.ports.renderer.clone(),
        ))
    }

    pub fn lifecycle(&self) -> StatusLifecycle {
        StatusLifecycle::new(self.ports.clone(), self.documents(), BillingPolicy::default())
    }

    pub fn evaluator(&self) -> BillingCycleEvaluator {
        self.evaluator_with(BillingPolicy::default())
    }

    pub fn evaluator_with(&self, policy: BillingPolicy) -> BillingCycleEvaluator {
        BillingCycleEvaluator::new(self.ports.clone(), policy)
    }

    pub fn billing(&self) -> BillingService {
        BillingService::new(self.ports.clone())
    }

    pub fn retention(&self) -> RetentionService {
        RetentionService::new(self.ports.clone())
    }

    pub fn add_project(&self, id: i64, hourly_rate: Decimal, interval_days: Option<i32>) -> Project {
        let project = Project {
            id,
            tenant_id: self.tenant,
            client_id: CLIENT_ID,
            name: format!("Project {}", id),
            hourly_rate,
            auto_generate_invoice: true,
            auto_generate_amount: interval_days,
            last_auto_generated_at: None,
            auto_generation_failures: 0,
        };
        self.repo.insert_project(project.clone());
        project
    }

    pub fn add_entry(&self, id: i64, project_id: i64, started_at: DateTime<Utc>, minutes: i64) {
        self.repo.insert_time_entry(TimeEntry {
            id,
            project_id,
            started_at,
            ended_at: started_at + Duration::minutes(minutes),
            duration_minutes: minutes,
            description: Some(format!("Work item {}", id)),
        });
    }
}

pub fn client(tenant: TenantId, name: &str) -> Client {
    Client {
        id: CLIENT_ID,
        tenant_id: tenant,
        name: name.to_string(),
        email: Some(CLIENT_EMAIL.to_string()),
        street: Some("Hauptstraße 1".into()),
        postal_code: Some("10115".into()),
        city: Some("Berlin".into()),
        country: Some("DE".into()),
    }
}
