//! In-memory stand-ins for the CMS, blob storage, submission table and mailer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hospital_common::http::UpstreamError;
use hospital_common::resend::EmailMessage;
use serde_json::Value;
use uuid::Uuid;

use crate::attachments::BlobStore;
use crate::model::{FormSubmission, FormType, NewSubmission, SubmissionMetadata, SubmissionStatus};
use crate::notify::Notifier;
use crate::search::{ContentSource, DoctorHit, FacilityHit, PackageHit};
use crate::store::{SubmissionPage, SubmissionQuery, SubmissionStore};

fn unavailable(what: &str) -> UpstreamError {
    UpstreamError::Unexpected(format!("{what} unavailable"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Doctors,
    Facilities,
    Packages,
}

#[derive(Default)]
pub struct FakeContent {
    doctors: Vec<DoctorHit>,
    facilities: Vec<FacilityHit>,
    packages: Vec<PackageHit>,
    failing: Option<Failure>,
    slow_packages: Option<Duration>,
    calls: AtomicUsize,
    last_query: Mutex<Option<String>>,
}

impl FakeContent {
    /// Two doctors, two facilities (one without a slug) and one package.
    pub fn stocked() -> Self {
        Self {
            doctors: vec![
                DoctorHit {
                    id: "doc-1".to_string(),
                    name: "Dr. Meera Rao".to_string(),
                    specialty: Some("Cardiology".to_string()),
                    department: Some("Heart Institute".to_string()),
                },
                DoctorHit {
                    id: "doc-2".to_string(),
                    name: "Dr. Arjun Shah".to_string(),
                    specialty: None,
                    department: Some("Emergency".to_string()),
                },
            ],
            facilities: vec![
                FacilityHit {
                    id: "fac-1".to_string(),
                    name: "Cardiac Catheterization Lab".to_string(),
                    slug: Some("cath-lab".to_string()),
                    summary: Some("Round-the-clock interventions".to_string()),
                },
                FacilityHit {
                    id: "fac-2".to_string(),
                    name: "Cardiac ICU (24x7)".to_string(),
                    slug: None,
                    summary: None,
                },
            ],
            packages: vec![PackageHit {
                id: "pkg-1".to_string(),
                name: "Cardiac Wellness".to_string(),
                category: Some("Heart".to_string()),
            }],
            ..Self::default()
        }
    }

    pub fn failing(mut self, failure: Failure) -> Self {
        self.failing = Some(failure);
        self
    }

    pub fn slow_packages(mut self, delay: Duration) -> Self {
        self.slow_packages = Some(delay);
        self
    }

    /// Total lookups across all three collections.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_query(&self) -> Option<String> {
        self.last_query.lock().unwrap().clone()
    }

    fn record(&self, query: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_query.lock().unwrap() = Some(query.to_string());
    }
}

#[async_trait]
impl ContentSource for FakeContent {
    async fn doctors(&self, query: &str, limit: usize) -> Result<Vec<DoctorHit>, UpstreamError> {
        self.record(query);
        if self.failing == Some(Failure::Doctors) {
            return Err(unavailable("doctors"));
        }
        Ok(self.doctors.iter().take(limit).cloned().collect())
    }

    async fn facilities(&self, query: &str, limit: usize) -> Result<Vec<FacilityHit>, UpstreamError> {
        self.record(query);
        if self.failing == Some(Failure::Facilities) {
            return Err(unavailable("facilities"));
        }
        Ok(self.facilities.iter().take(limit).cloned().collect())
    }

    async fn packages(&self, query: &str, limit: usize) -> Result<Vec<PackageHit>, UpstreamError> {
        self.record(query);
        if let Some(delay) = self.slow_packages {
            tokio::time::sleep(delay).await;
        }
        if self.failing == Some(Failure::Packages) {
            return Err(unavailable("packages"));
        }
        Ok(self.packages.iter().take(limit).cloned().collect())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    fail: bool,
}

impl MemoryBlobStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn object(&self, path: &str) -> Option<(Vec<u8>, String)> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), UpstreamError> {
        if self.fail {
            return Err(unavailable("storage"));
        }
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(path) {
            return Err(UpstreamError::Unexpected(format!("{path} already exists")));
        }
        objects.insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn signed_url(&self, path: &str, expires_in: Duration) -> Result<String, UpstreamError> {
        if self.fail {
            return Err(unavailable("storage"));
        }
        Ok(format!(
            "https://storage.test/signed/{path}?expires={}",
            expires_in.as_secs()
        ))
    }
}

#[derive(Default)]
pub struct MemorySubmissionStore {
    rows: Mutex<Vec<FormSubmission>>,
    fail: bool,
}

impl MemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn rows(&self) -> Vec<FormSubmission> {
        self.rows.lock().unwrap().clone()
    }

    /// Store a row directly, `minutes_ago` in the past.
    pub fn seed(
        &self,
        form_type: FormType,
        form_data: Value,
        status: SubmissionStatus,
        minutes_ago: i64,
    ) -> FormSubmission {
        let created = Utc::now() - chrono::Duration::minutes(minutes_ago);
        let row = FormSubmission {
            id: Uuid::new_v4().to_string(),
            form_type,
            form_data,
            metadata: SubmissionMetadata {
                ip: "192.0.2.1".to_string(),
                user_agent: "seed".to_string(),
                timestamp: created,
            },
            status,
            created_at: created,
            updated_at: created,
        };
        self.rows.lock().unwrap().push(row.clone());
        row
    }
}

fn matches_search(row: &FormSubmission, term: &str) -> bool {
    let term = term.to_lowercase();
    ["firstName", "lastName", "email", "phone"].iter().any(|field| {
        row.form_data
            .get(*field)
            .and_then(Value::as_str)
            .is_some_and(|v| v.to_lowercase().contains(&term))
    })
}

#[async_trait]
impl SubmissionStore for MemorySubmissionStore {
    async fn insert(&self, submission: &NewSubmission) -> Result<FormSubmission, UpstreamError> {
        if self.fail {
            return Err(unavailable("database"));
        }
        let now = Utc::now();
        let row = FormSubmission {
            id: Uuid::new_v4().to_string(),
            form_type: submission.form_type,
            form_data: submission.form_data.clone(),
            metadata: submission.metadata.clone(),
            status: submission.status,
            created_at: now,
            updated_at: now,
        };
        self.rows.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn list(&self, query: &SubmissionQuery) -> Result<SubmissionPage, UpstreamError> {
        if self.fail {
            return Err(unavailable("database"));
        }
        let mut matching: Vec<FormSubmission> = self
            .rows()
            .into_iter()
            .filter(|row| query.form_type.is_none_or(|t| row.form_type == t))
            .filter(|row| query.status.is_none_or(|s| row.status == s))
            .filter(|row| query.search.as_deref().is_none_or(|term| matches_search(row, term)))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matching.len() as u64;
        let submissions = matching
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .collect();
        Ok(SubmissionPage { submissions, total })
    }

    async fn update_status(
        &self,
        id: &str,
        status: SubmissionStatus,
    ) -> Result<Option<FormSubmission>, UpstreamError> {
        if self.fail {
            return Err(unavailable("database"));
        }
        let mut rows = self.rows.lock().unwrap();
        Ok(rows.iter_mut().find(|row| row.id == id).map(|row| {
            row.status = status;
            row.updated_at = Utc::now();
            row.clone()
        }))
    }
}

/// Records every send attempt by idempotency key. The first `fail_first` attempts fail.
#[derive(Default)]
pub struct RecordingNotifier {
    fail_first: usize,
    attempts: Mutex<Vec<String>>,
    delivered: Mutex<Vec<EmailMessage>>,
}

impl RecordingNotifier {
    pub fn failing_first(fail_first: usize) -> Self {
        Self {
            fail_first,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<EmailMessage> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &EmailMessage, idempotency_key: &str) -> Result<(), UpstreamError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(idempotency_key.to_string());
            attempts.len()
        };
        if attempt <= self.fail_first {
            return Err(unavailable("mail provider"));
        }
        self.delivered.lock().unwrap().push(message.clone());
        Ok(())
    }
}
