//! Staff notifications for new submissions.
//!
//! The request path only enqueues. A single worker drains the queue, retrying each email
//! with backoff, and never reports back: a lost notification is logged, while the
//! submission is already durable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hospital_common::http::{backoff_delay, UpstreamError};
use hospital_common::resend::{EmailMessage, ResendClient};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::forms::ContactDetails;
use crate::model::{FormSubmission, StoredFile};

const QUEUE_CAPACITY: usize = 256;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &EmailMessage, idempotency_key: &str) -> Result<(), UpstreamError>;
}

#[async_trait]
impl Notifier for ResendClient {
    async fn send(&self, message: &EmailMessage, idempotency_key: &str) -> Result<(), UpstreamError> {
        let id = self.send_email(message, idempotency_key).await?;
        debug!(email_id = %id, "notification accepted by provider");
        Ok(())
    }
}

/// Sender and recipients for staff notifications.
#[derive(Debug, Clone)]
pub struct NotifySettings {
    pub from: String,
    pub to: Vec<String>,
    pub max_attempts: u32,
}

#[derive(Debug)]
struct Job {
    submission_id: String,
    message: EmailMessage,
}

/// Handle used by request handlers. Cloning is cheap; all clones feed one worker.
#[derive(Clone)]
pub struct NotificationQueue {
    sender: Option<mpsc::Sender<Job>>,
    from: String,
    to: Vec<String>,
}

impl NotificationQueue {
    /// A queue that drops every job. Used when no email provider is configured.
    pub fn disabled() -> Self {
        Self {
            sender: None,
            from: String::new(),
            to: Vec::new(),
        }
    }

    /// Start the worker. It exits once every queue handle has been dropped and the
    /// backlog is drained.
    pub fn spawn(notifier: Arc<dyn Notifier>, settings: NotifySettings) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let worker = tokio::spawn(run_worker(notifier, receiver, settings.max_attempts.max(1)));
        let queue = Self {
            sender: Some(sender),
            from: settings.from,
            to: settings.to,
        };
        (queue, worker)
    }

    /// Queue a notification for `submission` without waiting. Returns whether the job
    /// was accepted.
    pub fn enqueue(&self, submission: &FormSubmission) -> bool {
        let Some(sender) = &self.sender else {
            debug!(submission_id = %submission.id, "notifications disabled, skipping");
            return false;
        };
        let job = Job {
            submission_id: submission.id.clone(),
            message: render_notification(submission, &self.from, &self.to),
        };
        match sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(submission_id = %job.submission_id, "notification queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!(submission_id = %job.submission_id, "notification worker stopped, dropping");
                false
            }
        }
    }
}

async fn run_worker(notifier: Arc<dyn Notifier>, mut receiver: mpsc::Receiver<Job>, max_attempts: u32) {
    while let Some(job) = receiver.recv().await {
        deliver(notifier.as_ref(), &job, max_attempts).await;
    }
    info!("notification worker stopped");
}

async fn deliver(notifier: &dyn Notifier, job: &Job, max_attempts: u32) -> bool {
    let key = idempotency_key(&job.submission_id);
    for attempt in 0..max_attempts {
        match notifier.send(&job.message, &key).await {
            Ok(()) => {
                info!(submission_id = %job.submission_id, attempt = attempt + 1, "notification sent");
                return true;
            }
            Err(e) if attempt + 1 < max_attempts && is_retryable(&e) => {
                let delay = backoff_delay(INITIAL_BACKOFF, MAX_BACKOFF, attempt);
                warn!(
                    submission_id = %job.submission_id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "notification failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(
                    submission_id = %job.submission_id,
                    attempts = attempt + 1,
                    error = %e,
                    "notification failed, giving up"
                );
                return false;
            }
        }
    }
    false
}

/// Rejections the provider will repeat no matter how often we ask.
fn is_retryable(e: &UpstreamError) -> bool {
    match e.status() {
        Some(status) => status.as_u16() == 429 || status.is_server_error(),
        None => true,
    }
}

pub fn idempotency_key(submission_id: &str) -> String {
    format!("submission-{submission_id}")
}

/// Build the staff email for a stored submission.
pub fn render_notification(submission: &FormSubmission, from: &str, to: &[String]) -> EmailMessage {
    let label = submission.form_type.label();
    let mut html = format!(
        "<h2>New {}</h2>\n<p>Submission <code>{}</code> received {}.</p>\n<table>\n",
        html_escape(label),
        html_escape(&submission.id),
        submission.created_at.format("%Y-%m-%d %H:%M UTC"),
    );
    if let Value::Object(fields) = &submission.form_data {
        for (name, value) in fields {
            html.push_str(&format!(
                "<tr><th align=\"left\">{}</th><td>{}</td></tr>\n",
                html_escape(name),
                render_value(value)
            ));
        }
    }
    html.push_str("</table>\n");

    let subject = match ContactDetails::deserialize(&submission.form_data)
        .ok()
        .and_then(|contact| contact.full_name())
    {
        Some(name) => format!("New {label} submission from {name}"),
        None => format!("New {label} submission"),
    };
    EmailMessage {
        from: from.to_string(),
        to: to.to_vec(),
        subject,
        html,
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => html_escape(s).replace('\n', "<br>"),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items.iter().map(render_value).collect::<Vec<_>>().join(", "),
        Value::Object(_) => match serde_json::from_value::<StoredFile>(value.clone()) {
            Ok(file) => render_file(&file),
            Err(_) => html_escape(&value.to_string()),
        },
    }
}

fn render_file(file: &StoredFile) -> String {
    match &file.file_path {
        Some(path) => format!("{} ({})", html_escape(&file.file_name), html_escape(path)),
        None => format!("{} (upload failed)", html_escape(&file.file_name)),
    }
}

fn html_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::model::{FormType, SubmissionMetadata, SubmissionStatus};
    use crate::testing::RecordingNotifier;

    fn submission(form_data: Value) -> FormSubmission {
        let now = Utc::now();
        FormSubmission {
            id: "abc-123".to_string(),
            form_type: FormType::Job,
            form_data,
            metadata: SubmissionMetadata {
                ip: "203.0.113.9".to_string(),
                user_agent: "test".to_string(),
                timestamp: now,
            },
            status: SubmissionStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    fn settings(max_attempts: u32) -> NotifySettings {
        NotifySettings {
            from: "forms@hospital.example".to_string(),
            to: vec!["hr@hospital.example".to_string()],
            max_attempts,
        }
    }

    #[test]
    fn rendering_escapes_user_input_and_shows_files() {
        let message = render_notification(
            &submission(json!({
                "firstName": "<b>Asha</b>",
                "resume": {"fileName": "r.pdf", "fileSize": 3, "fileType": "application/pdf",
                           "filePath": "form-submissions/x/1-r.pdf"},
                "portfolio": {"fileName": "p.png", "fileSize": 3, "fileType": "image/png"}
            })),
            "forms@hospital.example",
            &["hr@hospital.example".to_string()],
        );
        assert_eq!(message.subject, "New Job application submission from <b>Asha</b>");
        assert!(message.html.contains("&lt;b&gt;Asha&lt;/b&gt;"));
        assert!(!message.html.contains("<b>Asha"));
        assert!(message.html.contains("r.pdf (form-submissions/x/1-r.pdf)"));
        assert!(message.html.contains("p.png (upload failed)"));
        assert_eq!(message.to, vec!["hr@hospital.example".to_string()]);
    }

    #[tokio::test]
    async fn worker_retries_then_delivers_with_a_stable_key() {
        let notifier = Arc::new(RecordingNotifier::failing_first(1));
        let (queue, worker) = NotificationQueue::spawn(notifier.clone(), settings(3));

        assert!(queue.enqueue(&submission(json!({"email": "a@b.com"}))));
        drop(queue);
        worker.await.unwrap();

        let attempts = notifier.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|key| key == "submission-abc-123"));
        assert_eq!(notifier.delivered().len(), 1);
    }

    #[tokio::test]
    async fn worker_gives_up_after_max_attempts() {
        let notifier = Arc::new(RecordingNotifier::failing_first(10));
        let (queue, worker) = NotificationQueue::spawn(notifier.clone(), settings(2));

        queue.enqueue(&submission(json!({})));
        drop(queue);
        worker.await.unwrap();

        assert_eq!(notifier.attempts().len(), 2);
        assert!(notifier.delivered().is_empty());
    }

    #[test]
    fn disabled_queue_accepts_nothing() {
        let queue = NotificationQueue::disabled();
        assert!(!queue.enqueue(&submission(json!({}))));
    }

    #[test]
    fn subject_names_the_applicant_when_known() {
        let to = ["hr@hospital.example".to_string()];
        let named = render_notification(
            &submission(json!({"firstName": "Asha", "lastName": "Kulkarni", "phone": "+91 98"})),
            "forms@hospital.example",
            &to,
        );
        assert_eq!(named.subject, "New Job application submission from Asha Kulkarni");

        let anonymous = render_notification(
            &submission(json!({"email": "a@b.com"})),
            "forms@hospital.example",
            &to,
        );
        assert_eq!(anonymous.subject, "New Job application submission");
    }

    #[test]
    fn full_or_stopped_queue_drops_the_job() {
        let (sender, receiver) = mpsc::channel(1);
        let queue = NotificationQueue {
            sender: Some(sender),
            from: "forms@hospital.example".to_string(),
            to: vec!["hr@hospital.example".to_string()],
        };

        assert!(queue.enqueue(&submission(json!({"email": "a@b.com"}))));
        assert!(!queue.enqueue(&submission(json!({"email": "c@d.com"}))));

        drop(receiver);
        assert!(!queue.enqueue(&submission(json!({"email": "e@f.com"}))));
    }
}
