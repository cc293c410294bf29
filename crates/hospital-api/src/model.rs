use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which public form a submission came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormType {
    Appointment,
    Checkup,
    Research,
    Job,
}

impl FormType {
    pub const ALL: [FormType; 4] = [
        FormType::Appointment,
        FormType::Checkup,
        FormType::Research,
        FormType::Job,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FormType::Appointment => "appointment",
            FormType::Checkup => "checkup",
            FormType::Research => "research",
            FormType::Job => "job",
        }
    }

    /// Human-readable name for notification emails.
    pub fn label(self) -> &'static str {
        match self {
            FormType::Appointment => "Appointment request",
            FormType::Checkup => "Health checkup booking",
            FormType::Research => "Research enquiry",
            FormType::Job => "Job application",
        }
    }
}

impl fmt::Display for FormType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FormType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown form type: {s}"))
    }
}

/// Review state of a submission. Only admins move a submission between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Reviewed,
    Contacted,
    Archived,
}

impl SubmissionStatus {
    pub const ALL: [SubmissionStatus; 4] = [
        SubmissionStatus::Pending,
        SubmissionStatus::Reviewed,
        SubmissionStatus::Contacted,
        SubmissionStatus::Archived,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Reviewed => "reviewed",
            SubmissionStatus::Contacted => "contacted",
            SubmissionStatus::Archived => "archived",
        }
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubmissionStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown status: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionMetadata {
    pub ip: String,
    pub user_agent: String,
    pub timestamp: DateTime<Utc>,
}

/// A submission row as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormSubmission {
    pub id: String,
    pub form_type: FormType,
    pub form_data: Value,
    pub metadata: SubmissionMetadata,
    pub status: SubmissionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A submission about to be stored; the store assigns id and timestamps.
#[derive(Debug, Clone, Serialize)]
pub struct NewSubmission {
    pub form_type: FormType,
    pub form_data: Value,
    pub metadata: SubmissionMetadata,
    pub status: SubmissionStatus,
}

/// What replaces an uploaded file inside `form_data`. `file_path` is absent when the
/// upload failed and only the metadata was kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}
