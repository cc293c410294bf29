//! Durable storage for form submissions.
//!
//! Submissions are created once by the public form endpoint and afterwards only their
//! status changes, by an admin. Nothing here deletes rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hospital_common::http::UpstreamError;
use hospital_common::supabase::SupabaseClient;
use serde::Serialize;

use crate::model::{FormSubmission, FormType, NewSubmission, SubmissionStatus};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Fields the admin search box matches against.
const SEARCHABLE_FIELDS: &[&str] = &["firstName", "lastName", "email", "phone"];

/// Filters and paging for the admin submission list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionQuery {
    pub form_type: Option<FormType>,
    pub status: Option<SubmissionStatus>,
    pub limit: u32,
    pub offset: u32,
    pub search: Option<String>,
}

impl SubmissionQuery {
    /// Apply paging defaults: `limit` defaults to 50 and is clamped to `1..=100`.
    pub fn new(
        form_type: Option<FormType>,
        status: Option<SubmissionStatus>,
        limit: Option<u32>,
        offset: Option<u32>,
        search: Option<&str>,
    ) -> Self {
        Self {
            form_type,
            status,
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
            offset: offset.unwrap_or(0),
            search: search.map(clean_search_term).filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmissionPage {
    pub submissions: Vec<FormSubmission>,
    pub total: u64,
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn insert(&self, submission: &NewSubmission) -> Result<FormSubmission, UpstreamError>;

    async fn list(&self, query: &SubmissionQuery) -> Result<SubmissionPage, UpstreamError>;

    /// Returns `None` when no submission has this id.
    async fn update_status(
        &self,
        id: &str,
        status: SubmissionStatus,
    ) -> Result<Option<FormSubmission>, UpstreamError>;
}

pub struct SupabaseSubmissionStore {
    client: SupabaseClient,
    table: String,
}

impl SupabaseSubmissionStore {
    pub fn new(client: SupabaseClient, table: String) -> Self {
        Self { client, table }
    }
}

#[derive(Serialize)]
struct StatusPatch {
    status: SubmissionStatus,
    updated_at: DateTime<Utc>,
}

#[async_trait]
impl SubmissionStore for SupabaseSubmissionStore {
    async fn insert(&self, submission: &NewSubmission) -> Result<FormSubmission, UpstreamError> {
        self.client.insert_row(&self.table, submission).await
    }

    async fn list(&self, query: &SubmissionQuery) -> Result<SubmissionPage, UpstreamError> {
        let page = self
            .client
            .select_rows::<FormSubmission>(&self.table, &postgrest_params(query))
            .await?;
        let total = page.total.unwrap_or(page.rows.len() as u64);
        Ok(SubmissionPage {
            submissions: page.rows,
            total,
        })
    }

    async fn update_status(
        &self,
        id: &str,
        status: SubmissionStatus,
    ) -> Result<Option<FormSubmission>, UpstreamError> {
        let filters = [("id".to_string(), format!("eq.{id}"))];
        let patch = StatusPatch {
            status,
            updated_at: Utc::now(),
        };
        let rows: Vec<FormSubmission> = self
            .client
            .update_rows(&self.table, &filters, &patch)
            .await?;
        Ok(rows.into_iter().next())
    }
}

/// PostgREST query string for a list request, newest first.
pub fn postgrest_params(query: &SubmissionQuery) -> Vec<(String, String)> {
    let mut params = vec![
        ("select".to_string(), "*".to_string()),
        ("order".to_string(), "created_at.desc".to_string()),
        ("limit".to_string(), query.limit.to_string()),
        ("offset".to_string(), query.offset.to_string()),
    ];
    if let Some(form_type) = query.form_type {
        params.push(("form_type".to_string(), format!("eq.{form_type}")));
    }
    if let Some(status) = query.status {
        params.push(("status".to_string(), format!("eq.{}", status.as_str())));
    }
    if let Some(term) = &query.search {
        let clauses: Vec<String> = SEARCHABLE_FIELDS
            .iter()
            .map(|field| format!("form_data->>{field}.ilike.*{term}*"))
            .collect();
        params.push(("or".to_string(), format!("({})", clauses.join(","))));
    }
    params
}

/// Drop characters that carry meaning inside a PostgREST filter.
fn clean_search_term(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, ',' | '(' | ')' | '*' | '%' | '\\' | ':' | '"' | '\''))
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .chars()
        .take(100)
        .collect()
}
