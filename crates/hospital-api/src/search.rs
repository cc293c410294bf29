//! Site-wide search across doctors, facilities and health packages.
//!
//! One query fans out to three independent CMS lookups. Each branch is guarded by a
//! timeout and its own error handling: a failing branch contributes no results, and
//! never cancels or delays its siblings beyond its own timeout. Results are normalized
//! into [`SearchResult`] and concatenated in a fixed category order. Ranking is left to
//! the CMS within each category.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hospital_common::http::UpstreamError;
use hospital_common::site_api::{ResultType, SearchResponse, SearchResult};
use tracing::{info, warn};

use crate::cache::SearchCache;

pub const MIN_QUERY_CHARS: usize = 2;
pub const MAX_QUERY_CHARS: usize = 100;
pub const PER_CATEGORY_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoctorHit {
    pub id: String,
    pub name: String,
    pub specialty: Option<String>,
    pub department: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacilityHit {
    pub id: String,
    pub name: String,
    pub slug: Option<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageHit {
    pub id: String,
    pub name: String,
    pub category: Option<String>,
}

/// The three searchable content collections.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn doctors(&self, query: &str, limit: usize) -> Result<Vec<DoctorHit>, UpstreamError>;

    async fn facilities(&self, query: &str, limit: usize) -> Result<Vec<FacilityHit>, UpstreamError>;

    async fn packages(&self, query: &str, limit: usize) -> Result<Vec<PackageHit>, UpstreamError>;
}

pub struct SearchAggregator {
    source: Arc<dyn ContentSource>,
    cache: SearchCache,
    branch_timeout: Duration,
}

/// Items from one branch, and whether the branch finished cleanly.
struct Branch<T> {
    items: Vec<T>,
    complete: bool,
}

impl SearchAggregator {
    pub fn new(source: Arc<dyn ContentSource>, cache: SearchCache, branch_timeout: Duration) -> Self {
        Self {
            source,
            cache,
            branch_timeout,
        }
    }

    /// Run a search for the raw `q` parameter. Never fails: upstream trouble only
    /// shrinks the result list.
    pub async fn search(&self, raw_query: &str) -> SearchResponse {
        let trimmed = raw_query.trim();
        if trimmed.chars().count() < MIN_QUERY_CHARS {
            return SearchResponse {
                results: Vec::new(),
                query: sanitize_query(trimmed),
            };
        }

        let query = sanitize_query(trimmed);
        if query.chars().count() < MIN_QUERY_CHARS {
            return SearchResponse {
                results: Vec::new(),
                query,
            };
        }

        if let Some(results) = self.cache.get(&query).await {
            info!(query = %query, "search cache hit");
            return SearchResponse { results, query };
        }

        let (doctors, facilities, packages) = futures::join!(
            guarded(
                "doctors",
                self.branch_timeout,
                self.source.doctors(&query, PER_CATEGORY_LIMIT)
            ),
            guarded(
                "facilities",
                self.branch_timeout,
                self.source.facilities(&query, PER_CATEGORY_LIMIT)
            ),
            guarded(
                "packages",
                self.branch_timeout,
                self.source.packages(&query, PER_CATEGORY_LIMIT)
            ),
        );
        let complete = doctors.complete && facilities.complete && packages.complete;

        let mut results =
            Vec::with_capacity(doctors.items.len() + facilities.items.len() + packages.items.len());
        results.extend(doctors.items.into_iter().map(doctor_result));
        results.extend(facilities.items.into_iter().map(facility_result));
        results.extend(packages.items.into_iter().map(package_result));

        // Partial results would otherwise stick around for the whole TTL.
        if complete {
            self.cache.set(&query, &results).await;
        }

        SearchResponse { results, query }
    }
}

async fn guarded<T, F>(category: &'static str, timeout: Duration, lookup: F) -> Branch<T>
where
    F: Future<Output = Result<Vec<T>, UpstreamError>>,
{
    match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(items)) => Branch {
            items,
            complete: true,
        },
        Ok(Err(e)) => {
            warn!(category, error = %e, "search branch failed, omitting category");
            Branch {
                items: Vec::new(),
                complete: false,
            }
        }
        Err(_) => {
            warn!(
                category,
                timeout_ms = timeout.as_millis(),
                "search branch timed out, omitting category"
            );
            Branch {
                items: Vec::new(),
                complete: false,
            }
        }
    }
}

/// Trim, cap at [`MAX_QUERY_CHARS`], and drop angle brackets so the echoed query can't
/// carry markup.
pub fn sanitize_query(raw: &str) -> String {
    let capped: String = raw.trim().chars().take(MAX_QUERY_CHARS).collect();
    capped.replace(['<', '>'], "").trim().to_string()
}

/// "Cath Lab & ICU" → "cath-lab-icu"
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

fn doctor_result(hit: DoctorHit) -> SearchResult {
    let subtitle = hit.specialty.or(hit.department);
    SearchResult::modal(hit.id, ResultType::Doctor, hit.name, subtitle)
}

fn facility_result(hit: FacilityHit) -> SearchResult {
    let slug = hit
        .slug
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| slugify(&hit.name));
    SearchResult::navigate(
        hit.id,
        ResultType::Facility,
        hit.name,
        hit.summary,
        format!("/facilities/{slug}"),
    )
}

fn package_result(hit: PackageHit) -> SearchResult {
    SearchResult::modal(hit.id, ResultType::Package, hit.name, hit.category)
}
