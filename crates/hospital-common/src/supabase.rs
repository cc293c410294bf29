/// Supabase client: PostgREST rows and Storage objects.
///
/// All calls authenticate with the service-role key, so this client must only ever run
/// server side. Writes are sent once (no retries); reads retry through `UpstreamClient`.
use reqwest::header::{HeaderMap, CONTENT_RANGE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::http::{UpstreamClient, UpstreamError};

#[derive(Clone, Debug)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_key: String,
    pub bucket: String,
}

/// One page of rows plus the exact total reported by PostgREST.
#[derive(Debug, Clone)]
pub struct RowPage<R> {
    pub rows: Vec<R>,
    pub total: Option<u64>,
}

#[derive(Clone)]
pub struct SupabaseClient {
    config: SupabaseConfig,
    http: UpstreamClient,
}

#[derive(Serialize)]
struct SignRequest {
    #[serde(rename = "expiresIn")]
    expires_in: u64,
}

#[derive(Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

impl SupabaseClient {
    pub fn new(config: SupabaseConfig, http: UpstreamClient) -> Self {
        let url = config.url.trim_end_matches('/').to_string();
        Self {
            config: SupabaseConfig { url, ..config },
            http,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    /// Insert one row and return it as stored (ids and defaults filled in).
    pub async fn insert_row<T, R>(&self, table: &str, row: &T) -> Result<R, UpstreamError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let url = self.rest_url(table);
        let rows: Vec<R> = self
            .http
            .send_json(false, |http| {
                self.authed(http.post(&url))
                    .header("Prefer", "return=representation")
                    .json(row)
            })
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| UpstreamError::Unexpected(format!("insert into {table} returned no rows")))
    }

    /// Select rows with PostgREST query parameters (`col=eq.value`, `order`, `limit`, ...).
    pub async fn select_rows<R>(
        &self,
        table: &str,
        params: &[(String, String)],
    ) -> Result<RowPage<R>, UpstreamError>
    where
        R: DeserializeOwned,
    {
        let url = self.rest_url(table);
        let resp = self
            .http
            .send(true, |http| {
                self.authed(http.get(&url))
                    .header("Prefer", "count=exact")
                    .query(params)
            })
            .await?;
        let total = parse_content_range_total(resp.headers());
        let bytes = resp.bytes().await?;
        let rows: Vec<R> = serde_json::from_slice(&bytes)?;
        Ok(RowPage { rows, total })
    }

    /// Patch every row matching `filters` and return the updated rows.
    pub async fn update_rows<T, R>(
        &self,
        table: &str,
        filters: &[(String, String)],
        patch: &T,
    ) -> Result<Vec<R>, UpstreamError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let url = self.rest_url(table);
        self.http
            .send_json(false, |http| {
                self.authed(http.patch(&url))
                    .header("Prefer", "return=representation")
                    .query(filters)
                    .json(patch)
            })
            .await
    }

    /// Upload an object into the configured bucket. Existing objects are never overwritten.
    pub async fn upload_object(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), UpstreamError> {
        let url = self.object_url(&[], path)?;
        self.http
            .send(false, |http| {
                self.authed(http.post(url.clone()))
                    .header("Content-Type", content_type)
                    .header("x-upsert", "false")
                    .body(bytes.clone())
            })
            .await?;
        Ok(())
    }

    /// Create a time-limited download URL for an object in the configured bucket.
    pub async fn create_signed_url(
        &self,
        path: &str,
        expires_in_secs: u64,
    ) -> Result<String, UpstreamError> {
        let url = self.object_url(&["sign"], path)?;
        let body = SignRequest {
            expires_in: expires_in_secs,
        };
        let signed: SignResponse = self
            .http
            .send_json(true, |http| self.authed(http.post(url.clone())).json(&body))
            .await?;
        Ok(absolute_signed_url(&self.config.url, &signed.signed_url))
    }

    /// `{url}/storage/v1/object/{action..}/{bucket}/{path}` with every path segment
    /// percent-encoded, so no part of `path` can act as a dot segment, query or fragment.
    fn object_url(&self, action: &[&str], path: &str) -> Result<reqwest::Url, UpstreamError> {
        object_url(&self.config.url, action, &self.config.bucket, path)
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.url, table)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.config.service_key)
            .bearer_auth(&self.config.service_key)
    }
}

/// `Content-Range: 0-24/3573` → `Some(3573)`. `*/0` and unknown totals (`0-24/*`) are handled.
fn parse_content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

fn object_url(
    base_url: &str,
    action: &[&str],
    bucket: &str,
    path: &str,
) -> Result<reqwest::Url, UpstreamError> {
    let mut url = reqwest::Url::parse(base_url)
        .map_err(|e| UpstreamError::Unexpected(format!("invalid storage url {base_url}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| UpstreamError::Unexpected(format!("storage url {base_url} has no path")))?
        .pop_if_empty()
        .extend(["storage", "v1", "object"])
        .extend(action)
        .push(bucket)
        .extend(path.split('/'));
    Ok(url)
}

/// Storage returns the signed path relative to `/storage/v1`.
fn absolute_signed_url(base_url: &str, signed: &str) -> String {
    if signed.starts_with("http://") || signed.starts_with("https://") {
        return signed.to_string();
    }
    let path = if signed.starts_with('/') {
        signed.to_string()
    } else {
        format!("/{signed}")
    };
    format!("{base_url}/storage/v1{path}")
}
