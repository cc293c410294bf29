/// Contentful Content Delivery API client.
///
/// Only the read path the site needs: entries of one content type, optionally
/// filtered by Contentful's full-text `query` parameter, capped by `limit`.
use serde::Deserialize;

use crate::http::{UpstreamClient, UpstreamError};

#[derive(Clone, Debug)]
pub struct ContentfulConfig {
    pub base_url: String,
    pub space_id: String,
    pub environment: String,
    pub access_token: String,
}

impl ContentfulConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://cdn.contentful.com";
}

/// One entry as returned by the delivery API. `fields` is left as raw JSON; mapping to
/// typed records happens at the caller, which knows the content model.
#[derive(Debug, Clone, Deserialize)]
pub struct Entry {
    pub sys: EntrySys,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntrySys {
    pub id: String,
}

impl Entry {
    /// A string field, ignoring empty values.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct EntryCollection {
    #[serde(default)]
    items: Vec<Entry>,
}

#[derive(Clone)]
pub struct ContentfulClient {
    config: ContentfulConfig,
    http: UpstreamClient,
}

impl ContentfulClient {
    pub fn new(config: ContentfulConfig, http: UpstreamClient) -> Self {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Self {
            config: ContentfulConfig { base_url, ..config },
            http,
        }
    }

    /// Fetch up to `limit` entries of `content_type` matching `query`.
    pub async fn entries(
        &self,
        content_type: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Entry>, UpstreamError> {
        let url = format!(
            "{}/spaces/{}/environments/{}/entries",
            self.config.base_url, self.config.space_id, self.config.environment
        );
        let limit = limit.to_string();
        let params: [(&str, &str); 4] = [
            ("content_type", content_type),
            ("query", query),
            ("limit", &limit),
            ("include", "0"),
        ];
        let collection: EntryCollection = self
            .http
            .send_json(true, |http| {
                http.get(&url)
                    .bearer_auth(&self.config.access_token)
                    .query(&params)
            })
            .await?;
        Ok(collection.items)
    }
}
