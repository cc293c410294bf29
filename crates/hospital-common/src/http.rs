/// Upstream HTTP client shared by the CMS, storage and email integrations.
///
/// Every call carries an explicit timeout. Idempotent calls are retried on timeouts,
/// connection failures, 429 and 5xx with capped exponential backoff plus jitter.
/// Non-idempotent calls (row inserts, uploads, emails) are sent exactly once.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

#[derive(Clone, Debug)]
pub struct UpstreamClientConfig {
    pub user_agent: String,
    pub default_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_error_body_bytes: usize,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            user_agent: "hospital-site/api".to_string(),
            default_timeout: Duration::from_secs(10),
            max_retries: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(5_000),
            max_error_body_bytes: 8 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid response JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("upstream returned error: status={status} message={message}")]
    Upstream { status: StatusCode, message: String },

    #[error("upstream returned non-JSON error: status={status} body={body}")]
    UpstreamBody { status: StatusCode, body: String },

    #[error("unexpected upstream response: {0}")]
    Unexpected(String),
}

impl UpstreamError {
    /// HTTP status reported by the upstream, when there was one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            UpstreamError::Upstream { status, .. } | UpstreamError::UpstreamBody { status, .. } => {
                Some(*status)
            }
            UpstreamError::Request(e) => e.status(),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct UpstreamClient {
    config: UpstreamClientConfig,
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &UpstreamClientConfig {
        &self.config
    }

    /// Send a request built by `build`, returning the successful response.
    ///
    /// `build` is invoked once per attempt. When `idempotent` is false the request
    /// is never retried.
    pub async fn send<F>(&self, idempotent: bool, build: F) -> Result<Response, UpstreamError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let max_retries = if idempotent { self.config.max_retries } else { 0 };
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = self.send_once(&build).await;
            match result {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt > max_retries || !should_retry(&e) {
                        return Err(e);
                    }
                    let delay = backoff_delay(
                        self.config.initial_backoff,
                        self.config.max_backoff,
                        attempt - 1,
                    );
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "upstream request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Send a request and decode the JSON body of a successful response.
    pub async fn send_json<T, F>(&self, idempotent: bool, build: F) -> Result<T, UpstreamError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let resp = self.send(idempotent, build).await?;
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn send_once<F>(&self, build: &F) -> Result<Response, UpstreamError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let resp = build(&self.http)
            .timeout(self.config.default_timeout)
            .send()
            .await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        Err(to_upstream_error(resp, self.config.max_error_body_bytes).await)
    }
}

async fn to_upstream_error(resp: Response, max_error_body_bytes: usize) -> UpstreamError {
    let status = resp.status();
    let body = read_limited_text(resp, max_error_body_bytes).await;
    if let Ok(parsed) = serde_json::from_str::<ErrorEnvelope>(&body) {
        if let Some(message) = parsed.message() {
            return UpstreamError::Upstream { status, message };
        }
    }
    UpstreamError::UpstreamBody { status, body }
}

fn should_retry(err: &UpstreamError) -> bool {
    match err {
        UpstreamError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        UpstreamError::Upstream { status, .. } | UpstreamError::UpstreamBody { status, .. } => {
            *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
        }
        UpstreamError::InvalidJson(_) | UpstreamError::Unexpected(_) => false,
    }
}

/// Exponential backoff capped at `max`, plus up to 25% jitter.
pub fn backoff_delay(initial: Duration, max: Duration, exponent: u32) -> Duration {
    let mult = 1u128.checked_shl(exponent).unwrap_or(u128::MAX);
    let base_ms = initial.as_millis().saturating_mul(mult);
    let capped_ms = std::cmp::min(base_ms, max.as_millis()) as u64;
    let jitter_cap = std::cmp::max(1, capped_ms / 4);
    let jitter_ms = pseudo_jitter_ms(jitter_cap);
    Duration::from_millis(capped_ms.saturating_add(jitter_ms))
}

fn pseudo_jitter_ms(max_inclusive: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    let nanos = now.subsec_nanos() as u64;
    nanos % (max_inclusive + 1)
}

async fn read_limited_text(resp: Response, max_bytes: usize) -> String {
    match resp.bytes().await {
        Ok(mut b) => {
            if b.len() > max_bytes {
                b.truncate(max_bytes);
            }
            String::from_utf8_lossy(&b).to_string()
        }
        Err(e) => {
            warn!(error = %e, "failed to read upstream error body");
            "<failed to read error body>".to_string()
        }
    }
}

/// The services we talk to disagree on where they put the error text.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    message: Option<String>,
    error: Option<serde_json::Value>,
    msg: Option<String>,
}

impl ErrorEnvelope {
    fn message(self) -> Option<String> {
        if let Some(m) = self.message.or(self.msg) {
            return Some(m);
        }
        match self.error? {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Object(map) => map
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_millis(1_000);

        let first = backoff_delay(initial, max, 0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));

        let third = backoff_delay(initial, max, 2);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));

        let huge = backoff_delay(initial, max, 200);
        assert!(huge >= max && huge <= Duration::from_millis(1_250));
    }

    #[test]
    fn retries_only_transient_statuses() {
        let throttled = UpstreamError::UpstreamBody {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        let unavailable = UpstreamError::Upstream {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "down".to_string(),
        };
        let bad_request = UpstreamError::Upstream {
            status: StatusCode::BAD_REQUEST,
            message: "nope".to_string(),
        };
        assert!(should_retry(&throttled));
        assert!(should_retry(&unavailable));
        assert!(!should_retry(&bad_request));
        assert!(!should_retry(&UpstreamError::Unexpected("x".to_string())));
    }

    #[test]
    fn error_envelope_finds_message_in_known_shapes() {
        let supabase: ErrorEnvelope =
            serde_json::from_str(r#"{"message":"duplicate key","code":"23505"}"#).unwrap();
        assert_eq!(supabase.message().as_deref(), Some("duplicate key"));

        let storage: ErrorEnvelope =
            serde_json::from_str(r#"{"error":"Bucket not found","statusCode":"404"}"#).unwrap();
        assert_eq!(storage.message().as_deref(), Some("Bucket not found"));

        let nested: ErrorEnvelope =
            serde_json::from_str(r#"{"error":{"message":"bad key"}}"#).unwrap();
        assert_eq!(nested.message().as_deref(), Some("bad key"));

        let none: ErrorEnvelope = serde_json::from_str(r#"{"sys":{}}"#).unwrap();
        assert_eq!(none.message(), None);
    }
}
