/// Resend transactional email client.
///
/// Each send carries an `Idempotency-Key`, so a caller that retries a send after an
/// ambiguous failure cannot deliver the same message twice.
use serde::{Deserialize, Serialize};

use crate::http::{UpstreamClient, UpstreamError};

#[derive(Clone, Debug)]
pub struct ResendConfig {
    pub base_url: String,
    pub api_key: String,
}

impl ResendConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.resend.com";
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Clone)]
pub struct ResendClient {
    config: ResendConfig,
    http: UpstreamClient,
}

impl ResendClient {
    pub fn new(config: ResendConfig, http: UpstreamClient) -> Self {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Self {
            config: ResendConfig { base_url, ..config },
            http,
        }
    }

    /// Send one email. Returns the provider's message id.
    pub async fn send_email(
        &self,
        message: &EmailMessage,
        idempotency_key: &str,
    ) -> Result<String, UpstreamError> {
        let url = format!("{}/emails", self.config.base_url);
        let sent: SendResponse = self
            .http
            .send_json(false, |http| {
                http.post(&url)
                    .bearer_auth(&self.config.api_key)
                    .header("Idempotency-Key", idempotency_key)
                    .json(message)
            })
            .await?;
        Ok(sent.id)
    }
}
