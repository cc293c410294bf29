use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use hospital_common::contentful::ContentfulConfig;
use hospital_common::http::UpstreamClientConfig;
use hospital_common::resend::ResendConfig;
use hospital_common::supabase::SupabaseConfig;

use crate::error::AppError;

/// Smallest accepted `ADMIN_SESSION_SECRET`, in bytes.
const MIN_SESSION_SECRET_LEN: usize = 32;

/// Application configuration loaded explicitly from environment variables.
///
/// Upstream credentials and admin secrets are required. Redis and email are optional:
/// without `REDIS_URL` rate limits stay in process memory and search results are not
/// cached; without `RESEND_API_KEY` notifications are logged and discarded.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub contentful: ContentfulConfig,
    pub supabase: SupabaseConfig,
    pub submissions_table: String,
    /// `None` disables email notifications.
    pub resend: Option<ResendConfig>,
    pub notify_from: String,
    pub notify_to: Vec<String>,
    pub notify_max_attempts: u32,
    /// Redis connection URL (e.g. "redis://127.0.0.1:6379").
    pub redis_url: Option<String>,
    pub admin_password: String,
    pub session_secret: String,
    pub cookie_secure: bool,
    /// Trust `X-Forwarded-For` / `X-Real-IP` for client identity. Only safe behind a proxy
    /// that overwrites them.
    pub trust_proxy_headers: bool,
    pub search_branch_timeout: Duration,
    pub form_rate_limit_max: u32,
    pub form_rate_limit_window: Duration,
    pub upstream: UpstreamClientConfig,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Required:
    /// - `CONTENTFUL_SPACE_ID`, `CONTENTFUL_ACCESS_TOKEN`
    /// - `SUPABASE_URL`, `SUPABASE_SERVICE_ROLE_KEY`
    /// - `ADMIN_PASSWORD`, `ADMIN_SESSION_SECRET` (at least 32 bytes)
    ///
    /// Everything else has a default; see [`Config::from_lookup`].
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &str| {
            get(key).ok_or_else(|| AppError::Config(format!("{key} environment variable is required")))
        };

        let bind_addr = parse_or(&get, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?;

        let contentful = ContentfulConfig {
            base_url: get("CONTENTFUL_BASE_URL")
                .unwrap_or_else(|| ContentfulConfig::DEFAULT_BASE_URL.to_string()),
            space_id: require("CONTENTFUL_SPACE_ID")?,
            environment: get("CONTENTFUL_ENVIRONMENT").unwrap_or_else(|| "master".to_string()),
            access_token: require("CONTENTFUL_ACCESS_TOKEN")?,
        };

        let supabase_url = require("SUPABASE_URL")?;
        if !supabase_url.starts_with("http://") && !supabase_url.starts_with("https://") {
            return Err(AppError::Config(format!(
                "SUPABASE_URL must be an http(s) URL, got {supabase_url}"
            )));
        }
        let supabase = SupabaseConfig {
            url: supabase_url,
            service_key: require("SUPABASE_SERVICE_ROLE_KEY")?,
            bucket: get("SUPABASE_BUCKET").unwrap_or_else(|| "form-attachments".to_string()),
        };
        let submissions_table =
            get("SUPABASE_TABLE").unwrap_or_else(|| "form_submissions".to_string());

        let resend = get("RESEND_API_KEY").map(|api_key| ResendConfig {
            base_url: get("RESEND_BASE_URL")
                .unwrap_or_else(|| ResendConfig::DEFAULT_BASE_URL.to_string()),
            api_key,
        });
        let notify_from =
            get("NOTIFY_EMAIL_FROM").unwrap_or_else(|| "Website Forms <forms@example.com>".to_string());
        let notify_to: Vec<String> = get("NOTIFY_EMAIL_TO")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if resend.is_some() && notify_to.is_empty() {
            return Err(AppError::Config(
                "NOTIFY_EMAIL_TO is required when RESEND_API_KEY is set".to_string(),
            ));
        }
        let notify_max_attempts: u32 = parse_or(&get, "NOTIFY_MAX_ATTEMPTS", 3)?;
        if notify_max_attempts == 0 {
            return Err(AppError::Config("NOTIFY_MAX_ATTEMPTS must be at least 1".to_string()));
        }

        let admin_password = require("ADMIN_PASSWORD")?;
        let session_secret = require("ADMIN_SESSION_SECRET")?;
        if session_secret.len() < MIN_SESSION_SECRET_LEN {
            return Err(AppError::Config(format!(
                "ADMIN_SESSION_SECRET must be at least {MIN_SESSION_SECRET_LEN} bytes"
            )));
        }

        let form_rate_limit_max: u32 = parse_or(&get, "FORM_RATE_LIMIT_MAX", 5)?;
        if form_rate_limit_max == 0 {
            return Err(AppError::Config("FORM_RATE_LIMIT_MAX must be at least 1".to_string()));
        }
        let form_rate_limit_window =
            Duration::from_secs(parse_or(&get, "FORM_RATE_LIMIT_WINDOW_SECS", 900)?);

        let defaults = UpstreamClientConfig::default();
        let upstream = UpstreamClientConfig {
            default_timeout: Duration::from_secs(parse_or(
                &get,
                "UPSTREAM_TIMEOUT_SECS",
                defaults.default_timeout.as_secs(),
            )?),
            max_retries: parse_or(&get, "UPSTREAM_MAX_RETRIES", defaults.max_retries)?,
            ..defaults
        };

        Ok(Self {
            bind_addr,
            contentful,
            supabase,
            submissions_table,
            resend,
            notify_from,
            notify_to,
            notify_max_attempts,
            redis_url: get("REDIS_URL"),
            admin_password,
            session_secret,
            cookie_secure: parse_or(&get, "COOKIE_SECURE", true)?,
            trust_proxy_headers: parse_or(&get, "TRUST_PROXY_HEADERS", true)?,
            search_branch_timeout: Duration::from_millis(parse_or(
                &get,
                "SEARCH_BRANCH_TIMEOUT_MS",
                3_000,
            )?),
            form_rate_limit_max,
            form_rate_limit_window,
            upstream,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| AppError::Config(format!("invalid {key} value {raw:?}: {e}"))),
    }
}
