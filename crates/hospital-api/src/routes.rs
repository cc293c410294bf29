use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, JsonRejection, QueryRejection};
use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use hospital_common::site_api::{
    AuthStatus, DownloadResponse, LoginRequest, SubmissionList, SubmitResponse,
};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::attachments::{validate_download_path, BlobStore};
use crate::error::ApiError;
use crate::model::{FormSubmission, FormType, SubmissionStatus};
use crate::rate_limit::{RateLimitPolicy, RateLimiter};
use crate::search::SearchAggregator;
use crate::session::{now_secs, session_cookie, SessionKeys};
use crate::store::{SubmissionQuery, SubmissionStore};
use crate::submit::{RequestContext, SubmissionService};

/// Base64 inflates a 10 MiB attachment to about 13.4 MiB.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub const SEARCH_CACHE_CONTROL: &str = "public, s-maxage=60, stale-while-revalidate=300";

/// Every attempt counts, successful or not.
pub const LOGIN_POLICY: RateLimitPolicy =
    RateLimitPolicy::new("login", 5, Duration::from_secs(15 * 60));

const DOWNLOAD_TTL: Duration = Duration::from_secs(60 * 60);

pub struct AppState {
    pub search: SearchAggregator,
    pub submissions: SubmissionService,
    pub store: Arc<dyn SubmissionStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub limiter: RateLimiter,
    pub session: SessionKeys,
    /// Take the client address from `X-Forwarded-For` / `X-Real-IP` when set.
    pub trust_proxy_headers: bool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/search", get(search))
        .route("/api/forms/submit", post(submit_form))
        .route("/api/admin/auth", get(auth_status).post(login).delete(logout))
        .route("/api/admin/submissions", get(list_submissions))
        .route("/api/admin/submissions/{id}", patch(update_submission))
        .route("/api/files/download", get(download))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Best-effort client address for rate limiting and submission metadata.
pub struct ClientIp(pub String);

impl FromRequestParts<Arc<AppState>> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(ClientIp(client_ip(&parts.headers, peer, state.trust_proxy_headers)))
    }
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer. The headers are
/// ignored unless `trust_proxy_headers` is set.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers {
        if let Some(first) = header_str(headers, "x-forwarded-for")
            .and_then(|list| list.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return first.to_string();
        }
        if let Some(real) = header_str(headers, "x-real-ip") {
            return real.to_string();
        }
    }
    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Present only when the request carries a valid admin session cookie.
pub struct AdminSession;

impl FromRequestParts<Arc<AppState>> for AdminSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let now = now_secs();
        let valid = parts
            .headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(session_cookie)
            .any(|token| state.session.verify(token, now));
        if valid {
            Ok(AdminSession)
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
}

async fn search(
    State(state): State<Arc<AppState>>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let q = params
        .q
        .ok_or_else(|| ApiError::bad_request("Query parameter 'q' is required"))?;
    let response = state.search.search(&q).await;
    Ok(([(header::CACHE_CONTROL, SEARCH_CACHE_CONTROL)], Json(response)).into_response())
}

async fn submit_form(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let body = body.map_err(|e| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge
        } else {
            ApiError::bad_request(e.body_text())
        }
    })?;
    let ctx = RequestContext {
        ip,
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string(),
    };
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let receipt = state.submissions.submit(&ctx, content_type, &body).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn login(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    state.limiter.enforce(&LOGIN_POLICY, &ip).await?;
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;

    if !state.session.password_matches(&request.password) {
        warn!(client = %ip, "admin login rejected");
        return Err(ApiError::Unauthorized);
    }
    info!(client = %ip, "admin logged in");
    let cookie = state.session.login_cookie(now_secs());
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(AuthStatus {
            authenticated: true,
        }),
    )
        .into_response())
}

async fn auth_status(_session: AdminSession) -> Json<AuthStatus> {
    Json(AuthStatus {
        authenticated: true,
    })
}

async fn logout(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::SET_COOKIE, state.session.logout_cookie())],
        Json(AuthStatus {
            authenticated: false,
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    form_type: Option<String>,
    status: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
    search: Option<String>,
}

/// Blank query values (`?status=`) mean "no filter".
fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

async fn list_submissions(
    State(state): State<Arc<AppState>>,
    _session: AdminSession,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<SubmissionList<FormSubmission>>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let form_type = non_blank(params.form_type)
        .map(|raw| raw.parse::<FormType>())
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let status = non_blank(params.status)
        .map(|raw| raw.parse::<SubmissionStatus>())
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let search = non_blank(params.search);
    let query = SubmissionQuery::new(
        form_type,
        status,
        params.limit,
        params.offset,
        search.as_deref(),
    );

    let page = state.store.list(&query).await?;
    Ok(Json(SubmissionList {
        submissions: page.submissions,
        total: page.total,
        limit: query.limit,
        offset: query.offset,
    }))
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: String,
}

async fn update_submission(
    State(state): State<Arc<AppState>>,
    _session: AdminSession,
    Path(id): Path<String>,
    body: Result<Json<StatusUpdate>, JsonRejection>,
) -> Result<Json<FormSubmission>, ApiError> {
    let Json(update) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let status = update
        .status
        .parse::<SubmissionStatus>()
        .map_err(ApiError::BadRequest)?;
    let not_found = || ApiError::NotFound("Submission not found".to_string());
    if Uuid::parse_str(&id).is_err() {
        return Err(not_found());
    }

    let updated = state
        .store
        .update_status(&id, status)
        .await?
        .ok_or_else(not_found)?;
    info!(submission_id = %id, status = status.as_str(), "submission status updated");
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    path: Option<String>,
}

async fn download(
    State(state): State<Arc<AppState>>,
    _session: AdminSession,
    params: Result<Query<DownloadParams>, QueryRejection>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let path = params
        .path
        .ok_or_else(|| ApiError::bad_request("Query parameter 'path' is required"))?;
    validate_download_path(&path).map_err(ApiError::bad_request)?;

    let url = state
        .blobs
        .signed_url(&path, DOWNLOAD_TTL)
        .await
        .map_err(|e| match e.status() {
            // Storage answers 400 for a missing object.
            Some(status) if status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST => {
                ApiError::NotFound("File not found".to_string())
            }
            _ => ApiError::from(e),
        })?;
    info!(path = %path, "signed download url issued");
    Ok(Json(DownloadResponse {
        url,
        expires_in: DOWNLOAD_TTL.as_secs(),
    }))
}
