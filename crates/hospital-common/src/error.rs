/// Error types shared across the hospital site crates.
///
/// These errors represent failures in infrastructure components (Redis, upstream HTTP
/// services) that every server in the workspace talks to. Application-specific errors
/// should be defined in each server crate and wrap `CommonError` via `#[from]`.

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis unavailable, degrading gracefully")]
    RedisUnavailable,

    #[error(transparent)]
    Upstream(#[from] crate::http::UpstreamError),
}
