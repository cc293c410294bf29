mod attachments;
mod cache;
mod cms;
mod config;
mod error;
mod forms;
mod model;
mod notify;
mod rate_limit;
mod routes;
mod search;
mod session;
mod store;
mod submit;
#[cfg(test)]
mod testing;
mod validate;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hospital_common::contentful::ContentfulClient;
use hospital_common::http::UpstreamClient;
use hospital_common::redis::RedisCache;
use hospital_common::resend::ResendClient;
use hospital_common::supabase::SupabaseClient;

use attachments::AttachmentUploader;
use cache::SearchCache;
use config::Config;
use notify::{NotificationQueue, NotifySettings};
use rate_limit::{MemoryRateLimitStore, RateLimitPolicy, RateLimitStore, RateLimiter, RedisRateLimitStore};
use routes::AppState;
use search::SearchAggregator;
use session::SessionKeys;
use store::SupabaseSubmissionStore;
use submit::SubmissionService;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("starting hospital-api");

    let config = Config::from_env()?;
    info!(
        bind_addr = %config.bind_addr,
        timeout_ms = config.upstream.default_timeout.as_millis(),
        max_retries = config.upstream.max_retries,
        "upstream client configured"
    );
    let http = UpstreamClient::new(config.upstream.clone())?;

    let redis = RedisCache::new(config.redis_url.as_deref());
    let rate_store: Arc<dyn RateLimitStore> = if redis.is_available().await {
        info!("redis connected, sharing rate limits and caching search");
        Arc::new(RedisRateLimitStore::new(redis.clone()))
    } else {
        info!("redis unavailable, rate limits are per process");
        Arc::new(MemoryRateLimitStore::new())
    };
    let limiter = RateLimiter::new(rate_store);
    let sweeper = rate_limit::spawn_sweeper(limiter.store(), SWEEP_INTERVAL);

    let contentful = ContentfulClient::new(config.contentful.clone(), http.clone());
    let supabase = SupabaseClient::new(config.supabase.clone(), http.clone());
    info!(bucket = supabase.bucket(), table = %config.submissions_table, "storage configured");

    let (notifications, notify_worker) = match config.resend.clone() {
        Some(resend) => {
            let (queue, worker) = NotificationQueue::spawn(
                Arc::new(ResendClient::new(resend, http.clone())),
                NotifySettings {
                    from: config.notify_from.clone(),
                    to: config.notify_to.clone(),
                    max_attempts: config.notify_max_attempts,
                },
            );
            info!(recipients = config.notify_to.len(), "email notifications enabled");
            (queue, Some(worker))
        }
        None => {
            warn!("RESEND_API_KEY not set, email notifications disabled");
            (NotificationQueue::disabled(), None)
        }
    };

    let blobs = Arc::new(supabase.clone());
    let store = Arc::new(SupabaseSubmissionStore::new(
        supabase,
        config.submissions_table.clone(),
    ));
    let state = Arc::new(AppState {
        search: SearchAggregator::new(
            Arc::new(contentful),
            SearchCache::new(redis),
            config.search_branch_timeout,
        ),
        submissions: SubmissionService::new(
            limiter.clone(),
            RateLimitPolicy::new(
                "form",
                config.form_rate_limit_max,
                config.form_rate_limit_window,
            ),
            AttachmentUploader::new(blobs.clone()),
            store.clone(),
            notifications,
        ),
        store,
        blobs,
        limiter,
        session: SessionKeys::new(
            config.admin_password.clone(),
            config.session_secret.clone(),
            config.cookie_secure,
        ),
        trust_proxy_headers: config.trust_proxy_headers,
    });

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(
        listener,
        routes::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    // The router owned the last queue handle; the worker now drains and exits.
    if let Some(worker) = notify_worker {
        if tokio::time::timeout(DRAIN_TIMEOUT, worker).await.is_err() {
            warn!("notification backlog not drained before shutdown");
        }
    }
    info!("hospital-api shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl+C, shutting down"),
            Err(e) => {
                warn!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
