//! # snapvault HTTP API Module
//!
//! Thin axum wrapper over [`Vault`] for the capture agent and for automation.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /identities` - Known identities
//! - `POST /identities/{id}/extractions` - Ingest a raw extraction
//! - `GET /identities/{id}/history` - Snapshots, newest first
//! - `GET /identities/{id}/current` - Current pointer and snapshot
//! - `POST /identities/{id}/gc` - Run a retention pass now
//! - `GET|PUT|DELETE /selection` - Active identity selection
//! - `GET /selection/resolve` - Canonical state of the active identity
//!
//! ## Security Configuration (Environment Variables)
//!
//! - `SNAPVAULT_CORS_ORIGINS`: Comma-separated list of allowed origins, or "*" for all (default: localhost only)
//! - `SNAPVAULT_RATE_LIMIT`: Requests per second (default: 100, 0 to disable)
//! - `SNAPVAULT_API_KEY`: If set, requires Bearer token authentication

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::{ApiKey, get_api_key_from_env};
pub use handlers::ApiError;
pub use middleware::{GlobalRateLimiter, create_rate_limiter, get_rate_limit_from_env};
pub use types::{
    ClearSelectionResponse, CurrentResponse, ErrorResponse, HealthResponse, IdentitiesResponse,
    SelectRequest, SelectionResponse,
};

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{get, post},
};
use snapvault_core::Vault;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Extractions are small; anything larger is a misbehaving agent.
const MAX_BODY_BYTES: usize = 1024 * 1024;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    pub vault: Arc<Vault>,
    /// Deadline for each store call.
    pub request_timeout: Duration,
}

impl AppState {
    #[must_use]
    pub fn new(vault: Vault, request_timeout: Duration) -> Self {
        Self {
            vault: Arc::new(vault),
            request_timeout,
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

const CORS_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
];

/// Build the CORS layer from `SNAPVAULT_CORS_ORIGINS`.
///
/// - `*`: any origin (development only)
/// - unset: localhost only
/// - otherwise: comma-separated origin list
fn build_cors_layer() -> CorsLayer {
    match std::env::var("SNAPVAULT_CORS_ORIGINS").ok().as_deref() {
        Some("*") => {
            tracing::warn!(
                "CORS: Allowing ALL origins (SNAPVAULT_CORS_ORIGINS=*). This is insecure for production!"
            );
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|s| match s.parse::<HeaderValue>() {
                    Ok(hv) => {
                        tracing::info!("CORS: Allowing origin: {}", s);
                        Some(hv)
                    }
                    Err(e) => {
                        tracing::warn!("CORS: Invalid origin '{}': {}", s, e);
                        None
                    }
                })
                .collect();

            if allowed.is_empty() {
                tracing::warn!(
                    "CORS: No valid origins in SNAPVAULT_CORS_ORIGINS, defaulting to localhost only"
                );
                build_localhost_cors()
            } else {
                CorsLayer::new()
                    .allow_origin(allowed)
                    .allow_methods(CORS_METHODS)
                    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            }
        }
        None => build_localhost_cors(),
    }
}

fn build_localhost_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .into_iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(CORS_METHODS)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the router with all endpoints and middleware.
///
/// Middleware stack (outer to inner): tracing, CORS, body limit, rate
/// limiting (if enabled), authentication (if configured).
pub fn create_router(state: AppState) -> Router {
    let rate_limiter = create_rate_limiter(get_rate_limit_from_env());
    match &rate_limiter {
        Some(_) => tracing::info!("Rate limiting enabled"),
        None => tracing::info!("Rate limiting disabled"),
    }

    let api_key = get_api_key_from_env();
    if api_key.is_some() {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!(
            "API key authentication DISABLED - all endpoints are publicly accessible! \
             Set SNAPVAULT_API_KEY to enable authentication."
        );
    }

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/identities", get(handlers::identities_handler))
        .route("/identities/{id}/extractions", post(handlers::ingest_handler))
        .route("/identities/{id}/history", get(handlers::history_handler))
        .route("/identities/{id}/current", get(handlers::current_handler))
        .route("/identities/{id}/gc", post(handlers::gc_handler))
        .route(
            "/selection",
            get(handlers::get_selection_handler)
                .put(handlers::put_selection_handler)
                .delete(handlers::delete_selection_handler),
        )
        .route("/selection/resolve", get(handlers::resolve_handler));

    if let Some(key) = api_key {
        router = router.layer(axum_middleware::from_fn_with_state(
            key,
            auth::api_key_auth_middleware,
        ));
    }

    if let Some(limiter) = rate_limiter {
        router = router.layer(axum_middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(build_cors_layer())
                .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

// =============================================================================
// RETENTION TIMER
// =============================================================================

/// Run a retention pass over every identity each `interval`.
///
/// The first pass runs one interval after startup.
pub fn spawn_retention_task(vault: Arc<Vault>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let vault = vault.clone();
            match tokio::task::spawn_blocking(move || vault.collect_all()).await {
                Ok(Ok(reports)) => {
                    let deleted: usize = reports.iter().map(|r| r.deleted.len()).sum();
                    tracing::info!(
                        identities = reports.len(),
                        deleted,
                        "Periodic retention pass finished"
                    );
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "Periodic retention pass failed"),
                Err(e) => tracing::error!(error = %e, "Retention task panicked"),
            }
        }
    })
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Serve until Ctrl+C.
pub async fn run_server(
    addr: &str,
    state: AppState,
    retention_interval: Option<Duration>,
) -> std::io::Result<()> {
    let retention = retention_interval.map(|every| {
        tracing::info!(interval_secs = every.as_secs(), "Retention timer started");
        spawn_retention_task(state.vault.clone(), every)
    });

    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("snapvault HTTP server listening on {}", addr);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(handle) = retention {
        handle.abort();
    }
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
