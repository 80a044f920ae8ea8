//! # API Endpoint Handlers
//!
//! Every handler hands its store work to the blocking pool and waits at most
//! the configured request timeout. A stuck filesystem surfaces as 504 rather
//! than a hung request; the blocking task itself is left to finish.

use super::{
    AppState,
    types::{
        ClearSelectionResponse, CurrentResponse, ErrorResponse, HealthResponse,
        IdentitiesResponse, SelectRequest, SelectionResponse,
    },
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use snapvault_core::{
    CanonicalState, ErrorKind, IdentityId, IngestReceipt, RawExtraction, RetentionReport,
    Snapshot, Vault, VaultError,
};

// =============================================================================
// ERROR MAPPING
// =============================================================================

/// Handler failure, rendered as an [`ErrorResponse`].
#[derive(Debug)]
pub enum ApiError {
    Vault(VaultError),
    Timeout,
    Internal(String),
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        Self::Vault(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::Vault(err) => {
                let status = match err.kind() {
                    ErrorKind::Validation => StatusCode::BAD_REQUEST,
                    ErrorKind::Conflict => StatusCode::CONFLICT,
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    tracing::error!(error = %err, "Store failure");
                }
                (status, ErrorResponse::from_vault(err))
            }
            Self::Timeout => {
                tracing::warn!("Store call exceeded request deadline");
                (
                    StatusCode::GATEWAY_TIMEOUT,
                    ErrorResponse::new("timeout", "store did not respond before the deadline"),
                )
            }
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Blocking task failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("internal", msg.clone()),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Run `f` against the vault on the blocking pool, bounded by the deadline.
async fn with_vault<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Vault) -> Result<T, VaultError> + Send + 'static,
{
    let vault = state.vault.clone();
    let task = tokio::task::spawn_blocking(move || f(vault.as_ref()));
    match tokio::time::timeout(state.request_timeout, task).await {
        Err(_) => Err(ApiError::Timeout),
        Ok(Err(join)) => Err(ApiError::Internal(join.to_string())),
        Ok(Ok(result)) => result.map_err(ApiError::from),
    }
}

fn parse_identity(raw: &str) -> Result<IdentityId, ApiError> {
    IdentityId::new(raw).map_err(|e| ApiError::Vault(e.into()))
}

// =============================================================================
// HEALTH
// =============================================================================

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::ok(state.vault.backend_name()))
}

// =============================================================================
// IDENTITIES
// =============================================================================

/// List every known identity.
pub async fn identities_handler(
    State(state): State<AppState>,
) -> Result<Json<IdentitiesResponse>, ApiError> {
    let identities = with_vault(&state, |vault| vault.identities()).await?;
    Ok(Json(IdentitiesResponse { identities }))
}

/// Ingest one raw extraction for `{id}`.
pub async fn ingest_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(raw): Json<RawExtraction>,
) -> Result<Json<IngestReceipt>, ApiError> {
    let identity = parse_identity(&id)?;
    let receipt = with_vault(&state, move |vault| vault.ingest(&identity, &raw)).await?;
    tracing::info!(
        identity = %id,
        hash = %receipt.hash.short(),
        status = receipt.status.as_str(),
        "Extraction ingested"
    );
    Ok(Json(receipt))
}

/// Snapshots for `{id}`, newest first.
pub async fn history_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Snapshot>>, ApiError> {
    let identity = parse_identity(&id)?;
    let history = with_vault(&state, move |vault| vault.list_history(&identity)).await?;
    Ok(Json(history))
}

/// Current pointer and snapshot for `{id}`.
pub async fn current_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CurrentResponse>, ApiError> {
    let identity = parse_identity(&id)?;
    let current = with_vault(&state, move |vault| {
        vault
            .current(&identity)?
            .ok_or(VaultError::IdentityNotFound(identity))
    })
    .await?;
    let (pointer, snapshot) = current;
    Ok(Json(CurrentResponse { pointer, snapshot }))
}

/// Run a retention pass for `{id}` now.
pub async fn gc_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RetentionReport>, ApiError> {
    let identity = parse_identity(&id)?;
    let report = with_vault(&state, move |vault| vault.collect(&identity)).await?;
    Ok(Json(report))
}

// =============================================================================
// SELECTION
// =============================================================================

pub async fn get_selection_handler(
    State(state): State<AppState>,
) -> Result<Json<SelectionResponse>, ApiError> {
    let selection = with_vault(&state, |vault| vault.active()).await?;
    Ok(Json(SelectionResponse { selection }))
}

/// Select the identity downstream automation should use.
pub async fn put_selection_handler(
    State(state): State<AppState>,
    Json(request): Json<SelectRequest>,
) -> Result<Json<SelectionResponse>, ApiError> {
    let identity = parse_identity(&request.identity_id)?;
    let selection = with_vault(&state, move |vault| vault.select_identity(&identity)).await?;
    Ok(Json(SelectionResponse {
        selection: Some(selection),
    }))
}

pub async fn delete_selection_handler(
    State(state): State<AppState>,
) -> Result<Json<ClearSelectionResponse>, ApiError> {
    let cleared = with_vault(&state, |vault| vault.clear_selection()).await?;
    Ok(Json(ClearSelectionResponse { cleared }))
}

/// Canonical state of the selected identity's current snapshot.
pub async fn resolve_handler(
    State(state): State<AppState>,
) -> Result<Json<CanonicalState>, ApiError> {
    let canonical = with_vault(&state, |vault| vault.resolve_active()).await?;
    Ok(Json(canonical))
}
