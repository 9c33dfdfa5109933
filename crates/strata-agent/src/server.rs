//! Management API routes
//!
//! - `POST /api/databases`, `POST /api/users`, `POST /api/grants` run SQL
//! - `POST /api/backups` starts a backup (409 while one runs)
//! - `GET /api/backups`, `GET /api/backups/{id}` read the ledger
//! - `GET /healthz` liveness

use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use tracing::{info, instrument};
use uuid::Uuid;

use strata_common::agent::{
    BackupRecord, CreateBackupRequest, CreateDatabaseRequest, CreateGrantRequest,
    CreateUserRequest, BACKUPS_PATH, DATABASES_PATH, GRANTS_PATH, HEALTH_PATH, USERS_PATH,
};

use crate::backup::BackupService;
use crate::error::ApiError;
use crate::sql::DatabaseAdmin;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    /// SQL administration
    pub admin: DatabaseAdmin,
    /// Backup execution
    pub backups: BackupService,
}

/// Build the management router
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(DATABASES_PATH, post(create_database))
        .route(USERS_PATH, post(create_user))
        .route(GRANTS_PATH, post(create_grant))
        .route(BACKUPS_PATH, post(create_backup).get(list_backups))
        .route(&format!("{BACKUPS_PATH}/{{id}}"), get(get_backup))
        .route(HEALTH_PATH, get(|| async { "ok" }))
        .with_state(state)
}

/// Serve the management API until the process receives ctrl-c
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Management API started");
    axum::serve(listener, routes(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await
}

#[instrument(skip(state))]
async fn create_database(
    State(state): State<AppState>,
    Json(request): Json<CreateDatabaseRequest>,
) -> Result<StatusCode, ApiError> {
    state.admin.create_database(&request).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
async fn create_user(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> Result<StatusCode, ApiError> {
    if request.password.is_empty() {
        return Err(ApiError::BadRequest("password must not be empty".to_string()));
    }
    state.admin.create_user(&request).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
async fn create_grant(
    State(state): State<AppState>,
    Json(request): Json<CreateGrantRequest>,
) -> Result<StatusCode, ApiError> {
    state.admin.create_grant(&request).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, request), fields(backend = %request.backend, location = %request.location))]
async fn create_backup(
    State(state): State<AppState>,
    Json(request): Json<CreateBackupRequest>,
) -> Result<(StatusCode, Json<BackupRecord>), ApiError> {
    let ticket = state.backups.create_backup(request)?;
    Ok((StatusCode::ACCEPTED, Json(ticket.record)))
}

async fn list_backups(State(state): State<AppState>) -> Json<Vec<BackupRecord>> {
    Json(state.backups.list_backups())
}

async fn get_backup(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BackupRecord>, ApiError> {
    state
        .backups
        .get_backup(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("backup {id} not found")))
}
