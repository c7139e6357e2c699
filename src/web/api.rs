//! Defines the Axum API routes and handlers.

use crate::dispatch::DispatchError;
use crate::error::JobError;
use crate::gcode::HostDispatcher;
use crate::print_job::{PrintJobController, StatusSnapshot};
use crate::print_stats::PrintStats;
use crate::web::models::{
    CommandErrorResponse, FileEntry, FileListQuery, GcodeCommandRequest, GcodeCommandResponse,
    JobStatusResponse,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub controller: PrintJobController,
    pub dispatcher: Arc<HostDispatcher>,
    pub stats: Arc<PrintStats>,
}

/// A job operation failure rendered as the structured error reply.
pub struct ApiError(JobError);

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            JobError::Busy | JobError::NoFileSelected | JobError::ResetFromStream => {
                StatusCode::CONFLICT
            }
            JobError::FileNotFound(_) | JobError::OpenFailed { .. } => StatusCode::NOT_FOUND,
            JobError::MissingFilename
            | JobError::InvalidParameter { .. }
            | JobError::WriteUnsupported => StatusCode::BAD_REQUEST,
            JobError::CatalogUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self.0.reply())).into_response()
    }
}

/// Creates the Axum router with all the API endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/job", get(get_job))
        .route("/api/v1/files", get(list_files))
        .route("/api/v1/gcode", post(execute_gcode))
        .route("/api/v1/job/pause", post(pause_job))
        .route("/api/v1/job/resume", post(resume_job))
        .route("/api/v1/job/cancel", post(cancel_job))
        .with_state(state)
}

/// Handler to get the current print job status.
async fn get_job(State(state): State<AppState>) -> Json<JobStatusResponse> {
    Json(JobStatusResponse {
        job: state.controller.state().await,
        status: state.controller.status().await,
        print_stats: state.stats.get_status(),
    })
}

async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<FileListQuery>,
) -> Result<Json<Vec<FileEntry>>, ApiError> {
    let files = state.controller.list_files(query.recursive).await?;
    Ok(Json(files.into_iter().map(FileEntry::from).collect()))
}

/// Handler to execute a single G-code command.
async fn execute_gcode(
    State(state): State<AppState>,
    Json(payload): Json<GcodeCommandRequest>,
) -> Result<Json<GcodeCommandResponse>, (StatusCode, Json<CommandErrorResponse>)> {
    match state.dispatcher.run_interactive(&payload.command).await {
        Ok(responses) => Ok(Json(GcodeCommandResponse { responses })),
        Err(DispatchError::Command(error)) => {
            Err((StatusCode::BAD_REQUEST, Json(CommandErrorResponse { error })))
        }
        Err(e @ DispatchError::Internal(_)) => {
            tracing::error!("G-code request '{}' failed: {}", payload.command, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CommandErrorResponse { error: e.to_string() }),
            ))
        }
    }
}

async fn pause_job(State(state): State<AppState>) -> Json<StatusSnapshot> {
    state.controller.pause().await;
    Json(state.controller.status().await)
}

async fn resume_job(State(state): State<AppState>) -> Result<Json<StatusSnapshot>, ApiError> {
    state.controller.resume().await?;
    Ok(Json(state.controller.status().await))
}

async fn cancel_job(State(state): State<AppState>) -> Json<StatusSnapshot> {
    state.controller.cancel().await;
    Json(state.controller.status().await)
}
