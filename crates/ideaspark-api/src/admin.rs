use axum::{
    Extension, Json,
    extract::{Query, State},
    response::IntoResponse,
};
use serde::Deserialize;

use ideaspark_types::api::{ApiResponse, Claims};
use ideaspark_types::models::UserRole;

use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_FAILED_LIMIT: u32 = 50;

#[derive(Debug, Deserialize)]
pub struct FailedJobsQuery {
    pub limit: Option<u32>,
}

/// Dead-lettered jobs, newest first. Admins only.
pub async fn failed_jobs(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<FailedJobsQuery>,
) -> Result<impl IntoResponse, AppError> {
    if claims.role != UserRole::Admin {
        return Err(AppError::Forbidden("Admin access required".into()));
    }
    let limit = query.limit.unwrap_or(DEFAULT_FAILED_LIMIT).clamp(1, 200);
    let jobs = state.queue.failed_jobs(limit).await?;
    Ok(Json(ApiResponse::ok("Failed jobs retrieved", jobs)))
}
