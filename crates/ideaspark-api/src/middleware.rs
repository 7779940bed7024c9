use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use ideaspark_types::api::Claims;

use crate::auth::verify_token;
use crate::error::AppError;
use crate::state::AppState;

/// Extract and validate JWT from Authorization header.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(AppError::Unauthorized)?;

    let claims = verify_token(&state.jwt_secret, token)?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Per-user request budget. Must run inside `require_auth`.
pub async fn rate_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(claims) = req.extensions().get::<Claims>() {
        if !state.limiter.check(claims.sub).await {
            return Err(AppError::RateLimited);
        }
    }
    Ok(next.run(req).await)
}
