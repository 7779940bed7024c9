use anyhow::Context;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand_core::OsRng;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use ideaspark_types::api::{ApiResponse, AuthResponse, Claims, LoginRequest, RegisterRequest};
use ideaspark_types::models::UserRole;

use crate::error::AppError;
use crate::mailer::WELCOME_EMAIL;
use crate::state::AppState;

const WELCOME_PRIORITY: i64 = 5;

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    // Validate input
    let username = req.username.trim();
    if username.len() < 3 || username.len() > 32 {
        return Err(AppError::Validation(
            "Username must be between 3 and 32 characters".into(),
        ));
    }
    if req.password.len() < 8 {
        return Err(AppError::Validation(
            "Password must be at least 8 characters".into(),
        ));
    }
    let email = req.email.as_deref().map(str::trim).filter(|e| !e.is_empty());
    if email.is_some_and(|e| !e.contains('@')) {
        return Err(AppError::Validation("Email address is invalid".into()));
    }

    let password_hash = hash_password(&req.password)?;

    let (name, mail, daily_ideas) = (
        username.to_string(),
        email.map(str::to_string),
        state.daily_ideas,
    );
    let user = state
        .db
        .run(move |db| db.create_user(&name, &password_hash, mail.as_deref(), daily_ideas))
        .await?;
    info!("Registered {} ({})", user.username, user.id);

    if let Some(email) = &user.email {
        let payload = json!({ "email": email, "username": user.username });
        if let Err(e) = state.queue.enqueue(WELCOME_EMAIL, payload, WELCOME_PRIORITY).await {
            warn!("Could not queue welcome email for {}: {}", user.id, e);
        }
    }

    let token = create_token(
        &state.jwt_secret,
        user.id,
        &user.username,
        user.role,
        state.token_ttl_days,
    )
    .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(
            "User registered successfully",
            AuthResponse {
                user_id: user.id,
                username: user.username,
                token,
            },
        )),
    ))
}

/// Argon2id with a fresh OS-random salt.
fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::Internal(format!("password hashing failed: {}", e)))?
        .to_string())
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let username = req.username.trim().to_string();
    let user = state
        .db
        .run(move |db| db.get_credentials(&username))
        .await?
        .ok_or(AppError::Unauthorized)?;

    // Verify password
    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| AppError::Internal(format!("stored hash unreadable: {}", e)))?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| AppError::Unauthorized)?;

    let token = create_token(
        &state.jwt_secret,
        user.id,
        &user.username,
        user.role,
        state.token_ttl_days,
    )
    .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(ApiResponse::ok(
        "Login successful",
        AuthResponse {
            user_id: user.id,
            username: user.username,
            token,
        },
    )))
}

/// Profile of the caller, including what is left of today's idea budget.
pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, AppError> {
    let user = state.db.run(move |db| db.get_user(claims.sub)).await?;
    Ok(Json(ApiResponse::ok("Profile retrieved", user)))
}

pub fn create_token(
    secret: &str,
    user_id: Uuid,
    username: &str,
    role: UserRole,
    ttl_days: i64,
) -> anyhow::Result<String> {
    let expires = chrono::Duration::try_days(ttl_days)
        .and_then(|ttl| chrono::Utc::now().checked_add_signed(ttl))
        .context("token lifetime out of range")?;
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        role,
        exp: expires.timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

pub fn verify_token(secret: &str, token: &str) -> Result<Claims, AppError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| AppError::Unauthorized)
}
