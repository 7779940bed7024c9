use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use uuid::Uuid;

use ideaspark_types::api::{
    ApiResponse, Claims, CreateConversationRequest, IdeaFilter, SendMessageRequest,
};
use ideaspark_types::pagination::PaginationQuery;

use crate::error::AppError;
use crate::state::AppState;

pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let conversation = state
        .conversations
        .create_conversation(claims.sub, req.title.as_deref(), &req.message)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok("Conversation created successfully", conversation)),
    ))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PaginationQuery>,
) -> Result<impl IntoResponse, AppError> {
    let page = state
        .conversations
        .list_conversations(claims.sub, &query)
        .await?;
    Ok(Json(ApiResponse::ok("Conversations retrieved successfully", page)))
}

pub async fn conversation_feed(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PaginationQuery>,
) -> Result<impl IntoResponse, AppError> {
    let page = state
        .conversations
        .conversation_feed(claims.sub, &query)
        .await?;
    Ok(Json(ApiResponse::ok("Conversations retrieved successfully", page)))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state
        .conversations
        .delete_conversation(conversation_id, claims.sub)
        .await?;
    Ok(Json(ApiResponse::ok(
        "Conversation deleted successfully",
        json!({ "id": conversation_id }),
    )))
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, AppError> {
    let message = state
        .conversations
        .send_message(conversation_id, claims.sub, &req.content)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok("Message sent successfully", message)),
    ))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<PaginationQuery>,
) -> Result<impl IntoResponse, AppError> {
    let page = state
        .conversations
        .list_messages(conversation_id, claims.sub, &query)
        .await?;
    Ok(Json(ApiResponse::ok("Messages retrieved successfully", page)))
}

pub async fn scroll_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<PaginationQuery>,
) -> Result<impl IntoResponse, AppError> {
    let page = state
        .conversations
        .scroll_messages(conversation_id, claims.sub, &query)
        .await?;
    Ok(Json(ApiResponse::ok("Messages retrieved successfully", page)))
}

pub async fn list_ideas(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(filter): Query<IdeaFilter>,
    Query(query): Query<PaginationQuery>,
) -> Result<impl IntoResponse, AppError> {
    let page = state
        .conversations
        .list_ideas(claims.sub, filter.category, &query)
        .await?;
    Ok(Json(ApiResponse::ok("Ideas retrieved successfully", page)))
}
