// Session browsing routes: list, rename, delete, and message history

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use perpetua_contracts::{ListResponse, MessageRole, MessageType, Session};

use crate::state::AppState;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ChatSessionResponse {
    pub id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub state: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct UpdateChatRequest {
    pub title: String,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/chats", get(list_chats))
        .route(
            "/v1/chats/:chat_id",
            get(get_chat).put(update_chat).delete(delete_chat),
        )
        .route("/v1/chats/:chat_id/messages", get(get_chat_messages))
        .with_state(state)
}

async fn to_response(state: &AppState, session: Session) -> ChatSessionResponse {
    let model = match state.db.get_template_version(session.template_version_id).await {
        Ok(Some(version)) => match state.db.get_template(version.template_id).await {
            Ok(Some(template)) => Some(template.name),
            _ => None,
        },
        _ => None,
    };
    ChatSessionResponse {
        id: session.id,
        title: session.title.unwrap_or_else(|| "New Chat".to_string()),
        model,
        state: session.state.to_string(),
        created_at: session.created_at.to_rfc3339(),
        updated_at: session.updated_at.to_rfc3339(),
    }
}

/// GET /v1/chats - list sessions, most recently updated first
#[utoipa::path(
    get,
    path = "/v1/chats",
    responses((status = 200, description = "Sessions", body = ListResponse<ChatSessionResponse>)),
    tag = "chats"
)]
pub async fn list_chats(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<ChatSessionResponse>>, StatusCode> {
    let sessions = state.db.list_sessions(100).await.map_err(|e| {
        tracing::error!("failed to list sessions: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let mut chats = Vec::with_capacity(sessions.len());
    for session in sessions {
        chats.push(to_response(&state, session).await);
    }
    Ok(Json(ListResponse::new(chats)))
}

/// GET /v1/chats/{chat_id}
#[utoipa::path(
    get,
    path = "/v1/chats/{chat_id}",
    params(("chat_id" = Uuid, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Session", body = ChatSessionResponse),
        (status = 404, description = "Session not found")
    ),
    tag = "chats"
)]
pub async fn get_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
) -> Result<Json<ChatSessionResponse>, StatusCode> {
    let session = state
        .db
        .get_session(chat_id)
        .await
        .map_err(|e| {
            tracing::error!("failed to get session: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(to_response(&state, session).await))
}

/// PUT /v1/chats/{chat_id} - rename
#[utoipa::path(
    put,
    path = "/v1/chats/{chat_id}",
    params(("chat_id" = Uuid, Path, description = "Session ID")),
    request_body = UpdateChatRequest,
    responses(
        (status = 200, description = "Updated session", body = ChatSessionResponse),
        (status = 404, description = "Session not found")
    ),
    tag = "chats"
)]
pub async fn update_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Json(body): Json<UpdateChatRequest>,
) -> Result<Json<ChatSessionResponse>, StatusCode> {
    let session = state
        .db
        .update_session_title(chat_id, &body.title)
        .await
        .map_err(|e| {
            tracing::error!("failed to update session title: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(to_response(&state, session).await))
}

/// DELETE /v1/chats/{chat_id}
#[utoipa::path(
    delete,
    path = "/v1/chats/{chat_id}",
    params(("chat_id" = Uuid, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Deleted"),
        (status = 404, description = "Session not found")
    ),
    tag = "chats"
)]
pub async fn delete_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
) -> Result<Json<Value>, StatusCode> {
    let deleted = state.db.delete_session(chat_id).await.map_err(|e| {
        tracing::error!("failed to delete session: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if !deleted {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({"message": "Chat deleted successfully"})))
}

/// GET /v1/chats/{chat_id}/messages - history including agent steps
///
/// System prompts are filtered out; step records (tool calls, thinking,
/// step markers) are included for UI rendering.
#[utoipa::path(
    get,
    path = "/v1/chats/{chat_id}/messages",
    params(("chat_id" = Uuid, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Messages"),
        (status = 404, description = "Session not found")
    ),
    tag = "chats"
)]
pub async fn get_chat_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
) -> Result<Json<Value>, StatusCode> {
    let session = state
        .db
        .get_session(chat_id)
        .await
        .map_err(|e| {
            tracing::error!("failed to get session: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    let messages = state
        .db
        .list_session_messages(session.id)
        .await
        .map_err(|e| {
            tracing::error!("failed to list messages: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let data: Vec<Value> = messages
        .iter()
        .filter(|m| !(m.role == MessageRole::System && m.message_type == MessageType::Message))
        .map(|m| {
            json!({
                "id": m.id,
                "role": m.role,
                "content": m.content,
                "message_type": m.message_type,
                "step_number": m.step_number,
                "step_data": m.step_data,
                "created_at": m.created_at.to_rfc3339(),
            })
        })
        .collect();

    Ok(Json(json!({"data": data})))
}
