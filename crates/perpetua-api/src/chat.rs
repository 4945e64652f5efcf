// OpenAI-compatible gateway routes
//
// POST /v1/chat/completions routes by `model`: a template name starts a new
// session; a session id in WAITING_FOR_CLARIFICATION (or correlated via
// chat_id) resumes it. The response is either the live SSE stream or an
// accumulated chat.completion JSON.

use axum::{
    extract::State,
    http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode},
    response::sse::{KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use perpetua_contracts::{Session, SessionState};
use perpetua_core::{PromptsConfig, RuntimeError, TemplateRuntimeConfig};

use crate::sse::{accumulate, session_stream};
use crate::state::AppState;

static X_SESSION_ID: HeaderName = HeaderName::from_static("x-session-id");
static X_SESSION_ERROR: HeaderName = HeaderName::from_static("x-session-error");

/// OpenAI-style chat completions request
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub stream: bool,
    /// Continue an existing session regardless of its wait state
    #[serde(default)]
    pub chat_id: Option<Uuid>,
    /// Search scope for the chat-history tool
    #[serde(default)]
    pub search_all_chats: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ModelResponse {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
    pub version_id: Uuid,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .with_state(state)
}

/// GET /v1/models - active template versions as model ids
#[utoipa::path(
    get,
    path = "/v1/models",
    responses(
        (status = 200, description = "Active models", body = [ModelResponse])
    ),
    tag = "gateway"
)]
pub async fn list_models(
    State(state): State<AppState>,
) -> Result<Json<Value>, StatusCode> {
    let active = state.db.list_active_template_versions().await.map_err(|e| {
        tracing::error!("failed to list models: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let data: Vec<ModelResponse> = active
        .into_iter()
        .map(|(template, version)| ModelResponse {
            id: template.name,
            object: "model",
            owned_by: "perpetua",
            version_id: version.id,
        })
        .collect();
    Ok(Json(json!({"data": data})))
}

/// POST /v1/chat/completions - start or resume a session
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Chat completion (JSON or SSE stream)"),
        (status = 404, description = "Unknown model or session")
    ),
    tag = "gateway"
)]
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(body): Json<ChatCompletionRequest>,
) -> Response {
    let task = extract_task(&body.messages);
    if task.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "request has no user message");
    }

    let routed = match route_request(&state, &body, &task).await {
        Ok(routed) => routed,
        Err(RoutingError::ModelNotFound) => {
            return error_json(StatusCode::NOT_FOUND, "model_not_found")
        }
        Err(RoutingError::Conflict(session_id)) => {
            tracing::warn!(session_id = %session_id, "concurrent resume lost the CAS");
            return error_json(StatusCode::CONFLICT, "stale_session");
        }
        Err(RoutingError::Internal(e)) => {
            tracing::error!("chat completion routing failed: {e}");
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };
    let session_id = routed.session_id;

    // The worker produces into this channel once it claims the session
    let receiver = state.pool.stream_hub().attach(session_id);
    match state.db.find_idle_instance(routed.template_id).await {
        Ok(Some(instance)) => {
            tracing::info!(
                session_id = %session_id,
                instance = %instance.name,
                "dispatching to idle instance"
            );
        }
        Ok(None) => {
            // No slot free right now; the session stays queued until a
            // worker's poll or this notification picks it up
            tracing::info!(session_id = %session_id, "no idle instance, session queued");
        }
        Err(e) => tracing::warn!(session_id = %session_id, error = %e, "idle instance lookup failed"),
    }
    state.pool.notify(routed.template_id);

    let Some(receiver) = receiver else {
        tracing::error!(session_id = %session_id, "event stream already attached");
        return error_json(StatusCode::CONFLICT, "stream already attached");
    };

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&session_id.to_string()) {
        headers.insert(X_SESSION_ID.clone(), value);
    }

    if body.stream {
        let stream = session_stream(session_id, receiver);
        let response = Sse::new(stream).keep_alive(KeepAlive::default());
        return (headers, response).into_response();
    }

    // Non-streaming: drain the stream server-side until done
    let run = accumulate(receiver).await;
    if let Some(error) = &run.error {
        if let Ok(value) = HeaderValue::from_str(&sanitize_header(error)) {
            headers.insert(X_SESSION_ERROR.clone(), value);
        }
    }
    let content = if run.content.is_empty() {
        run.error.unwrap_or_else(|| "Task produced no output.".to_string())
    } else {
        run.content
    };
    let payload = json!({
        "id": session_id,
        "object": "chat.completion",
        "model": routed.model_name,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": run.finish_reason,
        }],
    });
    (headers, Json(payload)).into_response()
}

struct RoutedSession {
    session_id: Uuid,
    template_id: Uuid,
    model_name: String,
}

enum RoutingError {
    ModelNotFound,
    Conflict(Uuid),
    Internal(RuntimeError),
}

impl From<RuntimeError> for RoutingError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::StaleSession(id) => RoutingError::Conflict(id),
            other => RoutingError::Internal(other),
        }
    }
}

async fn route_request(
    state: &AppState,
    body: &ChatCompletionRequest,
    task: &str,
) -> Result<RoutedSession, RoutingError> {
    // Template name → new session
    if let Some(template) = state.db.get_template_by_name(&body.model).await? {
        let (config, prompts) = load_runtime(state, &template.id).await?;
        let session = state
            .session_service
            .start_session(&config, &prompts, &state.pool.catalog(), task, None)
            .await?;
        if body.search_all_chats {
            mark_search_all_chats(state, &session).await?;
        }
        return Ok(RoutedSession {
            session_id: session.id,
            template_id: template.id,
            model_name: config.template_name,
        });
    }

    // Session id → clarification resume
    let Ok(session_id) = body.model.parse::<Uuid>() else {
        return Err(RoutingError::ModelNotFound);
    };
    let Some(session) = state.db.get_session(session_id).await? else {
        return Err(RoutingError::ModelNotFound);
    };
    let correlated = body.chat_id == Some(session.id);
    if session.state != SessionState::WaitingForClarification && !correlated {
        return Err(RoutingError::ModelNotFound);
    }

    let version = state
        .db
        .get_template_version(session.template_version_id)
        .await?
        .ok_or(RoutingError::ModelNotFound)?;
    let (config, prompts) = load_runtime(state, &version.template_id).await?;

    state
        .session_service
        .resume_with_clarification(&session, &prompts, task)
        .await?;

    Ok(RoutedSession {
        session_id: session.id,
        template_id: version.template_id,
        model_name: config.template_name,
    })
}

async fn load_runtime(
    state: &AppState,
    template_id: &Uuid,
) -> Result<(TemplateRuntimeConfig, PromptsConfig), RoutingError> {
    let template = state
        .db
        .get_template(*template_id)
        .await?
        .ok_or(RoutingError::ModelNotFound)?;
    let version_id = template
        .active_version_id
        .ok_or(RoutingError::ModelNotFound)?;
    let version = state
        .db
        .get_template_version(version_id)
        .await?
        .ok_or(RoutingError::ModelNotFound)?;
    let config = TemplateRuntimeConfig::from_parts(&template, &version)
        .map_err(RoutingError::Internal)?;
    let defaults = state.db.list_system_prompts().await?;
    let prompts = PromptsConfig::resolve(&defaults, &config.prompts);
    Ok((config, prompts))
}

async fn mark_search_all_chats(state: &AppState, session: &Session) -> Result<(), RoutingError> {
    let mut context = perpetua_core::SessionContext::from_value(&session.context)
        .map_err(RoutingError::Internal)?;
    context.search_all_chats = true;
    state
        .db
        .update_session_context(session.id, &context)
        .await?;
    Ok(())
}

/// Last user message of the request body, as plain text
fn extract_task(messages: &[Value]) -> String {
    let Some(last) = messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
    else {
        return String::new();
    };
    match last.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

fn sanitize_header(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .take(200)
        .collect()
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({"error": {"message": message, "type": "invalid_request_error"}})),
    )
        .into_response()
}
