// Admin CRUD surface: tools, templates, versions, instances, prompts
//
// The runtime reads from the same store; tool mutations invalidate the
// shared catalog so workers re-resolve within one polling interval.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use perpetua_contracts::{AgentInstance, ListResponse, Template, TemplateVersion, Tool};
use perpetua_storage::{NewInstance, NewTool};

use crate::state::AppState;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateToolRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    "utility".to_string()
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SetActiveRequest {
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SetEnabledRequest {
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateTemplateRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateVersionRequest {
    #[serde(default)]
    pub settings: Option<Value>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub activate: bool,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateInstanceRequest {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub template_id: Uuid,
    /// Pinned version; defaults to the template's active version
    #[serde(default)]
    pub template_version_id: Option<Uuid>,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub priority: i32,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct UpsertPromptRequest {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub placeholders: Vec<String>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/admin/v1/tools", post(create_tool).get(list_tools))
        .route("/admin/v1/tools/:tool_id/active", post(set_tool_active))
        .route(
            "/admin/v1/templates",
            post(create_template).get(list_templates),
        )
        .route(
            "/admin/v1/templates/:template_id/versions",
            post(create_version).get(list_versions),
        )
        .route(
            "/admin/v1/templates/:template_id/versions/:version_id/activate",
            post(activate_version),
        )
        .route(
            "/admin/v1/instances",
            post(create_instance).get(list_instances),
        )
        .route("/admin/v1/instances/:instance_id", get(get_instance))
        .route("/admin/v1/instances/:instance_id/start", post(start_instance))
        .route("/admin/v1/instances/:instance_id/stop", post(stop_instance))
        .route(
            "/admin/v1/instances/:instance_id/enabled",
            post(set_instance_enabled),
        )
        .route("/admin/v1/prompts", get(list_prompts))
        .route("/admin/v1/prompts/:prompt_id", post(upsert_prompt))
        .with_state(state)
}

fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("admin operation failed: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ============================================================================
// Tools
// ============================================================================

#[utoipa::path(
    post,
    path = "/admin/v1/tools",
    request_body = CreateToolRequest,
    responses((status = 201, description = "Tool created", body = Tool)),
    tag = "admin"
)]
pub async fn create_tool(
    State(state): State<AppState>,
    Json(body): Json<CreateToolRequest>,
) -> Result<(StatusCode, Json<Tool>), StatusCode> {
    let tool = state
        .db
        .create_tool(NewTool {
            name: body.name,
            description: body.description,
            entrypoint: body.entrypoint,
            config: body.config.unwrap_or_else(|| json!({})),
            embedding: body.embedding,
            category: body.category,
        })
        .await
        .map_err(internal)?;
    state.pool.catalog().invalidate();
    Ok((StatusCode::CREATED, Json(tool)))
}

#[utoipa::path(
    get,
    path = "/admin/v1/tools",
    responses((status = 200, description = "Tools", body = ListResponse<Tool>)),
    tag = "admin"
)]
pub async fn list_tools(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<Tool>>, StatusCode> {
    let tools = state.db.list_tools(false).await.map_err(internal)?;
    Ok(Json(ListResponse::new(tools)))
}

#[utoipa::path(
    post,
    path = "/admin/v1/tools/{tool_id}/active",
    params(("tool_id" = Uuid, Path, description = "Tool ID")),
    request_body = SetActiveRequest,
    responses(
        (status = 200, description = "Tool updated", body = Tool),
        (status = 404, description = "Tool not found")
    ),
    tag = "admin"
)]
pub async fn set_tool_active(
    State(state): State<AppState>,
    Path(tool_id): Path<Uuid>,
    Json(body): Json<SetActiveRequest>,
) -> Result<Json<Tool>, StatusCode> {
    let tool = state
        .db
        .set_tool_active(tool_id, body.is_active)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    state.pool.catalog().invalidate();
    Ok(Json(tool))
}

// ============================================================================
// Templates & versions
// ============================================================================

#[utoipa::path(
    post,
    path = "/admin/v1/templates",
    request_body = CreateTemplateRequest,
    responses((status = 201, description = "Template created", body = Template)),
    tag = "admin"
)]
pub async fn create_template(
    State(state): State<AppState>,
    Json(body): Json<CreateTemplateRequest>,
) -> Result<(StatusCode, Json<Template>), StatusCode> {
    let template = state
        .db
        .create_template(&body.name, body.description.as_deref())
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(template)))
}

#[utoipa::path(
    get,
    path = "/admin/v1/templates",
    responses((status = 200, description = "Templates", body = ListResponse<Template>)),
    tag = "admin"
)]
pub async fn list_templates(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<Template>>, StatusCode> {
    let templates = state.db.list_templates().await.map_err(internal)?;
    Ok(Json(ListResponse::new(templates)))
}

#[utoipa::path(
    post,
    path = "/admin/v1/templates/{template_id}/versions",
    params(("template_id" = Uuid, Path, description = "Template ID")),
    request_body = CreateVersionRequest,
    responses((status = 201, description = "Version created", body = TemplateVersion)),
    tag = "admin"
)]
pub async fn create_version(
    State(state): State<AppState>,
    Path(template_id): Path<Uuid>,
    Json(body): Json<CreateVersionRequest>,
) -> Result<(StatusCode, Json<TemplateVersion>), StatusCode> {
    let version = state
        .db
        .create_template_version(
            template_id,
            &body.settings.unwrap_or_else(|| json!({})),
            &body.tools,
            body.embedding.as_ref(),
        )
        .await
        .map_err(internal)?;
    let version = if body.activate {
        state
            .db
            .activate_template_version(template_id, version.id)
            .await
            .map_err(internal)?
            .unwrap_or(version)
    } else {
        version
    };
    Ok((StatusCode::CREATED, Json(version)))
}

#[utoipa::path(
    get,
    path = "/admin/v1/templates/{template_id}/versions",
    params(("template_id" = Uuid, Path, description = "Template ID")),
    responses((status = 200, description = "Versions", body = ListResponse<TemplateVersion>)),
    tag = "admin"
)]
pub async fn list_versions(
    State(state): State<AppState>,
    Path(template_id): Path<Uuid>,
) -> Result<Json<ListResponse<TemplateVersion>>, StatusCode> {
    let versions = state
        .db
        .list_template_versions(template_id)
        .await
        .map_err(internal)?;
    Ok(Json(ListResponse::new(versions)))
}

#[utoipa::path(
    post,
    path = "/admin/v1/templates/{template_id}/versions/{version_id}/activate",
    params(
        ("template_id" = Uuid, Path, description = "Template ID"),
        ("version_id" = Uuid, Path, description = "Version ID")
    ),
    responses(
        (status = 200, description = "Activated version", body = TemplateVersion),
        (status = 404, description = "Version not found")
    ),
    tag = "admin"
)]
pub async fn activate_version(
    State(state): State<AppState>,
    Path((template_id, version_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<TemplateVersion>, StatusCode> {
    let version = state
        .db
        .activate_template_version(template_id, version_id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(version))
}

// ============================================================================
// Instances
// ============================================================================

#[utoipa::path(
    post,
    path = "/admin/v1/instances",
    request_body = CreateInstanceRequest,
    responses(
        (status = 201, description = "Instance created", body = AgentInstance),
        (status = 422, description = "Template has no active version")
    ),
    tag = "admin"
)]
pub async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<AgentInstance>), StatusCode> {
    let version_id = match body.template_version_id {
        Some(id) => id,
        None => state
            .db
            .get_template(body.template_id)
            .await
            .map_err(internal)?
            .and_then(|t| t.active_version_id)
            .ok_or(StatusCode::UNPROCESSABLE_ENTITY)?,
    };
    let instance = state
        .db
        .create_instance(NewInstance {
            name: body.name,
            display_name: body.display_name,
            description: body.description,
            template_id: body.template_id,
            template_version_id: version_id,
            is_enabled: body.is_enabled,
            auto_start: body.auto_start,
            priority: body.priority,
        })
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(instance)))
}

#[utoipa::path(
    get,
    path = "/admin/v1/instances",
    responses((status = 200, description = "Instances", body = ListResponse<AgentInstance>)),
    tag = "admin"
)]
pub async fn list_instances(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<AgentInstance>>, StatusCode> {
    let instances = state.db.list_instances().await.map_err(internal)?;
    Ok(Json(ListResponse::new(instances)))
}

#[utoipa::path(
    get,
    path = "/admin/v1/instances/{instance_id}",
    params(("instance_id" = Uuid, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "Instance", body = AgentInstance),
        (status = 404, description = "Instance not found")
    ),
    tag = "admin"
)]
pub async fn get_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<AgentInstance>, StatusCode> {
    let instance = state
        .db
        .get_instance(instance_id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(instance))
}

#[utoipa::path(
    post,
    path = "/admin/v1/instances/{instance_id}/start",
    params(("instance_id" = Uuid, Path, description = "Instance ID")),
    responses((status = 200, description = "Start requested")),
    tag = "admin"
)]
pub async fn start_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<Value>, StatusCode> {
    let started = state
        .pool
        .start_instance(instance_id)
        .await
        .map_err(internal)?;
    Ok(Json(json!({"started": started})))
}

#[utoipa::path(
    post,
    path = "/admin/v1/instances/{instance_id}/stop",
    params(("instance_id" = Uuid, Path, description = "Instance ID")),
    responses((status = 200, description = "Stop requested")),
    tag = "admin"
)]
pub async fn stop_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<Value>, StatusCode> {
    let stopped = state
        .pool
        .stop_instance(instance_id)
        .await
        .map_err(internal)?;
    Ok(Json(json!({"stopped": stopped})))
}

/// Disabling takes effect at the worker's next heartbeat; a BUSY instance
/// finishes its current session first, then goes offline.
#[utoipa::path(
    post,
    path = "/admin/v1/instances/{instance_id}/enabled",
    params(("instance_id" = Uuid, Path, description = "Instance ID")),
    request_body = SetEnabledRequest,
    responses(
        (status = 200, description = "Instance updated", body = AgentInstance),
        (status = 404, description = "Instance not found")
    ),
    tag = "admin"
)]
pub async fn set_instance_enabled(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
    Json(body): Json<SetEnabledRequest>,
) -> Result<Json<AgentInstance>, StatusCode> {
    let instance = state
        .db
        .set_instance_enabled(instance_id, body.is_enabled)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(instance))
}

// ============================================================================
// System prompts
// ============================================================================

#[utoipa::path(
    get,
    path = "/admin/v1/prompts",
    responses((status = 200, description = "System prompts")),
    tag = "admin"
)]
pub async fn list_prompts(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let prompts = state.db.list_system_prompts().await.map_err(internal)?;
    Ok(Json(json!({"data": prompts})))
}

#[utoipa::path(
    post,
    path = "/admin/v1/prompts/{prompt_id}",
    params(("prompt_id" = String, Path, description = "Prompt ID (system, initial_user, clarification)")),
    request_body = UpsertPromptRequest,
    responses((status = 200, description = "Prompt upserted")),
    tag = "admin"
)]
pub async fn upsert_prompt(
    State(state): State<AppState>,
    Path(prompt_id): Path<String>,
    Json(body): Json<UpsertPromptRequest>,
) -> Result<Json<Value>, StatusCode> {
    let prompt = state
        .db
        .upsert_system_prompt(&prompt_id, &body.name, &body.content, &body.placeholders)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::to_value(prompt).unwrap_or(Value::Null)))
}
