// Perpetua API server
//
// Boots the shared store, the instance pool, and the HTTP gateway in one
// process. Auto-start instances come online before the listener accepts
// traffic; ctrl-c drains workers at a step boundary before exit.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use perpetua_api::state::AppState;
use perpetua_api::{admin, chat, chats, router};
use perpetua_contracts::{AgentInstance, Template, TemplateVersion, Tool};
use perpetua_core::StreamHub;
use perpetua_storage::Database;
use perpetua_worker::InstancePool;

#[derive(OpenApi)]
#[openapi(
    paths(
        chat::chat_completions,
        chat::list_models,
        chats::list_chats,
        chats::get_chat,
        chats::update_chat,
        chats::delete_chat,
        chats::get_chat_messages,
        admin::create_tool,
        admin::list_tools,
        admin::set_tool_active,
        admin::create_template,
        admin::list_templates,
        admin::create_version,
        admin::list_versions,
        admin::activate_version,
        admin::create_instance,
        admin::list_instances,
        admin::get_instance,
        admin::start_instance,
        admin::stop_instance,
        admin::set_instance_enabled,
        admin::list_prompts,
        admin::upsert_prompt,
    ),
    components(
        schemas(
            Template, TemplateVersion, Tool, AgentInstance,
            chat::ChatCompletionRequest,
            chat::ModelResponse,
            chats::ChatSessionResponse,
            chats::UpdateChatRequest,
            admin::CreateToolRequest,
            admin::SetActiveRequest,
            admin::SetEnabledRequest,
            admin::CreateTemplateRequest,
            admin::CreateVersionRequest,
            admin::CreateInstanceRequest,
            admin::UpsertPromptRequest,
        )
    ),
    tags(
        (name = "gateway", description = "OpenAI-compatible chat completions"),
        (name = "chats", description = "Session browsing"),
        (name = "admin", description = "Templates, tools, instances, prompts")
    ),
    info(
        title = "Perpetua API",
        version = "0.1.0",
        description = "Persistent multi-agent runtime"
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perpetua=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("perpetua-api starting...");

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let db = Database::from_url(&database_url)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run migrations")?;
    tracing::info!("Connected to database");

    let pool = InstancePool::new(db.clone(), StreamHub::new());
    let started = pool
        .start()
        .await
        .context("Failed to start instance pool")?;
    tracing::info!(instances = started, "Instance pool online");

    let state = AppState::new(Arc::new(db), pool.clone());
    let app = router(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()));

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:9000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", addr);

    let shutdown_pool = pool.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received, draining workers");
            shutdown_pool.shutdown();
        })
        .await
        .context("Server error")?;

    Ok(())
}
