// Instance worker: one long-lived task per agent instance row
//
// Lifecycle: OFFLINE → STARTING (prewarm) → IDLE → BUSY (claimed session)
// → IDLE, with ERROR on driver faults and STOPPING → OFFLINE on admin stop.
// Work arrives either through a dispatch notification or the periodic DB
// scan over claimable sessions of the pinned template version.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

use perpetua_contracts::{AgentInstance, ChatMessage, InstanceStatus, MessageRole, MessageType, SessionState};
use perpetua_core::driver::AgentLoopDriver;
use perpetua_core::{
    OpenAiDriver, PromptsConfig, RuntimeError, StreamHub, TemplateRuntimeConfig, ToolCatalog,
    ToolStore,
};
use perpetua_storage::{Database, ReleaseOutcome};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLAIM_BATCH: i64 = 5;

pub struct InstanceWorker {
    db: Database,
    instance: AgentInstance,
    config: TemplateRuntimeConfig,
    prompts: PromptsConfig,
    catalog: Arc<ToolCatalog>,
    hub: StreamHub,
    dispatch: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
}

impl InstanceWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        instance: AgentInstance,
        config: TemplateRuntimeConfig,
        prompts: PromptsConfig,
        catalog: Arc<ToolCatalog>,
        hub: StreamHub,
        dispatch: Arc<Notify>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            instance,
            config,
            prompts,
            catalog,
            hub,
            dispatch,
            shutdown,
        }
    }

    /// Run the worker until shutdown, admin stop, or a driver fault
    pub async fn run(self) {
        let instance_id = self.instance.id;
        let name = self.instance.name.clone();

        if let Err(e) = self.startup().await {
            error!(instance = %name, error = %e, "instance startup failed");
            let _ = self.db.record_instance_error(instance_id, &e.to_string()).await;
            return;
        }
        info!(instance = %name, template = %self.config.template_name, "instance online");

        let mut shutdown = self.shutdown.clone();
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(instance = %name, "shutdown signal received");
                        break;
                    }
                }
                _ = self.dispatch.notified() => {
                    if !self.drain_claimable().await {
                        return;
                    }
                }
                _ = poll.tick() => {
                    if !self.drain_claimable().await {
                        return;
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.db.heartbeat(instance_id).await {
                        warn!(instance = %name, error = %e, "heartbeat failed");
                    }
                    if self.admin_stop_requested().await {
                        info!(instance = %name, "stop requested, going offline");
                        // STOPPING on admin stop, still IDLE when disabled
                        let offline = self
                            .db
                            .set_instance_status(instance_id, InstanceStatus::Stopping, InstanceStatus::Offline)
                            .await
                            .unwrap_or(false)
                            || self
                                .db
                                .set_instance_status(instance_id, InstanceStatus::Idle, InstanceStatus::Offline)
                                .await
                                .unwrap_or(false);
                        if !offline {
                            warn!(instance = %name, "offline transition lost a status race");
                        }
                        return;
                    }
                }
            }
        }

        // Process shutdown: leave the slot cleanly offline
        let _ = self
            .db
            .set_instance_status(instance_id, InstanceStatus::Idle, InstanceStatus::Offline)
            .await;
    }

    /// OFFLINE/ERROR → STARTING → IDLE with catalog prewarm in between
    async fn startup(&self) -> perpetua_core::Result<()> {
        let id = self.instance.id;
        let to_starting = self
            .db
            .set_instance_status(id, InstanceStatus::Offline, InstanceStatus::Starting)
            .await?
            || self
                .db
                .set_instance_status(id, InstanceStatus::Error, InstanceStatus::Starting)
                .await?;
        if !to_starting {
            return Err(RuntimeError::config(format!(
                "instance {} is not in a startable status",
                self.instance.name
            )));
        }

        // Prewarm: resolve the catalog before accepting work
        let tools = self.db.list_active_tools().await?;
        self.catalog.refresh(tools);

        if !self
            .db
            .set_instance_status(id, InstanceStatus::Starting, InstanceStatus::Idle)
            .await?
        {
            return Err(RuntimeError::config(format!(
                "instance {} left STARTING concurrently",
                self.instance.name
            )));
        }
        Ok(())
    }

    async fn admin_stop_requested(&self) -> bool {
        matches!(
            self.db.get_instance(self.instance.id).await,
            Ok(Some(row)) if row.status == InstanceStatus::Stopping || !row.is_enabled
        )
    }

    /// Claim and process sessions until none are left
    ///
    /// Returns false when a driver fault parked the instance in ERROR; the
    /// worker task exits and an admin restart re-spawns it.
    async fn drain_claimable(&self) -> bool {
        loop {
            if *self.shutdown.borrow() {
                return true;
            }
            if self.catalog.is_stale() {
                match self.db.list_active_tools().await {
                    Ok(tools) => self.catalog.refresh(tools),
                    Err(e) => warn!(error = %e, "catalog reload failed"),
                }
            }

            let candidates = match self
                .db
                .find_claimable_sessions(self.config.version_id, CLAIM_BATCH)
                .await
            {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(error = %e, "claimable session scan failed");
                    return true;
                }
            };
            if candidates.is_empty() {
                return true;
            }

            let mut claimed = None;
            for candidate in candidates {
                match self.db.claim_instance(self.instance.id, candidate.id).await {
                    // First writer wins; losers keep scanning
                    Ok(true) => {
                        claimed = Some(candidate.id);
                        break;
                    }
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(session_id = %candidate.id, error = %e, "claim failed");
                        continue;
                    }
                }
            }
            let Some(session_id) = claimed else {
                return true;
            };

            if !self.process_session(session_id).await {
                return false;
            }
        }
    }

    /// Drive one claimed session; returns false on a driver fault
    async fn process_session(&self, session_id: Uuid) -> bool {
        info!(
            instance = %self.instance.name,
            session_id = %session_id,
            "processing session"
        );

        let events = self.hub.open(session_id);
        let llm = Arc::new(build_llm_driver(&self.config));
        let driver = AgentLoopDriver::new(
            Arc::new(self.db.clone()),
            llm,
            self.catalog.clone(),
            self.config.clone(),
            self.prompts.clone(),
            events,
        )
        .with_shutdown(self.shutdown.clone());

        let outcome = driver.run(session_id).await;
        self.hub.close(session_id);

        let release = match &outcome {
            Ok(outcome) => ReleaseOutcome {
                error: None,
                messages: outcome.messages_appended as i64,
                tool_calls: outcome.tool_calls_made as i64,
                tool_errors: outcome.had_tool_errors,
            },
            Err(e) => ReleaseOutcome {
                error: Some(e.to_string()),
                ..Default::default()
            },
        };
        if let Err(e) = self.db.release_instance(self.instance.id, &release).await {
            error!(instance = %self.instance.name, error = %e, "release failed");
            return false;
        }

        match outcome {
            Ok(outcome) => {
                info!(
                    instance = %self.instance.name,
                    session_id = %session_id,
                    state = %outcome.final_state,
                    finish_reason = %outcome.finish_reason,
                    "session run finished"
                );
                if outcome.final_state == SessionState::Completed {
                    if let Err(e) = self.record_chat_turn(session_id).await {
                        warn!(session_id = %session_id, error = %e, "chat turn not recorded");
                    }
                }
                true
            }
            Err(e) => {
                // The session's instance binding is already cleared, so
                // another worker of the pinned version can pick it up
                error!(
                    instance = %self.instance.name,
                    session_id = %session_id,
                    error = %e,
                    "driver fault"
                );
                false
            }
        }
    }
}

impl InstanceWorker {
    /// Derive a searchable Q/A pair from a completed session
    async fn record_chat_turn(&self, session_id: Uuid) -> perpetua_core::Result<()> {
        let session = self
            .db
            .get_session(session_id)
            .await?
            .ok_or(RuntimeError::SessionNotFound(session_id))?;
        let context = perpetua_core::SessionContext::from_value(&session.context)?;
        let Some(answer) = context.execution_result else {
            return Ok(());
        };

        let messages = self.db.list_session_messages(session_id).await?;
        let question = messages
            .iter()
            .filter(|m| m.message_type == MessageType::Message && m.role == MessageRole::User)
            .filter_map(|m| serde_json::from_value::<ChatMessage>(m.content.clone()).ok())
            .map(|m| m.content_text().to_string())
            .next()
            .unwrap_or_default();
        if question.is_empty() {
            return Ok(());
        }

        self.db
            .insert_chat_turn(session_id, &question, &answer, Some(&self.config.template_name))
            .await
    }
}

/// OpenAI-protocol driver for a template's LLM policy
pub fn build_llm_driver(config: &TemplateRuntimeConfig) -> OpenAiDriver {
    let api_key = config.resolve_api_key().unwrap_or_default();
    match &config.llm_policy.base_url {
        Some(base_url) => OpenAiDriver::with_base_url(api_key, base_url.clone()),
        None => OpenAiDriver::new(api_key),
    }
}
