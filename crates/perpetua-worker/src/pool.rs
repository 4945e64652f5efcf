// Instance pool: spawns and supervises one worker task per agent instance

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use perpetua_contracts::InstanceStatus;
use perpetua_core::tools::builtin::{builtin_registry, BuiltinDeps};
use perpetua_core::{
    PromptsConfig, Result, RuntimeError, StreamHub, TemplateRuntimeConfig, TemplateStore,
    ToolCatalog, ToolStore,
};
use perpetua_storage::Database;

use crate::dispatch::DispatchHub;
use crate::worker::InstanceWorker;

/// Process-wide pool of named worker slots
///
/// The pool owns the shared tool catalog and the shutdown signal; workers
/// are plain tokio tasks that exit on shutdown, admin stop, or fault.
#[derive(Clone)]
pub struct InstancePool {
    db: Database,
    hub: StreamHub,
    dispatch: DispatchHub,
    catalog: Arc<ToolCatalog>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl InstancePool {
    pub fn new(db: Database, hub: StreamHub) -> Self {
        let deps = BuiltinDeps {
            http: reqwest::Client::new(),
            store: Some(Arc::new(db.clone()) as Arc<dyn ToolStore>),
        };
        let catalog = Arc::new(ToolCatalog::new(builtin_registry(deps)));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            db,
            hub,
            dispatch: DispatchHub::new(),
            catalog,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn dispatch_hub(&self) -> DispatchHub {
        self.dispatch.clone()
    }

    pub fn stream_hub(&self) -> StreamHub {
        self.hub.clone()
    }

    /// Shared catalog handle; admin mutations call `invalidate` on it
    pub fn catalog(&self) -> Arc<ToolCatalog> {
        self.catalog.clone()
    }

    /// Boot: spawn workers for enabled auto_start instances
    pub async fn start(&self) -> Result<usize> {
        let tools = self.db.list_active_tools().await?;
        self.catalog.refresh(tools);

        let instances = self.db.list_enabled_instances().await?;
        let mut started = 0;
        for instance in instances.iter().filter(|i| i.auto_start) {
            match self.spawn_worker(instance.id).await {
                Ok(()) => started += 1,
                Err(e) => warn!(instance = %instance.name, error = %e, "failed to start instance"),
            }
        }
        info!(started, "instance pool started");
        Ok(started)
    }

    /// Admin start: spawn a worker for one instance
    pub async fn start_instance(&self, instance_id: Uuid) -> Result<bool> {
        let Some(instance) = self.db.get_instance(instance_id).await? else {
            return Ok(false);
        };
        if !instance.is_enabled {
            return Err(RuntimeError::config(format!(
                "instance {} is disabled",
                instance.name
            )));
        }
        if matches!(instance.status, InstanceStatus::Idle | InstanceStatus::Busy) {
            return Ok(false);
        }
        self.spawn_worker(instance_id).await?;
        Ok(true)
    }

    /// Admin stop: request the worker to go offline
    ///
    /// IDLE workers observe STOPPING on their next heartbeat; ERROR slots
    /// (whose worker already exited) go straight to OFFLINE.
    pub async fn stop_instance(&self, instance_id: Uuid) -> Result<bool> {
        let stopping = self
            .db
            .set_instance_status(instance_id, InstanceStatus::Idle, InstanceStatus::Stopping)
            .await?
            || self
                .db
                .set_instance_status(instance_id, InstanceStatus::Error, InstanceStatus::Offline)
                .await?;
        Ok(stopping)
    }

    /// Wake workers pinned to a template after a session became claimable
    pub fn notify(&self, template_id: Uuid) {
        self.dispatch.notify(template_id);
    }

    /// Signal all workers to drain and stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn spawn_worker(&self, instance_id: Uuid) -> Result<()> {
        let instance = self
            .db
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| RuntimeError::config(format!("unknown instance {instance_id}")))?;

        let template = self
            .db
            .get_template(instance.template_id)
            .await?
            .ok_or_else(|| {
                RuntimeError::config(format!("instance {} has no template", instance.name))
            })?;
        let version = self
            .db
            .get_version(instance.template_version_id)
            .await?
            .ok_or_else(|| {
                RuntimeError::config(format!("instance {} has no pinned version", instance.name))
            })?;
        let config = TemplateRuntimeConfig::from_parts(&template, &version)?;

        let defaults = self.db.list_system_prompts().await?;
        let prompts = PromptsConfig::resolve(&defaults, &config.prompts);

        let dispatch = self.dispatch.subscribe(instance.template_id);
        let worker = InstanceWorker::new(
            self.db.clone(),
            instance,
            config,
            prompts,
            self.catalog.clone(),
            self.hub.clone(),
            dispatch,
            self.shutdown_tx.subscribe(),
        );
        tokio::spawn(worker.run());
        Ok(())
    }
}
