// Shared app state for gateway and admin routes

use std::sync::Arc;

use perpetua_storage::Database;
use perpetua_worker::InstancePool;

use crate::services::SessionService;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub pool: InstancePool,
    pub session_service: Arc<SessionService>,
}

impl AppState {
    pub fn new(db: Arc<Database>, pool: InstancePool) -> Self {
        Self {
            session_service: Arc::new(SessionService::new(db.clone())),
            db,
            pool,
        }
    }
}
