// In-process dispatch: the gateway wakes workers of a template without
// waiting for their next poll tick

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use uuid::Uuid;

/// Wakeup channel keyed by template id
///
/// Workers subscribe with their pinned template; the gateway notifies after
/// a session becomes claimable. Purely an optimization over the poll loop:
/// a missed notification is covered by the next tick.
#[derive(Clone, Default)]
pub struct DispatchHub {
    inner: Arc<Mutex<HashMap<Uuid, Arc<Notify>>>>,
}

impl DispatchHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, template_id: Uuid) -> Arc<Notify> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entry(template_id).or_default().clone()
    }

    pub fn notify(&self, template_id: Uuid) {
        let notify = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.get(&template_id).cloned()
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }
}
