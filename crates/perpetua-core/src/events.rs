// Per-session event channel
//
// One ephemeral bounded channel per active session: single producer (the
// worker driving the loop), single consumer (the attached HTTP handler).
// Typed step events are never dropped — the producer awaits capacity.
// `message` deltas may be coalesced under backpressure. The channel outlives
// the handler: a consumer disconnect never aborts the loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

use perpetua_contracts::StepEvent;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Producer half of a session event channel
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<StepEvent>,
    /// Delta held back while the channel is full; flushed before typed sends
    pending_delta: Arc<Mutex<Option<StepEvent>>>,
}

impl EventSender {
    /// Send a typed step event, awaiting channel capacity
    ///
    /// Errors after consumer disconnect are ignored: streaming is a view,
    /// not a transaction.
    pub async fn send(&self, event: StepEvent) {
        self.flush_pending().await;
        let _ = self.tx.send(event).await;
    }

    /// Send a `message` delta; under backpressure the delta is coalesced
    /// with any previously held-back delta instead of blocking
    pub fn send_delta(&self, event: StepEvent) {
        debug_assert!(matches!(event, StepEvent::Message(_)));
        let mut pending = self.pending_delta.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(held) = pending.as_mut() {
            held.coalesce_delta(&event);
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => *pending = Some(event),
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    async fn flush_pending(&self) {
        let held = {
            let mut pending = self.pending_delta.lock().unwrap_or_else(|e| e.into_inner());
            pending.take()
        };
        if let Some(event) = held {
            let _ = self.tx.send(event).await;
        }
    }

    /// Flush any coalesced delta; call before the final `done`
    pub async fn flush(&self) {
        self.flush_pending().await;
    }
}

/// Consumer half of a session event channel
pub struct EventReceiver {
    rx: mpsc::Receiver<StepEvent>,
}

impl EventReceiver {
    /// Next event, or None once the producer side is gone
    pub async fn recv(&mut self) -> Option<StepEvent> {
        self.rx.recv().await
    }
}

/// Create a bounded session event channel
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        EventSender {
            tx,
            pending_delta: Arc::new(Mutex::new(None)),
        },
        EventReceiver { rx },
    )
}

struct StreamEntry {
    sender: EventSender,
    receiver: Option<EventReceiver>,
}

/// Registry of live per-session channels
///
/// The worker opens a channel when it claims a session; the gateway attaches
/// to stream it. Whichever side arrives first creates the channel, so a
/// request racing the claim still gets every event.
#[derive(Clone, Default)]
pub struct StreamHub {
    inner: Arc<Mutex<HashMap<Uuid, StreamEntry>>>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer handle for a session, creating the channel if needed
    pub fn open(&self, session_id: Uuid) -> EventSender {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.entry(session_id).or_insert_with(|| {
            let (sender, receiver) = channel(EVENT_CHANNEL_CAPACITY);
            StreamEntry {
                sender,
                receiver: Some(receiver),
            }
        });
        entry.sender.clone()
    }

    /// Take the consumer handle for a session (single-consumer)
    pub fn attach(&self, session_id: Uuid) -> Option<EventReceiver> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.entry(session_id).or_insert_with(|| {
            let (sender, receiver) = channel(EVENT_CHANNEL_CAPACITY);
            StreamEntry {
                sender,
                receiver: Some(receiver),
            }
        });
        entry.receiver.take()
    }

    /// Drop the channel on worker release; pending events remain readable
    /// by an attached consumer until its receiver drains
    pub fn close(&self, session_id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(&session_id);
    }

    pub fn is_open(&self, session_id: Uuid) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.contains_key(&session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (tx, mut rx) = channel(8);
        tx.send(StepEvent::step_start(1, 10, "a")).await;
        tx.send(StepEvent::step_end(1, "completed", Some(5))).await;
        assert_eq!(rx.recv().await.unwrap().kind(), "step_start");
        assert_eq!(rx.recv().await.unwrap().kind(), "step_end");
    }

    #[tokio::test]
    async fn full_channel_coalesces_deltas() {
        let (tx, mut rx) = channel(1);
        tx.send_delta(StepEvent::message("s", "m", "a"));
        // Channel is now full; these get held back and merged
        tx.send_delta(StepEvent::message("s", "m", "b"));
        tx.send_delta(StepEvent::message("s", "m", "c"));

        assert_eq!(rx.recv().await.unwrap().delta_content(), Some("a"));
        tx.flush().await;
        assert_eq!(rx.recv().await.unwrap().delta_content(), Some("bc"));
    }

    #[tokio::test]
    async fn send_after_consumer_drop_is_ignored() {
        let (tx, rx) = channel(2);
        drop(rx);
        // Must not panic or error out
        tx.send(StepEvent::done("stop")).await;
        tx.send_delta(StepEvent::message("s", "m", "late"));
    }

    #[tokio::test]
    async fn hub_pairs_producer_and_consumer_in_any_order() {
        let hub = StreamHub::new();
        let session_id = Uuid::new_v4();

        // Consumer attaches before the worker opens the channel
        let mut rx = hub.attach(session_id).expect("receiver");
        let tx = hub.open(session_id);
        tx.send(StepEvent::done("stop")).await;
        assert_eq!(rx.recv().await.unwrap().kind(), "done");

        // Second attach returns nothing (single consumer)
        assert!(hub.attach(session_id).is_none());
    }

    #[tokio::test]
    async fn close_ends_the_stream() {
        let hub = StreamHub::new();
        let session_id = Uuid::new_v4();
        let tx = hub.open(session_id);
        let mut rx = hub.attach(session_id).expect("receiver");
        tx.send(StepEvent::done("stop")).await;
        drop(tx);
        hub.close(session_id);
        assert_eq!(rx.recv().await.unwrap().kind(), "done");
        assert!(rx.recv().await.is_none());
    }
}
