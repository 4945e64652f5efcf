// SSE framing for the chat-completions stream
//
// Wire contract: a leading `: session_id=<uuid>` comment, one
// `event: <kind>\ndata: <json>` frame per step event, and a final
// `data: [DONE]` line regardless of how the run ended.

use std::convert::Infallible;

use axum::response::sse::Event as SseEvent;
use futures::stream::{self, Stream, StreamExt};
use uuid::Uuid;

use perpetua_contracts::StepEvent;
use perpetua_core::EventReceiver;

enum StreamState {
    Open(EventReceiver),
    /// `done` was forwarded; the `[DONE]` terminator is still owed
    Terminating,
    Closed,
}

fn frame(event: &StepEvent) -> SseEvent {
    SseEvent::default()
        .event(event.kind())
        .data(event.payload().to_string())
}

fn done_line() -> SseEvent {
    SseEvent::default().data("[DONE]")
}

/// Session events as an SSE response stream
pub fn session_stream(
    session_id: Uuid,
    receiver: EventReceiver,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    let comment = stream::once(async move {
        Ok(SseEvent::default().comment(format!("session_id={session_id}")))
    });

    let events = stream::unfold(StreamState::Open(receiver), |state| async move {
        match state {
            StreamState::Open(mut rx) => match rx.recv().await {
                Some(event) => {
                    let next = if matches!(event, StepEvent::Done(_)) {
                        StreamState::Terminating
                    } else {
                        StreamState::Open(rx)
                    };
                    Some((Ok(frame(&event)), next))
                }
                // Producer went away without a done event; close the
                // stream protocol-completely anyway
                None => Some((Ok(done_line()), StreamState::Closed)),
            },
            StreamState::Terminating => Some((Ok(done_line()), StreamState::Closed)),
            StreamState::Closed => None,
        }
    });

    comment.chain(events).boxed()
}

/// Drain a session stream server-side for non-streaming responses
pub struct AccumulatedRun {
    pub content: String,
    pub finish_reason: String,
    pub error: Option<String>,
}

pub async fn accumulate(mut receiver: EventReceiver) -> AccumulatedRun {
    let mut content = String::new();
    let mut finish_reason = "stop".to_string();
    let mut error = None;
    while let Some(event) = receiver.recv().await {
        match &event {
            StepEvent::Message(_) => {
                if let Some(delta) = event.delta_content() {
                    content.push_str(delta);
                }
            }
            StepEvent::Error(e) => error = Some(e.message.clone()),
            StepEvent::Done(done) => {
                finish_reason = done.finish_reason.clone();
                break;
            }
            _ => {}
        }
    }
    AccumulatedRun {
        content,
        finish_reason,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perpetua_core::events::channel;

    #[tokio::test]
    async fn accumulate_collects_deltas_until_done() {
        let (tx, rx) = channel(16);
        tx.send(StepEvent::step_start(1, 10, "go")).await;
        tx.send(StepEvent::message("s", "m", "Hello ")).await;
        tx.send(StepEvent::message("s", "m", "world")).await;
        tx.send(StepEvent::done("stop")).await;

        let run = accumulate(rx).await;
        assert_eq!(run.content, "Hello world");
        assert_eq!(run.finish_reason, "stop");
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn accumulate_captures_error_events() {
        let (tx, rx) = channel(16);
        tx.send(StepEvent::error(1, "llm unavailable")).await;
        tx.send(StepEvent::done("stop")).await;

        let run = accumulate(rx).await;
        assert_eq!(run.error.as_deref(), Some("llm unavailable"));
    }

    #[tokio::test]
    async fn stream_ends_with_done_line_even_without_done_event() {
        let (tx, rx) = channel(16);
        tx.send(StepEvent::step_start(1, 10, "go")).await;
        drop(tx);

        let session_id = Uuid::new_v4();
        let frames: Vec<_> = session_stream(session_id, rx).collect().await;
        // comment + step_start + [DONE]
        assert_eq!(frames.len(), 3);
    }
}
