use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use futures::{stream, Stream};
use mcp_studio_error::StudioError;
use mcp_studio_output::OutputEvent;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};

use crate::process::{AgentProcess, ViewerAttachment};

pub const HEARTBEAT_COMMENT: &str = "heartbeat";

/// Detaches the viewer from its process when the stream is dropped.
#[derive(Debug)]
pub struct ViewerGuard {
    process: Arc<AgentProcess>,
    viewer_id: u64,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.process.detach_viewer(self.viewer_id);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamTiming {
    pub heartbeat: Duration,
    pub exit_grace: Duration,
}

struct ViewerState {
    _guard: ViewerGuard,
    pending: VecDeque<OutputEvent>,
    events: mpsc::UnboundedReceiver<OutputEvent>,
    closed: oneshot::Receiver<()>,
    heartbeat: Interval,
    exit_grace: Duration,
    closing: bool,
}

/// What a viewer receives, before SSE framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerFrame {
    Event(OutputEvent),
    Heartbeat,
}

/// Live output for one viewer: connection notice, buffered output, then live
/// events with heartbeats. Ends shortly after a terminal event, or at once
/// when another viewer takes over.
pub fn viewer_frames(
    process: Arc<AgentProcess>,
    attachment: ViewerAttachment,
    timing: StreamTiming,
) -> impl Stream<Item = ViewerFrame> + Send + 'static {
    let ViewerAttachment {
        id,
        backlog,
        events,
        closed,
    } = attachment;

    let mut pending = VecDeque::with_capacity(backlog.len() + 1);
    pending.push_back(OutputEvent::connection_established());
    pending.extend(backlog);

    let mut heartbeat =
        tokio::time::interval_at(tokio::time::Instant::now() + timing.heartbeat, timing.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = ViewerState {
        _guard: ViewerGuard {
            process,
            viewer_id: id,
        },
        pending,
        events,
        closed,
        heartbeat,
        exit_grace: timing.exit_grace,
        closing: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.closing {
            tokio::time::sleep(state.exit_grace).await;
            return None;
        }

        if let Some(event) = state.pending.pop_front() {
            state.closing = event.is_terminal();
            return Some((ViewerFrame::Event(event), state));
        }

        tokio::select! {
            biased;
            _ = &mut state.closed => {
                tracing::debug!("viewer stream replaced");
                None
            }
            event = state.events.recv() => {
                let event = event?;
                state.closing = event.is_terminal();
                Some((ViewerFrame::Event(event), state))
            }
            _ = state.heartbeat.tick() => Some((ViewerFrame::Heartbeat, state)),
        }
    })
}

pub fn sse_frame(frame: ViewerFrame) -> Event {
    match frame {
        ViewerFrame::Event(event) => Event::default().data(event.to_json()),
        ViewerFrame::Heartbeat => Event::default().comment(HEARTBEAT_COMMENT),
    }
}

pub fn sse_response<S>(frames: S) -> Response
where
    S: Stream<Item = ViewerFrame> + Send + 'static,
{
    use futures::StreamExt;

    let events = frames.map(|frame| Ok::<_, Infallible>(sse_frame(frame)));
    let mut response = Sse::new(events).into_response();
    apply_stream_headers(response.headers_mut());
    response
}

/// A failed attach is reported as one `error` event with the mapped status.
pub fn sse_error(err: &StudioError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = format!("data: {}\n\n", OutputEvent::error(err.to_string()).to_json());
    let mut response = (status, body).into_response();
    apply_stream_headers(response.headers_mut());
    response
}

fn apply_stream_headers(headers: &mut axum::http::HeaderMap) {
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_carries_status_and_event_body() {
        let response = sse_error(&StudioError::AgentNotFound {
            agent_id: "ghost".to_string(),
        });
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).map(|value| value.as_bytes()),
            Some(&b"text/event-stream"[..])
        );
        assert_eq!(
            response.headers().get("x-accel-buffering").map(|value| value.as_bytes()),
            Some(&b"no"[..])
        );
    }
}
