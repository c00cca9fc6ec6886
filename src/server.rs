//! HTTP front: stills, the live multipart feed, and device controls.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use metrics::gauge;
use tracing::{debug, error, info, warn};

use crate::capture::{
    list_controls, run_control, set_control, CaptureDevice, ControlAction, V4l2Source,
};
use crate::error::{CaptureError, FrameError, Severity};
use crate::pipeline::FrameStore;
use crate::stream::{self, CollectSink, MultipartSink, Outcome, MULTIPART_CONTENT_TYPE};

/// Parts buffered between a streaming consumer and its connection.
const STREAM_CHANNEL_DEPTH: usize = 2;

const NO_CACHE: [(header::HeaderName, &str); 3] = [
    (header::CACHE_CONTROL, "no-cache"),
    (header::PRAGMA, "no-cache"),
    (header::EXPIRES, "Thu, 01 Dec 1994 16:00:00 GMT"),
];

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<FrameStore>,
    pub device: Arc<CaptureDevice<V4l2Source>>,
    pub content_type: &'static str,
    /// Parts per multipart response; `None` streams until the client leaves.
    pub stream_frames: Option<u64>,
    pub wait_timeout: Duration,
    pub consumers: Arc<AtomicUsize>,
    /// Errors that must take the whole process down.
    pub fatal: flume::Sender<CaptureError>,
}

impl AppState {
    fn report_fatal(&self, err: CaptureError) -> Response {
        error!("fatal error while serving: {}", err);
        // The supervisor may already be shutting down.
        let _ = self.fatal.send(err);
        internal_error("capture failed")
    }
}

/// Counts one active consumer for as long as it lives.
struct ConsumerGuard(Arc<AtomicUsize>);

impl ConsumerGuard {
    fn new(consumers: &Arc<AtomicUsize>) -> Self {
        consumers.fetch_add(1, Ordering::Relaxed);
        gauge!("consumers_active").increment(1.0);
        Self(Arc::clone(consumers))
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
        gauge!("consumers_active").decrement(1.0);
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(still))
        .route("/image.jpg", get(still))
        .route("/image.replace", get(live))
        .route("/controls", get(controls))
        .route("/set", get(set))
        .route("/status", get(status))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, router(state)).await
}

fn internal_error(msg: &'static str) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
}

async fn still(State(state): State<AppState>) -> Response {
    let store = Arc::clone(&state.store);
    let delivered = tokio::task::spawn_blocking(move || {
        let mut sink = CollectSink::default();
        stream::deliver_still(&*store, &mut sink).map(|delivery| (delivery, sink))
    })
    .await;

    match delivered {
        Ok(Ok((delivery, mut sink))) => match (delivery.outcome, sink.frames.pop()) {
            (Outcome::Completed, Some((generation, bytes))) => {
                debug!(generation, len = bytes.len(), "still delivered");
                (
                    NO_CACHE,
                    [(header::CONTENT_TYPE, state.content_type)],
                    bytes,
                )
                    .into_response()
            }
            _ => (StatusCode::SERVICE_UNAVAILABLE, "no frame captured yet").into_response(),
        },
        Ok(Err(e)) => state.report_fatal(e.into()),
        Err(e) => {
            warn!("still delivery task failed: {}", e);
            internal_error("delivery failed")
        }
    }
}

async fn live(State(state): State<AppState>) -> Response {
    let (tx, rx) = flume::bounded(STREAM_CHANNEL_DEPTH);
    let consumer = state.clone();

    tokio::task::spawn_blocking(move || {
        let _guard = ConsumerGuard::new(&consumer.consumers);
        let mut sink = MultipartSink::new(tx, consumer.content_type);
        match stream::deliver_stream(
            &*consumer.store,
            &mut sink,
            consumer.stream_frames,
            consumer.wait_timeout,
        ) {
            Ok(delivery) => match delivery.outcome {
                Outcome::SendFailed(e) => {
                    debug!(frames = delivery.frames, "stream consumer went away: {}", e)
                }
                outcome => debug!(frames = delivery.frames, ?outcome, "stream finished"),
            },
            Err(e) => {
                let _ = consumer.report_fatal(e.into());
            }
        }
    });

    (
        NO_CACHE,
        [(header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE)],
        Body::from_stream(rx.into_stream()),
    )
        .into_response()
}

async fn control_call(state: AppState, action: ControlAction, id: u32, value: i64) -> Response {
    let device = Arc::clone(&state.device);
    let result = tokio::task::spawn_blocking(move || run_control(&device, action, id, value)).await;

    match result {
        Ok(Ok(text)) => (NO_CACHE, [(header::CONTENT_TYPE, "text/xml")], text).into_response(),
        Ok(Err(e)) if is_fatal(&e) => state.report_fatal(e),
        Ok(Err(e)) => {
            warn!("control request failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            warn!("control task failed: {}", e);
            internal_error("control failed")
        }
    }
}

/// A failed control request leaves the device usable; a broken lock does not.
fn is_fatal(err: &CaptureError) -> bool {
    err.severity() == Severity::Runtime && !matches!(err, CaptureError::Device { .. })
}

async fn controls(State(state): State<AppState>) -> Response {
    control_call(state, list_controls, 0, 0).await
}

async fn set(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    match query.as_deref().and_then(parse_set_query) {
        Some((cid, value)) => control_call(state, set_control, cid, value).await,
        None => (
            StatusCode::BAD_REQUEST,
            format!("Bad query string: {}", query.unwrap_or_default()),
        )
            .into_response(),
    }
}

/// `<cid>=<value>`, both decimal.
fn parse_set_query(query: &str) -> Option<(u32, i64)> {
    let (cid, value) = query.split_once('=')?;
    Some((cid.trim().parse().ok()?, value.trim().parse().ok()?))
}

fn render_status(generation: Result<u64, FrameError>, consumers: usize) -> Result<String, FrameError> {
    Ok(format!(
        "frames published: {}\nconsumers: {}\n",
        generation?, consumers
    ))
}

async fn status(State(state): State<AppState>) -> Response {
    let consumers = state.consumers.load(Ordering::Relaxed);
    match render_status(state.store.generation(), consumers) {
        Ok(text) => (NO_CACHE, [(header::CONTENT_TYPE, "text/plain")], text).into_response(),
        Err(e) => state.report_fatal(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_query() {
        assert_eq!(parse_set_query("9963776=128"), Some((9963776, 128)));
        assert_eq!(parse_set_query("9963788=-20"), Some((9963788, -20)));
        assert_eq!(parse_set_query("brightness=1"), None);
        assert_eq!(parse_set_query("9963776"), None);
        assert_eq!(parse_set_query("=5"), None);
    }

    #[test]
    fn test_render_status() {
        let text = render_status(Ok(42), 3).unwrap();
        assert_eq!(text, "frames published: 42\nconsumers: 3\n");

        let err = render_status(Err(FrameError::Poisoned { lock: "generation" }), 0);
        assert!(err.is_err());
    }
}
