use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, BodyDataStream, Bytes, HttpBody};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use futures::{Stream, StreamExt, TryStreamExt};

use crate::utils::logging::{ACCESS_TARGET, ERROR_TARGET};
use crate::utils::state::AppState;

/// Status logged for requests abandoned by the client before a response.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

const REQUEST_ID_HEADER: &str = "x-oio-req-id";

/// Emits one access line per request and feeds the `/stat` counters.
///
/// The line is written once the response body is fully sent, with the bytes
/// that actually went through in both directions.
pub async fn access_log(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    state.stats.record_request(req.method());
    let received = Arc::new(AtomicU64::new(0));
    let mut entry = AccessEntry::new(state, &req, received.clone());

    let req = req.map(|body| {
        let stream = body.into_data_stream().inspect_ok(move |chunk| {
            received.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        });
        Body::from_stream(stream)
    });
    let response = next.run(req).await;

    entry.respond(response.status(), content_length(response.headers()));
    if response.body().is_end_stream() {
        entry.finish(entry.status);
        return response;
    }
    response.map(|body| {
        Body::from_stream(LoggedBody {
            inner: body.into_data_stream(),
            entry,
        })
    })
}

/// An access line in the making. Dropped unfinished, it is written with
/// status 499.
struct AccessEntry {
    state: Arc<AppState>,
    peer: String,
    method: Method,
    path: String,
    request_id: String,
    received: Arc<AtomicU64>,
    status: u16,
    expected: Option<u64>,
    sent: u64,
    started: Instant,
    finished: bool,
}

impl AccessEntry {
    fn new(state: Arc<AppState>, req: &Request, received: Arc<AtomicU64>) -> Self {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_else(|| "-".to_string());
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("-")
            .to_string();
        AccessEntry {
            state,
            peer,
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            request_id,
            received,
            status: CLIENT_CLOSED_REQUEST,
            expected: None,
            sent: 0,
            started: Instant::now(),
            finished: false,
        }
    }

    fn respond(&mut self, status: StatusCode, expected: Option<u64>) {
        self.status = status.as_u16();
        self.expected = expected;
    }

    fn sent(&mut self, len: u64) {
        self.sent += len;
        if self.expected.is_some_and(|expected| self.sent >= expected) {
            self.finish(self.status);
        }
    }

    fn finish(&mut self, status: u16) {
        if self.finished {
            return;
        }
        self.finished = true;
        let received = self.received.load(Ordering::Relaxed);
        tracing::info!(
            target: ACCESS_TARGET,
            "{} {} {} {} {} {} {} {} {}",
            self.peer,
            self.state.config.addr,
            self.method,
            status,
            self.started.elapsed().as_micros(),
            received,
            self.sent,
            self.request_id,
            self.path,
        );
        self.state.stats.record_reply(status, received, self.sent);
    }
}

impl Drop for AccessEntry {
    fn drop(&mut self) {
        self.finish(CLIENT_CLOSED_REQUEST);
    }
}

/// Response body that closes its access line when the last byte is out, or
/// with 499 when dropped before.
struct LoggedBody {
    inner: BodyDataStream,
    entry: AccessEntry,
}

impl Stream for LoggedBody {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => this.entry.sent(chunk.len() as u64),
            Poll::Ready(Some(Err(e))) => {
                tracing::error!(
                    target: ERROR_TARGET,
                    "{} {}: body failed: {e}",
                    this.entry.method,
                    this.entry.path
                );
                this.entry.finish(StatusCode::INTERNAL_SERVER_ERROR.as_u16());
            }
            Poll::Ready(None) => this.entry.finish(this.entry.status),
            Poll::Pending => {}
        }
        polled
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}
