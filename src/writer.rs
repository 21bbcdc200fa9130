//! Streaming response writers.
//!
//! A handler does not return a response; it is handed a [`Writer`] and
//! streams one. The head (status + headers) goes out on the first
//! [`write_header`](ResponseWriter::write_header) or
//! [`write`](ResponseWriter::write), whichever comes first. Every later
//! `write` is one body chunk, delivered to the client as soon as hyper can
//! take it.
//!
//! ```text
//! handler task                          connection task
//! ────────────                          ───────────────
//! w.headers().insert(..)
//! w.write(chunk) ── head (oneshot) ──▶  PendingResponse::into_response
//!                ── chunk (mpsc)   ──▶  ResponseBody ──▶ socket
//! w.write(chunk) ── chunk (mpsc)   ──▶  ResponseBody ──▶ socket
//! drop(w)        ── channel closed ──▶  end of body
//! ```

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream;
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::Frame;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use crate::error::Error;

/// Chunks a handler may queue ahead of a slow client before `write` waits.
const BODY_BUFFER: usize = 16;

/// A heap-allocated, type-erased future.
///
/// `Send` so tokio can move it across worker threads.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The body type handed to hyper.
pub type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

/// The writer every handler receives.
pub type Writer = Box<dyn ResponseWriter>;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values.
///
/// ```rust
/// # use tardy::ContentType;
/// # fn f(w: &mut tardy::Writer) {
/// w.headers().insert(http::header::CONTENT_TYPE, ContentType::Json.header_value());
/// # }
/// ```
pub enum ContentType {
    EventStream,  // text/event-stream  (SSE)
    Html,         // text/html; charset=utf-8
    Json,         // application/json
    OctetStream,  // application/octet-stream
    Text,         // text/plain; charset=utf-8
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EventStream => "text/event-stream",
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
        }
    }

    pub fn header_value(&self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }
}

// ── ResponseWriter ────────────────────────────────────────────────────────────

/// The capability set a handler writes its response through.
///
/// Implemented by the connection-backed [`BodyWriter`] and by middleware
/// that decorates it.
pub trait ResponseWriter: Send {
    /// Headers that will be sent with the head. Changes made after the head
    /// was committed have no effect.
    fn headers(&mut self) -> &mut HeaderMap;

    /// Commits the head with `status`. Only the first call counts.
    fn write_header(&mut self, status: StatusCode) -> Result<(), Error>;

    /// Commits the head (200 unless set) and sends one body chunk. Waits
    /// while the client is behind.
    fn write(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<(), Error>>;

    /// Write deadline of this response, when it has one.
    fn write_deadline(&self) -> Option<WriteDeadline> {
        None
    }
}

// ── WriteDeadline ─────────────────────────────────────────────────────────────

/// A shared, movable write deadline.
///
/// Once the deadline passes, writes blocked in flight and every write after
/// fail with an `i/o timeout` error, and the response body aborts, which
/// tears down the client's connection. `None` means no deadline.
///
/// Cloning shares the deadline: setting it through one clone is observed by
/// all of them.
#[derive(Clone, Debug)]
pub struct WriteDeadline {
    tx: Arc<watch::Sender<Option<Instant>>>,
}

impl WriteDeadline {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, at: Option<Instant>) {
        self.tx.send_replace(at);
    }

    /// Moves the deadline to now, failing pending and future writes.
    pub fn expire(&self) {
        self.set(Some(Instant::now()));
    }

    pub fn get(&self) -> Option<Instant> {
        *self.tx.borrow()
    }

    pub fn is_expired(&self) -> bool {
        self.get().is_some_and(|at| at <= Instant::now())
    }

    /// Resolves once the deadline has passed, following every move of it.
    /// Returns at once for a deadline already in the past.
    pub async fn elapsed(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let at = *rx.borrow_and_update();
            let changed = match at {
                Some(at) if at <= Instant::now() => return,
                Some(at) => tokio::select! {
                    () = tokio::time::sleep_until(at) => return,
                    changed = rx.changed() => changed,
                },
                None => rx.changed().await,
            };
            if changed.is_err() {
                // Unreachable while `self` holds the sender.
                return std::future::pending().await;
            }
        }
    }
}

impl Default for WriteDeadline {
    fn default() -> Self {
        Self::new()
    }
}

// ── BodyWriter ────────────────────────────────────────────────────────────────

type Head = (StatusCode, HeaderMap);

/// The writer backed by a real response.
///
/// Dropping it finishes the response. A writer dropped before committing
/// sends its current status (200 unless set) and headers with an empty body,
/// unless it is dropped by a panic: then the client gets a 500.
pub struct BodyWriter {
    status: StatusCode,
    headers: HeaderMap,
    head: Option<oneshot::Sender<Head>>,
    body: mpsc::Sender<Bytes>,
    deadline: WriteDeadline,
}

/// The receiving half of [`channel`]: becomes the hyper response once the
/// handler commits its head.
pub struct PendingResponse {
    head: oneshot::Receiver<Head>,
    body: mpsc::Receiver<Bytes>,
    deadline: WriteDeadline,
    watcher: Option<AbortOnDrop>,
}

/// Aborts the task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Creates a response writer and the response it feeds.
pub fn channel(deadline: WriteDeadline) -> (BodyWriter, PendingResponse) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(BODY_BUFFER);
    let writer = BodyWriter {
        status: StatusCode::OK,
        headers: HeaderMap::new(),
        head: Some(head_tx),
        body: body_tx,
        deadline: deadline.clone(),
    };
    let pending = PendingResponse { head: head_rx, body: body_rx, deadline, watcher: None };
    (writer, pending)
}

impl BodyWriter {
    fn commit(&mut self) {
        if let Some(tx) = self.head.take() {
            // Receiver gone means the connection is gone; the next write
            // reports it.
            let _ = tx.send((self.status, self.headers.clone()));
        }
    }
}

impl ResponseWriter for BodyWriter {
    fn headers(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) -> Result<(), Error> {
        if self.head.is_none() {
            warn!(%status, "superfluous write_header call");
            return Ok(());
        }
        self.status = status;
        self.commit();
        Ok(())
    }

    fn write(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.commit();
            if self.deadline.is_expired() {
                return Err(Error::write_timed_out());
            }
            if chunk.is_empty() {
                return Ok(());
            }
            tokio::select! {
                biased;
                () = self.deadline.elapsed() => Err(Error::write_timed_out()),
                sent = self.body.send(chunk) => sent.map_err(|_| Error::Closed),
            }
        })
    }

    fn write_deadline(&self) -> Option<WriteDeadline> {
        Some(self.deadline.clone())
    }
}

impl Drop for BodyWriter {
    fn drop(&mut self) {
        // A handler that panicked before committing must not look successful.
        if !std::thread::panicking() {
            self.commit();
        }
    }
}

impl PendingResponse {
    /// Ties `task` to the response body: it is aborted once the body ends or
    /// is dropped.
    pub(crate) fn with_watcher(mut self, task: JoinHandle<()>) -> Self {
        self.watcher = Some(AbortOnDrop(task));
        self
    }

    /// Waits for the head and returns the response, its body still streaming.
    ///
    /// A writer dropped without ever committing (its handler panicked)
    /// yields a 500.
    pub async fn into_response(self) -> http::Response<ResponseBody> {
        let (status, headers) = match self.head.await {
            Ok(head) => head,
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new()),
        };
        let body = stream_body(self.body, self.deadline, self.watcher);
        let mut response = http::Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

/// Streams queued chunks until the writer is dropped, or fails the body once
/// the write deadline passes. A body whose deadline passed never ends
/// cleanly, even if the writer is gone by the time it is polled.
fn stream_body(
    chunks: mpsc::Receiver<Bytes>,
    deadline: WriteDeadline,
    watcher: Option<AbortOnDrop>,
) -> ResponseBody {
    let timed_out = || io::Error::new(io::ErrorKind::TimedOut, "i/o timeout");
    let frames = stream::unfold(Some((chunks, deadline, watcher)), move |state| async move {
        let (mut chunks, deadline, watcher) = state?;
        tokio::select! {
            biased;
            () = deadline.elapsed() => Some((Err(timed_out()), None)),
            chunk = chunks.recv() => match chunk {
                _ if deadline.is_expired() => Some((Err(timed_out()), None)),
                Some(chunk) => Some((Ok(Frame::data(chunk)), Some((chunks, deadline, watcher)))),
                None => None,
            },
        }
    });
    StreamBody::new(frames).boxed_unsync()
}

pub(crate) fn empty_response(status: StatusCode) -> http::Response<ResponseBody> {
    let body = Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync();
    let mut response = http::Response::new(body);
    *response.status_mut() = status;
    response
}
