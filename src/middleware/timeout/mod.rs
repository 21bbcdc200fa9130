//! Initial and rolling response timeouts.
//!
//! [`timeout`] wraps a handler with two independent timers:
//!
//! - **initial**: the handler must commit to a response (first `write` or
//!   `write_header`) within this long, or the fallback handler answers
//!   instead;
//! - **rolling**: once writing, every write must follow the previous one
//!   within this long, or the response is cut off.
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use tardy::middleware::timeout::{timeout, TimeoutOptions};
//! use tardy::{Error, Request, Server, Writer};
//!
//! async fn feed(_req: Request, mut w: Writer) -> Result<(), Error> {
//!     for line in ["one\n", "two\n", "three\n"] {
//!         w.write(line.into()).await?;
//!     }
//!     Ok(())
//! }
//!
//! # async fn run() -> Result<(), Error> {
//! let options = TimeoutOptions::new()
//!     .initial(Duration::from_secs(2))
//!     .rolling(Duration::from_millis(500));
//!
//! Server::bind("0.0.0.0:3000").serve(timeout(feed, options)).await
//! # }
//! ```
//!
//! # Who owns the response
//!
//! The initial timer and the handler race for the response through one
//! compare-and-exchange. If the timer wins, the request context is cancelled
//! with [`Cause::TimeoutBeforeWrite`](crate::Cause), the fallback runs against
//! the real writer, and every later `write` or `write_header` from the
//! handler fails with [`Error::TimeoutBeforeWrite`]. Headers the handler set
//! never reach the client. If the handler wins, the timer does nothing.
//!
//! # Rolling timeouts
//!
//! Every successful write pushes a deadline `rolling` into the future. A
//! watchdog task sleeps until it. If it passes untouched, the context is
//! cancelled with [`Cause::TimeoutDuringWrite`](crate::Cause) and the
//! response's write deadline is expired: the client's connection is closed
//! mid-body, a write stuck in flight fails with
//! [`Error::TimeoutDuringWrite`] wrapping the `i/o timeout`, and any later
//! write fails with a bare [`Error::TimeoutDuringWrite`]. Bytes already
//! written stand.
//!
//! The handler is never forcibly stopped; it is expected to return once its
//! writes fail.

mod state;
mod writer;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, StatusCode};
use tokio::task::JoinError;
use tracing::{debug, warn};

use self::state::Shared;
use self::writer::TimeoutWriter;
use crate::error::Error;
use crate::handler::{BoxedHandler, ErasedHandler, Handler};
use crate::request::Request;
use crate::writer::{BoxFuture, ContentType, Writer};

const UNAVAILABLE_BODY: &str = "<html><body>Service Unavailable</body></html>";

/// Timer configuration for [`timeout`].
///
/// A zero duration disables that timer. When only `rolling` is set it also
/// serves as the initial timeout.
#[derive(Clone, Default)]
pub struct TimeoutOptions {
    initial: Duration,
    rolling: Duration,
    fallback: Option<BoxedHandler>,
}

impl TimeoutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Longest wait for the handler's first write or `write_header`.
    pub fn initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    /// Longest gap allowed between two writes.
    pub fn rolling(mut self, rolling: Duration) -> Self {
        self.rolling = rolling;
        self
    }

    /// Answers requests whose handler missed the initial timeout. Defaults to
    /// [`service_unavailable`].
    pub fn fallback(mut self, fallback: impl Handler) -> Self {
        self.fallback = Some(fallback.into_boxed_handler());
        self
    }
}

/// Wraps `handler` with the timers in `options`.
///
/// With both timers disabled the handler is returned as is.
pub fn timeout(handler: impl Handler, options: TimeoutOptions) -> BoxedHandler {
    let inner = handler.into_boxed_handler();
    if options.initial.is_zero() && options.rolling.is_zero() {
        return inner;
    }

    let initial = if options.initial.is_zero() { options.rolling } else { options.initial };
    let fallback = options
        .fallback
        .unwrap_or_else(|| service_unavailable.into_boxed_handler());

    BoxedHandler::new(TimeoutHandler { inner, fallback, initial, rolling: options.rolling })
}

/// The default fallback: `503 Service Unavailable` with a short HTML body.
pub async fn service_unavailable(_req: Request, mut w: Writer) -> Result<(), Error> {
    let headers = w.headers();
    headers.insert(CONTENT_TYPE, ContentType::Html.header_value());
    headers.insert(CONTENT_LENGTH, HeaderValue::from(UNAVAILABLE_BODY.len()));
    w.write_header(StatusCode::SERVICE_UNAVAILABLE)?;
    w.write(Bytes::from_static(UNAVAILABLE_BODY.as_bytes())).await
}

struct TimeoutHandler {
    inner: BoxedHandler,
    fallback: BoxedHandler,
    initial: Duration,
    rolling: Duration,
}

impl ErasedHandler for TimeoutHandler {
    fn call(&self, req: Request, w: Writer) -> BoxFuture<'static, Result<(), Error>> {
        let inner = self.inner.clone();
        let fallback = self.fallback.clone();
        let (initial, rolling) = (self.initial, self.rolling);

        Box::pin(async move {
            let (context, cancel) = req.context().with_cancel();
            let req = req.with_context(context);
            let deadline = w.write_deadline();
            let shared = Arc::new(Shared::new(w, cancel));
            let proxy = TimeoutWriter::new(Arc::clone(&shared), rolling, deadline);

            let fallback_req = req.clone();
            let mut handler = tokio::spawn(inner.call(req, Box::new(proxy)));

            let result = tokio::select! {
                joined = &mut handler => flatten(joined),
                () = tokio::time::sleep(initial) => match shared.time_out() {
                    Some(sink) => {
                        warn!(?initial, path = fallback_req.path(), "request timeout reached before write");
                        // The handler keeps running detached; its writes now fail.
                        fallback.call(fallback_req, sink).await
                    }
                    None => flatten(handler.await),
                },
            };

            shared.finish();
            if let Err(e) = &result {
                debug!(error = %e, "timeout-guarded handler failed");
            }
            result
        })
    }
}

fn flatten(joined: Result<Result<(), Error>, JoinError>) -> Result<(), Error> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(Error::Canceled),
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http_body_util::BodyExt;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::context::{Cause, Context};
    use crate::writer::{channel, ResponseBody, ResponseWriter, WriteDeadline};

    type Response = http::Response<ResponseBody>;

    fn handler_bug() {
        panic!("handler bug");
    }

    async fn serve(handler: BoxedHandler) -> (Response, JoinHandle<Result<(), Error>>) {
        let (w, pending) = channel(WriteDeadline::new());
        let req = Request::from(http::Request::new(Bytes::new()));
        let task = tokio::spawn(handler.call(req, Box::new(w)));
        (pending.into_response().await, task)
    }

    /// Reads frames until the body ends or fails.
    async fn read_body(response: Response) -> (Vec<u8>, Option<io::Error>) {
        let mut body = response.into_body();
        let mut received = Vec::new();
        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => received.extend_from_slice(&frame.into_data().unwrap_or_default()),
                Err(e) => return (received, Some(e)),
            }
        }
        (received, None)
    }

    async fn complete_body(response: Response) -> Vec<u8> {
        let (received, err) = read_body(response).await;
        assert!(err.is_none(), "body aborted: {err:?}");
        received
    }

    /// A handler writing `chunks` after their delays, reporting how it ended
    /// (and the context it saw) on `report`.
    fn streaming(
        chunks: &'static [(u64, &'static str)],
        report: mpsc::UnboundedSender<(Result<(), Error>, Context)>,
    ) -> impl Handler {
        move |req: Request, mut w: Writer| {
            let report = report.clone();
            async move {
                w.headers().insert(CONTENT_TYPE, ContentType::Json.header_value());
                let mut result = Ok(());
                for &(delay, data) in chunks {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if let Err(e) = w.write(Bytes::from_static(data.as_bytes())).await {
                        result = Err(e);
                        break;
                    }
                }
                let _ = report.send((result, req.context().clone()));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_timers_leave_handler_untouched() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = timeout(streaming(&[(0, "plain")], tx), TimeoutOptions::new());

        let (response, _) = serve(handler).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(complete_body(response).await, b"plain");

        let (result, context) = rx.recv().await.unwrap();
        assert!(result.is_ok());
        // No derived context: nothing cancels it when the request ends.
        assert!(!context.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn write_before_initial_timeout_keeps_response() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = TimeoutOptions::new().initial(Duration::from_millis(50));
        let (response, task) = serve(timeout(streaming(&[(49, "success!")], tx), options)).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(complete_body(response).await, b"success!");
        assert!(task.await.unwrap().is_ok());

        let (result, context) = rx.recv().await.unwrap();
        assert!(result.is_ok());
        tokio::task::yield_now().await;
        assert_eq!(context.cause(), Some(Cause::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_timeout_serves_default_fallback() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |req: Request, mut w: Writer| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                w.headers().insert("test-dirty-write", HeaderValue::from_static("true"));
                let header = w.write_header(StatusCode::OK);
                let write = w.write(Bytes::from_static(b"success!")).await;
                let _ = tx.send((header, write, req.context().cause()));
            }
        };
        let options = TimeoutOptions::new().initial(Duration::from_millis(1));

        let (response, task) = serve(timeout(handler, options)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/html; charset=utf-8");
        assert_eq!(response.headers()[CONTENT_LENGTH], "45");
        assert!(response.headers().get("test-dirty-write").is_none());
        assert_eq!(complete_body(response).await, UNAVAILABLE_BODY.as_bytes());
        assert!(task.await.unwrap().is_ok());

        let (header, write, cause) = rx.recv().await.unwrap();
        assert!(matches!(header, Err(Error::TimeoutBeforeWrite)));
        assert_eq!(write.unwrap_err().to_string(), "request timeout reached before write");
        assert_eq!(cause, Some(Cause::TimeoutBeforeWrite));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_timeout_serves_custom_fallback() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let fallback = |req: Request, mut w: Writer| async move {
            assert_eq!(req.context().cause(), Some(Cause::TimeoutBeforeWrite));
            w.headers().insert(CONTENT_TYPE, ContentType::Json.header_value());
            w.write_header(StatusCode::INTERNAL_SERVER_ERROR)?;
            w.write(Bytes::from_static(br#"{"error":"service unavailable"}"#)).await
        };
        let options = TimeoutOptions::new()
            .initial(Duration::from_millis(1))
            .fallback(fallback);

        let (response, _) = serve(timeout(streaming(&[(10, "late")], tx), options)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(complete_body(response).await, br#"{"error":"service unavailable"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_writes_beat_rolling_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chunks = &[(2, r#"{"hel"#), (2, r#"lo":"#), (2, r#""wor"#), (2, r#"ld""#), (2, "}")];
        let options = TimeoutOptions::new().rolling(Duration::from_millis(5));

        let (response, _) = serve(timeout(streaming(chunks, tx), options)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(complete_body(response).await, br#"{"hello":"world"}"#);
        assert!(rx.recv().await.unwrap().0.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_writer_is_cut_off() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chunks = &[(0, r#"{"hel"#), (2, r#"lo":"#), (4, r#""wor"#), (8, r#"ld""#), (160, "}")];
        let options = TimeoutOptions::new().rolling(Duration::from_millis(5));

        let (response, _) = serve(timeout(streaming(chunks, tx), options)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let (received, err) = read_body(response).await;
        assert_eq!(received, br#"{"hello":"wor"#);
        assert_eq!(err.map(|e| e.kind()), Some(io::ErrorKind::TimedOut));

        let (result, context) = rx.recv().await.unwrap();
        assert!(matches!(result, Err(Error::TimeoutDuringWrite { source: None })));
        assert_eq!(context.cause(), Some(Cause::TimeoutDuringWrite));
    }

    #[tokio::test(start_paused = true)]
    async fn stall_interrupts_write_in_flight() {
        let handler = |_req: Request, mut w: Writer| async move {
            let chunk = Bytes::from_static(&[b'a'; 1024]);
            // Nobody reads: the writes eventually block on a full buffer.
            loop {
                if let Err(e) = w.write(chunk.clone()).await {
                    return Err::<(), Error>(e);
                }
            }
        };
        let options = TimeoutOptions::new().rolling(Duration::from_millis(20));

        let (_response, task) = serve(timeout(handler, options)).await;
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(&err, Error::TimeoutDuringWrite { source: Some(_) }));
        assert_eq!(
            err.to_string(),
            "request rolling timeout reached during write: i/o timeout",
        );
    }

    #[tokio::test(start_paused = true)]
    async fn handler_quitting_on_cancel_still_aborts_body() {
        let handler = |req: Request, mut w: Writer| async move {
            w.write(Bytes::from_static(b"first")).await?;
            tokio::select! {
                cause = req.context().cancelled() => Err(Error::from(cause)),
                () = tokio::time::sleep(Duration::from_secs(1)) => {
                    w.write(Bytes::from_static(b"second")).await
                }
            }
        };
        let options = TimeoutOptions::new().rolling(Duration::from_millis(20));

        let (response, task) = serve(timeout(handler, options)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let (received, err) = read_body(response).await;
        assert_eq!(received, b"first");
        assert_eq!(err.map(|e| e.kind()), Some(io::ErrorKind::TimedOut));
        assert!(matches!(task.await.unwrap(), Err(Error::TimeoutDuringWrite { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_rolling_timeout_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = TimeoutOptions::new().rolling(Duration::MAX);

        let (response, _) = serve(timeout(streaming(&[(0, "a"), (10, "b")], tx), options)).await;
        assert_eq!(complete_body(response).await, b"ab");
        assert!(rx.recv().await.unwrap().0.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn panic_before_write_is_not_a_success() {
        let handler = |_req: Request, mut w: Writer| async move {
            w.headers().insert("x-partial", HeaderValue::from_static("yes"));
            handler_bug();
        };
        let options = TimeoutOptions::new().initial(Duration::from_millis(10));

        let (response, task) = serve(timeout(handler, options)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get("x-partial").is_none());
        assert!(task.await.unwrap_err().is_panic());
    }

    #[tokio::test(start_paused = true)]
    async fn headers_before_first_write_are_flushed() {
        let handler = |_req: Request, mut w: Writer| async move {
            let headers = w.headers();
            headers.insert("x-order", HeaderValue::from_static("first"));
            headers.insert("x-other", HeaderValue::from_static("kept"));
            headers.insert("x-order", HeaderValue::from_static("second"));
            w.write_header(StatusCode::ACCEPTED)?;
            // Delegated straight to the real writer, after the head: ignored.
            w.headers().insert("x-late", HeaderValue::from_static("ignored"));
            w.write(Bytes::from_static(b"ok")).await
        };
        let options = TimeoutOptions::new().initial(Duration::from_millis(10));

        let (mut w, pending) = channel(WriteDeadline::new());
        w.headers().insert("x-order", HeaderValue::from_static("server"));
        let req = Request::from(http::Request::new(Bytes::new()));
        tokio::spawn(timeout(handler, options).call(req, Box::new(w)));

        let response = pending.into_response().await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()["x-order"], "second");
        assert_eq!(response.headers()["x-other"], "kept");
        assert!(response.headers().get("x-late").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn handler_returning_without_write_sends_its_headers() {
        let handler = |_req: Request, mut w: Writer| async move {
            w.headers().insert("x-only", HeaderValue::from_static("headers"));
        };
        let options = TimeoutOptions::new().initial(Duration::from_millis(10));

        let (response, _) = serve(timeout(handler, options)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-only"], "headers");
        assert!(complete_body(response).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn write_deadline_passes_through() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |_req: Request, w: Writer| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(w.write_deadline().is_some());
            }
        };
        let options = TimeoutOptions::new().initial(Duration::from_millis(10));

        serve(timeout(handler, options)).await;
        assert!(rx.recv().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn timer_and_first_write_never_both_win() {
        let fallbacks = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&fallbacks);
            let fallback = move |req: Request, w: Writer| {
                counter.fetch_add(1, Ordering::SeqCst);
                service_unavailable(req, w)
            };
            let handler = |_req: Request, mut w: Writer| async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                w.headers().insert("x-handler", HeaderValue::from_static("yes"));
                w.write(Bytes::from_static(b"handler")).await
            };
            let options = TimeoutOptions::new()
                .initial(Duration::from_millis(1))
                .fallback(fallback);

            let before = fallbacks.load(Ordering::SeqCst);
            let (response, _) = serve(timeout(handler, options)).await;
            let status = response.status();
            let flushed = response.headers().contains_key("x-handler");
            let body = complete_body(response).await;
            let invoked = fallbacks.load(Ordering::SeqCst) - before;

            if status == StatusCode::SERVICE_UNAVAILABLE {
                assert_eq!(invoked, 1);
                assert!(!flushed);
                assert_eq!(body, UNAVAILABLE_BODY.as_bytes());
            } else {
                assert_eq!(status, StatusCode::OK);
                assert_eq!(invoked, 0);
                assert!(flushed);
                assert_eq!(body, b"handler");
            }
        }
    }
}
