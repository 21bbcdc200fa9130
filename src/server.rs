//! HTTP server and graceful shutdown.
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//!
//! The server reacts by:
//! 1. Immediately stopping `listener.accept()`, so no new connections are made.
//! 2. Letting every in-flight connection task run to completion.
//! 3. Returning from [`Server::serve`], which lets `main` exit cleanly.
//!
//! # Write deadlines
//!
//! Every request gets its own [`WriteDeadline`], exposed to its handler
//! through
//! [`ResponseWriter::write_deadline`](crate::ResponseWriter::write_deadline).
//! When it passes, the response body fails and the connection is dropped,
//! just as a socket write deadline would fail the next write. The kill is
//! latched: later requests on the connection cannot undo it. On HTTP/2 it
//! closes every stream sharing the connection; sibling streams never move
//! each other's deadlines.

use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::handler::{BoxedHandler, Handler};
use crate::request::Request;
use crate::writer::{self, ResponseBody, WriteDeadline};

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a valid `host:port` string.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use tardy::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: &str) -> Self {
        let addr: SocketAddr = addr.parse().expect("invalid socket address");
        Self { addr }
    }

    /// Starts accepting connections and dispatching every request to
    /// `handler`.
    ///
    /// Returns only after a full graceful shutdown (SIGTERM or Ctrl-C,
    /// followed by all in-flight requests completing).
    pub async fn serve(self, handler: impl Handler) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        serve_with_shutdown(listener, handler, shutdown_signal()).await
    }
}

/// Serves `handler` on an already-bound `listener` until `signal` resolves,
/// then drains in-flight connections.
pub async fn serve_with_shutdown(
    listener: TcpListener,
    handler: impl Handler,
    signal: impl Future<Output = ()>,
) -> Result<(), Error> {
    let handler = handler.into_boxed_handler();

    info!(addr = %listener.local_addr()?, "tardy listening");

    // JoinSet tracks every spawned connection task so we can wait for
    // them all to finish during graceful shutdown.
    let mut tasks = tokio::task::JoinSet::new();

    tokio::pin!(signal);

    loop {
        tokio::select! {
            // Check shutdown first so a SIGTERM immediately stops accepting
            // new connections, even if more are queued.
            biased;

            () = &mut signal => {
                info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                break;
            }

            res = listener.accept() => {
                let (stream, remote_addr) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let handler = handler.clone();
                let io = TokioIo::new(stream);

                tasks.spawn(async move {
                    let (kill, mut killed) = watch::channel(false);
                    let kill = Arc::new(kill);
                    let svc = service_fn(move |req| dispatch(handler.clone(), req, Arc::clone(&kill)));

                    // `auto::Builder` transparently handles both HTTP/1.1
                    // and HTTP/2, whatever the client negotiates.
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    let conn = builder.serve_connection(io, svc);

                    tokio::select! {
                        res = conn => {
                            if let Err(e) = res {
                                error!(peer = %remote_addr, "connection error: {e}");
                            }
                        }
                        () = deadline_passed(&mut killed) => {
                            debug!(peer = %remote_addr, "write deadline passed, closing connection");
                        }
                    }
                });
            }

            // Reap finished connection tasks so the JoinSet does not grow
            // without bound on long-running servers.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    // Drain: wait for every in-flight connection to finish before we return.
    while tasks.join_next().await.is_some() {}

    info!("tardy stopped");
    Ok(())
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Core hot path: reads one request, starts its handler, and hands hyper the
/// response as soon as the handler commits a head.
///
/// The request's write deadline is watched on its own task until the
/// response body is done; if it passes first, `kill` closes the connection.
///
/// The error type is [`Infallible`]: failures become responses (400) or
/// aborted bodies, so hyper never sees an error here.
async fn dispatch<B>(
    handler: BoxedHandler,
    req: hyper::Request<B>,
    kill: Arc<watch::Sender<bool>>,
) -> Result<http::Response<ResponseBody>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return Ok(writer::empty_response(http::StatusCode::BAD_REQUEST));
        }
    };

    let request = Request::new(parts, body);
    let deadline = WriteDeadline::new();
    let (w, pending) = writer::channel(deadline.clone());

    let watcher = tokio::spawn(async move {
        deadline.elapsed().await;
        kill.send_replace(true);
    });

    // The body keeps streaming after the head is returned, so the handler
    // runs on its own task.
    tokio::spawn(async move {
        if let Err(e) = handler.call(request, Box::new(w)).await {
            debug!(error = %e, "handler returned an error");
        }
    });

    Ok(pending.with_watcher(watcher).into_response().await)
}

/// Resolves once any request on the connection passed its write deadline.
async fn deadline_passed(killed: &mut watch::Receiver<bool>) {
    if killed.wait_for(|killed| *killed).await.is_err() {
        // Every sender is gone, so nothing can pass a deadline any more.
        std::future::pending::<()>().await;
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** (sent by `kubectl` and the
/// Kubernetes control plane) and **SIGINT** (Ctrl-C, for local dev).
/// On Windows only Ctrl-C is available.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    // `pending()` is a future that never resolves, so on non-Unix platforms
    // the SIGTERM arm is effectively disabled.
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
