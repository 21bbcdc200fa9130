//! # tardy
//!
//! Streaming HTTP handlers that are not allowed to dawdle.
//!
//! A tardy handler receives the request and a [`Writer`] and streams its
//! response chunk by chunk. The [`middleware::timeout`] layer then holds it to
//! two promises:
//!
//! - **Start on time.** Commit to a response within the *initial* timeout,
//!   or a fallback (503 by default) answers in its place.
//! - **Keep going.** Once streaming, never let more than the *rolling*
//!   timeout pass between writes, or the connection is cut mid-body.
//!
//! Everything else is kept to what a timeout-guarded stream needs: a hyper
//! server with graceful shutdown, a per-request cancellation [`Context`]
//! that says *why* it was cancelled, and per-response write deadlines.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use tardy::middleware::{timeout, TimeoutOptions};
//! use tardy::{ContentType, Error, Request, Server, Writer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = TimeoutOptions::new()
//!         .initial(Duration::from_secs(1))
//!         .rolling(Duration::from_millis(250));
//!
//!     Server::bind("0.0.0.0:3000")
//!         .serve(timeout(events, options))
//!         .await
//!         .unwrap();
//! }
//!
//! async fn events(req: Request, mut w: Writer) -> Result<(), Error> {
//!     w.headers().insert(http::header::CONTENT_TYPE, ContentType::EventStream.header_value());
//!     for n in 0.. {
//!         req.context().check()?;
//!         w.write(format!("data: {n}\n\n").into()).await?;
//!         tokio::time::sleep(Duration::from_millis(100)).await;
//!     }
//!     Ok(())
//! }
//! ```

mod context;
mod error;
mod handler;
mod request;
mod server;
mod writer;

pub mod middleware;

pub use context::{CancelHandle, Cause, Context};
pub use error::Error;
pub use handler::{BoxedHandler, Handler, IntoResult};
#[doc(hidden)]
pub use handler::ErasedHandler;
pub use request::Request;
pub use server::{serve_with_shutdown, Server};
pub use writer::{
    channel, BodyWriter, BoxFuture, ContentType, PendingResponse, ResponseBody, ResponseWriter,
    WriteDeadline, Writer,
};
