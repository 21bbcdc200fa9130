//! Handler trait and type erasure.
//!
//! # How async handlers are stored
//!
//! Middleware and the server need to hold handlers of *different* types
//! behind one type, so the concrete handler is hidden behind a trait object
//! (`dyn ErasedHandler`) inside a [`BoxedHandler`].
//!
//! ```text
//! async fn report(req, w) -> Result<(), Error> { … }   ← user writes this
//!        ↓ timeout(report, opts) / server.serve(report)
//! report.into_boxed_handler()                          ← Handler blanket impl
//!        ↓
//! BoxedHandler(Arc::new(FnHandler(report)))            ← heap-allocated wrapper
//!        ↓
//! handler.call(req, w)  at request time                ← one vtable dispatch
//!        ↓
//! Box::pin(async { report(req, w).await.into_result() })
//! ```
//!
//! The only runtime cost per request is **one Arc clone** + **one virtual
//! call**.

use std::future::Future;
use std::sync::Arc;

use crate::error::Error;
use crate::request::Request;
use crate::writer::{BoxFuture, Writer};

// ── Internal types ────────────────────────────────────────────────────────────

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because middleware outside
/// this crate may implement it and wrap the result in a [`BoxedHandler`].
#[doc(hidden)]
pub trait ErasedHandler: Send + Sync + 'static {
    fn call(&self, req: Request, w: Writer) -> BoxFuture<'static, Result<(), Error>>;
}

/// A type-erased handler shared across concurrent requests.
///
/// Cloning is one atomic increment.
#[derive(Clone)]
pub struct BoxedHandler(Arc<dyn ErasedHandler>);

impl BoxedHandler {
    #[doc(hidden)]
    pub fn new(handler: impl ErasedHandler) -> Self {
        Self(Arc::new(handler))
    }

    /// Runs the handler for one request.
    pub fn call(&self, req: Request, w: Writer) -> BoxFuture<'static, Result<(), Error>> {
        self.0.call(req, w)
    }
}

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid handler.
///
/// You never implement this yourself. It is automatically satisfied for any
/// `async fn` (or closure returning a future) with the shape:
///
/// ```text
/// async fn name(req: Request, w: Writer) -> ()
/// async fn name(req: Request, w: Writer) -> Result<(), Error>
/// ```
///
/// and for [`BoxedHandler`], which is what middleware returns, so wrapped
/// handlers can be wrapped again.
///
/// The trait is **sealed** (via the private `Sealed` supertrait).
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

/// What a handler may return.
pub trait IntoResult {
    fn into_result(self) -> Result<(), Error>;
}

impl IntoResult for () {
    fn into_result(self) -> Result<(), Error> { Ok(()) }
}

impl IntoResult for Result<(), Error> {
    fn into_result(self) -> Result<(), Error> { self }
}

// ── Blanket implementations ───────────────────────────────────────────────────

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request, Writer) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResult + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request, Writer) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResult + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        BoxedHandler::new(FnHandler(self))
    }
}

impl private::Sealed for BoxedHandler {}

impl Handler for BoxedHandler {
    fn into_boxed_handler(self) -> BoxedHandler { self }
}

// ── Concrete wrapper ──────────────────────────────────────────────────────────

/// Newtype wrapper that holds a concrete handler `F` and implements
/// [`ErasedHandler`], bridging the typed world to the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request, Writer) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResult + Send + 'static,
{
    fn call(&self, req: Request, w: Writer) -> BoxFuture<'static, Result<(), Error>> {
        let fut = (self.0)(req, w);
        Box::pin(async move { fut.await.into_result() })
    }
}
