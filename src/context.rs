//! Per-request cancellation with a typed cause.
//!
//! Every [`Request`](crate::Request) carries a [`Context`]. Middleware derives
//! a child with [`Context::with_cancel`] and cancels it with a [`Cause`] when
//! it gives up on the request; handlers that care can watch for it:
//!
//! ```rust,no_run
//! # use tardy::{Error, Request, Writer};
//! async fn report(req: Request, mut w: Writer) -> Result<(), Error> {
//!     tokio::select! {
//!         cause = req.context().cancelled() => Err(cause.into()),
//!         rows = expensive_query() => w.write(rows.into()).await,
//!     }
//! }
//! # async fn expensive_query() -> Vec<u8> { Vec::new() }
//! ```
//!
//! Cancellation is advisory. Nothing forces a handler to stop; the timeout
//! middleware rejects its writes either way.

use futures_util::future::select_all;
use tokio::sync::watch;

use crate::error::Error;

/// Why a [`Context`] was cancelled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Cause {
    /// The request finished or was abandoned without a timeout.
    Canceled,
    /// The initial timeout fired before the handler wrote anything.
    TimeoutBeforeWrite,
    /// The rolling timeout fired between two writes.
    TimeoutDuringWrite,
}

impl From<Cause> for Error {
    fn from(cause: Cause) -> Self {
        match cause {
            Cause::Canceled           => Error::Canceled,
            Cause::TimeoutBeforeWrite => Error::TimeoutBeforeWrite,
            Cause::TimeoutDuringWrite => Error::TimeoutDuringWrite { source: None },
        }
    }
}

/// A cancellation signal shared by a request and everything it spawns.
///
/// Cloning is cheap. A child context observes its own cancellation and that
/// of every ancestor.
#[derive(Clone, Debug, Default)]
pub struct Context {
    // Innermost signal last.
    signals: Vec<watch::Receiver<Option<Cause>>>,
}

impl Context {
    /// A context that is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a child context and the handle that cancels it.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let (tx, rx) = watch::channel(None);
        let mut signals = self.signals.clone();
        signals.push(rx);
        (Context { signals }, CancelHandle { tx })
    }

    /// The cause of cancellation, if any. A context's own cause wins over an
    /// inherited one.
    pub fn cause(&self) -> Option<Cause> {
        self.signals.iter().rev().find_map(|rx| *rx.borrow())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause().is_some()
    }

    /// `Ok(())` while the context is live, the cause as an [`Error`] after.
    pub fn check(&self) -> Result<(), Error> {
        match self.cause() {
            Some(cause) => Err(cause.into()),
            None => Ok(()),
        }
    }

    /// Resolves once this context or any ancestor is cancelled. Never
    /// resolves for [`Context::background`].
    pub async fn cancelled(&self) -> Cause {
        if let Some(cause) = self.cause() {
            return cause;
        }
        if self.signals.is_empty() {
            return std::future::pending().await;
        }

        let waits = self.signals.iter().cloned().map(|mut rx| {
            Box::pin(async move {
                let fired = rx
                    .wait_for(Option::is_some)
                    .await
                    .map(|cause| cause.unwrap_or(Cause::Canceled));
                match fired {
                    Ok(cause) => cause,
                    // Handle dropped without cancelling: this level never fires.
                    Err(_) => std::future::pending().await,
                }
            })
        });
        select_all(waits).await.0
    }
}

/// Cancels the [`Context`] it was created with.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<Option<Cause>>,
}

impl CancelHandle {
    /// Records `cause` and wakes every waiter. Only the first cause sticks;
    /// returns whether this call was the one that cancelled.
    pub fn cancel(&self, cause: Cause) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause);
            true
        })
    }
}
