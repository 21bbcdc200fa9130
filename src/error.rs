//! Unified error type.

use std::io;

/// The error type returned by tardy's fallible operations.
///
/// Two variants are sentinels handlers are expected to match on:
/// [`Error::TimeoutBeforeWrite`] and [`Error::TimeoutDuringWrite`]. When a
/// rolling timeout interrupted a write that was already in flight, the
/// underlying I/O error is reachable through
/// [`source`](std::error::Error::source).
///
/// ```rust
/// use tardy::Error;
///
/// fn should_stop(err: &Error) -> bool {
///     matches!(err, Error::TimeoutBeforeWrite | Error::TimeoutDuringWrite { .. })
/// }
/// # assert!(should_stop(&Error::TimeoutBeforeWrite));
/// ```
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Binding, accepting, or writing to the underlying transport failed.
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// The initial timeout fired before the handler committed to a response.
    /// The fallback handler owns the response.
    #[error("request timeout reached before write")]
    TimeoutBeforeWrite,

    /// The rolling timeout fired between two writes.
    #[error("request rolling timeout reached during write{}", io_suffix(.source))]
    TimeoutDuringWrite { source: Option<io::Error> },

    /// The request context was cancelled without a timeout cause.
    #[error("request canceled")]
    Canceled,

    /// The response sink is gone: the client disconnected or the response
    /// was already handed to someone else.
    #[error("response writer closed")]
    Closed,
}

impl Error {
    pub(crate) fn write_timed_out() -> Self {
        Self::Io(io::Error::new(io::ErrorKind::TimedOut, "i/o timeout"))
    }
}

fn io_suffix(source: &Option<io::Error>) -> String {
    source.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
}
