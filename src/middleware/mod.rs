//! Middleware layer.
//!
//! Middleware takes a handler and returns a [`BoxedHandler`](crate::BoxedHandler)
//! that wraps it, usually by decorating the [`Writer`](crate::Writer) the
//! inner handler sees. Because a `BoxedHandler` is itself a handler, layers
//! stack by plain function composition.
//!
//! Built-in middleware:
//! - [`timeout`]: initial and rolling response timeouts with a fallback
//!   response

pub mod timeout;

pub use timeout::{timeout, TimeoutOptions};
