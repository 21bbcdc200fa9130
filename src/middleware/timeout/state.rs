//! Response ownership arbitration.
//!
//! ```text
//!            initial timer                 first write / write_header / return
//!   TimedOut ◀──────────── Pending ──────────────────────────────────▶ Writing
//!                                                                         │
//!                                                          rolling timer  ▼
//!                                                                      Stalled
//! ```
//!
//! Every arrow is one compare-and-exchange. Whoever wins `Pending → _` takes
//! the real writer out of [`Shared`]; the loser never sees it.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::context::{CancelHandle, Cause};
use crate::error::Error;
use crate::writer::Writer;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(super) enum State {
    Pending  = 0,
    TimedOut = 1,
    Writing  = 2,
    Stalled  = 3,
}

impl State {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::TimedOut,
            2 => Self::Writing,
            _ => Self::Stalled,
        }
    }
}

/// Stand-in for deadlines past what `Instant` can hold.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// State shared by the timers and the handler's writer for one request.
pub(super) struct Shared {
    state: AtomicU8,
    // Locked once, by the winner of `Pending → _`.
    sink: Mutex<Option<Writer>>,
    cancel: CancelHandle,
    epoch: Instant,
    // Nanoseconds after `epoch`.
    rolling_deadline: AtomicU64,
}

impl Shared {
    pub(super) fn new(sink: Writer, cancel: CancelHandle) -> Self {
        Self {
            state: AtomicU8::new(State::Pending as u8),
            sink: Mutex::new(Some(sink)),
            cancel,
            epoch: Instant::now(),
            rolling_deadline: AtomicU64::new(0),
        }
    }

    pub(super) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: State, to: State) -> Result<(), State> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| debug!(?from, ?to, "response state transition"))
            .map_err(State::from_u8)
    }

    fn take_sink(&self) -> Option<Writer> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// `Pending → TimedOut`. On success cancels the request context and
    /// hands over the real writer for the fallback.
    pub(super) fn time_out(&self) -> Option<Writer> {
        self.transition(State::Pending, State::TimedOut).ok()?;
        self.cancel.cancel(Cause::TimeoutBeforeWrite);
        self.take_sink()
    }

    /// `Pending → Writing`, claiming the real writer for the handler.
    pub(super) fn claim(&self) -> Result<Writer, Error> {
        match self.transition(State::Pending, State::Writing) {
            Ok(()) => self.take_sink().ok_or(Error::Closed),
            Err(State::TimedOut) => Err(Error::TimeoutBeforeWrite),
            // Already claimed; only the claimant writes from here on.
            Err(_) => Err(Error::Closed),
        }
    }

    /// `Writing → Stalled`. On success cancels the request context.
    pub(super) fn stall(&self) -> bool {
        if self.transition(State::Writing, State::Stalled).is_err() {
            return false;
        }
        self.cancel.cancel(Cause::TimeoutDuringWrite);
        true
    }

    /// Marks the request as over. A no-op for contexts a timeout cancelled.
    pub(super) fn finish(&self) {
        self.cancel.cancel(Cause::Canceled);
    }

    /// Moves the rolling deadline to `now + rolling`, saturating for
    /// durations too long to represent.
    pub(super) fn extend_rolling_deadline(&self, rolling: Duration) {
        let since_epoch = self.epoch.elapsed().saturating_add(rolling);
        let nanos = u64::try_from(since_epoch.as_nanos()).unwrap_or(u64::MAX);
        self.rolling_deadline.store(nanos, Ordering::Release);
    }

    pub(super) fn rolling_deadline(&self) -> Instant {
        let nanos = self.rolling_deadline.load(Ordering::Acquire);
        self.epoch
            .checked_add(Duration::from_nanos(nanos))
            .unwrap_or_else(|| self.epoch + FAR_FUTURE)
    }
}
