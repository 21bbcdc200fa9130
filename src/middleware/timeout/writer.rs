//! The writer handed to the wrapped handler.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use super::state::{Shared, State};
use crate::error::Error;
use crate::writer::{BoxFuture, ResponseWriter, WriteDeadline, Writer};

/// Proxies the real writer through the ownership state machine.
///
/// Until the first write, headers land in a private map. The first write,
/// `write_header`, or dropping the writer claims the real writer and flushes
/// that map into it; from then on everything is delegated.
pub(super) struct TimeoutWriter {
    shared: Arc<Shared>,
    // Some once this writer won `Pending → Writing`.
    sink: Option<Writer>,
    headers: HeaderMap,
    rolling: Duration,
    watchdog: Option<JoinHandle<()>>,
    deadline: Option<WriteDeadline>,
}

impl TimeoutWriter {
    pub(super) fn new(
        shared: Arc<Shared>,
        rolling: Duration,
        deadline: Option<WriteDeadline>,
    ) -> Self {
        Self {
            shared,
            sink: None,
            headers: HeaderMap::new(),
            rolling,
            watchdog: None,
            deadline,
        }
    }

    fn sink(&mut self) -> Result<&mut Writer, Error> {
        if self.sink.is_none() {
            let mut sink = self.shared.claim()?;
            flush_headers(&mut self.headers, sink.headers());
            self.sink = Some(sink);
        }
        if self.shared.state() == State::Stalled {
            return Err(Error::TimeoutDuringWrite { source: None });
        }
        self.sink.as_mut().ok_or(Error::Closed)
    }

    fn extend_rolling(&mut self) {
        if self.rolling.is_zero() {
            return;
        }
        self.shared.extend_rolling_deadline(self.rolling);
        if self.watchdog.is_none() {
            let watchdog = watch_rolling(Arc::clone(&self.shared), self.rolling, self.deadline.clone());
            self.watchdog = Some(tokio::spawn(watchdog));
        }
    }
}

impl ResponseWriter for TimeoutWriter {
    fn headers(&mut self) -> &mut HeaderMap {
        match &mut self.sink {
            Some(sink) => sink.headers(),
            None => &mut self.headers,
        }
    }

    fn write_header(&mut self, status: StatusCode) -> Result<(), Error> {
        self.sink()?.write_header(status)
    }

    fn write(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let written = self.sink()?.write(chunk).await;
            match written {
                Ok(()) => {
                    self.extend_rolling();
                    Ok(())
                }
                Err(err) if self.shared.state() == State::Stalled => {
                    let source = match err {
                        Error::Io(e) => Some(e),
                        _ => None,
                    };
                    Err(Error::TimeoutDuringWrite { source })
                }
                Err(err) => Err(err),
            }
        })
    }

    fn write_deadline(&self) -> Option<WriteDeadline> {
        self.deadline.clone()
    }
}

impl Drop for TimeoutWriter {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        if self.sink.is_none() && !std::thread::panicking() {
            // Handler returned without writing; send what it buffered.
            if let Ok(mut sink) = self.shared.claim() {
                flush_headers(&mut self.headers, sink.headers());
            }
        }
    }
}

/// Moves `buffered` into `live`. A buffered name replaces every value `live`
/// had for it; all buffered values for that name are kept.
fn flush_headers(buffered: &mut HeaderMap, live: &mut HeaderMap) {
    let mut current = None;
    for (name, value) in buffered.drain() {
        match name {
            Some(name) => {
                live.insert(&name, value);
                current = Some(name);
            }
            None => {
                if let Some(name) = &current {
                    live.append(name, value);
                }
            }
        }
    }
}

/// Sleeps until the rolling deadline, following it as writes push it back.
/// If it passes untouched, stalls the response and expires the response's
/// write deadline so the client is cut off and any in-flight write fails.
async fn watch_rolling(shared: Arc<Shared>, rolling: Duration, deadline: Option<WriteDeadline>) {
    loop {
        let at = shared.rolling_deadline();
        if Instant::now() < at {
            tokio::time::sleep_until(at).await;
            continue;
        }
        if shared.stall() {
            warn!(?rolling, "request rolling timeout reached during write");
            if let Some(deadline) = deadline {
                deadline.expire();
            }
        }
        return;
    }
}
