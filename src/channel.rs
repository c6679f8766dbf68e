//! Bounded event channel between a session's pump thread and the host.
//!
//! When the consumer falls behind, the oldest queued metrics event is
//! discarded to make room. Metrics carry cumulative counters, so a dropped
//! reading loses no share totals. Control events are never discarded.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::SessionEvent;

pub const DEFAULT_CAPACITY: usize = 256;

/// How long a control event may wait for room when the queue holds nothing
/// but other control events
const CONTROL_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a bounded event channel
pub fn event_channel(capacity: usize) -> (EventSink, MetricsStream) {
    let (tx, rx) = bounded(capacity.max(1));
    (
        EventSink {
            tx,
            evict: rx.clone(),
            dropped: 0,
        },
        MetricsStream { rx },
    )
}

/// Producer half, owned by exactly one thread
pub struct EventSink {
    tx: Sender<SessionEvent>,
    // used only to pull queued items back out when the queue is full
    evict: Receiver<SessionEvent>,
    dropped: u64,
}

impl EventSink {
    pub fn send(&mut self, event: SessionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => self.evict_and_send(event),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Number of metrics events discarded so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn evict_and_send(&mut self, event: SessionEvent) {
        let mut pending: Vec<SessionEvent> = self.evict.try_iter().collect();

        match pending.iter().position(SessionEvent::is_metrics) {
            Some(oldest) => {
                pending.remove(oldest);
                pending.push(event);
                self.dropped += 1;
                debug!("Event queue full, dropped oldest metrics event");
            }
            None if event.is_metrics() => {
                self.dropped += 1;
                debug!("Event queue full of control events, dropped incoming metrics");
            }
            None => pending.push(event),
        }

        for item in pending {
            if let Err(TrySendError::Full(item)) = self.tx.try_send(item) {
                if self.tx.send_timeout(item, CONTROL_SEND_TIMEOUT).is_err() {
                    warn!("Host stopped reading events, a control event was lost");
                }
            }
        }
    }
}

/// Host-facing half of a session's event stream
///
/// The stream ends (`recv` returns `None`) once the session has stopped and
/// every queued event has been read.
pub struct MetricsStream {
    rx: Receiver<SessionEvent>,
}

impl MetricsStream {
    /// Block until the next event; `None` after the session has ended
    pub fn recv(&self) -> Option<SessionEvent> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<SessionEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<SessionEvent, TryRecvError> {
        self.rx.try_recv()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.rx.iter()
    }

    /// Underlying receiver, for use with `crossbeam_channel::select!`
    pub fn receiver(&self) -> &Receiver<SessionEvent> {
        &self.rx
    }
}

impl IntoIterator for MetricsStream {
    type Item = SessionEvent;
    type IntoIter = crossbeam_channel::IntoIter<SessionEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.rx.into_iter()
    }
}
