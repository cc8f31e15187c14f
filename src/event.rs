//! Structured diagnostic events.
//!
//! Single producer (the session engine), many consumers. Live consumers
//! subscribe to a broadcast stream and must not block the producer; a
//! bounded in-memory backlog keeps recent history for late readers, and on
//! overflow the oldest non-error events are dropped first.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_stream::stream;
use futures_core::stream::Stream;
use tokio::sync::broadcast;

use crate::protocol::ProtocolType;
use crate::session::state::ProtocolState;
use crate::uds::{NegativeResponseCode, SessionKind};

const BROADCAST_BUFFER: usize = 256;
const DEFAULT_BACKLOG: usize = 256;

/// One telemetry event with a monotonic timestamp relative to the engine's
/// start.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiagnosticEvent {
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    StateChanged {
        from: ProtocolState,
        to: ProtocolState,
    },
    MessageSent {
        sequence: u64,
        service_id: u8,
        bytes: Vec<u8>,
    },
    MessageReceived {
        sequence: u64,
        service_id: u8,
        elapsed_ms: u64,
        bytes: Vec<u8>,
    },
    ErrorOccurred {
        context: String,
        error: String,
    },
    SessionStarted {
        session: SessionKind,
        ecu_address: Option<u32>,
    },
    SessionEnded {
        session: SessionKind,
        reason: String,
    },
    ProtocolDetected {
        protocol: ProtocolType,
        elapsed_ms: u64,
    },
    EcuDiscovered {
        address: u32,
    },
    DtcRead {
        codes: Vec<String>,
    },
    KeepAliveSent {
        success: bool,
    },
    TimeoutOccurred {
        service_id: u8,
        timeout_ms: u64,
    },
    SecurityAccessAttempted {
        level: u8,
        granted: bool,
    },
    NegativeResponseReceived {
        service_id: u8,
        nrc: NegativeResponseCode,
    },
    ConfigurationUpdated,
    TransferProgress {
        transferred: usize,
        total: usize,
    },
}

impl EventKind {
    /// Errors survive backlog overflow.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            EventKind::ErrorOccurred { .. } | EventKind::TimeoutOccurred { .. }
        )
    }
}

/// Callback invoked synchronously on publish; must not block.
pub type EventHook = Box<dyn Fn(&DiagnosticEvent) + Send + Sync>;

struct BusInner {
    epoch: Instant,
    tx: broadcast::Sender<DiagnosticEvent>,
    backlog: Mutex<VecDeque<DiagnosticEvent>>,
    backlog_capacity: usize,
    hooks: Mutex<Vec<EventHook>>,
}

/// Cheaply cloneable handle to the event stream.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG)
    }
}

impl EventBus {
    pub fn new(backlog_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_BUFFER);
        Self {
            inner: Arc::new(BusInner {
                epoch: Instant::now(),
                tx,
                backlog: Mutex::new(VecDeque::new()),
                backlog_capacity: backlog_capacity.max(1),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Milliseconds since the bus was created.
    pub fn now_ms(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }

    pub fn publish(&self, kind: EventKind) {
        let event = DiagnosticEvent {
            timestamp_ms: self.now_ms(),
            kind,
        };

        for hook in self.inner.hooks.lock().unwrap().iter() {
            hook(&event);
        }

        {
            let mut backlog = self.inner.backlog.lock().unwrap();
            backlog.push_back(event.clone());
            if backlog.len() > self.inner.backlog_capacity {
                match backlog.iter().position(|e| !e.kind.is_error()) {
                    Some(index) => {
                        backlog.remove(index);
                    }
                    None => {
                        backlog.pop_front();
                    }
                }
            }
        }

        // Nobody listening is fine.
        let _ = self.inner.tx.send(event);
    }

    /// Live event stream. Lagging consumers skip ahead rather than block
    /// the producer.
    pub fn subscribe(&self) -> impl Stream<Item = DiagnosticEvent> {
        let mut rx = self.inner.tx.subscribe();
        Box::pin(stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Snapshot of the retained backlog, oldest first.
    pub fn backlog(&self) -> Vec<DiagnosticEvent> {
        self.inner.backlog.lock().unwrap().iter().cloned().collect()
    }

    /// Register a persistence hook. Hooks run on the publishing task and
    /// must return quickly.
    pub fn add_hook(&self, hook: EventHook) {
        self.inner.hooks.lock().unwrap().push(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_stream::StreamExt;

    #[test]
    fn timestamps_are_monotonic() {
        let bus = EventBus::default();
        bus.publish(EventKind::ConfigurationUpdated);
        bus.publish(EventKind::ConfigurationUpdated);
        let backlog = bus.backlog();
        assert!(backlog[0].timestamp_ms <= backlog[1].timestamp_ms);
    }

    #[test]
    fn overflow_drops_non_errors_first() {
        let bus = EventBus::new(3);
        bus.publish(EventKind::ErrorOccurred {
            context: "send".into(),
            error: "Timeout".into(),
        });
        bus.publish(EventKind::ConfigurationUpdated);
        bus.publish(EventKind::ConfigurationUpdated);
        bus.publish(EventKind::KeepAliveSent { success: true });

        let backlog = bus.backlog();
        assert_eq!(backlog.len(), 3);
        assert!(backlog[0].kind.is_error());
    }

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let bus = EventBus::default();
        let mut stream = bus.subscribe();

        bus.publish(EventKind::EcuDiscovered { address: 0x7e8 });
        let event = stream.next().await.unwrap();
        assert_eq!(event.kind, EventKind::EcuDiscovered { address: 0x7e8 });
    }

    #[test]
    fn hooks_run_on_publish() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = count.clone();
        bus.add_hook(Box::new(move |_| {
            hook_count.fetch_add(1, Ordering::Relaxed);
        }));

        bus.publish(EventKind::ConfigurationUpdated);
        bus.publish(EventKind::ConfigurationUpdated);
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}
