//! Bounded message channel from the core to the front end.
//!
//! The core never calls into UI code. Every user-visible condition is
//! posted as a `UiEvent` on a lock-free bounded queue that the front
//! end drains at its own pace; posting never blocks a real-time
//! thread. When the queue is full the event is counted as dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use log::warn;

use crate::repro::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Fatal,
}

#[derive(Debug, Clone)]
pub enum UiEvent {
    /// User-visible text. Info messages auto-dismiss after `timeout`
    /// seconds, warnings go to the log pane, fatals require
    /// acknowledgement.
    Message {
        severity: Severity,
        text: String,
        timeout: Option<f64>,
    },
    ReProStarted {
        name: String,
    },
    ReProFinished {
        name: String,
        outcome: Outcome,
    },
    SessionStarted,
    SessionStopped {
        saved: bool,
    },
    /// Persistence could not keep up; the named run misses stimulus rows.
    IncompleteSave {
        repro: String,
    },
}

const UI_QUEUE_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct UiChannel {
    queue: Arc<ArrayQueue<UiEvent>>,
    dropped: Arc<AtomicU64>,
}

impl UiChannel {
    pub fn new() -> UiChannel {
        UiChannel {
            queue: Arc::new(ArrayQueue::new(UI_QUEUE_CAPACITY)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Non-blocking post; counts the event as dropped when full.
    pub fn post(&self, event: UiEvent) {
        if self.queue.push(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn info(&self, text: impl Into<String>, timeout: Option<f64>) {
        self.post(UiEvent::Message {
            severity: Severity::Info,
            text: text.into(),
            timeout,
        });
    }

    pub fn warning(&self, text: impl Into<String>) {
        let text = text.into();
        warn!("{text}");
        self.post(UiEvent::Message {
            severity: Severity::Warning,
            text,
            timeout: None,
        });
    }

    pub fn fatal(&self, text: impl Into<String>) {
        self.post(UiEvent::Message {
            severity: Severity::Fatal,
            text: text.into(),
            timeout: None,
        });
    }

    pub fn try_pop(&self) -> Option<UiEvent> {
        self.queue.pop()
    }

    /// Drains everything currently queued.
    pub fn drain(&self) -> Vec<UiEvent> {
        let mut out = Vec::new();
        while let Some(e) = self.queue.pop() {
            out.push(e);
        }
        out
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for UiChannel {
    fn default() -> Self {
        UiChannel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_and_drain_in_order() {
        let ui = UiChannel::new();
        ui.info("a", Some(2.0));
        ui.warning("b");
        let drained = ui.drain();
        assert_eq!(drained.len(), 2);
        match &drained[0] {
            UiEvent::Message { severity, text, timeout } => {
                assert_eq!(*severity, Severity::Info);
                assert_eq!(text, "a");
                assert_eq!(*timeout, Some(2.0));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn overflow_is_counted_not_blocking() {
        let ui = UiChannel::new();
        for i in 0..(UI_QUEUE_CAPACITY + 5) {
            ui.info(format!("m{i}"), None);
        }
        assert_eq!(ui.dropped(), 5);
    }
}
