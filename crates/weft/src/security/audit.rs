// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Security audit trail.
//!
//! Events are delivered to a host-pluggable sink; the default sink forwards
//! to the `log` facade. A bounded in-memory tail is kept so hosts can pull
//! recent events without wiring a sink.

use crate::clock;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Events retained in the in-memory tail.
const TAIL_CAPACITY: usize = 256;

/// One audit record: `timestamp | slot | event | details`.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub timestamp_ns: u64,
    pub slot_id: u32,
    pub event: String,
    pub details: String,
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | slot {} | {} | {}",
            self.timestamp_ns, self.slot_id, self.event, self.details
        )
    }
}

/// Host-supplied audit event consumer.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

/// Default sink: forwards events to the `log` facade under the
/// `weft::audit` target.
pub struct LogSink;

impl AuditSink for LogSink {
    fn emit(&self, event: &AuditEvent) {
        log::warn!(target: "weft::audit", "{}", event);
    }
}

/// Audit pipeline: pluggable sink + bounded tail.
pub struct AuditLog {
    enabled: bool,
    sink: RwLock<Arc<dyn AuditSink>>,
    tail: Mutex<VecDeque<AuditEvent>>,
}

impl AuditLog {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            sink: RwLock::new(Arc::new(LogSink)),
            tail: Mutex::new(VecDeque::with_capacity(TAIL_CAPACITY)),
        }
    }

    /// Replace the sink. The tail keeps accumulating regardless.
    pub fn set_sink(&self, sink: Arc<dyn AuditSink>) {
        *self.sink.write() = sink;
    }

    /// Record an event: timestamp it, append to the tail, deliver to the sink.
    pub fn record(&self, slot_id: u32, event: &str, details: impl Into<String>) {
        if !self.enabled {
            return;
        }
        let event = AuditEvent {
            timestamp_ns: clock::monotonic_ns(),
            slot_id,
            event: event.to_string(),
            details: details.into(),
        };
        {
            let mut tail = self.tail.lock();
            if tail.len() == TAIL_CAPACITY {
                tail.pop_front();
            }
            tail.push_back(event.clone());
        }
        self.sink.read().emit(&event);
    }

    /// Snapshot of the retained tail, oldest first.
    pub fn recent(&self) -> Vec<AuditEvent> {
        self.tail.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSink(std::sync::atomic::AtomicUsize);

    impl AuditSink for CountingSink {
        fn emit(&self, _event: &AuditEvent) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    #[test]
    fn test_record_reaches_sink_and_tail() {
        let log = AuditLog::new(true);
        let sink = Arc::new(CountingSink(std::sync::atomic::AtomicUsize::new(0)));
        log.set_sink(sink.clone());

        log.record(3, "token_invalid", "slot id mismatch");
        log.record(3, "token_expired", "");

        assert_eq!(sink.0.load(std::sync::atomic::Ordering::Relaxed), 2);
        let tail = log.recent();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].slot_id, 3);
        assert_eq!(tail[0].event, "token_invalid");
    }

    #[test]
    fn test_disabled_log_is_silent() {
        let log = AuditLog::new(false);
        log.record(1, "anything", "");
        assert!(log.recent().is_empty());
    }

    #[test]
    fn test_tail_is_bounded() {
        let log = AuditLog::new(true);
        for i in 0..(TAIL_CAPACITY + 10) {
            log.record(i as u32, "evt", "");
        }
        let tail = log.recent();
        assert_eq!(tail.len(), TAIL_CAPACITY);
        // Oldest entries were evicted.
        assert_eq!(tail[0].slot_id, 10);
    }

    #[test]
    fn test_event_format() {
        let event = AuditEvent {
            timestamp_ns: 42,
            slot_id: 7,
            event: "anomaly".into(),
            details: "hot slot".into(),
        };
        assert_eq!(event.to_string(), "42 | slot 7 | anomaly | hot slot");
    }
}
