//! Runtime counters for callers and dispatchers.
//!
//! Counters are plain atomics updated on the hot path; `snapshot()` produces
//! the serializable view handed out to monitoring code.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time statistics of a [`Caller`](crate::Caller).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallerStats {
    pub calls_issued: u64,
    pub responses_matched: u64,
    /// Responses whose correlation id matched no pending call.
    pub unknown_responses: u64,
    pub malformed_frames: u64,
    pub timeouts: u64,
    pub cancelled: u64,
}

/// Point-in-time statistics of a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub requests_handled: u64,
    pub method_not_found: u64,
    pub handler_errors: u64,
    pub malformed_frames: u64,
    pub active_connections: u64,
}

#[derive(Debug, Default)]
pub(crate) struct CallerCounters {
    pub calls_issued: AtomicU64,
    pub responses_matched: AtomicU64,
    pub unknown_responses: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub timeouts: AtomicU64,
    pub cancelled: AtomicU64,
}

impl CallerCounters {
    pub fn snapshot(&self) -> CallerStats {
        CallerStats {
            calls_issued: self.calls_issued.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            unknown_responses: self.unknown_responses.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct DispatcherCounters {
    pub requests_handled: AtomicU64,
    pub method_not_found: AtomicU64,
    pub handler_errors: AtomicU64,
    pub malformed_frames: AtomicU64,
}

impl DispatcherCounters {
    pub fn snapshot(&self, active_connections: usize) -> DispatcherStats {
        DispatcherStats {
            requests_handled: self.requests_handled.load(Ordering::Relaxed),
            method_not_found: self.method_not_found.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            active_connections: active_connections as u64,
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
