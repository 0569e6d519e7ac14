//! Read-only view of the host's in-flight work.
//!
//! The host service owns the list of requests it is currently serving. The
//! guardian only ever calls [`WorkTracker::in_flight`] once per snapshot and
//! keeps the returned copy; it never mutates the host's data.

use serde::{Deserialize, Serialize};

/// One in-flight work descriptor as published by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Request method or operation kind (e.g. `GET`)
    pub method: String,
    /// Request target (path, queue name, ...)
    pub target: String,
    /// When the work started (RFC 3339)
    pub start_time: String,
    /// Who asked for it (peer address, tenant, ...)
    pub origin: String,
}

/// Accessor for the host's current in-flight work.
///
/// Called from the panic hook on the panicking thread, before unwinding.
/// Implementations must not block, and must not wait on a lock that thread
/// may already hold: a plain `Mutex::lock` deadlocks the hook when the host
/// panics inside its own critical section. Use `try_lock` and return what is
/// available, or read from a copy the host publishes (an `Arc` swapped under
/// a short lock, a channel snapshot, ...).
pub trait WorkTracker: Send + Sync {
    fn in_flight(&self) -> Vec<WorkItem>;
}

impl<F> WorkTracker for F
where
    F: Fn() -> Vec<WorkItem> + Send + Sync,
{
    fn in_flight(&self) -> Vec<WorkItem> {
        self()
    }
}

/// Tracker for hosts that do not publish in-flight work.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWork;

impl WorkTracker for NoWork {
    fn in_flight(&self) -> Vec<WorkItem> {
        Vec::new()
    }
}
