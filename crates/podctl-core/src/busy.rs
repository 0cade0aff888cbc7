//! Busy windows during which the pod is presumed mid-operation.
//!
//! A bolus is acknowledged long before the pod has finished pushing the
//! insulin out. The tracker remembers until when each such operation is
//! expected to run, so the coordinator can turn away overlapping requests
//! without polling the pod.

use std::sync::atomic::{AtomicBool, Ordering};

use time::{Duration, OffsetDateTime};
use tracing::debug;

/// Default bolus delivery pace, in seconds per unit.
pub const DEFAULT_BOLUS_SECONDS_PER_UNIT: f64 = 42.0;

/// How long the pod needs to deliver `units` at `seconds_per_unit`.
///
/// Saturates instead of overflowing; NaN yields zero.
pub fn bolus_delivery_time(units: f64, seconds_per_unit: f64) -> Duration {
    Duration::saturating_seconds_f64((units * seconds_per_unit).max(0.0))
}

/// Flag raised while a command is on the radio.
///
/// Lock-free so it can be lowered from a guard's `Drop`, which also covers
/// an operation future dropped mid-dispatch.
#[derive(Debug, Default)]
pub struct InFlight(AtomicBool);

impl InFlight {
    /// A lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag until the returned guard is dropped.
    #[must_use = "the flag is lowered as soon as the guard is dropped"]
    pub fn enter(&self) -> InFlightGuard<'_> {
        self.0.store(true, Ordering::SeqCst);
        InFlightGuard { flag: &self.0 }
    }

    /// Whether a command is believed to be in flight.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lowers an [`InFlight`] flag on drop.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Set of busy-until timestamps.
///
/// Entries at or before `now` are expired; every query prunes them first.
#[derive(Debug, Clone, Default)]
pub struct BusyTracker {
    windows: Vec<OffsetDateTime>,
}

impl BusyTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consider the pod busy until `until`.
    pub fn mark_busy_until(&mut self, until: OffsetDateTime) {
        self.windows.push(until);
    }

    /// Consider the pod busy for `duration` from `now`; returns the end.
    pub fn mark_busy_for(&mut self, now: OffsetDateTime, duration: Duration) -> OffsetDateTime {
        let until = now.saturating_add(duration);
        self.mark_busy_until(until);
        until
    }

    /// Drop every window that ended at or before `now`.
    ///
    /// Returns how many were removed.
    pub fn prune(&mut self, now: OffsetDateTime) -> usize {
        let before = self.windows.len();
        self.windows.retain(|until| *until > now);
        let removed = before - self.windows.len();
        if removed > 0 {
            debug!("Pruned {} expired busy window(s)", removed);
        }
        removed
    }

    /// Whether a window is still open at `now`.
    pub fn is_busy(&mut self, now: OffsetDateTime) -> bool {
        self.prune(now);
        !self.windows.is_empty()
    }

    /// End of the latest open window at `now`, if any.
    pub fn busy_until(&mut self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        self.prune(now);
        self.windows.iter().max().copied()
    }

    /// Number of windows currently held, expired or not.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no windows are held.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
