//! Dispatch metrics tracking.
//!
//! Every command the coordinator sends is counted per [`CommandKind`], split
//! into accepted, refused and failed (unknown outcome), together with its
//! round-trip latency. Short-circuits and busy refusals, which never reach
//! the executor, have their own counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::CommandKind;

/// How a dispatched command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The pod did what it was asked.
    Accepted,
    /// The pod explicitly said no.
    Refused,
    /// The executor failed; the outcome is unknown.
    Failed,
}

/// Metrics for a single command kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    /// Total number of dispatches.
    pub count: u64,
    /// Dispatches the pod accepted.
    pub accepted_count: u64,
    /// Dispatches the pod refused.
    pub refused_count: u64,
    /// Dispatches that ended in an executor error.
    pub failed_count: u64,
    /// Total duration of all dispatches.
    pub total_duration_ms: u64,
    /// Minimum dispatch duration.
    pub min_duration_ms: Option<u64>,
    /// Maximum dispatch duration.
    pub max_duration_ms: Option<u64>,
    /// Average dispatch duration.
    pub avg_duration_ms: Option<f64>,
}

/// Thread-safe atomic operation metrics tracker.
#[derive(Debug)]
pub struct AtomicOperationMetrics {
    count: AtomicU64,
    accepted_count: AtomicU64,
    refused_count: AtomicU64,
    failed_count: AtomicU64,
    total_duration_ms: AtomicU64,
    min_duration_ms: AtomicU64,
    max_duration_ms: AtomicU64,
}

impl Default for AtomicOperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicOperationMetrics {
    /// Create new empty metrics.
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            accepted_count: AtomicU64::new(0),
            refused_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            min_duration_ms: AtomicU64::new(u64::MAX),
            max_duration_ms: AtomicU64::new(0),
        }
    }

    /// Record one dispatch.
    pub fn record(&self, outcome: DispatchOutcome, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        let bucket = match outcome {
            DispatchOutcome::Accepted => &self.accepted_count,
            DispatchOutcome::Refused => &self.refused_count,
            DispatchOutcome::Failed => &self.failed_count,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms.fetch_add(ms, Ordering::Relaxed);
        self.update_min_max(ms);
    }

    fn update_min_max(&self, ms: u64) {
        // compare-and-swap loops
        let mut current = self.min_duration_ms.load(Ordering::Relaxed);
        while ms < current {
            match self.min_duration_ms.compare_exchange_weak(
                current,
                ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }

        let mut current = self.max_duration_ms.load(Ordering::Relaxed);
        while ms > current {
            match self.max_duration_ms.compare_exchange_weak(
                current,
                ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }
    }

    /// Get a snapshot of the current metrics.
    pub fn snapshot(&self) -> OperationMetrics {
        let count = self.count.load(Ordering::Relaxed);
        let total_duration_ms = self.total_duration_ms.load(Ordering::Relaxed);
        let min = self.min_duration_ms.load(Ordering::Relaxed);
        let max = self.max_duration_ms.load(Ordering::Relaxed);

        OperationMetrics {
            count,
            accepted_count: self.accepted_count.load(Ordering::Relaxed),
            refused_count: self.refused_count.load(Ordering::Relaxed),
            failed_count: self.failed_count.load(Ordering::Relaxed),
            total_duration_ms,
            min_duration_ms: (min != u64::MAX).then_some(min),
            max_duration_ms: (count > 0).then_some(max),
            avg_duration_ms: (count > 0).then(|| total_duration_ms as f64 / count as f64),
        }
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.accepted_count.store(0, Ordering::Relaxed);
        self.refused_count.store(0, Ordering::Relaxed);
        self.failed_count.store(0, Ordering::Relaxed);
        self.total_duration_ms.store(0, Ordering::Relaxed);
        self.min_duration_ms.store(u64::MAX, Ordering::Relaxed);
        self.max_duration_ms.store(0, Ordering::Relaxed);
    }
}

/// Per-command dispatch metrics for one coordinator.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    per_command: [AtomicOperationMetrics; CommandKind::ALL.len()],
    short_circuits: AtomicU64,
    busy_refusals: AtomicU64,
}

impl DispatchMetrics {
    /// Create new empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: CommandKind) -> &AtomicOperationMetrics {
        let index = CommandKind::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_default();
        &self.per_command[index]
    }

    /// Record one dispatch of `kind`.
    pub fn record(&self, kind: CommandKind, outcome: DispatchOutcome, duration: Duration) {
        self.slot(kind).record(outcome, duration);
    }

    /// Record a request answered without contacting the pod.
    pub fn record_short_circuit(&self) {
        self.short_circuits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request turned away because the pod was busy.
    pub fn record_busy_refusal(&self) {
        self.busy_refusals.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of a single command kind.
    pub fn snapshot(&self, kind: CommandKind) -> OperationMetrics {
        self.slot(kind).snapshot()
    }

    /// Get a summary of all metrics.
    ///
    /// Command kinds that were never dispatched are left out.
    pub fn summary(&self) -> DispatchMetricsSummary {
        let commands = CommandKind::ALL
            .iter()
            .map(|kind| (*kind, self.snapshot(*kind)))
            .filter(|(_, metrics)| metrics.count > 0)
            .map(|(command, metrics)| CommandMetrics { command, metrics })
            .collect();

        DispatchMetricsSummary {
            commands,
            short_circuits: self.short_circuits.load(Ordering::Relaxed),
            busy_refusals: self.busy_refusals.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        for metrics in &self.per_command {
            metrics.reset();
        }
        self.short_circuits.store(0, Ordering::Relaxed);
        self.busy_refusals.store(0, Ordering::Relaxed);
    }
}

/// Metrics of one command kind inside a [`DispatchMetricsSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMetrics {
    /// The command kind.
    pub command: CommandKind,
    /// Its metrics.
    pub metrics: OperationMetrics,
}

/// Serializable summary of dispatch metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchMetricsSummary {
    /// Dispatched command kinds.
    pub commands: Vec<CommandMetrics>,
    /// Requests answered without contacting the pod.
    pub short_circuits: u64,
    /// Requests turned away while the pod was busy.
    pub busy_refusals: u64,
}

impl DispatchMetricsSummary {
    /// Metrics for `kind`, if it was dispatched at all.
    pub fn get(&self, kind: CommandKind) -> Option<&OperationMetrics> {
        self.commands
            .iter()
            .find(|c| c.command == kind)
            .map(|c| &c.metrics)
    }

    /// Total dispatches across every command kind.
    pub fn total_dispatches(&self) -> u64 {
        self.commands.iter().map(|c| c.metrics.count).sum()
    }
}
