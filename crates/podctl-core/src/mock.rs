//! Mock command executor for testing.
//!
//! This module provides a scripted pod that can be used for unit testing
//! without a radio bridge or a real pod.
//!
//! The [`MockExecutor`] implements the [`CommandExecutor`] trait, allowing it
//! to be used interchangeably with a real transport in generic code.
//!
//! # Features
//!
//! - **Refusals**: Answer `accepted: false` for chosen command kinds
//! - **Failure injection**: Fail permanently or for the next N commands with
//!   a timeout, link loss or NACK (all of unknown outcome)
//! - **Latency simulation**: Delay every answer
//! - **Readiness**: Report ready only after N polls, or never
//! - **Dispatch log**: Every command received, in order
//! - **Concurrency gauge**: Highest number of commands seen in flight at once

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::command::{Command, CommandKind, CommandResponse, StatusReport};
use crate::error::{Error, Result};
use crate::executor::CommandExecutor;

/// Kind of error an injected failure produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockFailure {
    /// [`Error::Timeout`].
    Timeout,
    /// [`Error::LinkLost`].
    #[default]
    LinkLost,
    /// [`Error::Nack`].
    Nack,
}

/// A scripted pod for testing.
///
/// # Example
///
/// ```
/// use podctl_core::{Command, CommandExecutor, CommandKind, MockExecutorBuilder};
///
/// #[tokio::main]
/// async fn main() {
///     let pod = MockExecutorBuilder::new()
///         .refuse(CommandKind::CancelTemporaryBasal)
///         .build();
///
///     let response = pod.execute(Command::CancelTemporaryBasal).await.unwrap();
///     assert!(!response.accepted());
///     assert_eq!(pod.dispatch_count(), 1);
/// }
/// ```
pub struct MockExecutor {
    report: Mutex<StatusReport>,
    refused: Mutex<HashSet<CommandKind>>,
    overrides: Mutex<HashMap<CommandKind, CommandResponse>>,
    log: Mutex<Vec<Command>>,
    failure: Mutex<MockFailure>,
    should_fail: AtomicBool,
    /// Number of commands still to fail before answering normally.
    remaining_failures: AtomicU32,
    /// Simulated latency in milliseconds (0 = no delay).
    latency_ms: AtomicU64,
    /// Polls before reporting ready; `u32::MAX` means never.
    ready_after: AtomicU32,
    readiness_polls: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    wire: Option<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for MockExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockExecutor")
            .field("dispatch_count", &self.dispatch_count())
            .field("should_fail", &self.should_fail.load(Ordering::Relaxed))
            .field("max_in_flight", &self.max_in_flight())
            .finish_non_exhaustive()
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        MockExecutorBuilder::new().build()
    }
}

impl MockExecutor {
    /// A mock with an active pod, 100 U in the reservoir, ready at once.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `accepted: false` to `kind` (or stop doing so).
    pub fn set_refuse(&self, kind: CommandKind, refuse: bool) {
        let mut refused = self.refused.lock().unwrap_or_else(|e| e.into_inner());
        if refuse {
            refused.insert(kind);
        } else {
            refused.remove(&kind);
        }
    }

    /// Answer `kind` with `response` regardless of what it should be.
    pub fn respond_with(&self, kind: CommandKind, response: CommandResponse) {
        self.overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, response);
    }

    /// Choose which error injected failures produce.
    pub fn set_failure(&self, failure: MockFailure) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = failure;
    }

    /// Make every command fail until turned off.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Configure transient failures.
    ///
    /// The mock will fail the next `count` commands, then answer normally.
    pub fn set_transient_failures(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }

    /// Get the number of remaining transient failures.
    pub fn remaining_failures(&self) -> u32 {
        self.remaining_failures.load(Ordering::Relaxed)
    }

    /// Set simulated latency.
    ///
    /// Each command will be delayed by this duration.
    /// Set to `Duration::ZERO` to disable latency simulation.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Report ready after `polls` more readiness polls.
    pub fn set_ready_after(&self, polls: u32) {
        self.readiness_polls.store(0, Ordering::Relaxed);
        self.ready_after.store(polls, Ordering::Relaxed);
    }

    /// Number of readiness polls so far.
    pub fn readiness_polls(&self) -> u32 {
        self.readiness_polls.load(Ordering::Relaxed)
    }

    /// Overwrite the reservoir level the pod reports.
    pub fn set_reservoir(&self, units: f64) {
        self.report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reservoir_units = units;
    }

    /// Overwrite whether the pod reports itself active.
    pub fn set_pod_active(&self, active: bool) {
        self.report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pod_active = active;
    }

    /// The status report the pod would give now.
    pub fn status_report(&self) -> StatusReport {
        self.report.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Every command received so far, in order.
    pub fn dispatched(&self) -> Vec<Command> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Kinds of every command received so far, in order.
    pub fn dispatched_kinds(&self) -> Vec<CommandKind> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(Command::kind)
            .collect()
    }

    /// Number of commands received so far.
    pub fn dispatch_count(&self) -> usize {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Forget the dispatch log.
    pub fn clear_log(&self) {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Highest number of commands seen in flight at the same time.
    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::Relaxed)
    }

    fn take_failure(&self) -> bool {
        if self.should_fail.load(Ordering::Relaxed) {
            return true;
        }
        self.remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn failure_for(&self, kind: CommandKind) -> Error {
        match *self.failure.lock().unwrap_or_else(|e| e.into_inner()) {
            MockFailure::Timeout => Error::timeout(kind.to_string(), Duration::from_secs(30)),
            MockFailure::LinkLost => Error::link_lost("mock link failure"),
            MockFailure::Nack => Error::nack(kind, "mock nack"),
        }
    }

    fn respond(&self, command: &Command) -> Result<CommandResponse> {
        let kind = command.kind();

        if self.take_failure() {
            return Err(self.failure_for(kind));
        }
        if let Some(response) = self
            .overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
        {
            return Ok(response.clone());
        }

        let refused = self
            .refused
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&kind);
        if !refused {
            let mut report = self.report.lock().unwrap_or_else(|e| e.into_inner());
            match command {
                Command::GetStatus => return Ok(CommandResponse::Status(report.clone())),
                Command::SetBolus { units } => {
                    report.reservoir_units = (report.reservoir_units - units).max(0.0);
                }
                Command::InitPod => report.pod_active = true,
                Command::DeactivatePod | Command::ResetPodStatus => report.pod_active = false,
                _ => {}
            }
        }

        CommandResponse::acknowledgement(kind, !refused).ok_or_else(|| Error::UnexpectedResponse {
            command: kind,
            response: "no refusal form".to_string(),
        })
    }
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    async fn execute(&self, command: Command) -> Result<CommandResponse> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.clone());

        let _wire = match &self.wire {
            Some(wire) => Some(wire.lock().await),
            None => None,
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let result = self.respond(&command);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn is_ready(&self) -> bool {
        let polls = self.readiness_polls.fetch_add(1, Ordering::Relaxed) + 1;
        let after = self.ready_after.load(Ordering::Relaxed);
        after != u32::MAX && polls >= after
    }
}

/// Builder for creating mock executors with custom settings.
#[derive(Debug)]
pub struct MockExecutorBuilder {
    reservoir_units: f64,
    battery_percent: u8,
    serial: Option<String>,
    pod_active: bool,
    refused: HashSet<CommandKind>,
    failure: MockFailure,
    should_fail: bool,
    transient_failures: u32,
    latency: Duration,
    ready_after: u32,
    single_flight: bool,
}

impl Default for MockExecutorBuilder {
    fn default() -> Self {
        Self {
            reservoir_units: 100.0,
            battery_percent: 100,
            serial: None,
            pod_active: true,
            refused: HashSet::new(),
            failure: MockFailure::default(),
            should_fail: false,
            transient_failures: 0,
            latency: Duration::ZERO,
            ready_after: 1,
            single_flight: false,
        }
    }
}

impl MockExecutorBuilder {
    /// Create a new builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reservoir level the pod reports.
    #[must_use]
    pub fn reservoir(mut self, units: f64) -> Self {
        self.reservoir_units = units;
        self
    }

    /// Set the battery level the pod reports.
    #[must_use]
    pub fn battery(mut self, percent: u8) -> Self {
        self.battery_percent = percent;
        self
    }

    /// Set the serial identifier (random by default).
    #[must_use]
    pub fn serial(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_string());
        self
    }

    /// Set whether a pod is paired and active.
    #[must_use]
    pub fn pod_active(mut self, active: bool) -> Self {
        self.pod_active = active;
        self
    }

    /// Answer `accepted: false` to `kind`.
    #[must_use]
    pub fn refuse(mut self, kind: CommandKind) -> Self {
        self.refused.insert(kind);
        self
    }

    /// Error produced by injected failures.
    #[must_use]
    pub fn failure(mut self, failure: MockFailure) -> Self {
        self.failure = failure;
        self
    }

    /// Fail every command.
    #[must_use]
    pub fn always_fail(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Fail the first `count` commands.
    #[must_use]
    pub fn transient_failures(mut self, count: u32) -> Self {
        self.transient_failures = count;
        self
    }

    /// Delay every answer by `latency`.
    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report ready from the `polls`-th readiness poll on.
    #[must_use]
    pub fn ready_after(mut self, polls: u32) -> Self {
        self.ready_after = polls;
        self
    }

    /// Never report ready.
    #[must_use]
    pub fn never_ready(mut self) -> Self {
        self.ready_after = u32::MAX;
        self
    }

    /// Serialize commands inside the mock, like a real transport.
    ///
    /// Off by default so the concurrency gauge shows what callers send.
    #[must_use]
    pub fn single_flight(mut self, enabled: bool) -> Self {
        self.single_flight = enabled;
        self
    }

    /// Build the mock executor.
    #[must_use]
    pub fn build(self) -> MockExecutor {
        let serial = self.serial.unwrap_or_else(|| {
            format!(
                "L{:05}-T{:07}",
                rand::random::<u32>() % 100_000,
                rand::random::<u32>() % 10_000_000
            )
        });

        MockExecutor {
            report: Mutex::new(StatusReport {
                reservoir_units: self.reservoir_units,
                battery_percent: self.battery_percent,
                serial,
                pod_active: self.pod_active,
            }),
            refused: Mutex::new(self.refused),
            overrides: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            failure: Mutex::new(self.failure),
            should_fail: AtomicBool::new(self.should_fail),
            remaining_failures: AtomicU32::new(self.transient_failures),
            latency_ms: AtomicU64::new(self.latency.as_millis() as u64),
            ready_after: AtomicU32::new(self.ready_after),
            readiness_polls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            wire: self.single_flight.then(|| tokio::sync::Mutex::new(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_accepts_by_default() {
        let pod = MockExecutor::new();
        let response = pod.execute(Command::SetBolus { units: 1.0 }).await.unwrap();
        assert!(response.accepted());
        assert!(response.responds_to(CommandKind::SetBolus));
        assert_eq!(pod.status_report().reservoir_units, 99.0);
    }

    #[tokio::test]
    async fn test_status_report() {
        let pod = MockExecutorBuilder::new()
            .reservoir(42.5)
            .battery(80)
            .serial("L12345-T0000001")
            .build();

        let response = pod.execute(Command::GetStatus).await.unwrap();
        let CommandResponse::Status(report) = response else {
            panic!("expected a status report");
        };
        assert_eq!(report.reservoir_units, 42.5);
        assert_eq!(report.battery_percent, 80);
        assert_eq!(report.serial, "L12345-T0000001");
        assert!(report.pod_active);
    }

    #[test]
    fn test_random_serial_format() {
        let pod = MockExecutor::new();
        let serial = pod.status_report().serial;
        assert!(serial.starts_with('L'));
        assert!(serial.contains("-T"));
    }

    #[tokio::test]
    async fn test_refusal() {
        let pod = MockExecutorBuilder::new()
            .refuse(CommandKind::SetTemporaryBasal)
            .build();
        let response = pod
            .execute(Command::SetTemporaryBasal {
                rate: 1.0,
                duration_minutes: 30,
            })
            .await
            .unwrap();
        assert!(!response.accepted());

        pod.set_refuse(CommandKind::SetTemporaryBasal, false);
        let response = pod
            .execute(Command::SetTemporaryBasal {
                rate: 1.0,
                duration_minutes: 30,
            })
            .await
            .unwrap();
        assert!(response.accepted());
    }

    #[tokio::test]
    async fn test_transient_failures() {
        let pod = MockExecutorBuilder::new()
            .transient_failures(2)
            .failure(MockFailure::Timeout)
            .build();

        for _ in 0..2 {
            let err = pod.execute(Command::CancelBolus).await.unwrap_err();
            assert!(matches!(err, Error::Timeout { .. }));
            assert!(err.is_ambiguous());
        }
        assert_eq!(pod.remaining_failures(), 0);
        assert!(pod.execute(Command::CancelBolus).await.is_ok());
        assert_eq!(pod.dispatch_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure() {
        let pod = MockExecutorBuilder::new().always_fail().build();
        pod.set_failure(MockFailure::Nack);
        let err = pod.execute(Command::GetStatus).await.unwrap_err();
        assert!(matches!(err, Error::Nack { command: CommandKind::GetStatus, .. }));

        pod.set_should_fail(false);
        assert!(pod.execute(Command::GetStatus).await.is_ok());
    }

    #[tokio::test]
    async fn test_pod_lifecycle_commands() {
        let pod = MockExecutorBuilder::new().pod_active(false).build();
        pod.execute(Command::InitPod).await.unwrap();
        assert!(pod.status_report().pod_active);
        pod.execute(Command::DeactivatePod).await.unwrap();
        assert!(!pod.status_report().pod_active);
    }

    #[tokio::test]
    async fn test_readiness_after_polls() {
        let pod = MockExecutorBuilder::new().ready_after(3).build();
        assert!(!pod.is_ready().await);
        assert!(!pod.is_ready().await);
        assert!(pod.is_ready().await);
        assert_eq!(pod.readiness_polls(), 3);

        let never = MockExecutorBuilder::new().never_ready().build();
        for _ in 0..50 {
            assert!(!never.is_ready().await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_gauge() {
        let pod = Arc::new(
            MockExecutorBuilder::new()
                .latency(Duration::from_millis(100))
                .build(),
        );
        let a = tokio::spawn({
            let pod = Arc::clone(&pod);
            async move { pod.execute(Command::CancelBolus).await }
        });
        let b = tokio::spawn({
            let pod = Arc::clone(&pod);
            async move { pod.execute(Command::GetStatus).await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(pod.max_in_flight(), 2);

        let serial = Arc::new(
            MockExecutorBuilder::new()
                .latency(Duration::from_millis(100))
                .single_flight(true)
                .build(),
        );
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pod = Arc::clone(&serial);
                tokio::spawn(async move { pod.execute(Command::GetStatus).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(serial.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_override_response() {
        let pod = MockExecutor::new();
        pod.respond_with(
            CommandKind::SetBolus,
            CommandResponse::acknowledgement(CommandKind::CancelBolus, true).unwrap(),
        );
        let response = pod.execute(Command::SetBolus { units: 1.0 }).await.unwrap();
        assert!(!response.responds_to(CommandKind::SetBolus));
        assert_eq!(pod.dispatched_kinds(), vec![CommandKind::SetBolus]);
        pod.clear_log();
        assert_eq!(pod.dispatch_count(), 0);
    }
}
