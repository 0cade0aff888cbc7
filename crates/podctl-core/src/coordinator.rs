//! Pump coordinator: the operations callers use.
//!
//! [`PodCoordinator`] turns requests such as "deliver 2 U" or "run 1.5 U/h
//! for 30 minutes" into command sequences for the [`CommandExecutor`],
//! updates the cached [`DeviceStatus`] and busy windows from the outcomes,
//! records treatments and statistics, and reports a normalised
//! [`EnactResult`].
//!
//! # Outcomes
//!
//! - A response with `accepted: false` is a refusal: nothing local changes
//!   and the result carries [`FailureKind::Refused`].
//! - An executor error (timeout, link loss, NACK) may have reached the pod.
//!   Nothing local changes either, but the result carries
//!   [`FailureKind::Uncertain`] so the caller can re-read status first.
//! - Requests that need no pod contact (same rate, same profile, nothing to
//!   cancel) succeed without being enacted.
//!
//! Nothing is retried automatically.
//!
//! # Concurrency
//!
//! One operation lock serializes whole operations, so a cancel-then-set
//! sequence never interleaves with another request. Status and busy
//! windows sit behind their own locks because the background prune task
//! and the readiness probe touch them too.

use std::ops::ControlFlow;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use podctl_types::{
    BasalProfile, CustomAction, CustomActionState, DriverState, EnactResult, FailureKind,
    MAX_BOLUS_UNITS, MAX_TEMP_BASAL_MINUTES, StatisticKey, TempBasal,
};

use crate::busy::{BusyTracker, InFlight, InFlightGuard, bolus_delivery_time};
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{
    BreakpointMatcher, InMemoryHistory, InMemoryPreferences, PREF_FIRST_PUMP_START,
    PREF_LAST_GOOD_COMMUNICATION, PreferenceStatistics, PreferenceStore, ProfileMatcher,
    Statistics, TreatmentHistory,
};
use crate::command::{Command, CommandKind, CommandResponse};
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver, PodEvent};
use crate::executor::CommandExecutor;
use crate::metrics::{DispatchMetrics, DispatchMetricsSummary, DispatchOutcome};
use crate::status::DeviceStatus;
use crate::supervisor::{ConnectionSupervisor, ProbeOptions};
use crate::tasks::PeriodicTask;

const OVERVIEW_BOLUS: &str = "Bolus";
const OVERVIEW_TBR: &str = "TBR";

/// Lifecycle bookkeeping guarded by one lock.
#[derive(Debug)]
struct Session {
    state: DriverState,
    pending_init: bool,
    pending_refresh: bool,
    started_announced: bool,
    prune_task: Option<PeriodicTask>,
    actions: Vec<CustomActionState>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: DriverState::Uninitialized,
            pending_init: true,
            pending_refresh: false,
            started_announced: false,
            prune_task: None,
            actions: vec![
                CustomActionState {
                    action: CustomAction::ResetRadioConfiguration,
                    enabled: true,
                },
                CustomActionState {
                    action: CustomAction::InitPod,
                    enabled: true,
                },
                CustomActionState {
                    action: CustomAction::DeactivatePod,
                    enabled: false,
                },
                CustomActionState {
                    action: CustomAction::ResetPodStatus,
                    enabled: false,
                },
            ],
        }
    }

    fn is_enabled(&self, action: CustomAction) -> bool {
        self.actions
            .iter()
            .any(|a| a.action == action && a.enabled)
    }

    /// Returns whether anything changed.
    fn set_enabled(&mut self, action: CustomAction, enabled: bool) -> bool {
        let mut changed = false;
        for entry in self.actions.iter_mut().filter(|a| a.action == action) {
            changed |= entry.enabled != enabled;
            entry.enabled = enabled;
        }
        changed
    }

    /// Derive enablement from pod activity. Returns whether anything changed.
    fn sync_with_pod(&mut self, pod_active: bool) -> bool {
        let mut changed = self.set_enabled(CustomAction::InitPod, !pod_active);
        changed |= self.set_enabled(CustomAction::DeactivatePod, pod_active);
        changed |= self.set_enabled(CustomAction::ResetPodStatus, pod_active);
        changed
    }
}

/// Coordinates every command sent to one pod.
///
/// Create one with [`PodCoordinator::builder`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use podctl_core::{MockExecutor, PodCoordinator};
///
/// #[tokio::main]
/// async fn main() -> podctl_core::Result<()> {
///     let coordinator = PodCoordinator::builder(Arc::new(MockExecutor::new())).build()?;
///     coordinator.on_transport_connected().await;
///     // ... once the readiness probe reported the pod ready:
///     coordinator.get_pump_status(true).await?;
///
///     let result = coordinator.deliver_bolus(2.0, 30.0, false).await;
///     println!("{result}");
///     Ok(())
/// }
/// ```
pub struct PodCoordinator {
    executor: Arc<dyn CommandExecutor>,
    clock: Arc<dyn Clock>,
    history: Arc<dyn TreatmentHistory>,
    statistics: Arc<dyn Statistics>,
    preferences: Arc<dyn PreferenceStore>,
    matcher: Arc<dyn ProfileMatcher>,
    config: DriverConfig,
    events: EventDispatcher,
    status: Arc<RwLock<DeviceStatus>>,
    busy: Arc<Mutex<BusyTracker>>,
    in_flight: InFlight,
    session: Mutex<Session>,
    operation: Mutex<()>,
    supervisor: ConnectionSupervisor,
    metrics: DispatchMetrics,
}

impl std::fmt::Debug for PodCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodCoordinator")
            .field("config", &self.config)
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

impl PodCoordinator {
    /// Start building a coordinator around `executor`.
    pub fn builder(executor: Arc<dyn CommandExecutor>) -> PodCoordinatorBuilder {
        PodCoordinatorBuilder::new(executor)
    }

    // --- Lifecycle ---

    /// Current lifecycle state.
    pub async fn state(&self) -> DriverState {
        self.session.lock().await.state
    }

    /// The radio transport (re)connected.
    ///
    /// Moves to `Connecting` and starts the readiness probe. Ignored while
    /// the driver is already initialised.
    pub async fn on_transport_connected(&self) {
        let mut session = self.session.lock().await;
        if matches!(
            session.state,
            DriverState::Initialized | DriverState::Unreachable
        ) {
            debug!("Transport connected while {}, nothing to do", session.state);
            return;
        }
        self.transition(&mut session, DriverState::Connecting);
        session.pending_init = true;
        drop(session);

        self.supervisor.start(
            Arc::clone(&self.executor),
            Arc::clone(&self.status),
            self.events.clone(),
        );
    }

    /// Initialise if needed, optionally refreshing from the pod.
    ///
    /// The first call after the readiness probe succeeded restores the
    /// persisted connection time, writes the first-start marker, announces
    /// the driver once, moves to `Initialized` and starts the busy-window
    /// prune. Before the probe succeeded this returns
    /// [`Error::NotInitialized`].
    ///
    /// With `refresh` (or after [`reset_status_state`](Self::reset_status_state))
    /// the pod's status is read: success overwrites the cached values and
    /// recovers from `Unreachable`; an executor error moves `Initialized` to
    /// `Unreachable` and is returned.
    pub async fn get_pump_status(&self, refresh: bool) -> Result<DriverState> {
        let _operation = self.operation.lock().await;

        let mut session = self.session.lock().await;
        if session.pending_init {
            if self.status.read().await.is_pre_init() {
                debug!("Status requested before the pod is ready ({})", session.state);
                return Err(Error::NotInitialized {
                    state: session.state,
                });
            }
            self.initialize(&mut session).await;
        }

        let refresh = refresh || std::mem::take(&mut session.pending_refresh);
        if !refresh {
            return Ok(session.state);
        }
        drop(session);

        let outcome = self.dispatch(Command::GetStatus).await;
        let mut session = self.session.lock().await;
        match outcome {
            Ok(CommandResponse::Status(report)) => {
                let now = self.clock.now();
                self.status.write().await.apply_status_report(&report, now);
                self.preferences
                    .put_i64(PREF_LAST_GOOD_COMMUNICATION, now.unix_timestamp());
                info!(
                    "Pod status: reservoir {:.2} U, battery {}%, pod active: {}",
                    report.reservoir_units, report.battery_percent, report.pod_active
                );

                if session.state == DriverState::Unreachable {
                    self.transition(&mut session, DriverState::Initialized);
                }
                if session.sync_with_pod(report.pod_active) {
                    self.events.send(PodEvent::CustomActionsChanged);
                }
                self.events.send(PodEvent::ValuesChanged);
                Ok(session.state)
            }
            Ok(other) => Err(Error::UnexpectedResponse {
                command: CommandKind::GetStatus,
                response: format!("{other:?}"),
            }),
            Err(e) => {
                if e.is_ambiguous() && session.state == DriverState::Initialized {
                    warn!("Status read failed, pod unreachable: {}", e);
                    self.transition(&mut session, DriverState::Unreachable);
                }
                Err(e)
            }
        }
    }

    /// Re-run initialisation, with a status refresh, on the next
    /// [`get_pump_status`](Self::get_pump_status).
    pub async fn reset_status_state(&self) {
        let mut session = self.session.lock().await;
        session.pending_init = true;
        session.pending_refresh = true;
        debug!("Status state reset, will re-initialise on next status request");
    }

    /// Stop background tasks.
    pub async fn shutdown(&self) {
        self.supervisor.stop();
        if let Some(task) = self.session.lock().await.prune_task.take() {
            task.stop();
        }
        info!("Pod coordinator shut down");
    }

    async fn initialize(&self, session: &mut Session) {
        let now = self.clock.now();

        if let Some(at) = self
            .preferences
            .get_i64(PREF_LAST_GOOD_COMMUNICATION)
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        {
            debug!("Restoring last good communication time {}", at);
            self.status.write().await.restore_last_connection(at);
        }

        if !self.preferences.contains(PREF_FIRST_PUMP_START) {
            info!("First start of the pod driver");
            self.preferences
                .put_i64(PREF_FIRST_PUMP_START, now.unix_timestamp());
        }

        if !session.started_announced {
            session.started_announced = true;
            self.events.send(PodEvent::DriverStarted {
                version: env!("CARGO_PKG_VERSION").to_string(),
            });
        }

        self.transition(session, DriverState::Initialized);
        if session.prune_task.is_none() {
            session.prune_task = Some(self.spawn_prune_task());
        }
        session.pending_init = false;
        info!("Pod driver initialized");
    }

    fn spawn_prune_task(&self) -> PeriodicTask {
        let busy = Arc::clone(&self.busy);
        let clock = Arc::clone(&self.clock);
        PeriodicTask::spawn("busy-prune", self.config.busy.prune_interval(), move |_| {
            let busy = Arc::clone(&busy);
            let clock = Arc::clone(&clock);
            async move {
                busy.lock().await.prune(clock.now());
                ControlFlow::Continue(())
            }
        })
    }

    fn transition(&self, session: &mut Session, to: DriverState) {
        let from = session.state;
        if from == to {
            return;
        }
        session.state = to;
        info!("Driver state {} -> {}", from, to);
        self.events.send(PodEvent::StateChanged { from, to });
    }

    // --- Bolus ---

    /// Deliver an immediate bolus.
    ///
    /// On success the reservoir estimate drops by `units`, the treatment
    /// and statistic are recorded, and the pod is considered busy for as
    /// long as delivery takes. Refused while a previous bolus is still
    /// being delivered.
    pub async fn deliver_bolus(&self, units: f64, carbs: f64, is_smb: bool) -> EnactResult {
        info!(
            "Deliver bolus: {:.2} U, {} g carbs, smb: {}",
            units, carbs, is_smb
        );
        if !units.is_finite() || units <= 0.0 {
            return EnactResult::failed(
                FailureKind::InvalidRequest,
                format!("invalid bolus amount {units}"),
            );
        }
        if units > MAX_BOLUS_UNITS {
            return EnactResult::failed(
                FailureKind::InvalidRequest,
                format!("bolus of {units} U exceeds {MAX_BOLUS_UNITS} U"),
            );
        }
        if !carbs.is_finite() || carbs < 0.0 {
            return EnactResult::failed(
                FailureKind::InvalidRequest,
                format!("invalid carbs amount {carbs}"),
            );
        }

        let _operation = self.operation.lock().await;
        if let Some(refusal) = self.refuse_unless_ready().await {
            return refusal;
        }
        if let Some(refusal) = self.refuse_if_busy().await {
            return refusal;
        }

        let result = match self.dispatch(Command::SetBolus { units }).await {
            Ok(response) if response.accepted() => {
                let now = self.clock.now();
                let shortfall = self.status.write().await.apply_bolus_effect(units);
                if let Some(missing) = shortfall {
                    self.events.send(PodEvent::ReservoirDiscrepancy {
                        requested: units,
                        available: units - missing,
                    });
                }

                self.history.record_bolus(units, carbs, now);
                self.statistics.increment(if is_smb {
                    StatisticKey::SmbBoluses
                } else {
                    StatisticKey::StandardBoluses
                });

                let delivery = bolus_delivery_time(units, self.config.bolus.seconds_per_unit);
                let until = self.busy.lock().await.mark_busy_for(now, delivery);
                info!("Bolus of {:.2} U delivered, pod busy until {}", units, until);

                EnactResult::applied()
                    .bolus_delivered(units)
                    .carbs_delivered(carbs)
            }
            Ok(_) => {
                warn!("Bolus of {:.2} U refused by pod", units);
                EnactResult::failed(FailureKind::Refused, "bolus not delivered")
            }
            Err(e) => {
                error!("Bolus of {:.2} U has unknown outcome: {}", units, e);
                failure_from_error(&e, "bolus outcome unknown")
            }
        };

        self.finish_action(OVERVIEW_BOLUS);
        result
    }

    /// Stop a bolus in progress.
    ///
    /// Never refused for being busy. Reservoir and history are left to the
    /// caller to correct.
    pub async fn stop_bolus_delivering(&self) -> EnactResult {
        info!("Stop bolus delivering");
        let _operation = self.operation.lock().await;
        if let Some(refusal) = self.refuse_unless_ready().await {
            return refusal;
        }

        let result = match self.dispatch(Command::CancelBolus).await {
            Ok(response) if response.accepted() => {
                info!("Bolus delivery stopped");
                EnactResult::applied()
            }
            Ok(_) => {
                warn!("Pod refused to stop the bolus");
                EnactResult::failed(FailureKind::Refused, "bolus could not be stopped")
            }
            Err(e) => {
                error!("Stopping the bolus has unknown outcome: {}", e);
                failure_from_error(&e, "bolus stop outcome unknown")
            }
        };

        self.finish_action(OVERVIEW_BOLUS);
        result
    }

    // --- Temporary basal ---

    /// Run `rate` U/h for `duration_minutes`.
    ///
    /// If a temporary basal with the same rate (within the configured
    /// tolerance) is already running and `enforce_new` is false, nothing is
    /// sent. Otherwise a running temporary basal is cancelled first; if the
    /// pod refuses that, the new rate is never sent.
    pub async fn set_temp_basal_absolute(
        &self,
        rate: f64,
        duration_minutes: u32,
        profile: &BasalProfile,
        enforce_new: bool,
    ) -> EnactResult {
        info!(
            "Set temporary basal: {:.2} U/h for {} min (enforce new: {})",
            rate, duration_minutes, enforce_new
        );
        if !rate.is_finite() || rate < 0.0 {
            return EnactResult::failed(
                FailureKind::InvalidRequest,
                format!("invalid temporary basal rate {rate}"),
            );
        }
        if duration_minutes == 0 {
            return EnactResult::failed(
                FailureKind::InvalidRequest,
                "temporary basal duration must be at least one minute",
            );
        }
        if duration_minutes > MAX_TEMP_BASAL_MINUTES {
            return EnactResult::failed(
                FailureKind::InvalidRequest,
                format!(
                    "temporary basal duration {duration_minutes} min exceeds {MAX_TEMP_BASAL_MINUTES} min"
                ),
            );
        }

        let _operation = self.operation.lock().await;
        if let Some(refusal) = self.refuse_unless_ready().await {
            return refusal;
        }
        if let Some(refusal) = self.refuse_if_busy().await {
            return refusal;
        }

        let now = self.clock.now();
        debug!(
            "Scheduled basal rate now: {:.2} U/h",
            profile.rate_at(now.time())
        );
        let current = self.status.write().await.read_temp_basal(now);

        let mut cancelled_previous = false;
        if let Some(tbr) = current {
            debug!(
                "Temporary basal running: {:.2} U/h, {} min, ends {}",
                tbr.rate(),
                tbr.duration_minutes(),
                tbr.end()
            );

            if !enforce_new && (tbr.rate() - rate).abs() <= self.config.temp_basal.rate_tolerance {
                info!("Same temporary basal rate requested, not re-setting");
                self.metrics.record_short_circuit();
                self.finish_action(OVERVIEW_TBR);
                return EnactResult::unchanged()
                    .absolute(tbr.rate())
                    .duration(tbr.duration_minutes());
            }

            info!("Temporary basal running, cancelling it first");
            match self.dispatch(Command::CancelTemporaryBasal).await {
                Ok(response) if response.accepted() => {
                    self.status.write().await.clear_temp_basal();
                    cancelled_previous = true;
                    info!("Running temporary basal cancelled");
                }
                Ok(_) => {
                    error!("Pod refused to cancel the running temporary basal");
                    self.finish_action(OVERVIEW_TBR);
                    return EnactResult::failed(
                        FailureKind::Refused,
                        "can't cancel TBR, stopping operation",
                    );
                }
                Err(e) => {
                    error!("Cancelling the running temporary basal has unknown outcome: {}", e);
                    self.finish_action(OVERVIEW_TBR);
                    return failure_from_error(&e, "can't cancel TBR, stopping operation");
                }
            }
        }

        let outcome = self
            .dispatch(Command::SetTemporaryBasal {
                rate,
                duration_minutes,
            })
            .await;
        let result = match outcome {
            Ok(response) if response.accepted() => {
                let now = self.clock.now();
                let tbr = self
                    .status
                    .write()
                    .await
                    .set_temp_basal(now, rate, duration_minutes);
                self.history
                    .record_temporary_basal(Some(rate), duration_minutes, now);
                self.statistics.increment(StatisticKey::TbrsSet);
                match tbr {
                    Some(tbr) => info!(
                        "Temporary basal {:.2} U/h running until {}",
                        tbr.rate(),
                        tbr.end()
                    ),
                    None => warn!("Temporary basal end is out of range, not tracking it"),
                }
                EnactResult::applied().absolute(rate).duration(duration_minutes)
            }
            Ok(_) => {
                warn!("Pod refused temporary basal of {:.2} U/h", rate);
                self.record_cancel_only(cancelled_previous);
                EnactResult::failed(FailureKind::Refused, "TBR could not be set")
            }
            Err(e) => {
                error!("Setting temporary basal has unknown outcome: {}", e);
                self.record_cancel_only(cancelled_previous);
                failure_from_error(&e, "TBR outcome unknown")
            }
        };

        self.finish_action(OVERVIEW_TBR);
        result
    }

    /// The previous temporary basal was cancelled but no new one started;
    /// history must show the cancellation.
    fn record_cancel_only(&self, cancelled_previous: bool) {
        if cancelled_previous {
            self.history
                .record_temporary_basal(None, 0, self.clock.now());
        }
    }

    /// Cancel the running temporary basal.
    ///
    /// Succeeds without contacting the pod if none is running, so calling it
    /// twice is harmless. Never refused for being busy.
    pub async fn cancel_temp_basal(&self) -> EnactResult {
        info!("Cancel temporary basal");
        let _operation = self.operation.lock().await;
        if let Some(refusal) = self.refuse_unless_ready().await {
            return refusal;
        }

        let now = self.clock.now();
        if self.status.write().await.read_temp_basal(now).is_none() {
            info!("No temporary basal running, already cancelled");
            self.metrics.record_short_circuit();
            self.finish_action(OVERVIEW_TBR);
            return EnactResult::unchanged();
        }

        let result = match self.dispatch(Command::CancelTemporaryBasal).await {
            Ok(response) if response.accepted() => {
                let now = self.clock.now();
                self.status.write().await.clear_temp_basal();
                self.history.record_temporary_basal(None, 0, now);
                info!("Temporary basal cancelled");
                EnactResult::applied().temp_cancel()
            }
            Ok(_) => {
                warn!("Pod refused to cancel the temporary basal");
                EnactResult::failed(FailureKind::Refused, "can't cancel TBR")
            }
            Err(e) => {
                error!("Cancelling temporary basal has unknown outcome: {}", e);
                failure_from_error(&e, "TBR cancel outcome unknown")
            }
        };

        self.finish_action(OVERVIEW_TBR);
        result
    }

    /// The temporary basal believed to be running, if any.
    pub async fn active_temp_basal(&self) -> Option<TempBasal> {
        let now = self.clock.now();
        self.status.write().await.read_temp_basal(now)
    }

    // --- Basal profile ---

    /// Store a new full-day basal schedule on the pod.
    ///
    /// Nothing is sent if it behaves the same as the cached one.
    pub async fn set_new_basal_profile(&self, profile: BasalProfile) -> EnactResult {
        info!(
            "Set basal profile: {} segment(s), {:.2} U/day",
            profile.segments().len(),
            profile.daily_total()
        );
        let _operation = self.operation.lock().await;

        if self
            .status
            .read()
            .await
            .is_profile_equal(&profile, self.matcher.as_ref())
        {
            info!("Basal profile is the same, not set");
            self.metrics.record_short_circuit();
            return EnactResult::unchanged().with_comment("basal profile is the same, not set");
        }

        if let Some(refusal) = self.refuse_unless_ready().await {
            return refusal;
        }
        if let Some(refusal) = self.refuse_if_busy().await {
            return refusal;
        }

        let result = match self.dispatch(Command::SetBasalProfile(profile.clone())).await {
            Ok(response) if response.accepted() => {
                self.status.write().await.cache_profile(profile);
                info!("Basal profile set");
                EnactResult::applied()
            }
            Ok(_) => {
                warn!("Pod refused the basal profile");
                EnactResult::failed(FailureKind::Refused, "basal profile could not be set")
            }
            Err(e) => {
                error!("Setting basal profile has unknown outcome: {}", e);
                failure_from_error(&e, "basal profile outcome unknown")
            }
        };

        self.events.send(PodEvent::ValuesChanged);
        result
    }

    /// Whether `profile` is what the pod runs.
    ///
    /// True when no profile was ever confirmed, so a first run is never
    /// blocked on it.
    pub async fn is_this_profile_set(&self, profile: &BasalProfile) -> bool {
        let status = self.status.read().await;
        match status.cached_profile() {
            None => true,
            Some(cached) => self.matcher.is_same(cached, profile),
        }
    }

    /// Scheduled basal rate right now, from the cached profile.
    ///
    /// Zero if no profile is cached. The time of day is the wall-clock time
    /// in the clock's offset, local time for [`SystemClock`]. Never contacts
    /// the pod.
    pub async fn get_base_basal_rate(&self) -> f64 {
        let now = self.clock.now();
        self.status
            .read()
            .await
            .cached_profile()
            .map_or(0.0, |profile| profile.rate_at(now.time()))
    }

    // --- Busy ---

    /// Whether a command is in flight or the pod is still executing one.
    pub async fn is_busy(&self) -> bool {
        if self.in_flight.is_set() {
            return true;
        }
        let now = self.clock.now();
        self.busy.lock().await.is_busy(now)
    }

    // --- Cached values ---

    /// When the pod last answered, or now if it never has.
    pub async fn last_data_time(&self) -> OffsetDateTime {
        self.status
            .read()
            .await
            .last_connection_time()
            .unwrap_or_else(|| self.clock.now())
    }

    /// Estimated insulin left, in units.
    pub async fn reservoir_level(&self) -> f64 {
        self.status.read().await.reservoir_units()
    }

    /// Battery remaining, in percent.
    pub async fn battery_level(&self) -> u8 {
        self.status.read().await.battery()
    }

    /// Pod serial identifier, empty until reported.
    pub async fn serial_number(&self) -> String {
        self.status.read().await.serial().to_string()
    }

    /// A copy of the whole cached status.
    pub async fn status_snapshot(&self) -> DeviceStatus {
        self.status.read().await.clone()
    }

    // --- Custom actions ---

    /// Maintenance actions and whether each may run now.
    pub async fn custom_actions(&self) -> Vec<CustomActionState> {
        self.session.lock().await.actions.clone()
    }

    /// Enable or disable a custom action.
    pub async fn set_custom_action_enabled(&self, action: CustomAction, enabled: bool) {
        let changed = self.session.lock().await.set_enabled(action, enabled);
        if changed {
            debug!("Custom action '{}' enabled: {}", action, enabled);
            self.events.send(PodEvent::CustomActionsChanged);
        }
    }

    /// Run a maintenance action.
    ///
    /// Returns whether the pod performed it. Disabled actions are rejected
    /// with [`Error::InvalidArgument`]; everything but resetting the radio
    /// needs an initialised driver.
    pub async fn execute_custom_action(&self, action: CustomAction) -> Result<bool> {
        info!("Execute custom action '{}'", action);
        let _operation = self.operation.lock().await;

        {
            let session = self.session.lock().await;
            if !session.is_enabled(action) {
                return Err(Error::invalid_argument(format!(
                    "custom action '{action}' is disabled"
                )));
            }
            if action != CustomAction::ResetRadioConfiguration && !session.state.accepts_commands()
            {
                return Err(Error::NotInitialized {
                    state: session.state,
                });
            }
        }

        let response = self.dispatch(Command::for_custom_action(action)).await?;
        if !response.accepted() {
            warn!("Custom action '{}' was refused", action);
            return Ok(false);
        }

        let pod_active = {
            let mut status = self.status.write().await;
            match action {
                CustomAction::InitPod => status.set_pod_active(true),
                CustomAction::DeactivatePod | CustomAction::ResetPodStatus => {
                    status.reset_pod_state()
                }
                CustomAction::ResetRadioConfiguration => {}
            }
            status.pod_active()
        };

        if self.session.lock().await.sync_with_pod(pod_active) {
            self.events.send(PodEvent::CustomActionsChanged);
        }
        self.events.send(PodEvent::ValuesChanged);
        info!("Custom action '{}' done", action);
        Ok(true)
    }

    // --- Observability ---

    /// Subscribe to driver events.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// The event dispatcher.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Dispatch counters and latencies.
    pub fn metrics(&self) -> DispatchMetricsSummary {
        self.metrics.summary()
    }

    /// Configuration in use.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Whether the readiness probe is running.
    pub fn is_probing(&self) -> bool {
        self.supervisor.is_probing()
    }

    // --- Dispatch ---

    /// Send one command, keeping the in-flight flag, refresh affordance,
    /// communication time and metrics in step.
    async fn dispatch(&self, command: Command) -> Result<CommandResponse> {
        let kind = command.kind();
        debug!("Dispatching {}", kind);

        let guard = DispatchGuard::enter(&self.in_flight, &self.events);
        let started = Instant::now();

        let result = self.executor.execute(command).await;

        let elapsed = started.elapsed();
        drop(guard);

        let result = result.and_then(|response| {
            if response.responds_to(kind) {
                Ok(response)
            } else {
                Err(Error::UnexpectedResponse {
                    command: kind,
                    response: format!("{response:?}"),
                })
            }
        });

        let outcome = match &result {
            Ok(response) => {
                debug!(
                    "{} answered in {:?}, accepted: {}",
                    kind,
                    elapsed,
                    response.accepted()
                );
                if !matches!(response, CommandResponse::Status(_)) {
                    self.record_communication().await;
                }
                if response.accepted() {
                    DispatchOutcome::Accepted
                } else {
                    DispatchOutcome::Refused
                }
            }
            Err(e) => {
                warn!("{} failed after {:?}: {}", kind, elapsed, e);
                DispatchOutcome::Failed
            }
        };
        self.metrics.record(kind, outcome, elapsed);

        result
    }

    async fn record_communication(&self) {
        let now = self.clock.now();
        self.status.write().await.mark_communication(now);
        self.preferences
            .put_i64(PREF_LAST_GOOD_COMMUNICATION, now.unix_timestamp());
    }

    async fn refuse_unless_ready(&self) -> Option<EnactResult> {
        let state = self.session.lock().await.state;
        if state.accepts_commands() {
            return None;
        }
        warn!("Driver not ready ({}), request refused", state);
        Some(EnactResult::failed(
            FailureKind::NotReady,
            format!("driver not ready ({state})"),
        ))
    }

    async fn refuse_if_busy(&self) -> Option<EnactResult> {
        let now = self.clock.now();
        let until = self.busy.lock().await.busy_until(now)?;
        let error = Error::Busy { until };
        info!("{}, request refused", error);
        self.metrics.record_busy_refusal();
        Some(failure_from_error(&error, "request refused"))
    }

    fn finish_action(&self, overview_key: &str) {
        self.events.send(PodEvent::OverviewRefresh {
            key: overview_key.to_string(),
        });
        self.events.send(PodEvent::ValuesChanged);
        self.events.send(PodEvent::RefreshButton { enabled: true });
    }
}

impl Drop for PodCoordinator {
    fn drop(&mut self) {
        self.supervisor.stop();
    }
}

/// Holds the in-flight flag and disabled refresh affordance for one dispatch.
///
/// Dropping it, including when the dispatching future is dropped, lowers
/// the flag and re-enables the affordance.
struct DispatchGuard<'a> {
    _flight: InFlightGuard<'a>,
    events: &'a EventDispatcher,
}

impl<'a> DispatchGuard<'a> {
    fn enter(in_flight: &'a InFlight, events: &'a EventDispatcher) -> Self {
        let flight = in_flight.enter();
        events.send(PodEvent::RefreshButton { enabled: false });
        Self {
            _flight: flight,
            events,
        }
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.events.send(PodEvent::RefreshButton { enabled: true });
    }
}

/// Fold an error that ended an operation into a failed result.
fn failure_from_error(error: &Error, context: &str) -> EnactResult {
    let kind = match error {
        Error::NotInitialized { .. } => FailureKind::NotReady,
        Error::Busy { .. } => FailureKind::Busy,
        Error::InvalidArgument(_) | Error::Profile(_) => FailureKind::InvalidRequest,
        _ => FailureKind::Uncertain,
    };
    EnactResult::failed(kind, format!("{context}: {error}"))
}

/// Builder for [`PodCoordinator`].
///
/// Every collaborator defaults to an in-memory implementation.
pub struct PodCoordinatorBuilder {
    executor: Arc<dyn CommandExecutor>,
    clock: Option<Arc<dyn Clock>>,
    history: Option<Arc<dyn TreatmentHistory>>,
    statistics: Option<Arc<dyn Statistics>>,
    preferences: Option<Arc<dyn PreferenceStore>>,
    matcher: Option<Arc<dyn ProfileMatcher>>,
    events: Option<EventDispatcher>,
    config: DriverConfig,
}

impl std::fmt::Debug for PodCoordinatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodCoordinatorBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PodCoordinatorBuilder {
    /// Create a builder around `executor`.
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            clock: None,
            history: None,
            statistics: None,
            preferences: None,
            matcher: None,
            events: None,
            config: DriverConfig::default(),
        }
    }

    /// Use `clock` for every time computation.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Record treatments in `history`.
    #[must_use]
    pub fn history(mut self, history: Arc<dyn TreatmentHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Count boluses and temporary basals in `statistics`.
    ///
    /// Defaults to counters kept in the preference store.
    #[must_use]
    pub fn statistics(mut self, statistics: Arc<dyn Statistics>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    /// Persist timestamps in `preferences`.
    #[must_use]
    pub fn preferences(mut self, preferences: Arc<dyn PreferenceStore>) -> Self {
        self.preferences = Some(preferences);
        self
    }

    /// Compare basal profiles with `matcher`.
    ///
    /// Defaults to a [`BreakpointMatcher`] with the configured tolerance.
    #[must_use]
    pub fn matcher(mut self, matcher: Arc<dyn ProfileMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Send events through `events`.
    #[must_use]
    pub fn events(mut self, events: EventDispatcher) -> Self {
        self.events = Some(events);
        self
    }

    /// Use `config`.
    #[must_use]
    pub fn config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and build the coordinator.
    pub fn build(self) -> Result<PodCoordinator> {
        self.config
            .validate()
            .map_err(|e| Error::invalid_config(e.to_string()))?;

        let preferences = self
            .preferences
            .unwrap_or_else(|| Arc::new(InMemoryPreferences::new()));
        let statistics = self
            .statistics
            .unwrap_or_else(|| Arc::new(PreferenceStatistics::new(Arc::clone(&preferences))));
        let matcher = self.matcher.unwrap_or_else(|| {
            Arc::new(BreakpointMatcher::new(self.config.profile.rate_tolerance))
        });
        let events = self
            .events
            .unwrap_or_else(|| EventDispatcher::new(self.config.events.capacity));
        let supervisor = ConnectionSupervisor::new(ProbeOptions::from(&self.config.probe));

        Ok(PodCoordinator {
            executor: self.executor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            history: self
                .history
                .unwrap_or_else(|| Arc::new(InMemoryHistory::new())),
            statistics,
            preferences,
            matcher,
            config: self.config,
            events,
            status: Arc::new(RwLock::new(DeviceStatus::new())),
            busy: Arc::new(Mutex::new(BusyTracker::new())),
            in_flight: InFlight::new(),
            session: Mutex::new(Session::new()),
            operation: Mutex::new(()),
            supervisor,
            metrics: DispatchMetrics::new(),
        })
    }
}
