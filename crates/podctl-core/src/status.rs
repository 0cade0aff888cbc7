//! Locally cached view of the pod.
//!
//! The pod cannot be asked about everything at every instant, so the driver
//! keeps its own picture: a reservoir estimate decremented on each bolus, the
//! temporary basal it believes is running, the last profile it stored, and
//! when it last heard from the pod. [`DeviceStatus`] holds that picture and
//! enforces its invariants; it never talks to the pod itself.

use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use podctl_types::{BasalProfile, TempBasal};

use crate::collaborators::ProfileMatcher;
use crate::command::StatusReport;

/// Cached pod state, owned by one coordinator for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    reservoir_remaining_units: f64,
    battery_remaining: u8,
    last_connection_time: Option<OffsetDateTime>,
    previous_connection_time: Option<OffsetDateTime>,
    active_temp_basal: Option<TempBasal>,
    cached_basal_profile: Option<BasalProfile>,
    serial_identifier: String,
    pre_init: bool,
    pod_active: bool,
    reservoir_discrepancy: bool,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStatus {
    /// A status with nothing known yet, in pre-init.
    pub fn new() -> Self {
        Self {
            reservoir_remaining_units: 0.0,
            battery_remaining: 0,
            last_connection_time: None,
            previous_connection_time: None,
            active_temp_basal: None,
            cached_basal_profile: None,
            serial_identifier: String::new(),
            pre_init: true,
            pod_active: false,
            reservoir_discrepancy: false,
        }
    }

    // --- Reservoir and battery ---

    /// Estimated insulin left, in units.
    pub fn reservoir_units(&self) -> f64 {
        self.reservoir_remaining_units
    }

    /// Battery remaining, in percent.
    pub fn battery(&self) -> u8 {
        self.battery_remaining
    }

    /// Whether a bolus asked for more insulin than the estimate held.
    ///
    /// Cleared by the next authoritative status report.
    pub fn has_reservoir_discrepancy(&self) -> bool {
        self.reservoir_discrepancy
    }

    /// Overwrite the reservoir estimate.
    pub fn set_reservoir(&mut self, units: f64) {
        self.reservoir_remaining_units = units.max(0.0);
        self.reservoir_discrepancy = false;
    }

    /// Subtract a delivered bolus from the reservoir estimate.
    ///
    /// The estimate is clamped at zero. If the bolus exceeded it, the missing
    /// amount is returned and the discrepancy flag is raised.
    pub fn apply_bolus_effect(&mut self, units: f64) -> Option<f64> {
        let remaining = self.reservoir_remaining_units - units;
        if remaining < 0.0 {
            warn!(
                "Bolus of {:.2} U exceeds reservoir estimate of {:.2} U",
                units, self.reservoir_remaining_units
            );
            self.reservoir_remaining_units = 0.0;
            self.reservoir_discrepancy = true;
            Some(-remaining)
        } else {
            self.reservoir_remaining_units = remaining;
            None
        }
    }

    // --- Temporary basal ---

    /// Record a freshly enacted temporary basal starting at `now`.
    ///
    /// Returns `None` (and leaves no window active) if its end is not
    /// representable.
    pub fn set_temp_basal(
        &mut self,
        now: OffsetDateTime,
        rate: f64,
        duration_minutes: u32,
    ) -> Option<TempBasal> {
        self.active_temp_basal = TempBasal::new(now, rate, duration_minutes);
        self.active_temp_basal
    }

    /// Forget the active temporary basal.
    pub fn clear_temp_basal(&mut self) {
        self.active_temp_basal = None;
    }

    /// The active temporary basal, dropping it first if it has ended.
    pub fn read_temp_basal(&mut self, now: OffsetDateTime) -> Option<TempBasal> {
        if self
            .active_temp_basal
            .is_some_and(|tbr| tbr.is_expired_at(now))
        {
            debug!("Temporary basal ran out, clearing");
            self.active_temp_basal = None;
        }
        self.active_temp_basal
    }

    // --- Basal profile ---

    /// The last profile the pod confirmed.
    pub fn cached_profile(&self) -> Option<&BasalProfile> {
        self.cached_basal_profile.as_ref()
    }

    /// Remember a profile the pod confirmed.
    pub fn cache_profile(&mut self, profile: BasalProfile) {
        self.cached_basal_profile = Some(profile);
    }

    /// Whether `candidate` matches the cached profile.
    ///
    /// False when nothing is cached.
    pub fn is_profile_equal(&self, candidate: &BasalProfile, matcher: &dyn ProfileMatcher) -> bool {
        self.cached_basal_profile
            .as_ref()
            .is_some_and(|cached| matcher.is_same(cached, candidate))
    }

    // --- Connection bookkeeping ---

    /// When the pod last answered.
    pub fn last_connection_time(&self) -> Option<OffsetDateTime> {
        self.last_connection_time
    }

    /// The connection time before the last one.
    pub fn previous_connection_time(&self) -> Option<OffsetDateTime> {
        self.previous_connection_time
    }

    /// Seed both connection timestamps from persisted state.
    pub fn restore_last_connection(&mut self, at: OffsetDateTime) {
        self.last_connection_time = Some(at);
        self.previous_connection_time = Some(at);
    }

    /// Record a successful exchange with the pod.
    pub fn mark_communication(&mut self, at: OffsetDateTime) {
        self.previous_connection_time = self.last_connection_time;
        self.last_connection_time = Some(at);
    }

    /// Time since the pod last answered, `None` if it never has.
    pub fn since_last_connection(&self, now: OffsetDateTime) -> Option<Duration> {
        self.last_connection_time.map(|t| now - t)
    }

    /// Whether the cached view is older than `max_age`.
    ///
    /// A status that never heard from the pod is stale.
    pub fn is_stale(&self, now: OffsetDateTime, max_age: Duration) -> bool {
        self.since_last_connection(now)
            .is_none_or(|age| age > max_age)
    }

    /// Overwrite everything the pod reported.
    pub fn apply_status_report(&mut self, report: &StatusReport, now: OffsetDateTime) {
        self.set_reservoir(report.reservoir_units);
        self.battery_remaining = report.battery_percent;
        self.serial_identifier.clone_from(&report.serial);
        self.pod_active = report.pod_active;
        self.mark_communication(now);
    }

    // --- Pod identity and lifecycle ---

    /// Pod serial identifier, empty until reported.
    pub fn serial(&self) -> &str {
        &self.serial_identifier
    }

    /// Whether the transport has not yet finished its start-up.
    pub fn is_pre_init(&self) -> bool {
        self.pre_init
    }

    /// Leave pre-init. Returns whether the status was still in pre-init.
    pub fn leave_pre_init(&mut self) -> bool {
        std::mem::replace(&mut self.pre_init, false)
    }

    /// Whether a pod is known to be paired and delivering.
    pub fn pod_active(&self) -> bool {
        self.pod_active
    }

    /// Set whether a pod is paired and delivering.
    pub fn set_pod_active(&mut self, active: bool) {
        self.pod_active = active;
    }

    /// Forget everything tied to the current pod.
    pub fn reset_pod_state(&mut self) {
        self.active_temp_basal = None;
        self.cached_basal_profile = None;
        self.serial_identifier.clear();
        self.pod_active = false;
        self.reservoir_remaining_units = 0.0;
        self.reservoir_discrepancy = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::BreakpointMatcher;
    use podctl_types::BasalSegment;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-06-01 09:00 UTC);

    #[test]
    fn test_bolus_effect_decrements() {
        let mut status = DeviceStatus::new();
        status.set_reservoir(50.0);

        assert_eq!(status.apply_bolus_effect(2.5), None);
        assert!((status.reservoir_units() - 47.5).abs() < 1e-9);
        assert!(!status.has_reservoir_discrepancy());
    }

    #[test]
    fn test_bolus_effect_clamps_and_flags() {
        let mut status = DeviceStatus::new();
        status.set_reservoir(1.0);

        let shortfall = status.apply_bolus_effect(3.0).unwrap();
        assert!((shortfall - 2.0).abs() < 1e-9);
        assert_eq!(status.reservoir_units(), 0.0);
        assert!(status.has_reservoir_discrepancy());

        status.set_reservoir(80.0);
        assert!(!status.has_reservoir_discrepancy());
    }

    #[test]
    fn test_temp_basal_lazy_clear() {
        let mut status = DeviceStatus::new();
        let tbr = status.set_temp_basal(T0, 1.2, 30).unwrap();
        assert_eq!(tbr.end() - tbr.start(), Duration::minutes(30));

        assert_eq!(status.read_temp_basal(T0 + Duration::minutes(29)), Some(tbr));
        assert_eq!(status.read_temp_basal(T0 + Duration::minutes(30)), None);
        // Stays cleared even if read "earlier" again.
        assert_eq!(status.read_temp_basal(T0), None);
    }

    #[test]
    fn test_unrepresentable_temp_basal_is_not_kept() {
        let mut status = DeviceStatus::new();
        let late = datetime!(9999-12-31 23:59 UTC);
        assert!(status.set_temp_basal(late, 1.0, 30).is_none());
        assert_eq!(status.read_temp_basal(late), None);
    }

    #[test]
    fn test_clear_temp_basal() {
        let mut status = DeviceStatus::new();
        status.set_temp_basal(T0, 1.0, 60);
        status.clear_temp_basal();
        assert_eq!(status.read_temp_basal(T0), None);
    }

    #[test]
    fn test_profile_equality_uses_matcher() {
        let matcher = BreakpointMatcher::new(0.001);
        let mut status = DeviceStatus::new();
        let flat = BasalProfile::flat(0.9).unwrap();
        assert!(!status.is_profile_equal(&flat, &matcher));

        status.cache_profile(flat);
        let split = BasalProfile::new(vec![
            BasalSegment::at(0, 0, 0.9),
            BasalSegment::at(18, 0, 0.9),
        ])
        .unwrap();
        assert!(status.is_profile_equal(&split, &matcher));
        assert!(!status.is_profile_equal(&BasalProfile::flat(1.0).unwrap(), &matcher));
    }

    #[test]
    fn test_connection_timestamps() {
        let mut status = DeviceStatus::new();
        assert!(status.is_stale(T0, Duration::minutes(5)));

        status.restore_last_connection(T0);
        assert_eq!(status.previous_connection_time(), Some(T0));

        let later = T0 + Duration::minutes(3);
        status.mark_communication(later);
        assert_eq!(status.last_connection_time(), Some(later));
        assert_eq!(status.previous_connection_time(), Some(T0));
        assert!(!status.is_stale(later + Duration::minutes(5), Duration::minutes(5)));
        assert!(status.is_stale(later + Duration::minutes(6), Duration::minutes(5)));
    }

    #[test]
    fn test_status_report_overwrites() {
        let mut status = DeviceStatus::new();
        status.set_reservoir(2.0);
        status.apply_bolus_effect(5.0);

        let report = StatusReport {
            reservoir_units: 42.35,
            battery_percent: 71,
            serial: "L12345-T67890".to_string(),
            pod_active: true,
        };
        status.apply_status_report(&report, T0);

        assert_eq!(status.reservoir_units(), 42.35);
        assert_eq!(status.battery(), 71);
        assert_eq!(status.serial(), "L12345-T67890");
        assert!(status.pod_active());
        assert!(!status.has_reservoir_discrepancy());
        assert_eq!(status.last_connection_time(), Some(T0));
    }

    #[test]
    fn test_leave_pre_init_once() {
        let mut status = DeviceStatus::new();
        assert!(status.is_pre_init());
        assert!(status.leave_pre_init());
        assert!(!status.leave_pre_init());
        assert!(!status.is_pre_init());
    }

    #[test]
    fn test_reset_pod_state() {
        let mut status = DeviceStatus::new();
        status.set_pod_active(true);
        status.set_temp_basal(T0, 1.0, 30);
        status.cache_profile(BasalProfile::flat(1.0).unwrap());
        status.reset_pod_state();

        assert!(!status.pod_active());
        assert!(status.cached_profile().is_none());
        assert_eq!(status.read_temp_basal(T0), None);
    }
}
