//! Core types shared by pod drivers.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::{ProfileError, ProfileResult};

/// Number of minutes in a day; basal breakpoints live in `0..MINUTES_PER_DAY`.
pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Longest temporary basal a pod accepts, in minutes.
pub const MAX_TEMP_BASAL_MINUTES: u32 = 12 * 60;

/// Largest single bolus a pod accepts, in units.
pub const MAX_BOLUS_UNITS: f64 = 30.0;

/// One breakpoint of a basal schedule.
///
/// The rate applies from `start_minute` (minutes after local midnight) until
/// the next segment starts, or until the end of the day for the last one.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BasalSegment {
    /// Minutes after midnight at which this rate takes effect.
    pub start_minute: u16,
    /// Basal rate in U/h.
    pub rate: f64,
}

impl BasalSegment {
    /// Create a segment starting at `hour:minute`.
    #[must_use]
    pub fn at(hour: u8, minute: u8, rate: f64) -> Self {
        Self {
            start_minute: u16::from(hour) * 60 + u16::from(minute),
            rate,
        }
    }
}

/// A full-day basal schedule.
///
/// Construction validates the schedule, so every `BasalProfile` starts at
/// midnight, has strictly increasing breakpoints and finite non-negative
/// rates.
///
/// `PartialEq` is structural. Use [`BasalProfile::is_same_within`] to ask
/// whether two schedules deliver the same rate at every time of day.
///
/// # Examples
///
/// ```
/// use podctl_types::{BasalProfile, BasalSegment};
///
/// let profile = BasalProfile::new(vec![
///     BasalSegment::at(0, 0, 0.8),
///     BasalSegment::at(6, 30, 1.1),
/// ]).unwrap();
///
/// assert_eq!(profile.rate_at_minute(6 * 60), 0.8);
/// assert_eq!(profile.rate_at_minute(7 * 60), 1.1);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(try_from = "Vec<BasalSegment>", into = "Vec<BasalSegment>")
)]
pub struct BasalProfile {
    segments: Vec<BasalSegment>,
}

impl BasalProfile {
    /// Build a profile from its segments.
    pub fn new(segments: Vec<BasalSegment>) -> ProfileResult<Self> {
        let first = segments.first().ok_or(ProfileError::Empty)?;
        if first.start_minute != 0 {
            return Err(ProfileError::NotStartingAtMidnight(first.start_minute));
        }

        let mut previous: Option<u16> = None;
        for segment in &segments {
            if segment.start_minute >= MINUTES_PER_DAY {
                return Err(ProfileError::PastEndOfDay(segment.start_minute));
            }
            if previous.is_some_and(|p| segment.start_minute <= p) {
                return Err(ProfileError::Unordered {
                    minute: segment.start_minute,
                });
            }
            if !segment.rate.is_finite() || segment.rate < 0.0 {
                return Err(ProfileError::InvalidRate {
                    minute: segment.start_minute,
                    rate: segment.rate,
                });
            }
            previous = Some(segment.start_minute);
        }

        Ok(Self { segments })
    }

    /// A profile with a single rate for the whole day.
    pub fn flat(rate: f64) -> ProfileResult<Self> {
        Self::new(vec![BasalSegment {
            start_minute: 0,
            rate,
        }])
    }

    /// The validated segments, ordered by start minute.
    #[must_use]
    pub fn segments(&self) -> &[BasalSegment] {
        &self.segments
    }

    /// Basal rate in effect at the given minute after midnight.
    ///
    /// Minutes past the end of the day wrap around.
    #[must_use]
    pub fn rate_at_minute(&self, minute: u16) -> f64 {
        let minute = minute % MINUTES_PER_DAY;
        self.segments
            .iter()
            .take_while(|s| s.start_minute <= minute)
            .last()
            .map_or(0.0, |s| s.rate)
    }

    /// Basal rate in effect at the given wall-clock time.
    #[must_use]
    pub fn rate_at(&self, at: time::Time) -> f64 {
        let minute = u16::from(at.hour()) * 60 + u16::from(at.minute());
        self.rate_at_minute(minute)
    }

    /// Total insulin scheduled over a day, in units.
    #[must_use]
    pub fn daily_total(&self) -> f64 {
        let mut total = 0.0;
        for (i, segment) in self.segments.iter().enumerate() {
            let end = self
                .segments
                .get(i + 1)
                .map_or(MINUTES_PER_DAY, |next| next.start_minute);
            total += segment.rate * f64::from(end - segment.start_minute) / 60.0;
        }
        total
    }

    /// Whether both schedules deliver the same rate, within `tolerance` U/h,
    /// at every breakpoint of either schedule.
    ///
    /// Schedules are piecewise constant, so agreeing on the union of
    /// breakpoints means agreeing at every time of day.
    #[must_use]
    pub fn is_same_within(&self, other: &BasalProfile, tolerance: f64) -> bool {
        self.segments
            .iter()
            .chain(other.segments.iter())
            .map(|s| s.start_minute)
            .all(|minute| {
                (self.rate_at_minute(minute) - other.rate_at_minute(minute)).abs() <= tolerance
            })
    }
}

impl TryFrom<Vec<BasalSegment>> for BasalProfile {
    type Error = ProfileError;

    fn try_from(segments: Vec<BasalSegment>) -> ProfileResult<Self> {
        Self::new(segments)
    }
}

impl From<BasalProfile> for Vec<BasalSegment> {
    fn from(profile: BasalProfile) -> Self {
        profile.segments
    }
}

/// An enacted temporary basal window.
///
/// The end time is derived at construction, so `end == start + duration`
/// always holds.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TempBasal {
    start: OffsetDateTime,
    rate: f64,
    duration_minutes: u32,
    end: OffsetDateTime,
}

impl TempBasal {
    /// Create a window starting at `start`.
    ///
    /// `None` if the end would fall outside the representable date range.
    #[must_use]
    pub fn new(start: OffsetDateTime, rate: f64, duration_minutes: u32) -> Option<Self> {
        let end = start.checked_add(Duration::minutes(i64::from(duration_minutes)))?;
        Some(Self {
            start,
            rate,
            duration_minutes,
            end,
        })
    }

    /// When the window was enacted.
    #[must_use]
    pub fn start(&self) -> OffsetDateTime {
        self.start
    }

    /// Absolute rate in U/h.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Requested duration in minutes.
    #[must_use]
    pub fn duration_minutes(&self) -> u32 {
        self.duration_minutes
    }

    /// When the window ends.
    #[must_use]
    pub fn end(&self) -> OffsetDateTime {
        self.end
    }

    /// Whether the window has run out at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.end <= now
    }

    /// Time left in the window, zero once expired.
    #[must_use]
    pub fn remaining_at(&self, now: OffsetDateTime) -> Duration {
        (self.end - now).max(Duration::ZERO)
    }
}

/// Lifecycle state of the pod driver.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new states
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum DriverState {
    /// No transport connection yet.
    #[default]
    Uninitialized,
    /// Transport connected, driver not yet initialised.
    Connecting,
    /// Ready for commands.
    Initialized,
    /// Initialised, but the last connectivity probe failed.
    Unreachable,
}

impl DriverState {
    /// Whether new user commands may be dispatched in this state.
    #[must_use]
    pub fn accepts_commands(self) -> bool {
        matches!(self, DriverState::Initialized)
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverState::Uninitialized => write!(f, "Uninitialized"),
            DriverState::Connecting => write!(f, "Connecting"),
            DriverState::Initialized => write!(f, "Initialized"),
            DriverState::Unreachable => write!(f, "Unreachable"),
        }
    }
}

/// Monotonic usage counters kept by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum StatisticKey {
    /// Boluses requested by the user.
    StandardBoluses,
    /// Automated correction (super micro) boluses.
    SmbBoluses,
    /// Temporary basal rates set.
    TbrsSet,
}

impl StatisticKey {
    /// Stable storage key for this counter.
    #[must_use]
    pub fn as_key(self) -> &'static str {
        match self {
            StatisticKey::StandardBoluses => "omnipod_statistics_standard_boluses",
            StatisticKey::SmbBoluses => "omnipod_statistics_smb_boluses",
            StatisticKey::TbrsSet => "omnipod_statistics_tbrs_set",
        }
    }
}

/// Maintenance actions exposed next to the regular pump operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CustomAction {
    /// Reset the radio bridge configuration.
    ResetRadioConfiguration,
    /// Pair and prime a new pod.
    InitPod,
    /// Deactivate the active pod.
    DeactivatePod,
    /// Forget the locally stored pod state.
    ResetPodStatus,
}

impl fmt::Display for CustomAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CustomAction::ResetRadioConfiguration => write!(f, "Reset radio configuration"),
            CustomAction::InitPod => write!(f, "Init pod"),
            CustomAction::DeactivatePod => write!(f, "Deactivate pod"),
            CustomAction::ResetPodStatus => write!(f, "Reset pod status"),
        }
    }
}

/// A custom action together with its current enablement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CustomActionState {
    /// The action.
    pub action: CustomAction,
    /// Whether the action may be executed right now.
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn two_step() -> BasalProfile {
        BasalProfile::new(vec![BasalSegment::at(0, 0, 0.5), BasalSegment::at(8, 0, 1.0)]).unwrap()
    }

    #[test]
    fn test_profile_rejects_empty() {
        assert_eq!(BasalProfile::new(vec![]), Err(ProfileError::Empty));
    }

    #[test]
    fn test_profile_rejects_late_start() {
        let result = BasalProfile::new(vec![BasalSegment::at(1, 0, 0.5)]);
        assert_eq!(result, Err(ProfileError::NotStartingAtMidnight(60)));
    }

    #[test]
    fn test_profile_rejects_unordered() {
        let result = BasalProfile::new(vec![
            BasalSegment::at(0, 0, 0.5),
            BasalSegment::at(8, 0, 1.0),
            BasalSegment::at(8, 0, 1.2),
        ]);
        assert_eq!(result, Err(ProfileError::Unordered { minute: 480 }));
    }

    #[test]
    fn test_profile_rejects_bad_rate() {
        let result = BasalProfile::new(vec![BasalSegment::at(0, 0, -0.1)]);
        assert!(matches!(result, Err(ProfileError::InvalidRate { minute: 0, .. })));

        let result = BasalProfile::flat(f64::NAN);
        assert!(matches!(result, Err(ProfileError::InvalidRate { .. })));
    }

    #[test]
    fn test_profile_rejects_past_end_of_day() {
        let result = BasalProfile::new(vec![
            BasalSegment::at(0, 0, 0.5),
            BasalSegment {
                start_minute: MINUTES_PER_DAY,
                rate: 1.0,
            },
        ]);
        assert_eq!(result, Err(ProfileError::PastEndOfDay(MINUTES_PER_DAY)));
    }

    #[test]
    fn test_rate_lookup() {
        let profile = two_step();
        assert_eq!(profile.rate_at_minute(0), 0.5);
        assert_eq!(profile.rate_at_minute(479), 0.5);
        assert_eq!(profile.rate_at_minute(480), 1.0);
        assert_eq!(profile.rate_at_minute(1439), 1.0);
        assert_eq!(profile.rate_at(time::macros::time!(7:59)), 0.5);
        assert_eq!(profile.rate_at(time::macros::time!(23:00)), 1.0);
    }

    #[test]
    fn test_daily_total() {
        let profile = two_step();
        // 8h at 0.5 + 16h at 1.0
        assert!((profile.daily_total() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_domain_equality_ignores_redundant_breakpoints() {
        let a = BasalProfile::flat(0.8).unwrap();
        let b = BasalProfile::new(vec![
            BasalSegment::at(0, 0, 0.8),
            BasalSegment::at(12, 0, 0.8),
        ])
        .unwrap();

        assert_ne!(a, b);
        assert!(a.is_same_within(&b, 0.001));
        assert!(b.is_same_within(&a, 0.001));
    }

    #[test]
    fn test_domain_equality_detects_difference() {
        let a = two_step();
        let b = BasalProfile::new(vec![BasalSegment::at(0, 0, 0.5), BasalSegment::at(9, 0, 1.0)])
            .unwrap();
        assert!(!a.is_same_within(&b, 0.001));
    }

    #[test]
    fn test_temp_basal_past_max_date_is_rejected() {
        let start = datetime!(9999-12-31 23:00 UTC);
        assert!(TempBasal::new(start, 1.0, 59).is_some());
        assert!(TempBasal::new(start, 1.0, 61).is_none());
        assert!(TempBasal::new(start, 1.0, u32::MAX).is_none());
    }

    #[test]
    fn test_temp_basal_window() {
        let start = datetime!(2024-03-01 10:00 UTC);
        let tbr = TempBasal::new(start, 1.5, 30).unwrap();

        assert_eq!(tbr.end() - tbr.start(), Duration::minutes(30));
        assert!(!tbr.is_expired_at(datetime!(2024-03-01 10:29:59 UTC)));
        assert!(tbr.is_expired_at(datetime!(2024-03-01 10:30 UTC)));
        assert_eq!(
            tbr.remaining_at(datetime!(2024-03-01 10:20 UTC)),
            Duration::minutes(10)
        );
        assert_eq!(tbr.remaining_at(datetime!(2024-03-01 11:00 UTC)), Duration::ZERO);
    }

    #[test]
    fn test_driver_state_gating() {
        assert!(DriverState::Initialized.accepts_commands());
        assert!(!DriverState::Connecting.accepts_commands());
        assert!(!DriverState::Uninitialized.accepts_commands());
        assert!(!DriverState::Unreachable.accepts_commands());
        assert_eq!(DriverState::default(), DriverState::Uninitialized);
    }

    #[test]
    fn test_statistic_keys_are_distinct() {
        let keys = [
            StatisticKey::StandardBoluses.as_key(),
            StatisticKey::SmbBoluses.as_key(),
            StatisticKey::TbrsSet.as_key(),
        ];
        assert_ne!(keys[0], keys[1]);
        assert_ne!(keys[1], keys[2]);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_profile_deserialization_validates() {
        let ok: BasalProfile =
            serde_json::from_str(r#"[{"start_minute":0,"rate":0.7}]"#).unwrap();
        assert_eq!(ok.rate_at_minute(100), 0.7);

        let bad = serde_json::from_str::<BasalProfile>(r#"[{"start_minute":30,"rate":0.7}]"#);
        assert!(bad.is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use time::macros::datetime;

    proptest! {
        /// The end of a temporary basal window is always start + duration.
        #[test]
        fn temp_basal_end_matches_duration(rate in 0.0f64..30.0, minutes in 0u32..=720) {
            let start = datetime!(2024-01-01 00:00 UTC);
            let tbr = TempBasal::new(start, rate, minutes).unwrap();
            prop_assert_eq!(tbr.end() - tbr.start(), Duration::minutes(i64::from(minutes)));
        }

        /// A profile is always domain-equal to itself with extra redundant breakpoints.
        #[test]
        fn redundant_breakpoint_keeps_profile_equal(rate in 0.0f64..5.0, minute in 1u16..MINUTES_PER_DAY) {
            let a = BasalProfile::flat(rate).unwrap();
            let b = BasalProfile::new(vec![
                BasalSegment { start_minute: 0, rate },
                BasalSegment { start_minute: minute, rate },
            ]).unwrap();
            prop_assert!(a.is_same_within(&b, 0.0));
        }
    }
}
