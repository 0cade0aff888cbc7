//! Interfaces to the application around the driver.
//!
//! The coordinator records treatments, bumps usage counters, persists a few
//! timestamps and compares basal profiles through these traits. In-memory
//! implementations are provided and used as defaults by
//! [`crate::PodCoordinatorBuilder`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use podctl_types::{BasalProfile, StatisticKey};

/// Preference key of the write-once first-start marker (unix seconds).
pub const PREF_FIRST_PUMP_START: &str = "first_pump_start";

/// Preference key of the last good communication time (unix seconds).
pub const PREF_LAST_GOOD_COMMUNICATION: &str = "last_good_communication";

/// Treatment history of the surrounding application.
///
/// Each method is called exactly once per successful enact.
pub trait TreatmentHistory: Send + Sync {
    /// Record a delivered bolus.
    fn record_bolus(&self, units: f64, carbs: f64, at: OffsetDateTime);

    /// Record a temporary basal change. A cancellation is recorded with
    /// `rate == None` and a zero duration.
    fn record_temporary_basal(&self, rate: Option<f64>, duration_minutes: u32, at: OffsetDateTime);
}

/// Monotonic usage counters.
pub trait Statistics: Send + Sync {
    /// Increment a counter by one.
    fn increment(&self, key: StatisticKey);
}

/// Small persistent key/value store.
pub trait PreferenceStore: Send + Sync {
    /// Read an integer value.
    fn get_i64(&self, key: &str) -> Option<i64>;

    /// Write an integer value.
    fn put_i64(&self, key: &str, value: i64);

    /// Whether the key has a value.
    fn contains(&self, key: &str) -> bool {
        self.get_i64(key).is_some()
    }
}

/// Decides whether two basal schedules behave identically.
pub trait ProfileMatcher: Send + Sync {
    /// Whether `a` and `b` deliver the same rate at every time of day.
    fn is_same(&self, a: &BasalProfile, b: &BasalProfile) -> bool;
}

/// Compares rates at every breakpoint of either profile, within a tolerance.
#[derive(Debug, Clone, Copy)]
pub struct BreakpointMatcher {
    tolerance: f64,
}

impl BreakpointMatcher {
    /// Create a matcher accepting rate differences up to `tolerance` U/h.
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }
}

impl Default for BreakpointMatcher {
    fn default() -> Self {
        Self::new(0.001)
    }
}

impl ProfileMatcher for BreakpointMatcher {
    fn is_same(&self, a: &BasalProfile, b: &BasalProfile) -> bool {
        a.is_same_within(b, self.tolerance)
    }
}

/// One entry written to an [`InMemoryHistory`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreatmentRecord {
    Bolus {
        units: f64,
        carbs: f64,
        at: OffsetDateTime,
    },
    TemporaryBasal {
        rate: Option<f64>,
        duration_minutes: u32,
        at: OffsetDateTime,
    },
}

/// Treatment history kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    records: Mutex<Vec<TreatmentRecord>>,
}

impl InMemoryHistory {
    /// An empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, oldest first.
    pub fn records(&self) -> Vec<TreatmentRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, record: TreatmentRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}

impl TreatmentHistory for InMemoryHistory {
    fn record_bolus(&self, units: f64, carbs: f64, at: OffsetDateTime) {
        self.push(TreatmentRecord::Bolus { units, carbs, at });
    }

    fn record_temporary_basal(&self, rate: Option<f64>, duration_minutes: u32, at: OffsetDateTime) {
        self.push(TreatmentRecord::TemporaryBasal {
            rate,
            duration_minutes,
            at,
        });
    }
}

/// Preferences kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryPreferences {
    values: Mutex<HashMap<String, i64>>,
}

impl InMemoryPreferences {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for InMemoryPreferences {
    fn get_i64(&self, key: &str) -> Option<i64> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
    }

    fn put_i64(&self, key: &str, value: i64) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
    }
}

/// Statistics stored as counters in a [`PreferenceStore`].
#[derive(Clone)]
pub struct PreferenceStatistics {
    preferences: Arc<dyn PreferenceStore>,
}

impl PreferenceStatistics {
    /// Keep counters in `preferences`.
    pub fn new(preferences: Arc<dyn PreferenceStore>) -> Self {
        Self { preferences }
    }

    /// Current value of a counter.
    pub fn get(&self, key: StatisticKey) -> i64 {
        self.preferences.get_i64(key.as_key()).unwrap_or(0)
    }
}

impl std::fmt::Debug for PreferenceStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreferenceStatistics").finish_non_exhaustive()
    }
}

impl Statistics for PreferenceStatistics {
    fn increment(&self, key: StatisticKey) {
        let current = self.get(key);
        self.preferences.put_i64(key.as_key(), current + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podctl_types::BasalSegment;
    use time::macros::datetime;

    #[test]
    fn test_in_memory_history_records_in_order() {
        let history = InMemoryHistory::new();
        let at = datetime!(2024-06-01 08:00 UTC);
        history.record_bolus(1.5, 20.0, at);
        history.record_temporary_basal(None, 0, at);

        let records = history.records();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], TreatmentRecord::Bolus { units, .. } if units == 1.5));
        assert!(matches!(
            records[1],
            TreatmentRecord::TemporaryBasal {
                rate: None,
                duration_minutes: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_preferences_roundtrip() {
        let prefs = InMemoryPreferences::new();
        assert!(!prefs.contains(PREF_FIRST_PUMP_START));
        prefs.put_i64(PREF_FIRST_PUMP_START, 1_700_000_000);
        assert_eq!(prefs.get_i64(PREF_FIRST_PUMP_START), Some(1_700_000_000));
        assert!(prefs.contains(PREF_FIRST_PUMP_START));
    }

    #[test]
    fn test_preference_statistics_count() {
        let prefs: Arc<dyn PreferenceStore> = Arc::new(InMemoryPreferences::new());
        let stats = PreferenceStatistics::new(Arc::clone(&prefs));

        stats.increment(StatisticKey::StandardBoluses);
        stats.increment(StatisticKey::StandardBoluses);
        stats.increment(StatisticKey::TbrsSet);

        assert_eq!(stats.get(StatisticKey::StandardBoluses), 2);
        assert_eq!(stats.get(StatisticKey::TbrsSet), 1);
        assert_eq!(stats.get(StatisticKey::SmbBoluses), 0);
        assert_eq!(prefs.get_i64(StatisticKey::StandardBoluses.as_key()), Some(2));
    }

    #[test]
    fn test_breakpoint_matcher_tolerance() {
        let a = BasalProfile::flat(1.0).unwrap();
        let b = BasalProfile::new(vec![
            BasalSegment::at(0, 0, 1.0004),
            BasalSegment::at(12, 0, 0.9996),
        ])
        .unwrap();

        assert!(BreakpointMatcher::new(0.001).is_same(&a, &b));
        assert!(!BreakpointMatcher::new(0.0001).is_same(&a, &b));
    }
}
