//! Command and state coordination core for insulin pod drivers.
//!
//! This crate sits between a loop controller that asks for therapy changes
//! (boluses, temporary basal rates, basal schedules) and a radio transport
//! that talks to the pod. It owns the cached view of the pod, decides when
//! a request can be answered locally, refuses requests while the pod is
//! still delivering, and reports every outcome as an
//! [`EnactResult`](podctl_types::EnactResult).
//!
//! # Features
//!
//! - **Pump operations**: bolus, stop bolus, temporary basal, basal profile
//! - **Short-circuits**: same rate, same profile or nothing to cancel skip the radio
//! - **Busy windows**: estimated delivery time keeps new commands away
//! - **Lifecycle**: bounded readiness probe, lazy initialisation, unreachable recovery
//! - **Custom actions**: pod init, deactivation and resets, gated by pod state
//! - **Events**: broadcast of state changes and UI refresh hints
//! - **Metrics**: per-command dispatch counters and latencies
//! - **Mock executor**: scriptable pod for tests and simulations
//!
//! # Outcome classes
//!
//! | Pod answer | Local state | [`FailureKind`](podctl_types::FailureKind) |
//! |------------|-------------|-------------|
//! | accepted | updated | none |
//! | refused | untouched | `Refused` |
//! | timeout, link lost, NACK | untouched | `Uncertain` |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use podctl_core::{BasalProfile, MockExecutor, PodCoordinator, PodEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let coordinator = PodCoordinator::builder(Arc::new(MockExecutor::new())).build()?;
//!     let mut events = coordinator.subscribe();
//!
//!     coordinator.on_transport_connected().await;
//!     while !matches!(events.recv().await?, PodEvent::PodReady { .. }) {}
//!     coordinator.get_pump_status(true).await?;
//!
//!     let profile = BasalProfile::flat(0.8)?;
//!     let result = coordinator.set_temp_basal_absolute(1.2, 30, &profile, false).await;
//!     println!("TBR: {result}");
//!
//!     Ok(())
//! }
//! ```

pub mod busy;
pub mod clock;
pub mod collaborators;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod executor;
pub mod metrics;
pub mod mock;
pub mod status;
pub mod supervisor;
pub mod tasks;

// Re-export the types module from podctl-types
pub use podctl_types::types;

// Core exports
pub use coordinator::{PodCoordinator, PodCoordinatorBuilder};
pub use error::{Error, Result};
pub use executor::CommandExecutor;
pub use status::DeviceStatus;

/// Type alias for a shared coordinator.
///
/// Operations take `&self`, so one coordinator behind an `Arc` can serve
/// every task that issues therapy requests.
pub type SharedCoordinator = std::sync::Arc<PodCoordinator>;

pub use busy::{
    BusyTracker, DEFAULT_BOLUS_SECONDS_PER_UNIT, InFlight, InFlightGuard, bolus_delivery_time,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    BreakpointMatcher, InMemoryHistory, InMemoryPreferences, PREF_FIRST_PUMP_START,
    PREF_LAST_GOOD_COMMUNICATION, PreferenceStatistics, PreferenceStore, ProfileMatcher,
    Statistics, TreatmentHistory, TreatmentRecord,
};
pub use command::{
    CancelBolusResult, CancelTempBasalResult, Command, CommandKind, CommandResponse,
    MaintenanceResult, SetBasalProfileResult, SetBolusResult, SetTempBasalResult, StatusReport,
};
pub use config::{ConfigError, DriverConfig, MAX_BOLUS_SECONDS_PER_UNIT, ValidationError};
pub use events::{EventDispatcher, EventReceiver, EventSender, PodEvent};
pub use metrics::{DispatchMetrics, DispatchMetricsSummary, OperationMetrics};
pub use mock::{MockExecutor, MockExecutorBuilder, MockFailure};
pub use supervisor::{ConnectionSupervisor, ProbeOptions};
pub use tasks::PeriodicTask;

// Re-export from podctl-types
pub use podctl_types::{
    BasalProfile, BasalSegment, CustomAction, CustomActionState, DriverState, EnactResult,
    FailureKind, MAX_BOLUS_UNITS, MAX_TEMP_BASAL_MINUTES, NumericEffects, ProfileError,
    StatisticKey, TempBasal,
};
