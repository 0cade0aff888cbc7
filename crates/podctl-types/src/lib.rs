//! Platform-agnostic types for insulin pod drivers.
//!
//! This crate provides the data types shared by the coordination core
//! (podctl-core) and anything that sits in front of it.
//!
//! # Features
//!
//! - Validated full-day basal profiles with breakpoint-wise equality
//! - Temporary basal windows whose end time is derived, never stored apart
//! - The normalised [`EnactResult`] returned by every pump operation
//! - Driver lifecycle states, statistic keys and custom actions
//!
//! # Example
//!
//! ```
//! use podctl_types::{BasalProfile, BasalSegment};
//!
//! let day = BasalProfile::new(vec![
//!     BasalSegment::at(0, 0, 0.6),
//!     BasalSegment::at(7, 0, 0.9),
//! ]).unwrap();
//! let flat = BasalProfile::flat(0.6).unwrap();
//!
//! assert!(!day.is_same_within(&flat, 0.001));
//! ```

pub mod enact;
pub mod error;
pub mod types;

pub use enact::{EnactResult, FailureKind, NumericEffects};
pub use error::{ProfileError, ProfileResult};
pub use types::{
    BasalProfile, BasalSegment, CustomAction, CustomActionState, DriverState, MAX_BOLUS_UNITS,
    MAX_TEMP_BASAL_MINUTES, MINUTES_PER_DAY, StatisticKey, TempBasal,
};
