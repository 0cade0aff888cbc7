//! Error types for basal profile validation in podctl-types.

use thiserror::Error;

/// Errors raised when building a [`crate::BasalProfile`].
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ProfileError {
    /// The profile has no segments.
    #[error("basal profile has no segments")]
    Empty,

    /// The first segment does not start at midnight.
    #[error("first basal segment must start at 00:00, starts at minute {0}")]
    NotStartingAtMidnight(u16),

    /// Breakpoints are not strictly increasing.
    #[error("basal segment at minute {minute} is out of order")]
    Unordered {
        /// Start minute of the offending segment.
        minute: u16,
    },

    /// A breakpoint lies outside the day.
    #[error("basal segment starts at minute {0}, past the end of the day")]
    PastEndOfDay(u16),

    /// A rate is negative, NaN or infinite.
    #[error("invalid basal rate {rate} at minute {minute}")]
    InvalidRate {
        /// Start minute of the offending segment.
        minute: u16,
        /// The rejected rate in U/h.
        rate: f64,
    },
}

/// Result type alias using podctl-types' ProfileError type.
pub type ProfileResult<T> = std::result::Result<T, ProfileError>;
