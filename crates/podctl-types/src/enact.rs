//! Normalised outcome of a pump operation.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Why an operation did not succeed.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new failure kinds
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum FailureKind {
    /// The pod explicitly refused the command. Nothing changed.
    Refused,
    /// The command may or may not have reached the pod (timeout, link
    /// loss, NACK). Re-read status before retrying anything destructive.
    Uncertain,
    /// The driver is not initialised or the pod is unreachable.
    NotReady,
    /// A previous command is still being executed by the pod.
    Busy,
    /// The request itself was invalid and was never dispatched.
    InvalidRequest,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Refused => write!(f, "refused by pod"),
            FailureKind::Uncertain => write!(f, "outcome unknown"),
            FailureKind::NotReady => write!(f, "driver not ready"),
            FailureKind::Busy => write!(f, "pod busy"),
            FailureKind::InvalidRequest => write!(f, "invalid request"),
        }
    }
}

/// Quantities an operation put into effect.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NumericEffects {
    /// Absolute temporary basal rate in U/h.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub absolute_rate: Option<f64>,
    /// Temporary basal duration in minutes.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub duration_minutes: Option<u32>,
    /// Insulin delivered as bolus, in units.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub bolus_delivered: Option<f64>,
    /// Carbohydrates recorded with the bolus, in grams.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub carbs_delivered: Option<f64>,
}

/// Result of a pump operation as seen by the caller.
///
/// Only the constructors can set `success` and `enacted`, so `enacted`
/// implies `success` for every value of this type.
///
/// # Examples
///
/// ```
/// use podctl_types::{EnactResult, FailureKind};
///
/// let done = EnactResult::applied().bolus_delivered(2.0).carbs_delivered(30.0);
/// assert!(done.success() && done.enacted());
/// assert_eq!(done.effects().bolus_delivered, Some(2.0));
///
/// let refused = EnactResult::failed(FailureKind::Refused, "bolus not delivered");
/// assert!(!refused.success() && !refused.enacted());
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EnactResult {
    success: bool,
    enacted: bool,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    comment: Option<String>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    failure: Option<FailureKind>,
    #[cfg_attr(feature = "serde", serde(default))]
    is_temp_cancel: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    effects: NumericEffects,
}

impl EnactResult {
    /// The operation succeeded and changed pod behaviour.
    #[must_use]
    pub fn applied() -> Self {
        Self {
            success: true,
            enacted: true,
            comment: None,
            failure: None,
            is_temp_cancel: false,
            effects: NumericEffects::default(),
        }
    }

    /// The operation succeeded without touching the pod.
    #[must_use]
    pub fn unchanged() -> Self {
        Self {
            enacted: false,
            ..Self::applied()
        }
    }

    /// The operation failed.
    #[must_use]
    pub fn failed(kind: FailureKind, comment: impl Into<String>) -> Self {
        Self {
            success: false,
            enacted: false,
            comment: Some(comment.into()),
            failure: Some(kind),
            is_temp_cancel: false,
            effects: NumericEffects::default(),
        }
    }

    /// Attach a human-readable comment.
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Record the delivered bolus.
    #[must_use]
    pub fn bolus_delivered(mut self, units: f64) -> Self {
        self.effects.bolus_delivered = Some(units);
        self
    }

    /// Record the carbohydrates delivered with the bolus.
    #[must_use]
    pub fn carbs_delivered(mut self, grams: f64) -> Self {
        self.effects.carbs_delivered = Some(grams);
        self
    }

    /// Record the enacted absolute temporary basal rate.
    #[must_use]
    pub fn absolute(mut self, rate: f64) -> Self {
        self.effects.absolute_rate = Some(rate);
        self
    }

    /// Record the enacted temporary basal duration.
    #[must_use]
    pub fn duration(mut self, minutes: u32) -> Self {
        self.effects.duration_minutes = Some(minutes);
        self
    }

    /// Mark this result as the cancellation of a temporary basal.
    #[must_use]
    pub fn temp_cancel(mut self) -> Self {
        self.is_temp_cancel = true;
        self
    }

    /// Whether the operation succeeded.
    #[must_use]
    pub fn success(&self) -> bool {
        self.success
    }

    /// Whether the pod's behaviour actually changed.
    #[must_use]
    pub fn enacted(&self) -> bool {
        self.enacted
    }

    /// Human-readable comment, if any.
    #[must_use]
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Failure category for unsuccessful results.
    #[must_use]
    pub fn failure(&self) -> Option<FailureKind> {
        self.failure
    }

    /// Whether this result cancelled a temporary basal.
    #[must_use]
    pub fn is_temp_cancel(&self) -> bool {
        self.is_temp_cancel
    }

    /// Quantities put into effect.
    #[must_use]
    pub fn effects(&self) -> &NumericEffects {
        &self.effects
    }
}

impl fmt::Display for EnactResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "success={} enacted={}", self.success, self.enacted)?;
        if let Some(kind) = self.failure {
            write!(f, " ({kind})")?;
        }
        if let Some(comment) = &self.comment {
            write!(f, ": {comment}")?;
        }
        Ok(())
    }
}
