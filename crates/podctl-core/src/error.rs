//! Error types for podctl-core.
//!
//! This module defines every error the coordination core can produce, and
//! the errors a [`crate::CommandExecutor`] reports back.
//!
//! # Known vs unknown outcomes
//!
//! A command whose response says "no" leaves the pod as it was. A command
//! that timed out, lost the link, or was NACKed by the transport may have
//! reached the pod anyway. These are two different situations:
//!
//! | Source | Meaning | Local bookkeeping |
//! |--------|---------|-------------------|
//! | Response with `accepted: false` | Pod refused | Unchanged, safe to report as not enacted |
//! | [`Error::Timeout`] | Unknown outcome | Unchanged, caller should re-read status |
//! | [`Error::LinkLost`] | Unknown outcome | Unchanged, caller should re-read status |
//! | [`Error::Nack`] | Unknown outcome | Unchanged, caller should re-read status |
//!
//! [`Error::is_ambiguous`] identifies the second group. The coordinator never
//! retries on its own: repeating a bolus whose first attempt may have been
//! delivered is unsafe, so retry policy belongs to the caller.

use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;

use podctl_types::{DriverState, ProfileError};

use crate::command::CommandKind;

/// Errors that can occur while coordinating pod commands.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The executor gave up waiting for the pod.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// The radio link dropped while a command was in flight.
    #[error("Radio link lost: {0}")]
    LinkLost(String),

    /// The transport rejected the exchange (bad nonce, corrupt frame, ...).
    #[error("Command {command} NACKed: {reason}")]
    Nack {
        /// The command that was NACKed.
        command: CommandKind,
        /// Transport-supplied reason.
        reason: String,
    },

    /// The driver is not in a state that accepts commands.
    #[error("Driver not ready (state: {state})")]
    NotInitialized {
        /// The state the driver was in.
        state: DriverState,
    },

    /// The pod is still executing an earlier command.
    #[error("Pod busy until {until}")]
    Busy {
        /// End of the latest busy window.
        until: OffsetDateTime,
    },

    /// The executor answered with a payload for a different command.
    #[error("Unexpected response to {command}: {response}")]
    UnexpectedResponse {
        /// The command that was dispatched.
        command: CommandKind,
        /// Debug rendering of the response received.
        response: String,
    },

    /// A request argument was rejected before dispatch.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A basal profile failed validation.
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a link-lost error.
    pub fn link_lost(reason: impl Into<String>) -> Self {
        Self::LinkLost(reason.into())
    }

    /// Create a NACK error for a command.
    pub fn nack(command: CommandKind, reason: impl Into<String>) -> Self {
        Self::Nack {
            command,
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether the pod may have executed the command despite this error.
    ///
    /// True for every error raised by the executor while a command was in
    /// flight. Local state must not be updated on these.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::LinkLost(_) | Error::Nack { .. }
        )
    }
}

/// Result type alias using podctl-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
