//! Pod commands and their typed responses.
//!
//! Every command the coordinator can dispatch is a [`Command`] variant, and
//! every answer is a [`CommandResponse`] variant carrying a payload specific
//! to that command. [`CommandResponse::responds_to`] ties the two together
//! so a mismatched answer is caught before any state is touched.

use std::fmt;

use serde::{Deserialize, Serialize};

use podctl_types::{BasalProfile, CustomAction};

/// A command addressed to the pod.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Command {
    /// Deliver an immediate bolus.
    SetBolus {
        /// Insulin to deliver, in units.
        units: f64,
    },
    /// Stop a bolus in progress.
    CancelBolus,
    /// Start a temporary basal rate.
    SetTemporaryBasal {
        /// Absolute rate in U/h.
        rate: f64,
        /// Duration in minutes.
        duration_minutes: u32,
    },
    /// Stop the active temporary basal rate.
    CancelTemporaryBasal,
    /// Replace the full-day basal schedule.
    SetBasalProfile(BasalProfile),
    /// Pair and prime a new pod.
    InitPod,
    /// Deactivate the active pod.
    DeactivatePod,
    /// Forget locally stored pod state.
    ResetPodStatus,
    /// Reset the radio bridge configuration.
    ResetRadioConfiguration,
    /// Read the authoritative pod status.
    GetStatus,
}

impl Command {
    /// The kind of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::SetBolus { .. } => CommandKind::SetBolus,
            Command::CancelBolus => CommandKind::CancelBolus,
            Command::SetTemporaryBasal { .. } => CommandKind::SetTemporaryBasal,
            Command::CancelTemporaryBasal => CommandKind::CancelTemporaryBasal,
            Command::SetBasalProfile(_) => CommandKind::SetBasalProfile,
            Command::InitPod => CommandKind::InitPod,
            Command::DeactivatePod => CommandKind::DeactivatePod,
            Command::ResetPodStatus => CommandKind::ResetPodStatus,
            Command::ResetRadioConfiguration => CommandKind::ResetRadioConfiguration,
            Command::GetStatus => CommandKind::GetStatus,
        }
    }

    /// The maintenance command behind a custom action.
    pub fn for_custom_action(action: CustomAction) -> Self {
        match action {
            CustomAction::ResetRadioConfiguration => Command::ResetRadioConfiguration,
            CustomAction::InitPod => Command::InitPod,
            CustomAction::DeactivatePod => Command::DeactivatePod,
            CustomAction::ResetPodStatus => Command::ResetPodStatus,
        }
    }
}

/// Discriminant of a [`Command`], used for logging, metrics and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum CommandKind {
    SetBolus,
    CancelBolus,
    SetTemporaryBasal,
    CancelTemporaryBasal,
    SetBasalProfile,
    InitPod,
    DeactivatePod,
    ResetPodStatus,
    ResetRadioConfiguration,
    GetStatus,
}

impl CommandKind {
    /// Every command kind, in declaration order.
    pub const ALL: [CommandKind; 10] = [
        CommandKind::SetBolus,
        CommandKind::CancelBolus,
        CommandKind::SetTemporaryBasal,
        CommandKind::CancelTemporaryBasal,
        CommandKind::SetBasalProfile,
        CommandKind::InitPod,
        CommandKind::DeactivatePod,
        CommandKind::ResetPodStatus,
        CommandKind::ResetRadioConfiguration,
        CommandKind::GetStatus,
    ];

    /// Whether this is a maintenance command (answered by [`MaintenanceResult`]).
    pub fn is_maintenance(self) -> bool {
        matches!(
            self,
            CommandKind::InitPod
                | CommandKind::DeactivatePod
                | CommandKind::ResetPodStatus
                | CommandKind::ResetRadioConfiguration
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Answer to [`Command::SetBolus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetBolusResult {
    /// Whether the pod started delivering.
    pub delivered: bool,
}

/// Answer to [`Command::CancelBolus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelBolusResult {
    /// Whether delivery was stopped.
    pub cancelled: bool,
}

/// Answer to [`Command::SetTemporaryBasal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetTempBasalResult {
    /// Whether the pod started the temporary rate.
    pub accepted: bool,
}

/// Answer to [`Command::CancelTemporaryBasal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTempBasalResult {
    /// Whether the temporary rate was stopped.
    pub cancelled: bool,
}

/// Answer to [`Command::SetBasalProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetBasalProfileResult {
    /// Whether the schedule was stored on the pod.
    pub accepted: bool,
}

/// Answer to any maintenance command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceResult {
    /// Which maintenance command this answers.
    pub command: CommandKind,
    /// Whether the pod (or bridge) performed it.
    pub accepted: bool,
}

/// Answer to [`Command::GetStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Insulin left in the reservoir, in units.
    pub reservoir_units: f64,
    /// Battery remaining, in percent.
    pub battery_percent: u8,
    /// Pod serial / lot identifier.
    pub serial: String,
    /// Whether a pod is paired and delivering.
    pub pod_active: bool,
}

/// Typed answer from the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum CommandResponse {
    Bolus(SetBolusResult),
    BolusCancelled(CancelBolusResult),
    TempBasal(SetTempBasalResult),
    TempBasalCancelled(CancelTempBasalResult),
    BasalProfile(SetBasalProfileResult),
    Maintenance(MaintenanceResult),
    Status(StatusReport),
}

impl CommandResponse {
    /// Whether this response is a valid answer to `kind`.
    pub fn responds_to(&self, kind: CommandKind) -> bool {
        match self {
            CommandResponse::Bolus(_) => kind == CommandKind::SetBolus,
            CommandResponse::BolusCancelled(_) => kind == CommandKind::CancelBolus,
            CommandResponse::TempBasal(_) => kind == CommandKind::SetTemporaryBasal,
            CommandResponse::TempBasalCancelled(_) => kind == CommandKind::CancelTemporaryBasal,
            CommandResponse::BasalProfile(_) => kind == CommandKind::SetBasalProfile,
            CommandResponse::Maintenance(m) => m.command == kind && kind.is_maintenance(),
            CommandResponse::Status(_) => kind == CommandKind::GetStatus,
        }
    }

    /// Whether the pod did what it was asked.
    ///
    /// A status report is always an acceptance.
    pub fn accepted(&self) -> bool {
        match self {
            CommandResponse::Bolus(r) => r.delivered,
            CommandResponse::BolusCancelled(r) => r.cancelled,
            CommandResponse::TempBasal(r) => r.accepted,
            CommandResponse::TempBasalCancelled(r) => r.cancelled,
            CommandResponse::BasalProfile(r) => r.accepted,
            CommandResponse::Maintenance(r) => r.accepted,
            CommandResponse::Status(_) => true,
        }
    }

    /// The response a pod gives when it accepts (or refuses) `command`.
    ///
    /// Status reads have no refusal form and yield `None`.
    pub fn acknowledgement(kind: CommandKind, accepted: bool) -> Option<Self> {
        let response = match kind {
            CommandKind::SetBolus => CommandResponse::Bolus(SetBolusResult {
                delivered: accepted,
            }),
            CommandKind::CancelBolus => CommandResponse::BolusCancelled(CancelBolusResult {
                cancelled: accepted,
            }),
            CommandKind::SetTemporaryBasal => {
                CommandResponse::TempBasal(SetTempBasalResult { accepted })
            }
            CommandKind::CancelTemporaryBasal => {
                CommandResponse::TempBasalCancelled(CancelTempBasalResult {
                    cancelled: accepted,
                })
            }
            CommandKind::SetBasalProfile => {
                CommandResponse::BasalProfile(SetBasalProfileResult { accepted })
            }
            CommandKind::InitPod
            | CommandKind::DeactivatePod
            | CommandKind::ResetPodStatus
            | CommandKind::ResetRadioConfiguration => {
                CommandResponse::Maintenance(MaintenanceResult {
                    command: kind,
                    accepted,
                })
            }
            CommandKind::GetStatus => return None,
        };
        Some(response)
    }
}
