//! Driver event system for UI and telemetry notifications.
//!
//! The coordinator announces what it is doing (refresh affordance toggled,
//! values changed, state transitions) over a broadcast channel. Sending is
//! fire-and-forget: an event with no subscribers is simply dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use podctl_types::DriverState;

/// Events emitted by the pod driver.
///
/// All events are serializable for logging, persistence, and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum PodEvent {
    /// The manual refresh affordance should be enabled or disabled.
    RefreshButton { enabled: bool },
    /// Cached pump values changed; views should re-read them.
    ValuesChanged,
    /// The treatment overview should refresh the given section.
    OverviewRefresh { key: String },
    /// The driver moved between lifecycle states.
    StateChanged { from: DriverState, to: DriverState },
    /// The transport finished start-up after this many probe attempts.
    PodReady { attempts: u32 },
    /// The readiness probe gave up.
    ProbeExhausted { attempts: u32 },
    /// First initialisation of this driver session.
    DriverStarted { version: String },
    /// A bolus exceeded the local reservoir estimate.
    ReservoirDiscrepancy { requested: f64, available: f64 },
    /// Enablement of custom actions changed.
    CustomActionsChanged,
}

/// Sender for driver events.
pub type EventSender = broadcast::Sender<PodEvent>;

/// Receiver for driver events.
pub type EventReceiver = broadcast::Receiver<PodEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: PodEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the sender for direct use.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}
