//! Post-connect readiness probing.
//!
//! When the radio transport comes up it still needs time before the pod can
//! be reached. [`ConnectionSupervisor`] polls
//! [`CommandExecutor::is_ready`](crate::CommandExecutor::is_ready) a bounded
//! number of times and, once it reports ready, takes the status out of
//! pre-init so the coordinator may initialise.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, PodEvent};
use crate::executor::CommandExecutor;
use crate::status::DeviceStatus;
use crate::tasks::PeriodicTask;

/// Options for the readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOptions {
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            delay: Duration::from_secs(5),
        }
    }
}

impl From<&ProbeConfig> for ProbeOptions {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            delay: config.delay(),
        }
    }
}

impl ProbeOptions {
    /// Create probe options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the delay between attempts.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Longest time the probe can run before giving up.
    pub fn budget(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }

    /// Validate the options and return an error if invalid.
    ///
    /// Checks that:
    /// - `max_attempts` is > 0
    /// - `delay` is > 0
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::invalid_config("max_attempts must be > 0"));
        }
        if self.delay.is_zero() {
            return Err(Error::invalid_config("delay must be > 0"));
        }
        Ok(())
    }
}

/// Runs the bounded readiness probe after each transport connection.
#[derive(Debug)]
pub struct ConnectionSupervisor {
    options: ProbeOptions,
    probe: Mutex<Option<PeriodicTask>>,
}

impl ConnectionSupervisor {
    /// Create a supervisor with the given probe options.
    pub fn new(options: ProbeOptions) -> Self {
        Self {
            options,
            probe: Mutex::new(None),
        }
    }

    /// The probe options in use.
    pub fn options(&self) -> &ProbeOptions {
        &self.options
    }

    /// Start probing, replacing any probe still running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        &self,
        executor: Arc<dyn CommandExecutor>,
        status: Arc<RwLock<DeviceStatus>>,
        events: EventDispatcher,
    ) {
        let max_attempts = self.options.max_attempts;
        debug!(
            "Starting readiness probe ({} attempts, {:?} apart)",
            max_attempts, self.options.delay
        );

        let task = PeriodicTask::spawn("readiness-probe", self.options.delay, move |attempt| {
            let executor = Arc::clone(&executor);
            let status = Arc::clone(&status);
            let events = events.clone();
            async move {
                if executor.is_ready().await {
                    status.write().await.leave_pre_init();
                    info!("Pod transport ready after {} probe attempt(s)", attempt);
                    events.send(PodEvent::PodReady { attempts: attempt });
                    return ControlFlow::Break(());
                }
                if attempt >= max_attempts {
                    warn!("Pod transport not ready after {} probe attempts, giving up", attempt);
                    events.send(PodEvent::ProbeExhausted { attempts: attempt });
                    return ControlFlow::Break(());
                }
                debug!("Probe attempt {}/{}: transport not ready", attempt, max_attempts);
                ControlFlow::Continue(())
            }
        });

        // Replacing drops (and so cancels) the previous probe.
        *self.probe.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// Stop any running probe.
    pub fn stop(&self) {
        if let Some(task) = self.probe.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.stop();
        }
    }

    /// Whether a probe is currently running.
    pub fn is_probing(&self) -> bool {
        self.probe
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(PeriodicTask::is_active)
    }
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new(ProbeOptions::default())
    }
}
