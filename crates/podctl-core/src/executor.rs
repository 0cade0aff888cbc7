//! Trait abstraction for the pod command transport.
//!
//! This module provides the [`CommandExecutor`] trait that abstracts over
//! the real radio transport and the [`crate::MockExecutor`] used in tests.

use std::sync::Arc;

use async_trait::async_trait;

use crate::command::{Command, CommandResponse};
use crate::error::Result;

/// Transport that carries commands to the pod.
///
/// Implementations must be single-flight: at most one command is in flight
/// to the pod at any time, system-wide, regardless of how many tasks call
/// [`execute`](Self::execute) concurrently. They must also return within a
/// bounded (possibly long) timeout.
///
/// Errors returned from `execute` mean the outcome is unknown; an explicit
/// refusal by the pod is a successful call whose response reports
/// `accepted == false`.
///
/// # Example
///
/// ```ignore
/// use podctl_core::{Command, CommandExecutor, Result};
///
/// async fn cancel_tbr<E: CommandExecutor>(executor: &E) -> Result<bool> {
///     let response = executor.execute(Command::CancelTemporaryBasal).await?;
///     Ok(response.accepted())
/// }
/// ```
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Send one command and wait for its typed response.
    async fn execute(&self, command: Command) -> Result<CommandResponse>;

    /// Whether the transport has finished its own start-up and can reach
    /// the pod.
    ///
    /// The default implementation reports ready immediately.
    async fn is_ready(&self) -> bool {
        true
    }
}

#[async_trait]
impl<E: CommandExecutor + ?Sized> CommandExecutor for Arc<E> {
    async fn execute(&self, command: Command) -> Result<CommandResponse> {
        (**self).execute(command).await
    }

    async fn is_ready(&self) -> bool {
        (**self).is_ready().await
    }
}
