//! The gate and job the dispatcher hands to the executor for each command.

use super::action::{ActionFailure, ActionStatus, ReadyAction};
use super::command::{CommandInvoker, ErrorEnvelope, RemoteCommand, Reply, Response};
use super::executor::{Job, ReadinessCheck};
use super::topology::TopologyTracker;
use crate::config::DispatcherConfig;
use crate::error::Error;
use crate::metrics::{inc, DispatcherMetrics};
use crate::types::TopologyId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Which topology milestone a command waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyWait {
    /// Transaction data for the command's topology has been received.
    TxData,
    /// The command's topology is installed. State requests only need this.
    Installed,
}

/// Readiness of one command: its ready action, if any, and its topology.
pub struct CommandGate {
    tracker: Arc<TopologyTracker>,
    topology_id: TopologyId,
    wait: TopologyWait,
    action: Option<Arc<dyn ReadyAction>>,
    created: Instant,
    topology_wait_timeout: Duration,
    horizon: i32,
    failure: Mutex<Option<ActionFailure>>,
}

impl CommandGate {
    pub fn new(
        tracker: Arc<TopologyTracker>,
        topology_id: TopologyId,
        wait: TopologyWait,
        action: Option<Arc<dyn ReadyAction>>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            tracker,
            topology_id,
            wait,
            action,
            created: Instant::now(),
            topology_wait_timeout: config.topology_wait_timeout,
            horizon: config.topology_horizon,
            failure: Mutex::new(None),
        }
    }

    pub fn action(&self) -> Option<&Arc<dyn ReadyAction>> {
        self.action.as_ref()
    }

    /// Why the command must not run, once the gate opened on a failure.
    pub fn failure(&self) -> Option<ActionFailure> {
        if let Some(failure) = &*self.failure.lock() {
            return Some(failure.clone());
        }
        match self.action.as_ref().map(|action| action.status()) {
            Some(ActionStatus::Canceled(failure)) => Some(failure),
            _ => None,
        }
    }

    pub fn on_finally(&self, success: bool) {
        if let Some(action) = &self.action {
            action.on_finally(success);
        }
    }

    fn fail(&self, failure: ActionFailure) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    fn topology_ready(&self) -> Result<bool, ActionFailure> {
        if self.tracker.is_stopped() {
            return Err(ActionFailure::Cancelled(format!(
                "cache '{}' is stopping",
                self.tracker.cache_name()
            )));
        }
        let reached = match self.wait {
            TopologyWait::TxData => self.tracker.tx_data_received(),
            TopologyWait::Installed => self.tracker.installed(),
        };
        if reached >= self.topology_id {
            return Ok(true);
        }

        let installed = self.tracker.installed();
        let waited = self.created.elapsed();
        if waited >= self.topology_wait_timeout
            && self.topology_id > installed.saturating_add(self.horizon)
        {
            return Err(ActionFailure::TopologyTimeout {
                expected: self.topology_id,
                installed,
                waited,
            });
        }
        Ok(false)
    }
}

impl ReadinessCheck for CommandGate {
    fn is_ready(&self) -> bool {
        if self.failure.lock().is_some() {
            return true;
        }
        if let Some(action) = &self.action {
            match action.status() {
                ActionStatus::NotReady => return false,
                ActionStatus::Canceled(_) => return true,
                ActionStatus::Ready => {}
            }
        }
        match self.topology_ready() {
            Ok(ready) => ready,
            Err(failure) => {
                self.fail(failure);
                true
            }
        }
    }

    fn cancel(&self, reason: ActionFailure) {
        self.fail(reason.clone());
        if let Some(action) = &self.action {
            action.cancel(reason);
        }
    }
}

impl std::fmt::Debug for CommandGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandGate")
            .field("topology_id", &self.topology_id)
            .field("wait", &self.wait)
            .field("has_action", &self.action.is_some())
            .field("failure", &*self.failure.lock())
            .finish()
    }
}

/// Runs a command once its gate opened and delivers the reply.
pub struct CommandRunnable {
    pub command: Arc<RemoteCommand>,
    pub reply: Reply,
    pub gate: Arc<CommandGate>,
    pub invoker: Arc<dyn CommandInvoker>,
    pub metrics: Arc<DispatcherMetrics>,
}

impl CommandRunnable {
    pub fn into_job(self) -> Job {
        Box::pin(self.run())
    }

    async fn run(self) {
        let Self {
            command,
            reply,
            gate,
            invoker,
            metrics,
        } = self;

        if let Some(failure) = gate.failure() {
            let error = failure.into_error(&command.cache_name);
            warn!(
                cache = %command.cache_name,
                command_id = command.command_id(),
                topology_id = command.topology_id,
                error = %error,
                "Command not executed"
            );
            gate.on_finally(false);
            inc(&metrics.failed);
            reply.send(Response::Exception(ErrorEnvelope::for_command(&command, &error)));
            return;
        }

        // A panicking invocation surfaces as a JoinError instead of tearing
        // down the executor task.
        let target = command.clone();
        let result = match tokio::spawn(async move { invoker.invoke(target).await }).await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("invocation failed: {}", e))),
        };

        let response = match result {
            Ok(response) => {
                gate.on_finally(!response.is_exception());
                inc(&metrics.executed);
                debug!(
                    cache = %command.cache_name,
                    command_id = command.command_id(),
                    "Command executed"
                );
                response
            }
            Err(error) => {
                gate.on_finally(false);
                inc(&metrics.failed);
                warn!(
                    cache = %command.cache_name,
                    command_id = command.command_id(),
                    error = %error,
                    "Command failed"
                );
                Response::Exception(ErrorEnvelope::for_command(&command, &error))
            }
        };
        reply.send(response);
    }
}
