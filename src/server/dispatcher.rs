//! Per-cache inbound handler for transactional commands.
//!
//! ```text
//! received -> classified -> ready now ------------------> executed -> replied
//!                        \-> parked on gate -> ready? --/
//! ```
//!
//! The receiving thread never blocks: it classifies the command, builds the
//! ready action guarding it and either spawns it or parks it on the
//! executor. Topology changes and ready-action progress poke the executor,
//! which re-checks parked commands.

use super::action::{ActionContext, ActionState, CompositeAction, DefaultReadyAction, ReadyAction};
use super::command::{
    CommandInvoker, CommandPayload, ErrorEnvelope, LockRequest, RemoteCommand, Reply, Response,
};
use super::executor::{ReadinessCheck, ReadyExecutor, ScheduledTask};
use super::locks::LockManager;
use super::pending::PendingLockManager;
use super::runnable::{CommandGate, CommandRunnable, TopologyWait};
use super::topology::{SubscriptionId, TopologyTracker};
use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use crate::metrics::{inc, DispatcherMetrics, DispatcherMetricsSnapshot};
use crate::types::{DeliverOrder, TopologyId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Dispatches commands of one transactional cache delivered without total
/// order.
pub struct TxInboundHandler {
    cache_name: String,
    config: DispatcherConfig,
    tracker: Arc<TopologyTracker>,
    lock_manager: Arc<dyn LockManager>,
    pending: Arc<dyn PendingLockManager>,
    invoker: Arc<dyn CommandInvoker>,
    executor: ReadyExecutor,
    ctx: ActionContext,
    metrics: Arc<DispatcherMetrics>,
    subscription: SubscriptionId,
}

impl TxInboundHandler {
    /// Build a handler. Must be called from within a tokio runtime.
    pub fn new(
        cache_name: impl Into<String>,
        config: DispatcherConfig,
        tracker: Arc<TopologyTracker>,
        lock_manager: Arc<dyn LockManager>,
        pending: Arc<dyn PendingLockManager>,
        invoker: Arc<dyn CommandInvoker>,
    ) -> Result<Self> {
        config.validate()?;
        let cache_name = cache_name.into();
        if tracker.cache_name() != cache_name {
            return Err(Error::Config(format!(
                "topology tracker belongs to cache '{}', not '{}'",
                tracker.cache_name(),
                cache_name
            )));
        }

        let executor = ReadyExecutor::new(cache_name.clone(), config.max_concurrent_tasks);
        let subscription = tracker.subscribe(executor.waker());
        let ctx = ActionContext::new(tracker.clone(), &config);
        info!(cache = %cache_name, locking_mode = ?config.locking_mode, "Inbound handler started");

        Ok(Self {
            cache_name,
            config,
            tracker,
            lock_manager,
            pending,
            invoker,
            executor,
            ctx,
            metrics: Arc::new(DispatcherMetrics::default()),
            subscription,
        })
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn tracker(&self) -> &Arc<TopologyTracker> {
        &self.tracker
    }

    pub fn metrics(&self) -> DispatcherMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Commands parked waiting for their gate.
    pub fn parked(&self) -> usize {
        self.executor.pending_count()
    }

    /// Accept a command. The reply is sent exactly once, from whichever task
    /// finishes the command.
    pub fn handle(&self, command: RemoteCommand, reply: Reply, order: DeliverOrder) {
        inc(&self.metrics.received);

        if self.tracker.is_stopped() || self.executor.is_shutdown() {
            let error = Error::Cancelled(format!("cache '{}' is stopping", self.cache_name));
            return self.reject(&command, reply, error);
        }
        if order == DeliverOrder::Total {
            let error = Error::protocol(
                command.origin.as_ref(),
                "total order delivery is not handled by this dispatcher",
            );
            return self.reject(&command, reply, error);
        }

        let action = match self.create_action(&command) {
            Ok(action) => action,
            Err(error) => return self.reject(&command, reply, error),
        };
        if let Some(action) = &action {
            action.add_listener(self.executor.waker());
        }

        let wait = match command.payload {
            CommandPayload::StateRequest { .. } => TopologyWait::Installed,
            _ => TopologyWait::TxData,
        };
        let command = Arc::new(command);
        let gate = Arc::new(CommandGate::new(
            self.tracker.clone(),
            command.topology_id,
            wait,
            action.clone(),
            &self.config,
        ));
        let job = CommandRunnable {
            command: command.clone(),
            reply,
            gate: gate.clone(),
            invoker: self.invoker.clone(),
            metrics: self.metrics.clone(),
        }
        .into_job();

        if gate.is_ready() {
            self.executor.submit(ScheduledTask::ReadyNow(job));
            return;
        }

        inc(&self.metrics.parked);
        debug!(
            cache = %self.cache_name,
            command_id = command.command_id(),
            topology_id = command.topology_id,
            installed = self.tracker.installed(),
            has_action = action.is_some(),
            "Command parked"
        );
        if action.is_none() {
            self.poke_after(self.config.topology_wait_timeout);
        }
        self.executor.submit(ScheduledTask::Pending { gate, job });
    }

    /// The ready action guarding `command`, if it needs one.
    fn create_action(&self, command: &RemoteCommand) -> Result<Option<Arc<dyn ReadyAction>>> {
        match &command.payload {
            CommandPayload::MultipleRpc(children) => {
                if children
                    .iter()
                    .any(|child| child.issued_order == DeliverOrder::Total)
                {
                    return Err(Error::protocol(
                        command.origin.as_ref(),
                        "batch contains a total order command",
                    ));
                }
                let mut actions: Vec<Arc<dyn ReadyAction>> = children
                    .iter()
                    .filter_map(|child| self.child_action(child))
                    .collect();
                Ok(match actions.len() {
                    0 => None,
                    1 => actions.pop(),
                    _ => Some(CompositeAction::new(actions) as Arc<dyn ReadyAction>),
                })
            }
            CommandPayload::Prepare(lock) | CommandPayload::VersionedPrepare(lock) => {
                if self.config.is_pessimistic() {
                    Ok(None)
                } else {
                    Ok(self.lock_action(command.topology_id, lock))
                }
            }
            CommandPayload::LockControl { lock, unlock } => {
                if *unlock {
                    Ok(None)
                } else {
                    Ok(self.lock_action(command.topology_id, lock))
                }
            }
            CommandPayload::StateRequest { .. } | CommandPayload::Other { .. } => Ok(None),
        }
    }

    /// Lock controls and optimistic prepares inside a batch get an action;
    /// everything else is ignored.
    fn child_action(&self, child: &RemoteCommand) -> Option<Arc<dyn ReadyAction>> {
        match &child.payload {
            CommandPayload::LockControl { lock, unlock: false } => {
                self.lock_action(child.topology_id, lock)
            }
            CommandPayload::Prepare(lock) | CommandPayload::VersionedPrepare(lock)
                if !self.config.is_pessimistic() =>
            {
                self.lock_action(child.topology_id, lock)
            }
            _ => None,
        }
    }

    fn lock_action(&self, topology_id: TopologyId, lock: &LockRequest) -> Option<Arc<dyn ReadyAction>> {
        if lock.skip_locking || lock.keys.is_empty() {
            return None;
        }
        let timeout = if lock.zero_lock_acquisition {
            Duration::ZERO
        } else {
            self.config.lock_acquisition_timeout
        };
        let state = ActionState::new(lock.tx, topology_id, lock.keys.clone(), timeout);
        let action = DefaultReadyAction::transactional(
            state,
            self.ctx.clone(),
            self.pending.clone(),
            self.lock_manager.clone(),
        );
        Some(Arc::new(action) as Arc<dyn ReadyAction>)
    }

    fn reject(&self, command: &RemoteCommand, reply: Reply, error: Error) {
        inc(&self.metrics.rejected);
        warn!(
            cache = %self.cache_name,
            command_id = command.command_id(),
            topology_id = command.topology_id,
            error = %error,
            "Command rejected"
        );
        reply.send(Response::Exception(ErrorEnvelope::for_command(command, &error)));
    }

    fn poke_after(&self, delay: Duration) {
        let waker = self.executor.waker();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            waker();
        });
    }

    /// Stop accepting commands and fail the parked ones with `Cancelled`.
    pub fn shutdown(&self) {
        info!(cache = %self.cache_name, parked = self.executor.pending_count(), "Shutting down inbound handler");
        self.tracker.stop();
        self.executor.shutdown();
    }
}

impl Drop for TxInboundHandler {
    fn drop(&mut self) {
        self.tracker.unsubscribe(self.subscription);
    }
}

impl std::fmt::Debug for TxInboundHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxInboundHandler")
            .field("cache_name", &self.cache_name)
            .field("locking_mode", &self.config.locking_mode)
            .field("executor", &self.executor)
            .finish()
    }
}
