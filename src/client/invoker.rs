//! Retry driver for remote operations.

use super::router::Router;
use crate::error::{Error, Result};
use crate::pool::Transport;
use crate::types::Endpoint;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One request/response exchange against a cache.
#[async_trait]
pub trait RemoteOperation: Send {
    type Output: Send;

    /// Cache the operation targets.
    fn cache_name(&self) -> &str;

    /// Key used to pick the owning server. `None` routes to any server.
    fn routing_key(&self) -> Option<&[u8]> {
        None
    }

    /// Whether a lock timeout or deadlock reported by the server is retried.
    fn retry_on_lock_failure(&self) -> bool {
        false
    }

    /// Run the exchange over a leased transport.
    async fn execute(&mut self, transport: &mut Transport) -> Result<Self::Output>;
}

/// Drives [`RemoteOperation`]s through the router with bounded retries.
///
/// Each cluster gets `max(max_retries, 1)` attempts. When they are spent and
/// every live server of the cluster has failed, the invoker switches to the
/// next failover cluster once and starts over with a fresh budget.
#[derive(Debug, Clone)]
pub struct Invoker {
    router: Arc<Router>,
}

#[derive(Debug, Default)]
struct RetryState {
    failed: HashSet<Endpoint>,
    attempts: u32,
    switched: bool,
    pool_retry_used: bool,
    protocol_retry_used: bool,
    last_error: Option<Error>,
}

impl Invoker {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Execute `op`, retrying per the error taxonomy.
    pub async fn execute<O: RemoteOperation>(&self, op: &mut O) -> Result<O::Output> {
        let cache = op.cache_name().to_string();
        let key = op.routing_key().map(<[u8]>::to_vec);
        let budget = self.router.config().max_retries.max(1);
        let mut state = RetryState::default();

        loop {
            if state.attempts >= budget {
                if self.all_failed(&state.failed, &cache) {
                    if !state.switched && self.router.try_switch_cluster(&cache) {
                        info!(cache = %cache, cluster = %self.router.cluster_name(), "Retrying on failover cluster");
                        state.switched = true;
                        state.attempts = 0;
                        state.failed.clear();
                        continue;
                    }
                    return Err(Error::NoReachableServers(cache));
                }
                return Err(state
                    .last_error
                    .take()
                    .unwrap_or(Error::NoReachableServers(cache)));
            }
            state.attempts += 1;

            let mut unreachable = Vec::new();
            let routed = self
                .router
                .lease(key.as_deref(), &state.failed, &cache, &mut unreachable)
                .await;
            state.failed.extend(unreachable);

            let mut transport = match routed {
                Ok(transport) => transport,
                Err(Error::NoReachableServers(_)) => {
                    // Every live server is already in the failed set.
                    state.attempts = budget;
                    continue;
                }
                Err(e) => {
                    if !self.should_retry(&e, op, &mut state) {
                        return Err(e);
                    }
                    // Only candidates that could not be connected count as
                    // failed; an exhausted pool belongs to a healthy server.
                    self.router.record_retry();
                    state.last_error = Some(e);
                    continue;
                }
            };

            match op.execute(&mut transport).await {
                Ok(output) => {
                    self.router.release_transport(transport);
                    self.router.record_success(&cache);
                    return Ok(output);
                }
                Err(e) => {
                    let endpoint = transport.endpoint().clone();
                    if e.invalidates_connection() || transport.is_broken() {
                        self.router.invalidate_transport(&endpoint, transport);
                    } else {
                        self.router.release_transport(transport);
                    }

                    if !self.should_retry(&e, op, &mut state) {
                        debug!(cache = %cache, %endpoint, error = %e, "Operation failed");
                        return Err(e);
                    }

                    warn!(
                        cache = %cache,
                        %endpoint,
                        attempt = state.attempts,
                        error = %e,
                        "Retrying operation"
                    );
                    if matches!(e, Error::TransientEndpoint { .. } | Error::Protocol { .. }) {
                        state.failed.insert(endpoint);
                    }
                    self.router.record_retry();
                    state.last_error = Some(e);
                }
            }
        }
    }

    fn should_retry<O: RemoteOperation>(&self, error: &Error, op: &O, state: &mut RetryState) -> bool {
        match error {
            Error::TransientEndpoint { .. }
            | Error::StaleTopology { .. }
            | Error::TopologyTimeout { .. } => true,
            Error::PoolExhausted { .. } => !std::mem::replace(&mut state.pool_retry_used, true),
            Error::Protocol { .. } => !std::mem::replace(&mut state.protocol_retry_used, true),
            Error::LockTimeout(_) | Error::Deadlock { .. } => op.retry_on_lock_failure(),
            _ => false,
        }
    }

    fn all_failed(&self, failed: &HashSet<Endpoint>, cache: &str) -> bool {
        self.router
            .servers(cache)
            .iter()
            .all(|server| failed.contains(server))
    }
}
