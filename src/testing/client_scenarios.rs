//! Routing, refresh and failover from the caller's point of view.

use super::{ep, init_tracing, key_in_segment, FakeConnector};
use crate::client::{Invoker, RemoteOperation, Router};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::hash::{HASH_VERSION_SEGMENTED, HASH_VERSION_WHEEL_V2};
use crate::pool::Transport;
use crate::topology::{TopologyEvent, TopologyUpdate};
use crate::types::Endpoint;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn router_with(config: ClientConfig) -> (Arc<Router>, Arc<FakeConnector>) {
    init_tracing();
    let connector = Arc::new(FakeConnector::new());
    let config = config
        .with_connect_timeout(Duration::from_millis(100))
        .with_so_timeout(Duration::from_millis(500));
    let router = Router::with_connector(config, connector.clone()).unwrap();
    (Arc::new(router), connector)
}

/// A keyed request whose reply may piggy-back a topology update.
struct Get {
    key: Vec<u8>,
    router: Arc<Router>,
    piggyback: Option<TopologyUpdate>,
}

#[async_trait]
impl RemoteOperation for Get {
    type Output = (Endpoint, Bytes);

    fn cache_name(&self) -> &str {
        "c"
    }

    fn routing_key(&self) -> Option<&[u8]> {
        Some(&self.key)
    }

    async fn execute(&mut self, transport: &mut Transport) -> Result<Self::Output> {
        let reply = transport.request(&self.key).await?;
        if let Some(update) = self.piggyback.take() {
            self.router.apply_update(transport, update)?;
        }
        Ok((transport.endpoint().clone(), reply))
    }
}

#[tokio::test]
async fn test_primary_routing_hit() {
    let (router, _) = router_with(ClientConfig::new(vec![ep("a"), ep("b")]));
    router
        .update_hash_function(1, vec![vec![ep("a")], vec![ep("b")]], 2, HASH_VERSION_SEGMENTED, "c")
        .unwrap();
    let key = key_in_segment(&router.consistent_hash("c").unwrap(), 1);

    let t = router.transport_for_key(&key, &HashSet::new(), "c").await.unwrap();
    assert_eq!(t.endpoint(), &ep("b"));
    router.release_transport(t);
    assert_eq!(router.metrics().owner_fallbacks, 0);
}

#[tokio::test]
async fn test_failed_primary_falls_back_to_backup_owner() {
    let servers = vec![ep("a"), ep("b"), ep("c"), ep("d")];
    let (router, _) = router_with(ClientConfig::new(servers));
    router
        .update_hash_function(
            1,
            vec![vec![ep("a"), ep("b")], vec![ep("c"), ep("d")]],
            2,
            HASH_VERSION_SEGMENTED,
            "c",
        )
        .unwrap();
    let key = key_in_segment(&router.consistent_hash("c").unwrap(), 0);
    let failed: HashSet<Endpoint> = [ep("a")].into_iter().collect();

    let t = router.transport_for_key(&key, &failed, "c").await.unwrap();
    assert_eq!(t.endpoint(), &ep("b"));
    router.release_transport(t);
    assert_eq!(router.metrics().owner_fallbacks, 1);
}

#[tokio::test]
async fn test_stale_topology_refresh_from_reply() {
    let (router, _) = router_with(ClientConfig::new(vec![ep("a"), ep("b")]));
    router
        .update_hash_function(5, vec![vec![ep("a")], vec![ep("b")]], 2, HASH_VERSION_SEGMENTED, "c")
        .unwrap();
    let old_hash = router.consistent_hash("c").unwrap();
    let key = key_in_segment(&old_hash, 0);
    let mut events = router.subscribe();

    // The reply to the first operation announces topology 7 with swapped
    // owners.
    let invoker = Invoker::new(router.clone());
    let mut op = Get {
        key: key.clone(),
        router: router.clone(),
        piggyback: Some(
            TopologyUpdate::new("c", 7)
                .with_segment_owners(HASH_VERSION_SEGMENTED, vec![vec![ep("b")], vec![ep("a")]]),
        ),
    };
    let (used, reply) = invoker.execute(&mut op).await.unwrap();
    assert_eq!(used, ep("a"));
    assert_eq!(&reply[..], FakeConnector::echo_reply(&ep("a"), &key).as_slice());

    assert_eq!(router.cache_topology_info("c").topology_id, 7);
    assert!(matches!(
        events.try_recv().unwrap(),
        TopologyEvent::TopologyInstalled { topology_id: 7, .. }
    ));

    let mut op = Get {
        key,
        router: router.clone(),
        piggyback: None,
    };
    let (used, _) = invoker.execute(&mut op).await.unwrap();
    assert_eq!(used, ep("b"));
}

#[tokio::test]
async fn test_topology_id_never_decreases() {
    let (router, _) = router_with(ClientConfig::new(vec![ep("a")]));
    let mut observed = Vec::new();
    for id in [3, 1, 4, 4, 2, 9, 5] {
        let _ = router.update_hash_function(id, vec![vec![ep("a")]], 1, HASH_VERSION_SEGMENTED, "c");
        observed.push(router.topology_id("c"));
    }
    assert_eq!(observed, vec![3, 3, 4, 4, 4, 9, 9]);
}

/// Succeeds with the endpoint it ran on.
struct Ping;

#[async_trait]
impl RemoteOperation for Ping {
    type Output = Endpoint;

    fn cache_name(&self) -> &str {
        "c"
    }

    async fn execute(&mut self, transport: &mut Transport) -> Result<Endpoint> {
        transport.request(b"ping").await?;
        Ok(transport.endpoint().clone())
    }
}

#[tokio::test]
async fn test_exhausted_retries_switch_cluster() {
    let config = ClientConfig::new(vec![ep("a"), ep("b")])
        .with_max_retries(2)
        .with_failover_cluster("backup", vec![ep("x")]);
    let (router, connector) = router_with(config);
    connector.refuse(&ep("a"));
    connector.refuse(&ep("b"));
    let mut events = router.subscribe();

    let invoker = Invoker::new(router.clone());
    let used = invoker.execute(&mut Ping).await.unwrap();

    assert_eq!(used, ep("x"));
    assert_eq!(router.cluster_name(), "backup");
    assert_eq!(router.metrics().cluster_switches, 1);
    assert_eq!(router.consecutive_failures("c"), 0);
    assert!(matches!(
        events.try_recv().unwrap(),
        TopologyEvent::ClusterSwitched { .. }
    ));
}

#[tokio::test]
async fn test_empty_failover_cluster_is_unreachable() {
    let config = ClientConfig::new(vec![ep("a"), ep("b")])
        .with_max_retries(2)
        .with_failover_cluster("backup", vec![]);
    let (router, connector) = router_with(config);
    connector.refuse(&ep("a"));
    connector.refuse(&ep("b"));

    let invoker = Invoker::new(router.clone());
    let err = invoker.execute(&mut Ping).await.unwrap_err();
    assert!(matches!(err, Error::NoReachableServers(_)));
    assert_eq!(router.cluster_name(), "default");
}

#[tokio::test]
async fn test_update_from_previous_cluster_is_discarded() {
    let config = ClientConfig::new(vec![ep("a")]).with_failover_cluster("backup", vec![ep("x")]);
    let (router, _) = router_with(config);

    let leased = router.transport(&HashSet::new(), "c").await.unwrap();
    assert!(router.try_switch_cluster("c"));

    let update = TopologyUpdate::new("c", 10).with_servers(vec![ep("a")]);
    assert!(!router.apply_update(&leased, update).unwrap());
    assert_eq!(router.topology_id("c"), 0);
    assert_eq!(router.servers("c"), vec![ep("x")]);
    assert_eq!(router.metrics().updates_discarded, 1);
    router.release_transport(leased);
}

#[tokio::test]
async fn test_legacy_hash_round_trip() {
    let (router, _) = router_with(ClientConfig::new(vec![ep("a"), ep("b"), ep("c")]));
    let servers_to_hash = vec![
        (ep("a"), vec![100, 700]),
        (ep("b"), vec![100, 400]),
        (ep("c"), vec![400]),
    ];
    assert!(router
        .update_hash_function_legacy(2, &servers_to_hash, 2, HASH_VERSION_WHEEL_V2, 1000, "c")
        .unwrap());

    let ch = router.consistent_hash("c").unwrap();
    assert!(ch.is_legacy());
    assert_eq!(ch.owners_of(100), &[ep("a"), ep("b")]);
    assert_eq!(ch.owners_of(400), &[ep("b"), ep("c")]);
    assert_eq!(ch.owners_of(700), &[ep("a")]);
}

#[tokio::test]
async fn test_topology_info_owners_are_subset_of_servers() {
    let (router, _) = router_with(ClientConfig::new(vec![ep("a"), ep("b"), ep("c")]));
    router
        .update_hash_function(
            1,
            vec![vec![ep("a"), ep("b")], vec![ep("c"), ep("a")], vec![ep("b")]],
            3,
            HASH_VERSION_SEGMENTED,
            "c",
        )
        .unwrap();

    let live = vec![ep("a"), ep("c")];
    router.update_servers(live.clone(), "c", true);

    let info = router.cache_topology_info("c");
    assert_eq!(info.topology_id, 1);
    for owner in info.owners() {
        assert!(live.contains(&owner), "{} is not a live server", owner);
    }
    assert_eq!(info.segment_owners.get(&2).map(Vec::len), Some(0));
}
