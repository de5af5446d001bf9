//! Inbound dispatch of transactional commands end to end.

use super::{init_tracing, wait_for, RecordingInvoker};
use crate::config::DispatcherConfig;
use crate::error::ErrorKind;
use crate::server::{
    ActionContext, ActionState, CommandPayload, CompositeAction, DefaultReadyAction,
    KeyLockManager, LockManager, LockRequest, PendingTxTracker, ReadyAction, RemoteCommand, Reply,
    Response, TopologyTracker, TxInboundHandler,
};
use crate::types::{DeliverOrder, LockingMode, TopologyId, TxId};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const CACHE: &str = "tx-cache";

fn key(name: &str) -> Bytes {
    Bytes::copy_from_slice(name.as_bytes())
}

fn keys(names: &[&str]) -> Vec<Bytes> {
    names.iter().map(|n| key(n)).collect()
}

struct Node {
    handler: TxInboundHandler,
    tracker: Arc<TopologyTracker>,
    locks: Arc<KeyLockManager>,
    pending: Arc<PendingTxTracker>,
    invoker: Arc<RecordingInvoker>,
}

impl Node {
    fn start(config: DispatcherConfig, installed: TopologyId) -> Self {
        init_tracing();
        let tracker = Arc::new(TopologyTracker::new(CACHE, installed));
        let locks = Arc::new(KeyLockManager::new());
        let pending = Arc::new(PendingTxTracker::new());
        let invoker = Arc::new(RecordingInvoker::checking_locks(locks.clone()));
        let handler = TxInboundHandler::new(
            CACHE,
            config,
            tracker.clone(),
            locks.clone(),
            pending.clone(),
            invoker.clone(),
        )
        .unwrap();
        Self {
            handler,
            tracker,
            locks,
            pending,
            invoker,
        }
    }

    fn optimistic() -> Self {
        Self::start(DispatcherConfig::default(), 1)
    }

    fn send(&self, command: RemoteCommand, order: DeliverOrder) -> oneshot::Receiver<Response> {
        let (reply, rx) = Reply::channel();
        self.handler.handle(command, reply, order);
        rx
    }
}

async fn response(rx: oneshot::Receiver<Response>) -> Response {
    tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("no reply in time")
        .expect("reply dropped")
}

async fn assert_no_reply(rx: &mut oneshot::Receiver<Response>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "command replied too early");
}

fn prepare(tx: TxId, topology_id: TopologyId, names: &[&str]) -> RemoteCommand {
    RemoteCommand::new(
        CACHE,
        topology_id,
        CommandPayload::Prepare(LockRequest::new(tx, keys(names))),
    )
}

fn lock_control(tx: TxId, topology_id: TopologyId, names: &[&str]) -> RemoteCommand {
    RemoteCommand::new(
        CACHE,
        topology_id,
        CommandPayload::LockControl {
            lock: LockRequest::new(tx, keys(names)),
            unlock: false,
        },
    )
}

#[tokio::test]
async fn test_optimistic_prepare_waits_for_lock() {
    let node = Node::optimistic();
    let holder = TxId::new();
    node.locks.lock_all(holder, &keys(&["k1"]), Duration::ZERO);

    let tx = TxId::new();
    let mut rx = node.send(prepare(tx, 1, &["k1", "k2"]), DeliverOrder::None);
    assert_no_reply(&mut rx).await;
    assert_eq!(node.invoker.invocations(), 0);
    assert_eq!(node.handler.metrics().parked, 1);

    node.locks.unlock_all(holder, &keys(&["k1"]));
    assert_eq!(response(rx).await, Response::Success(None));
    assert_eq!(node.invoker.invocations(), 1);
    assert_eq!(node.invoker.unheld_keys(), 0);

    // A successful prepare keeps its locks for the commit.
    assert_eq!(node.locks.held_by(tx), keys(&["k1", "k2"]));
}

#[tokio::test]
async fn test_lock_timeout_releases_partial_locks() {
    let config = DispatcherConfig::default().with_lock_acquisition_timeout(Duration::from_millis(50));
    let node = Node::start(config, 1);
    let holder = TxId::new();
    node.locks.lock_all(holder, &keys(&["k2"]), Duration::ZERO);

    let tx = TxId::new();
    let rx = node.send(prepare(tx, 1, &["k1", "k2"]), DeliverOrder::None);

    let envelope = response(rx).await.exception().cloned().unwrap();
    assert_eq!(envelope.kind, ErrorKind::LockTimeout);
    assert_eq!(node.invoker.invocations(), 0);
    assert!(node.locks.held_by(tx).is_empty());
    assert_eq!(node.locks.owner_of(b"k2"), Some(holder));
    assert_eq!(node.handler.metrics().failed, 1);
}

#[tokio::test]
async fn test_zero_lock_acquisition_fails_fast() {
    let node = Node::optimistic();
    node.locks.lock_all(TxId::new(), &keys(&["k"]), Duration::ZERO);

    let lock = LockRequest::new(TxId::new(), keys(&["k"])).with_zero_lock_acquisition();
    let command = RemoteCommand::new(CACHE, 1, CommandPayload::Prepare(lock));
    let envelope = response(node.send(command, DeliverOrder::None))
        .await
        .exception()
        .cloned()
        .unwrap();
    assert_eq!(envelope.kind, ErrorKind::LockTimeout);
}

#[tokio::test]
async fn test_composite_runs_once_after_both_children() {
    let node = Node::optimistic();
    let (h1, h2) = (TxId::new(), TxId::new());
    node.locks.lock_all(h1, &keys(&["a"]), Duration::ZERO);
    node.locks.lock_all(h2, &keys(&["b"]), Duration::ZERO);

    let batch = RemoteCommand::new(
        CACHE,
        1,
        CommandPayload::MultipleRpc(vec![
            lock_control(TxId::new(), 1, &["a"]),
            lock_control(TxId::new(), 1, &["b"]),
        ]),
    );
    let mut rx = node.send(batch, DeliverOrder::PerSender);
    assert_no_reply(&mut rx).await;

    let locks = node.locks.clone();
    let releases = [(h1, "a"), (h2, "b")].map(|(holder, name)| {
        let locks = locks.clone();
        std::thread::spawn(move || locks.unlock_all(holder, &keys(&[name])))
    });
    for release in releases {
        release.join().unwrap();
    }

    assert_eq!(response(rx).await, Response::Success(None));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.invoker.invocations(), 1);
    assert_eq!(node.invoker.unheld_keys(), 0);
}

#[tokio::test]
async fn test_composite_listener_fires_once_under_races() {
    let tracker = Arc::new(TopologyTracker::new(CACHE, 1));
    let ctx = ActionContext::new(tracker, &DispatcherConfig::default());
    let pending = Arc::new(PendingTxTracker::new());

    for _ in 0..20 {
        let locks = Arc::new(KeyLockManager::new());
        let (h1, h2) = (TxId::new(), TxId::new());
        locks.lock_all(h1, &keys(&["a"]), Duration::ZERO);
        locks.lock_all(h2, &keys(&["b"]), Duration::ZERO);

        let children: Vec<Arc<dyn ReadyAction>> = ["a", "b"]
            .into_iter()
            .map(|name| {
                let state = ActionState::new(TxId::new(), 1, keys(&[name]), Duration::from_secs(5));
                Arc::new(DefaultReadyAction::transactional(
                    state,
                    ctx.clone(),
                    pending.clone(),
                    locks.clone(),
                )) as Arc<dyn ReadyAction>
            })
            .collect();
        let composite = CompositeAction::new(children);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        composite.add_listener(Arc::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!composite.is_ready());

        let releases = [(h1, "a"), (h2, "b")].map(|(holder, name)| {
            let locks = locks.clone();
            std::thread::spawn(move || locks.unlock_all(holder, &keys(&[name])))
        });
        for release in releases {
            release.join().unwrap();
        }

        assert!(composite.is_ready());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn test_total_order_is_rejected() {
    let node = Node::optimistic();
    let rx = node.send(prepare(TxId::new(), 1, &["k"]), DeliverOrder::Total);

    let envelope = response(rx).await.exception().cloned().unwrap();
    assert_eq!(envelope.kind, ErrorKind::Protocol);
    assert_eq!(node.invoker.invocations(), 0);
    assert_eq!(node.handler.metrics().rejected, 1);
    assert_eq!(node.locks.owner_of(b"k"), None);
}

#[tokio::test]
async fn test_batch_with_total_order_child_is_rejected() {
    let node = Node::optimistic();
    let batch = RemoteCommand::new(
        CACHE,
        1,
        CommandPayload::MultipleRpc(vec![
            lock_control(TxId::new(), 1, &["a"]),
            prepare(TxId::new(), 1, &["b"]).with_order(DeliverOrder::Total),
        ]),
    );
    let envelope = response(node.send(batch, DeliverOrder::PerSender))
        .await
        .exception()
        .cloned()
        .unwrap();
    assert_eq!(envelope.kind, ErrorKind::Protocol);
    assert_eq!(node.locks.owner_of(b"a"), None);
}

#[tokio::test]
async fn test_pessimistic_prepare_does_not_lock() {
    let config = DispatcherConfig::default().with_locking_mode(LockingMode::Pessimistic);
    let node = Node::start(config, 1);
    let other = TxId::new();
    node.locks.lock_all(other, &keys(&["k"]), Duration::ZERO);

    let rx = node.send(prepare(TxId::new(), 1, &["k"]), DeliverOrder::None);
    assert_eq!(response(rx).await, Response::Success(None));
    assert_eq!(node.locks.owner_of(b"k"), Some(other));
}

#[tokio::test]
async fn test_skip_locking_and_unlock_have_no_action() {
    let node = Node::optimistic();
    let holder = TxId::new();
    node.locks.lock_all(holder, &keys(&["k"]), Duration::ZERO);

    let skip = LockRequest::new(TxId::new(), keys(&["k"])).with_skip_locking();
    let rx = node.send(
        RemoteCommand::new(CACHE, 1, CommandPayload::Prepare(skip)),
        DeliverOrder::None,
    );
    assert_eq!(response(rx).await, Response::Success(None));

    let unlock = RemoteCommand::new(
        CACHE,
        1,
        CommandPayload::LockControl {
            lock: LockRequest::new(TxId::new(), keys(&["k"])),
            unlock: true,
        },
    );
    assert_eq!(response(node.send(unlock, DeliverOrder::None)).await, Response::Success(None));
    assert_eq!(node.invoker.invocations(), 2);
}

#[tokio::test]
async fn test_state_request_waits_for_install_only() {
    let node = Node::optimistic();
    let state_request = RemoteCommand::new(CACHE, 2, CommandPayload::StateRequest { segments: vec![0, 1] });
    let other = RemoteCommand::new(
        CACHE,
        2,
        CommandPayload::Other {
            command_id: 40,
            body: Bytes::new(),
        },
    );

    let mut state_rx = node.send(state_request, DeliverOrder::None);
    let mut other_rx = node.send(other, DeliverOrder::None);
    assert_no_reply(&mut state_rx).await;
    assert_eq!(node.handler.parked(), 2);

    node.tracker.install(2);
    assert_eq!(response(state_rx).await, Response::Success(None));
    assert_no_reply(&mut other_rx).await;

    node.tracker.mark_tx_data_received(2);
    assert_eq!(response(other_rx).await, Response::Success(None));
}

#[tokio::test]
async fn test_prepare_waits_for_tx_data() {
    let node = Node::optimistic();
    let tx = TxId::new();
    let mut rx = node.send(prepare(tx, 2, &["k"]), DeliverOrder::None);
    assert_no_reply(&mut rx).await;
    assert_eq!(node.locks.owner_of(b"k"), None);

    node.tracker.install_with_tx_data(2);
    assert_eq!(response(rx).await, Response::Success(None));
    assert_eq!(node.locks.owner_of(b"k"), Some(tx));
}

#[tokio::test]
async fn test_topology_far_ahead_times_out() {
    let config = DispatcherConfig::default().with_topology_wait_timeout(Duration::from_millis(50));
    let node = Node::start(config, 1);
    let rx = node.send(
        RemoteCommand::new(
            CACHE,
            5,
            CommandPayload::Other {
                command_id: 40,
                body: Bytes::new(),
            },
        ),
        DeliverOrder::None,
    );

    let envelope = response(rx).await.exception().cloned().unwrap();
    assert_eq!(envelope.kind, ErrorKind::TopologyTimeout);
    assert_eq!(envelope.topology_id, 5);
}

#[tokio::test]
async fn test_outdated_command_is_stale() {
    let node = Node::start(DispatcherConfig::default(), 4);
    let rx = node.send(prepare(TxId::new(), 1, &["k"]), DeliverOrder::None);

    let envelope = response(rx).await.exception().cloned().unwrap();
    assert_eq!(envelope.kind, ErrorKind::StaleTopology);
    assert_eq!(node.locks.owner_of(b"k"), None);
}

#[tokio::test]
async fn test_pending_transaction_delays_lock() {
    let node = Node::start(DispatcherConfig::default(), 2);
    node.tracker.install_with_tx_data(2);
    let old = TxId::new();
    node.pending.track(old, 1, &keys(&["k"]));

    let tx = TxId::new();
    let mut rx = node.send(prepare(tx, 2, &["k"]), DeliverOrder::None);
    assert_no_reply(&mut rx).await;
    assert_eq!(node.locks.owner_of(b"k"), None);

    node.pending.complete(old);
    assert_eq!(response(rx).await, Response::Success(None));
    assert_eq!(node.locks.owner_of(b"k"), Some(tx));
}

#[tokio::test]
async fn test_shutdown_cancels_parked_and_rejects_new() {
    let node = Node::optimistic();
    let holder = TxId::new();
    node.locks.lock_all(holder, &keys(&["k2"]), Duration::ZERO);

    let tx = TxId::new();
    let mut rx = node.send(prepare(tx, 1, &["k1", "k2"]), DeliverOrder::None);
    assert_no_reply(&mut rx).await;
    assert_eq!(node.locks.owner_of(b"k1"), Some(tx));

    node.handler.shutdown();
    let envelope = response(rx).await.exception().cloned().unwrap();
    assert_eq!(envelope.kind, ErrorKind::Cancelled);
    assert!(
        wait_for(
            || node.locks.owner_of(b"k1").is_none(),
            Duration::from_secs(1),
            Duration::from_millis(10)
        )
        .await
    );

    let rx = node.send(prepare(TxId::new(), 1, &["k3"]), DeliverOrder::None);
    let envelope = response(rx).await.exception().cloned().unwrap();
    assert_eq!(envelope.kind, ErrorKind::Cancelled);
    assert_eq!(node.invoker.invocations(), 0);
}

#[tokio::test]
async fn test_per_sender_commands_on_same_key_serialize() {
    let node = Node::optimistic();
    let (first, second) = (TxId::new(), TxId::new());

    let rx1 = node.send(prepare(first, 1, &["k"]), DeliverOrder::PerSender);
    let mut rx2 = node.send(prepare(second, 1, &["k"]), DeliverOrder::PerSender);
    assert_eq!(response(rx1).await, Response::Success(None));
    assert_no_reply(&mut rx2).await;

    // Commit of the first transaction releases its locks.
    node.locks.unlock_all(first, &keys(&["k"]));
    assert_eq!(response(rx2).await, Response::Success(None));
    assert_eq!(node.locks.owner_of(b"k"), Some(second));
    assert_eq!(node.invoker.invoked().len(), 2);
}
