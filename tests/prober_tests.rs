
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use jobrelay::config::{ProbeConfig, ProbeStrategy};
use jobrelay::registry::{WorkerRegistry, WorkerState};
use jobrelay::store::SqliteStore;
use jobrelay::worker::{HealthProber, WorkerRpc};
use test_harness::{add_worker, closed_port, memory_store, FakeAgent, FakeRpc, RpcCall};

fn socket_config() -> ProbeConfig {
    ProbeConfig {
        interval_secs: 1,
        connect_timeout_ms: 500,
        strategy: ProbeStrategy::Socket,
    }
}

fn prober(store: &SqliteStore, rpc: Arc<dyn WorkerRpc>, config: ProbeConfig) -> HealthProber {
    HealthProber::new(Arc::new(store.clone()), rpc, config)
}

async fn state_of(store: &SqliteStore, worker_id: i64) -> WorkerState {
    store.get_worker(worker_id).await.unwrap().state
}

#[tokio::test]
async fn test_closed_port_goes_offline_then_online_when_reopened() {
    let store = memory_store().await;
    let port = closed_port();
    let worker = add_worker(&store, "c", "charlie", port, 1, WorkerState::Online).await;
    let prober = prober(&store, FakeRpc::new(), socket_config());

    let report = prober.probe_all().await.unwrap();
    assert_eq!(report.offline, vec![worker.id]);
    assert_eq!(state_of(&store, worker.id).await, WorkerState::Offline);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let accept = tokio::spawn(async move {
        loop {
            if listener.accept().await.is_err() {
                break;
            }
        }
    });

    let report = prober.probe_all().await.unwrap();
    assert_eq!(report.online, vec![worker.id]);
    assert_eq!(state_of(&store, worker.id).await, WorkerState::Online);

    accept.abort();
}

#[tokio::test]
async fn test_disabled_workers_are_untouched() {
    let store = memory_store().await;
    let agent = FakeAgent::start().await;
    let disabled = add_worker(&store, "d", "delta", agent.port(), 1, WorkerState::Disabled).await;
    // Would be marked Offline if it were checked
    let unreachable =
        add_worker(&store, "e", "echo", closed_port(), 1, WorkerState::Disabled).await;
    let live = add_worker(&store, "l", "lima", agent.port(), 1, WorkerState::Offline).await;

    let report = prober(&store, FakeRpc::new(), socket_config())
        .probe_all()
        .await
        .unwrap();

    assert_eq!(report.skipped, vec![disabled.id, unreachable.id]);
    assert_eq!(report.online, vec![live.id]);
    assert!(report.offline.is_empty());
    assert_eq!(state_of(&store, disabled.id).await, WorkerState::Disabled);
    assert_eq!(state_of(&store, unreachable.id).await, WorkerState::Disabled);
    assert_eq!(state_of(&store, live.id).await, WorkerState::Online);
}

#[tokio::test]
async fn test_disabled_workers_are_not_pinged() {
    let store = memory_store().await;
    let disabled = add_worker(&store, "d", "delta", closed_port(), 1, WorkerState::Disabled).await;
    let enabled = add_worker(&store, "e", "echo", closed_port(), 1, WorkerState::Offline).await;

    let rpc = FakeRpc::new();
    let config = ProbeConfig {
        strategy: ProbeStrategy::Rpc,
        ..socket_config()
    };
    let report = prober(&store, rpc.clone(), config).probe_all().await.unwrap();

    assert_eq!(report.skipped, vec![disabled.id]);
    assert_eq!(rpc.calls(), vec![RpcCall::Ping { worker_id: enabled.id }]);
}

#[tokio::test]
async fn test_repeated_ticks_are_idempotent() {
    let store = memory_store().await;
    let agent = FakeAgent::start().await;
    let up = add_worker(&store, "u", "uniform", agent.port(), 1, WorkerState::Offline).await;
    let down = add_worker(&store, "x", "xray", closed_port(), 1, WorkerState::Online).await;
    let prober = prober(&store, FakeRpc::new(), socket_config());

    let first = prober.probe_all().await.unwrap();
    let second = prober.probe_all().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(state_of(&store, up.id).await, WorkerState::Online);
    assert_eq!(state_of(&store, down.id).await, WorkerState::Offline);
}

#[tokio::test]
async fn test_rpc_strategy_uses_ping() {
    let store = memory_store().await;
    // Ports are irrelevant: the scripted RPC decides reachability
    let alive = add_worker(&store, "a", "alpha", closed_port(), 1, WorkerState::Offline).await;
    let dead = add_worker(&store, "b", "bravo", closed_port(), 1, WorkerState::Online).await;

    let rpc = FakeRpc::new();
    rpc.mark_dead(dead.id);
    let config = ProbeConfig {
        strategy: ProbeStrategy::Rpc,
        ..socket_config()
    };

    let report = prober(&store, rpc.clone(), config).probe_all().await.unwrap();

    assert_eq!(report.online, vec![alive.id]);
    assert_eq!(report.offline, vec![dead.id]);
    let mut pinged: Vec<RpcCall> = rpc.calls();
    pinged.sort_by_key(|c| match c {
        RpcCall::Ping { worker_id } => *worker_id,
        _ => i64::MAX,
    });
    assert_eq!(
        pinged,
        vec![
            RpcCall::Ping { worker_id: alive.id },
            RpcCall::Ping { worker_id: dead.id }
        ]
    );
}

#[tokio::test]
async fn test_socket_strategy_makes_no_rpc_calls() {
    let store = memory_store().await;
    let agent = FakeAgent::start().await;
    add_worker(&store, "a", "alpha", agent.port(), 1, WorkerState::Offline).await;

    let rpc = FakeRpc::new();
    prober(&store, rpc.clone(), socket_config())
        .probe_all()
        .await
        .unwrap();

    assert!(rpc.calls().is_empty());
    assert!(agent.requests().is_empty());
}

#[tokio::test]
async fn test_non_positive_interval_disables_prober() {
    let store = memory_store().await;
    let worker = add_worker(&store, "c", "charlie", closed_port(), 1, WorkerState::Online).await;

    for interval_secs in [0, -5] {
        let config = ProbeConfig {
            interval_secs,
            ..socket_config()
        };
        // Returns without waiting for cancellation
        tokio::time::timeout(
            Duration::from_secs(1),
            prober(&store, FakeRpc::new(), config).run(CancellationToken::new()),
        )
        .await
        .unwrap();
    }

    assert_eq!(state_of(&store, worker.id).await, WorkerState::Online);
}

#[tokio::test]
async fn test_run_probes_until_cancelled() {
    let store = memory_store().await;
    let worker = add_worker(&store, "c", "charlie", closed_port(), 1, WorkerState::Online).await;
    let shutdown = CancellationToken::new();

    let task = tokio::spawn(prober(&store, FakeRpc::new(), socket_config()).run(shutdown.clone()));

    // The first tick fires immediately
    let mut state = WorkerState::Online;
    for _ in 0..20 {
        state = state_of(&store, worker.id).await;
        if state == WorkerState::Offline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(state, WorkerState::Offline);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
}
