//! Spawner lifecycle against the in-memory engine: idempotence, recovery after
//! a hub restart, concurrent starts and replacement of diverged objects.

use futures::StreamExt;
use hubspawner_common::{
    EngineError, ExitStatus, ObjectKind, PersistedState, SpawnerConfig, UserOptions,
};
use hubspawner_core::testing::{MemoryEngine, Op};
use hubspawner_core::{HubSpawner, Reconciler, ResilientEngine, Spawner, SpawnerState, Variant};
use std::sync::Arc;
use std::time::Duration;

fn config() -> SpawnerConfig {
    SpawnerConfig {
        prefix: "hub-it".to_string(),
        image: "notebook:1".to_string(),
        allowed_images: vec!["notebook:1".to_string(), "notebook:2".to_string()],
        start_timeout_secs: 5,
        poll_interval_ms: 20,
        ..Default::default()
    }
}

fn spawner(
    engine: &Arc<MemoryEngine>,
    config: SpawnerConfig,
    reconciler: &Arc<Reconciler>,
) -> Spawner {
    Spawner::for_variant(
        Variant::Container,
        "alice",
        "",
        Arc::new(config),
        engine.clone(),
        reconciler.clone(),
    )
    .unwrap()
}

#[tokio::test]
async fn repeated_start_keeps_one_object() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());
    let s = spawner(&engine, config(), &reconciler);

    let first = s.start().await.unwrap();
    let second = s.start().await.unwrap();
    let third = s.start().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(second, third);
    assert_eq!(engine.object_count(), 1);
    assert_eq!(engine.calls(Op::Create), 1);
}

#[tokio::test]
async fn restart_after_stop_reuses_object() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());
    let s = spawner(&engine, config(), &reconciler);

    s.start().await.unwrap();
    let id = s.get_state().object_id;
    s.stop(false).await.unwrap();
    s.start().await.unwrap();

    assert_eq!(s.get_state().object_id, id);
    assert_eq!(engine.calls(Op::Create), 1);
    assert_eq!(s.state(), SpawnerState::Running);
}

#[tokio::test]
async fn hub_restart_rebinds_without_creating() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());

    let persisted = {
        let s = spawner(&engine, config(), &reconciler);
        s.start().await.unwrap();
        serde_json::to_string(&s.get_state()).unwrap()
    };

    // a fresh process with only the persisted blob
    let s = spawner(&engine, config(), &reconciler);
    s.load_state(serde_json::from_str::<PersistedState>(&persisted).unwrap());
    assert_eq!(s.state(), SpawnerState::Unconfigured);

    assert_eq!(s.poll().await.unwrap(), None);
    assert_eq!(s.state(), SpawnerState::Running);
    assert!(s.endpoint().is_some());
    assert_eq!(engine.calls(Op::Create), 1);
}

#[tokio::test]
async fn lost_state_is_recovered_by_name() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());
    let original = spawner(&engine, config(), &reconciler);
    original.start().await.unwrap();
    let id = original.get_state().object_id;

    let s = spawner(&engine, config(), &reconciler);
    s.load_state(PersistedState::default());
    assert_eq!(s.poll().await.unwrap(), None);
    assert_eq!(s.get_state().object_id, id);
    assert_eq!(engine.calls(Op::Create), 1);
}

#[tokio::test]
async fn lost_state_is_recovered_by_labels_after_prefix_change() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());
    let original = spawner(&engine, config(), &reconciler);
    original.start().await.unwrap();
    let id = original.get_state().object_id;

    let renamed = SpawnerConfig {
        prefix: "hub-renamed".to_string(),
        ..config()
    };
    let s = spawner(&engine, renamed, &reconciler);
    assert_eq!(s.poll().await.unwrap(), None);
    assert_eq!(s.get_state().object_id, id);
    assert_eq!(s.get_state().object_name.as_deref(), Some("hub-it-alice"));
}

#[tokio::test]
async fn start_after_label_recovery_reuses_the_recovered_object() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());
    let original = spawner(&engine, config(), &reconciler);
    original.start().await.unwrap();
    let id = original.get_state().object_id;

    let renamed = SpawnerConfig {
        prefix: "hub-renamed".to_string(),
        ..config()
    };
    let s = spawner(&engine, renamed, &reconciler);
    assert_eq!(s.poll().await.unwrap(), None);
    s.start().await.unwrap();

    assert_eq!(engine.calls(Op::Create), 1);
    assert_eq!(engine.object_count(), 1);
    assert_eq!(s.get_state().object_id, id);
    assert!(engine.peek("hub-renamed-alice").is_none());
}

#[tokio::test]
async fn start_from_persisted_name_restarts_the_stopped_object() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());
    let original = spawner(&engine, config(), &reconciler);
    original.start().await.unwrap();
    original.stop(false).await.unwrap();
    let persisted = original.get_state();

    let renamed = SpawnerConfig {
        prefix: "hub-renamed".to_string(),
        ..config()
    };
    let s = spawner(&engine, renamed, &reconciler);
    s.load_state(persisted.clone());
    s.start().await.unwrap();

    assert_eq!(engine.calls(Op::Create), 1);
    assert_eq!(engine.object_count(), 1);
    assert_eq!(s.get_state(), persisted);
    assert!(engine.peek("hub-it-alice").unwrap().running);
}

#[tokio::test]
async fn hub_restart_rebinds_exited_object_as_stopped() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());
    let persisted = {
        let s = spawner(&engine, config(), &reconciler);
        s.start().await.unwrap();
        s.get_state()
    };
    engine.exit("hub-it-alice", 3);

    let s = spawner(&engine, config(), &reconciler);
    let status = s.rebind(persisted.clone()).await.unwrap().unwrap();
    assert_eq!(status.code, 3);
    assert_eq!(s.state(), SpawnerState::Stopped);
    assert_eq!(s.endpoint(), None);
    // the exited object is kept for the next start
    assert_eq!(s.get_state(), persisted);
    assert_eq!(engine.calls(Op::Create), 1);
}

#[tokio::test]
async fn cancelled_start_waiting_on_another_leaves_no_lock_behind() {
    let engine = Arc::new(MemoryEngine::new());
    engine.add_image("notebook:1");
    engine.set_latency(Duration::from_millis(50));
    let reconciler = Arc::new(Reconciler::new());

    let first = {
        let s = spawner(&engine, config(), &reconciler);
        tokio::spawn(async move { s.start().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // the hub gives up on a duplicate request while it waits for the first
    let second = spawner(&engine, config(), &reconciler);
    let gave_up = tokio::time::timeout(Duration::from_millis(30), second.start()).await;
    assert!(gave_up.is_err());

    first.await.unwrap().unwrap();
    assert!(reconciler.flights().is_empty());

    second.start().await.unwrap();
    assert_eq!(engine.calls(Op::Create), 1);
    assert_eq!(engine.object_count(), 1);
    assert!(reconciler.flights().is_empty());
}

#[tokio::test]
async fn poll_without_any_object_reports_vanished() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());
    let s = spawner(&engine, config(), &reconciler);
    let status = s.poll().await.unwrap().unwrap();
    assert_eq!(status, ExitStatus::vanished("hub-it-alice"));
    assert_eq!(status.code, 0);
    assert_eq!(engine.calls(Op::Create), 0);
}

#[tokio::test]
async fn concurrent_starts_create_once() {
    let engine = Arc::new(MemoryEngine::new());
    engine.set_latency(Duration::from_millis(2));
    let reconciler = Arc::new(Reconciler::new());

    // separate spawner instances for the same user, as after a duplicated hub request
    let mut handles = Vec::new();
    for _ in 0..8 {
        let s = spawner(&engine, config(), &reconciler);
        handles.push(tokio::spawn(async move { s.start().await }));
    }
    let mut endpoints = Vec::new();
    for handle in handles {
        endpoints.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(engine.calls(Op::Create), 1);
    assert_eq!(engine.object_count(), 1);
    assert!(endpoints.windows(2).all(|w| w[0] == w[1]));
    assert!(reconciler.flights().is_empty());
}

#[tokio::test]
async fn image_change_recreates_stopped_object() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());
    let s = spawner(&engine, config(), &reconciler);

    s.start().await.unwrap();
    let old_id = s.get_state().object_id.unwrap();
    s.stop(false).await.unwrap();

    s.set_user_options(UserOptions {
        image: Some("notebook:2".to_string()),
        ..Default::default()
    });
    s.start().await.unwrap();

    let new_id = s.get_state().object_id.unwrap();
    assert_ne!(old_id, new_id);
    assert_eq!(engine.object_count(), 1);
    assert_eq!(engine.calls(Op::Create), 2);
    assert!(engine.peek(&old_id).is_none());
    assert_eq!(
        engine.peek(&new_id).unwrap().image.as_deref(),
        Some("notebook:2")
    );
}

#[tokio::test]
async fn image_change_leaves_running_object_alone() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());
    let s = spawner(&engine, config(), &reconciler);
    s.start().await.unwrap();
    let id = s.get_state().object_id;

    s.set_user_options(UserOptions {
        image: Some("notebook:2".to_string()),
        ..Default::default()
    });
    s.start().await.unwrap();
    assert_eq!(s.get_state().object_id, id);
    assert_eq!(engine.calls(Op::Create), 1);
}

#[tokio::test]
async fn resource_change_updates_in_place() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());
    let s = spawner(&engine, config(), &reconciler);
    s.start().await.unwrap();
    s.stop(false).await.unwrap();
    let id = s.get_state().object_id.unwrap();

    let bigger = SpawnerConfig {
        mem_limit: Some("2G".to_string()),
        ..config()
    };
    let s = spawner(&engine, bigger, &reconciler);
    s.start().await.unwrap();

    assert_eq!(s.get_state().object_id.as_deref(), Some(id.as_str()));
    assert_eq!(engine.calls(Op::Update), 1);
    assert_eq!(engine.calls(Op::Create), 1);
    assert_eq!(
        engine.peek(&id).unwrap().resources.memory_bytes,
        Some(2 * 1024 * 1024 * 1024)
    );
}

#[tokio::test]
async fn resource_change_recreates_under_strict_policy() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());
    let s = spawner(&engine, config(), &reconciler);
    s.start().await.unwrap();
    s.stop(false).await.unwrap();

    let strict = SpawnerConfig {
        cpu_limit: Some(2.0),
        recreate_on_resource_change: true,
        ..config()
    };
    let s = spawner(&engine, strict, &reconciler);
    s.start().await.unwrap();
    assert_eq!(engine.calls(Op::Update), 0);
    assert_eq!(engine.calls(Op::Create), 2);
    assert_eq!(engine.object_count(), 1);
}

#[tokio::test]
async fn end_to_end_start_poll_stop_poll() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());
    let s = spawner(&engine, config(), &reconciler);

    let endpoint = s.start().await.unwrap();
    assert_eq!(endpoint.ip, "127.0.0.1");
    assert_eq!(s.poll().await.unwrap(), None);

    s.stop(false).await.unwrap();
    let status = s.poll().await.unwrap().expect("stopped server reports status");
    assert_eq!(status.code, 0);
    assert_eq!(s.state(), SpawnerState::Stopped);
    assert_eq!(s.endpoint(), None);
}

#[tokio::test]
async fn transient_engine_failures_are_absorbed() {
    let engine = Arc::new(ResilientEngine::new(MemoryEngine::new(), Default::default()));
    let memory = engine.inner();
    memory.fail_next(Op::Create, EngineError::Unavailable("connection reset".into()));
    memory.fail_next(Op::Start, EngineError::Unavailable("connection reset".into()));

    let s = Spawner::for_variant(
        Variant::Container,
        "bob",
        "lab",
        Arc::new(config()),
        engine.clone(),
        Arc::new(Reconciler::new()),
    )
    .unwrap();
    s.start().await.unwrap();
    assert_eq!(memory.calls(Op::Create), 2);
    assert_eq!(memory.object_count(), 1);
    assert!(memory.peek("hub-it-bob--lab").unwrap().running);
}

#[tokio::test]
async fn missing_image_fails_start_without_objects() {
    let engine = Arc::new(MemoryEngine::new());
    engine.mark_unpullable("notebook:1");
    let reconciler = Arc::new(Reconciler::new());
    let s = spawner(&engine, config(), &reconciler);

    let err = s.start().await.unwrap_err();
    assert_eq!(err.kind(), hubspawner_common::ErrorKind::NotFound);
    assert_eq!(engine.object_count(), 0);

    // re-entrant start after the image shows up
    engine.add_image("notebook:1");
    s.start().await.unwrap();
    assert_eq!(s.state(), SpawnerState::Running);
}

#[tokio::test]
async fn stop_after_vanish_counts_as_stopped() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());
    let s = spawner(&engine, config(), &reconciler);
    s.start().await.unwrap();
    engine.vanish("hub-it-alice");

    s.stop(false).await.unwrap();
    assert_eq!(s.state(), SpawnerState::Stopped);
    assert!(s.get_state().is_empty());
}

#[tokio::test]
async fn swarm_variant_lifecycle() {
    let engine = Arc::new(MemoryEngine::new());
    let config = SpawnerConfig {
        network_name: "hub-overlay".to_string(),
        ..config()
    };
    let s = Spawner::for_variant(
        Variant::Swarm,
        "carol",
        "",
        Arc::new(config),
        engine.clone(),
        Arc::new(Reconciler::new()),
    )
    .unwrap();

    let endpoint = s.start().await.unwrap();
    assert_eq!(endpoint.port, 8888);
    assert!(endpoint.ip.starts_with("172.17.0."));
    assert_eq!(s.get_state().kind, Some(ObjectKind::Service));
    // nodes pull images themselves
    assert_eq!(engine.calls(Op::Pull), 0);

    s.stop(false).await.unwrap();
    let obs = engine.peek("hub-it-carol").unwrap();
    assert_eq!(obs.status, "scaled-down");
    assert_eq!(s.poll().await.unwrap().unwrap().code, 0);
}

#[tokio::test]
async fn swarm_variant_runs_on_the_default_network() {
    let engine = Arc::new(MemoryEngine::new());
    let s = Spawner::for_variant(
        Variant::Swarm,
        "dave",
        "",
        Arc::new(config()),
        engine.clone(),
        Arc::new(Reconciler::new()),
    )
    .unwrap();

    let endpoint = s.start().await.unwrap();
    assert_eq!(endpoint.port, 8888);
    assert_eq!(engine.calls(Op::Create), 1);
}

#[tokio::test]
async fn logs_stream_from_current_object() {
    let engine = Arc::new(MemoryEngine::new());
    let reconciler = Arc::new(Reconciler::new());
    let s = spawner(&engine, config(), &reconciler);
    s.start().await.unwrap();
    engine.push_log("hub-it-alice", b"listening on 8888\n");

    let chunks: Vec<Vec<u8>> = s
        .logs()
        .await
        .unwrap()
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;
    let text = String::from_utf8(chunks.concat()).unwrap();
    assert!(text.contains("starting hub-it-alice"));
    assert!(text.contains("listening on 8888"));
}
