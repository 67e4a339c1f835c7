//! Real Docker integration tests for the spawner
//! Run with: cargo test --test docker_integration -- --ignored

use bollard::Docker;
use hubspawner_common::{EngineClient, EngineError, ObjectKind, SpawnerConfig};
use hubspawner_core::{
    require_docker, require_swarm, DockerEngine, HubSpawner, Reconciler, ResilientEngine,
    Spawner, SpawnerState, Variant,
};
use serial_test::serial;
use std::sync::Arc;

const IMAGE: &str = "alpine:latest";

fn config(prefix: &str) -> SpawnerConfig {
    SpawnerConfig {
        prefix: prefix.to_string(),
        image: IMAGE.to_string(),
        // a long-running process listening nowhere; readiness is the published port
        command: Some(vec!["sleep".to_string(), "300".to_string()]),
        remove: true,
        start_timeout_secs: 60,
        stop_grace_secs: 1,
        ..Default::default()
    }
}

fn engine() -> Arc<ResilientEngine<DockerEngine>> {
    let docker = Arc::new(Docker::connect_with_local_defaults().unwrap());
    Arc::new(ResilientEngine::new(
        DockerEngine::new(docker),
        Default::default(),
    ))
}

#[tokio::test]
#[ignore = "Requires Docker"]
#[serial]
async fn test_container_lifecycle() {
    let _ = tracing_subscriber::fmt::try_init();
    require_docker!();
    let engine = engine();
    let s = Spawner::for_variant(
        Variant::Container,
        "it-user",
        "",
        Arc::new(config("hubspawner-it")),
        engine.clone(),
        Arc::new(Reconciler::new()),
    )
    .unwrap();

    let endpoint = s.start().await.unwrap();
    assert_eq!(endpoint.ip, "127.0.0.1");
    assert!(endpoint.port > 0);
    assert_eq!(s.poll().await.unwrap(), None);

    // a second start is idempotent
    let again = s.start().await.unwrap();
    assert_eq!(endpoint, again);

    s.stop(true).await.unwrap();
    assert_eq!(s.state(), SpawnerState::Stopped);
    let err = engine
        .inspect(ObjectKind::Container, "hubspawner-it-it-2duser")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
#[ignore = "Requires Docker"]
#[serial]
async fn test_rebind_after_restart() {
    let _ = tracing_subscriber::fmt::try_init();
    require_docker!();
    let engine = engine();
    let config = Arc::new(SpawnerConfig {
        remove: false,
        ..config("hubspawner-rebind")
    });
    let reconciler = Arc::new(Reconciler::new());

    let state = {
        let s = Spawner::for_variant(
            Variant::Container,
            "rebind",
            "",
            config.clone(),
            engine.clone(),
            reconciler.clone(),
        )
        .unwrap();
        s.start().await.unwrap();
        s.get_state()
    };

    let s = Spawner::for_variant(
        Variant::Container,
        "rebind",
        "",
        config,
        engine.clone(),
        reconciler,
    )
    .unwrap();
    s.load_state(state.clone());
    assert_eq!(s.poll().await.unwrap(), None);
    assert_eq!(s.get_state(), state);

    s.stop(true).await.unwrap();
    let status = s.poll().await.unwrap().unwrap();
    assert_eq!(s.state(), SpawnerState::Stopped);
    assert!(status.message.contains("ExitCode"));

    if let Some(id) = state.object_id {
        engine.remove(ObjectKind::Container, &id, true).await.unwrap();
    }
}

#[tokio::test]
#[ignore = "Requires Docker"]
#[serial]
async fn test_missing_image_is_not_found() {
    let _ = tracing_subscriber::fmt::try_init();
    require_docker!();
    let engine = engine();
    let s = Spawner::for_variant(
        Variant::Container,
        "noimage",
        "",
        Arc::new(SpawnerConfig {
            image: "hubspawner.invalid/does-not-exist:never".to_string(),
            ..config("hubspawner-it")
        }),
        engine,
        Arc::new(Reconciler::new()),
    )
    .unwrap();
    assert!(s.start().await.is_err());
    assert!(matches!(s.state(), SpawnerState::Error(_)));
}

#[tokio::test]
#[ignore = "Requires Docker swarm"]
#[serial]
async fn test_swarm_service_lifecycle() {
    let _ = tracing_subscriber::fmt::try_init();
    require_swarm!();
    let engine = engine();
    let network = bollard::network::CreateNetworkOptions {
        name: "hubspawner-it-overlay",
        driver: "overlay",
        attachable: true,
        ..Default::default()
    };
    // already exists from an earlier run
    let _ = engine.inner().client().create_network(network).await;
    let s = Spawner::for_variant(
        Variant::Swarm,
        "swarm-user",
        "",
        Arc::new(SpawnerConfig {
            network_name: "hubspawner-it-overlay".to_string(),
            ..config("hubspawner-it")
        }),
        engine,
        Arc::new(Reconciler::new()),
    )
    .unwrap();

    let endpoint = s.start().await.unwrap();
    assert_eq!(endpoint.port, 8888);
    s.stop(false).await.unwrap();
    assert_eq!(s.state(), SpawnerState::Stopped);
}
