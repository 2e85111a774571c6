//! End-to-end scenarios driving the whole engine (§8) against
//! `FakeDockerClient` rather than a live daemon.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use batect_engine::docker::testing::{FakeDockerClient, ScriptedContainer};
use batect_engine::model::{Container, HealthCheckConfig, ImageSource, Task, TaskModel};
use batect_engine::{split_command_line, Engine, EngineConfig, TaskEvent};

fn container(name: &str, dependencies: &[&str]) -> Container {
    Container {
        name: name.to_owned(),
        image_source: ImageSource::Pull {
            reference: format!("{name}:latest"),
        },
        command: None,
        environment: BTreeMap::new(),
        working_dir: None,
        volume_mounts: Default::default(),
        port_mappings: Default::default(),
        health_check: HealthCheckConfig::default(),
        user_and_group: None,
        dependencies: dependencies.iter().map(|s| (*s).to_owned()).collect(),
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        worker_count: 4,
        interrupt_grace_period: Duration::from_millis(50),
        second_interrupt_grace_period: Duration::from_millis(50),
        health_poll_floor: Duration::from_millis(2),
        default_health_interval: Duration::from_millis(2),
        docker_host: None,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn single_container_with_no_dependencies_runs_to_completion() {
    let task = Task {
        name: "run".into(),
        main_container: "app".into(),
        command_override: None,
        environment_overrides: BTreeMap::new(),
    };
    let model = Arc::new(TaskModel::resolve(task, vec![container("app", &[])]).unwrap());

    let docker = FakeDockerClient::new();
    docker
        .script("app", ScriptedContainer::exits_with(0))
        .await;

    let engine = Engine::new(docker, fast_config());
    let outcome = engine.run(model).await.unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.cleanup_failures.is_empty());
    assert!(outcome
        .events
        .iter()
        .any(|e| matches!(e, TaskEvent::TaskNetworkCreated { .. })));
    assert!(outcome
        .events
        .iter()
        .any(|e| matches!(e, TaskEvent::TaskNetworkDeleted { .. })));
    assert!(outcome
        .events
        .iter()
        .any(|e| matches!(e, TaskEvent::ContainerRemoved { container, .. } if container == "app")));
}

#[tokio::test]
async fn main_container_never_starts_when_its_dependency_never_becomes_healthy() {
    let task = Task {
        name: "run".into(),
        main_container: "app".into(),
        command_override: None,
        environment_overrides: BTreeMap::new(),
    };
    let model = Arc::new(TaskModel::resolve(
        task,
        vec![container("app", &["db"]), container("db", &[])],
    ).unwrap());

    let docker = FakeDockerClient::new();
    docker.script("db", ScriptedContainer::never_healthy()).await;

    let engine = Engine::new(docker.clone(), fast_config());
    let outcome = engine.run(model).await.unwrap();

    assert_eq!(outcome.exit_code, 1);
    assert!(outcome
        .events
        .iter()
        .any(|e| matches!(e, TaskEvent::ContainerDidNotBecomeHealthy { container, .. } if container == "db")));

    let calls = docker.calls.lock().await;
    assert!(!calls.iter().any(|c| c.starts_with("run_attached(app")));
    assert!(calls.iter().any(|c| c.starts_with("stop_container(db")));
}

#[tokio::test]
async fn command_override_with_balanced_quoting_reaches_the_main_container() {
    let words = split_command_line(r#"sh -c "echo 'hello world'""#).unwrap();
    assert_eq!(words, vec!["sh", "-c", "echo 'hello world'"]);

    let task = Task {
        name: "run".into(),
        main_container: "app".into(),
        command_override: Some(r#"sh -c "echo 'hello world'""#.to_owned()),
        environment_overrides: BTreeMap::new(),
    };
    let model = Arc::new(TaskModel::resolve(task, vec![container("app", &[])]).unwrap());

    let docker = FakeDockerClient::new();
    docker.script("app", ScriptedContainer::exits_with(0)).await;

    let engine = Engine::new(docker, fast_config());
    let outcome = engine.run(model).await.unwrap();

    assert_eq!(outcome.exit_code, 0);
}

#[test]
fn command_override_with_unbalanced_quoting_is_rejected_before_any_docker_call() {
    let err = split_command_line(r#"sh -c "echo hi"#).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Command line `sh -c \"echo hi` is invalid: it contains an unbalanced double quote"
    );
}

#[tokio::test]
async fn dependency_chain_tears_down_dependent_before_dependency() {
    let task = Task {
        name: "run".into(),
        main_container: "app".into(),
        command_override: None,
        environment_overrides: BTreeMap::new(),
    };
    let model = Arc::new(TaskModel::resolve(
        task,
        vec![container("app", &["db"]), container("db", &[])],
    ).unwrap());

    let docker = FakeDockerClient::new();
    docker.script("app", ScriptedContainer::exits_with(0)).await;
    docker
        .script("db", ScriptedContainer::healthy_immediately())
        .await;

    let engine = Engine::new(docker.clone(), fast_config());
    let outcome = engine.run(model).await.unwrap();

    assert_eq!(outcome.exit_code, 0);

    let calls = docker.calls.lock().await;
    let app_stop = calls.iter().position(|c| c.starts_with("stop_container(app")).unwrap();
    let db_stop = calls.iter().position(|c| c.starts_with("stop_container(db")).unwrap();
    assert!(app_stop < db_stop, "app must stop before db: {calls:?}");
}

#[tokio::test]
async fn a_failing_dependency_never_lets_the_main_container_start() {
    let task = Task {
        name: "run".into(),
        main_container: "app".into(),
        command_override: None,
        environment_overrides: BTreeMap::new(),
    };
    let model = Arc::new(TaskModel::resolve(
        task,
        vec![container("app", &["db"]), container("db", &[])],
    ).unwrap());

    let docker = FakeDockerClient::new();
    docker
        .script(
            "db",
            ScriptedContainer {
                start_fails: Some("connection refused".to_owned()),
                ..Default::default()
            },
        )
        .await;

    let engine = Engine::new(docker.clone(), fast_config());
    let outcome = engine.run(model).await.unwrap();

    assert_eq!(outcome.exit_code, 1);
    assert!(outcome
        .events
        .iter()
        .any(|e| matches!(e, TaskEvent::ContainerStartFailed { container, .. } if container == "db")));

    let calls = docker.calls.lock().await;
    assert!(!calls.iter().any(|c| c.starts_with("run_attached(app")));
}
