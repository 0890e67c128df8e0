//! End-to-end tests against a real helper program.
//!
//! The helper is a small shell script written into a temp directory, so
//! these only run on unix.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use excon_protocol::{CommandInfo, ContainerId, ExecutorInfo, HelperCommand, Resources};
use excon_runtime::{
    Containerizer, ContainerizerError, ExconConfig, ExitStatus, LaunchSpec, RecoveryState,
    RunState, Sandbox,
};

/// Records each sub-command and its request in the sandbox, then behaves
/// according to marker files placed there by the test.
const HELPER: &str = r#"#!/bin/sh
cat > "request-$1.json"
echo "$1 $EXCON_CONTAINER_ID $EXCON_HELPER_COMMAND" >> calls.log
case "$1" in
  launch)
    [ -f fail-launch ] && exit 1
    # Leaves a child behind that still holds the helper's stdout.
    [ -f background-launch ] && sleep 20 &
    exit 0
    ;;
  usage)
    echo '{"timestamp": 1.5, "mem_rss_bytes": 1024}'
    ;;
  wait)
    if [ -f exit-now ]; then
      echo '{"killed": false, "message": "Executor exited", "status": 0}'
      exit 0
    fi
    sleep 30
    echo '{"killed": false, "message": "slept", "status": 0}'
    ;;
  update|destroy)
    exit 0
    ;;
  *)
    exit 64
    ;;
esac
"#;

fn install_helper(dir: &Path) -> PathBuf {
    let path = dir.join("helper.sh");
    std::fs::write(&path, HELPER).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn launch_spec(id: &str, sandbox: &Path) -> LaunchSpec {
    LaunchSpec {
        container_id: id.into(),
        task_info: None,
        executor_info: ExecutorInfo {
            executor_id: "exec".into(),
            framework_id: "fw".into(),
            name: None,
            command: CommandInfo {
                value: "/bin/true".into(),
                ..Default::default()
            },
            resources: Resources::new().with("cpus", 1.0).with("mem", 128.0),
        },
        sandbox: Sandbox::new(sandbox, None),
        agent_id: "agent".into(),
        agent_pid: "agent@localhost".into(),
        checkpoint: false,
    }
}

fn calls(sandbox: &Path) -> Vec<String> {
    std::fs::read_to_string(sandbox.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn launch_usage_destroy() {
    let tmp = tempfile::tempdir().unwrap();
    let helper = install_helper(tmp.path());
    let sandbox = tmp.path().join("c1");
    std::fs::create_dir(&sandbox).unwrap();

    let containerizer = Containerizer::from_config(&ExconConfig::for_helper(helper));
    let id = ContainerId::new("c1");

    containerizer.launch(launch_spec("c1", &sandbox)).await.unwrap();

    let request: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(sandbox.join("request-launch.json")).unwrap())
            .unwrap();
    assert_eq!(request["container_id"], "c1");
    assert_eq!(request["executor_info"]["resources"]["cpus"], 1.0);

    let stats = containerizer.usage(&id).await.unwrap();
    assert_eq!(stats.timestamp, 1.5);
    assert_eq!(stats.mem_rss_bytes, Some(1024));

    containerizer
        .update(&id, Resources::new().with("cpus", 2.0))
        .await
        .unwrap();

    let waiter = containerizer.wait(&id);
    containerizer.destroy(&id).await.unwrap();

    // The blocked `wait` helper is killed rather than left to finish.
    let termination = tokio::time::timeout(Duration::from_secs(10), waiter)
        .await
        .expect("destroy should abort the wait helper")
        .unwrap();
    assert!(termination.killed);
    assert_eq!(termination.message, "Container destroyed");

    let calls = calls(&sandbox);
    assert_eq!(calls.first().map(String::as_str), Some("launch c1 launch"));
    assert!(calls.iter().any(|call| call == "destroy c1 destroy"));
    assert!(containerizer.containers().await.unwrap().is_empty());
}

#[tokio::test]
async fn wait_reports_executor_exit() {
    let tmp = tempfile::tempdir().unwrap();
    let helper = install_helper(tmp.path());
    let sandbox = tmp.path().join("c1");
    std::fs::create_dir(&sandbox).unwrap();
    std::fs::write(sandbox.join("exit-now"), "").unwrap();

    let containerizer = Containerizer::from_config(&ExconConfig::for_helper(helper));
    let id = ContainerId::new("c1");

    let launch = containerizer.launch(launch_spec("c1", &sandbox));
    let waiter = containerizer.wait(&id);
    launch.await.unwrap();

    let termination = waiter.await.unwrap();
    assert!(!termination.killed);
    assert_eq!(termination.status, Some(0));
    assert_eq!(termination.message, "Executor exited");
}

#[tokio::test]
async fn launch_with_backgrounded_child_resolves_on_exit() {
    let tmp = tempfile::tempdir().unwrap();
    let helper = install_helper(tmp.path());
    let sandbox = tmp.path().join("c1");
    std::fs::create_dir(&sandbox).unwrap();
    std::fs::write(sandbox.join("background-launch"), "").unwrap();

    let containerizer = Containerizer::from_config(&ExconConfig::for_helper(helper));
    let id = ContainerId::new("c1");

    tokio::time::timeout(
        Duration::from_secs(5),
        containerizer.launch(launch_spec("c1", &sandbox)),
    )
    .await
    .expect("launch should resolve when the helper exits")
    .unwrap();
    assert!(containerizer.containers().await.unwrap().contains(&id));

    let waiter = containerizer.wait(&id);
    containerizer.destroy(&id).await.unwrap();
    let termination = tokio::time::timeout(Duration::from_secs(10), waiter)
        .await
        .expect("destroy should abort the wait helper")
        .unwrap();
    assert!(termination.killed);
}

#[tokio::test]
async fn failed_launch_is_reported_and_forgotten() {
    let tmp = tempfile::tempdir().unwrap();
    let helper = install_helper(tmp.path());
    let sandbox = tmp.path().join("c1");
    std::fs::create_dir(&sandbox).unwrap();
    std::fs::write(sandbox.join("fail-launch"), "").unwrap();

    let containerizer = Containerizer::from_config(&ExconConfig::for_helper(helper));
    let err = containerizer
        .launch(launch_spec("c1", &sandbox))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ContainerizerError::HelperExitFailure {
            command: HelperCommand::Launch,
            status: ExitStatus::Exited(1),
        }
    );
    assert!(containerizer.containers().await.unwrap().is_empty());
    assert_eq!(calls(&sandbox), vec!["launch c1 launch".to_string()]);
}

#[tokio::test]
async fn recovered_container_can_be_destroyed() {
    let tmp = tempfile::tempdir().unwrap();
    let helper = install_helper(tmp.path());
    let sandbox = tmp.path().join("r1");
    std::fs::create_dir(&sandbox).unwrap();

    let state_path = tmp.path().join("recovery.json");
    RecoveryState {
        runs: vec![RunState {
            container_id: "r1".into(),
            directory: sandbox.clone(),
            user: None,
            completed: false,
        }],
    }
    .save(&state_path)
    .unwrap();

    let containerizer = Containerizer::from_config(&ExconConfig::for_helper(helper));
    let id = ContainerId::new("r1");
    containerizer
        .recover(RecoveryState::load(&state_path).unwrap())
        .await
        .unwrap();
    assert!(containerizer.containers().await.unwrap().contains(&id));

    let waiter = containerizer.wait(&id);
    containerizer.destroy(&id).await.unwrap();
    let termination = tokio::time::timeout(Duration::from_secs(10), waiter)
        .await
        .expect("destroy should abort the wait helper")
        .unwrap();
    assert!(termination.killed);
}
