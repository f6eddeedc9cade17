//! Tests for the process task handler

use crate::handler::{ExecutionOptions, HandlerFactory, HandlerStatus, ProcessHandlerFactory};
use crate::tests::support::make_claim;
use shared::api::Claim;
use std::collections::HashMap;
use std::time::Duration;
use tempfile::TempDir;

fn claim_with_command(task_id: &str, command: &[&str]) -> Claim {
    let mut claim = make_claim(task_id, 0);
    claim.task.payload.command = command.iter().map(|s| s.to_string()).collect();
    claim
}

fn factory(temp_dir: &TempDir) -> ProcessHandlerFactory {
    ProcessHandlerFactory::new(temp_dir.path().to_path_buf())
}

#[tokio::test]
async fn test_successful_command() {
    let temp_dir = TempDir::new().unwrap();
    let claim = claim_with_command("ok", &["true"]);
    let handler = factory(&temp_dir)
        .create(&claim, ExecutionOptions::default())
        .unwrap();

    assert!(handler.start().await.is_ok());
    assert_eq!(handler.status(), HandlerStatus::Succeeded);
    // The work directory was created for the run.
    assert!(temp_dir.path().join("ok-0").is_dir());
}

#[tokio::test]
async fn test_failing_command() {
    let temp_dir = TempDir::new().unwrap();
    let claim = claim_with_command("bad", &["false"]);
    let handler = factory(&temp_dir)
        .create(&claim, ExecutionOptions::default())
        .unwrap();

    let err = handler.start().await.unwrap_err();
    assert!(err.to_string().contains("exited"));
    assert_eq!(handler.status(), HandlerStatus::Failed);
}

#[tokio::test]
async fn test_empty_command_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let claim = make_claim("empty", 0);
    let handler = factory(&temp_dir)
        .create(&claim, ExecutionOptions::default())
        .unwrap();

    assert!(handler.start().await.is_err());
    assert_eq!(handler.status(), HandlerStatus::Failed);
}

#[tokio::test]
async fn test_cancel_kills_process() {
    let temp_dir = TempDir::new().unwrap();
    let claim = claim_with_command("slow", &["sleep", "30"]);
    let handler = factory(&temp_dir)
        .create(&claim, ExecutionOptions::default())
        .unwrap();

    let running = handler.clone();
    let join = tokio::spawn(async move { running.start().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    handler.cancel("canceled");

    let result = tokio::time::timeout(Duration::from_secs(5), join)
        .await
        .expect("cancel did not stop the task in time")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(handler.status(), HandlerStatus::Canceled);
}

#[tokio::test]
async fn test_abort_surfaces_as_error() {
    let temp_dir = TempDir::new().unwrap();
    let claim = claim_with_command("doomed", &["sleep", "30"]);
    let handler = factory(&temp_dir)
        .create(&claim, ExecutionOptions::default())
        .unwrap();

    let running = handler.clone();
    let join = tokio::spawn(async move { running.start().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    handler.abort("worker-shutdown").unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), join)
        .await
        .expect("abort did not stop the task in time")
        .unwrap();
    assert!(result.is_err());
    assert_eq!(handler.status(), HandlerStatus::Aborted);
}

#[tokio::test]
async fn test_max_run_time_enforced() {
    let temp_dir = TempDir::new().unwrap();
    let mut claim = claim_with_command("overdue", &["sleep", "30"]);
    claim.task.payload.max_run_time = Some(1);
    let handler = factory(&temp_dir)
        .create(&claim, ExecutionOptions::default())
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), handler.start())
        .await
        .expect("max run time was not enforced")
        .unwrap_err();
    assert!(err.to_string().contains("max run time"));
    assert_eq!(handler.status(), HandlerStatus::Failed);
}

#[tokio::test]
async fn test_devices_exported_to_environment() {
    let temp_dir = TempDir::new().unwrap();
    let claim = claim_with_command("env", &["sh", "-c", "test \"$DEVICE_KVM\" = kvm-0"]);
    let options = ExecutionOptions {
        devices: HashMap::from([("kvm".to_string(), "kvm-0".to_string())]),
    };
    let handler = factory(&temp_dir).create(&claim, options).unwrap();

    assert!(handler.start().await.is_ok());
}

#[tokio::test]
async fn test_payload_env_passed_through() {
    let temp_dir = TempDir::new().unwrap();
    let mut claim = claim_with_command("payload-env", &["sh", "-c", "test \"$GREETING\" = hello"]);
    claim
        .task
        .payload
        .env
        .insert("GREETING".to_string(), "hello".to_string());
    let handler = factory(&temp_dir)
        .create(&claim, ExecutionOptions::default())
        .unwrap();

    assert!(handler.start().await.is_ok());
}
