//! CommandExecutor against real child processes.

#![cfg(unix)]

use std::time::Duration;

use searchq::executor::{CommandExecutor, Executor};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn sh(script: &str) -> CommandExecutor {
    CommandExecutor::new("sh").arg("-c").arg(script)
}

#[tokio::test]
async fn payload_in_result_out() {
    let payload = json!({"query": "site:docs.rs tokio", "pages": 2});
    let result = sh("cat")
        .execute(&payload, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result, payload);
}

#[tokio::test]
async fn non_zero_exit_carries_stderr() {
    let err = sh("echo 'rate limited' >&2; exit 3")
        .execute(&json!({}), CancellationToken::new())
        .await
        .unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("status 3"), "{msg}");
    assert!(msg.contains("rate limited"), "{msg}");
}

#[tokio::test]
async fn non_json_output_is_an_error() {
    let result = sh("echo not-json")
        .execute(&json!({}), CancellationToken::new())
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn cancellation_stops_the_child() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        sh("sleep 30").execute(&json!({}), cancel),
    )
    .await
    .expect("executor returned promptly")
    .unwrap_err();
    assert!(err.to_string().contains("cancelled"));
}

#[tokio::test]
async fn missing_program_is_an_error() {
    let result = CommandExecutor::new("/nonexistent/searchq-executor")
        .execute(&json!({}), CancellationToken::new())
        .await;
    assert!(result.is_err());
}
