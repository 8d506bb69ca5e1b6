//! Test: result delivery to status sinks

use crate::helpers::*;
use pipeline_engine::core::{state::PipelineStatus, trigger::Event};
use pipeline_engine::report::{InMemoryStatusSink, ResultReporter};
use std::sync::Arc;
use std::time::Duration;

fn reporter_with_board() -> (Arc<ResultReporter>, Arc<InMemoryStatusSink>) {
    let board = Arc::new(InMemoryStatusSink::new());
    let reporter = Arc::new(ResultReporter::new().with_sink(board.clone()));
    (reporter, board)
}

async fn wait_for_updates(board: &InMemoryStatusSink, count: usize) {
    for _ in 0..200 {
        if board.updates() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("status board saw {} updates, expected {}", board.updates(), count);
}

/// Every finished run reaches the status board
#[tokio::test]
async fn test_finished_run_is_published() {
    let (reporter, board) = reporter_with_board();
    let provisioner = ScriptedProvisioner::new().on("npm test", Behavior::Fail(1));
    let harness = Harness::with_reporter(provisioner, reporter);

    let result = harness.run(RELEASE, Event::push("refs/heads/main")).await;
    wait_for_updates(&board, 1).await;

    let published = board.get(result.execution_id).await.unwrap();
    assert_eq!(published.status, PipelineStatus::Failed);
    assert_eq!(&published, result.as_ref());
    assert_eq!(board.len().await, 1);
}

/// Publishing the same result again leaves the board untouched
#[tokio::test]
async fn test_republish_is_idempotent() {
    let (reporter, board) = reporter_with_board();
    let harness = Harness::with_reporter(ScriptedProvisioner::new(), reporter.clone());

    let result = harness.run(RELEASE, Event::push("refs/heads/main")).await;
    wait_for_updates(&board, 1).await;

    reporter.publish(result.clone()).await.unwrap();
    reporter.publish(result.clone()).await.unwrap();

    assert_eq!(board.updates(), 1);
    assert_eq!(board.len().await, 1);
}

/// Separate runs are reported separately
#[tokio::test]
async fn test_each_run_reported() {
    let (reporter, board) = reporter_with_board();
    let harness = Harness::with_reporter(ScriptedProvisioner::new(), reporter);

    let first = harness.run(RELEASE, Event::push("refs/heads/main")).await;
    let second = harness.run(RELEASE, Event::push("refs/heads/main")).await;
    wait_for_updates(&board, 2).await;

    assert_eq!(board.len().await, 2);
    assert!(board.get(first.execution_id).await.is_some());
    assert!(board.get(second.execution_id).await.is_some());
}

/// What the board stores is masked like the result itself
#[tokio::test]
async fn test_published_result_has_no_secret() {
    let (reporter, board) = reporter_with_board();
    let provisioner = ScriptedProvisioner::new().on("./push.sh", Behavior::EchoEnv);
    let harness = Harness::with_reporter(provisioner, reporter);

    let result = harness.run(RELEASE, Event::push("refs/heads/main")).await;
    wait_for_updates(&board, 1).await;

    let published = board.get(result.execution_id).await.unwrap();
    assert_secret_absent(&published, REGISTRY_TOKEN);
}
