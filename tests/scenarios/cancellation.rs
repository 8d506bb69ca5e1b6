//! Test: cancelling runs and superseding runs on the same ref

use crate::helpers::*;
use pipeline_engine::core::{
    error::StepError,
    settings::EngineSettings,
    state::{JobStatus, PipelineStatus, StepStatus},
    trigger::Event,
};
use pipeline_engine::execution::{ExecutionEvent, TriggerOutcome, CANCELLED_REASON};
use std::time::Duration;

const SHIP: &str = r#"
name: ship
on: push
jobs:
  build:
    runs-on: linux
    steps:
      - id: compile
        run: make compile
      - id: package
        run: make package
      - id: cleanup
        if: always()
        run: make clean
  deploy:
    runs-on: linux
    needs: build
    steps:
      - id: rollout
        run: ./rollout.sh
"#;

fn spawn_trigger(harness: &Harness, yaml: &str) -> tokio::task::JoinHandle<TriggerOutcome> {
    let engine = harness.engine.clone();
    let definition = definition(yaml);
    tokio::spawn(async move { engine.trigger(&Event::push("refs/heads/main"), definition).await })
}

/// Cancelling mid-step stops the step, skips the rest and releases the environment
#[tokio::test]
async fn test_cancel_running_pipeline() {
    let provisioner =
        ScriptedProvisioner::new().on("make compile", Behavior::Sleep(Duration::from_secs(60), 0));
    let harness = Harness::new(provisioner.clone());

    let handle = spawn_trigger(&harness, SHIP);
    provisioner.wait_for_start("make compile").await;
    assert_eq!(harness.engine.active_runs().len(), 1);
    assert!(harness.engine.cancel("ship", "refs/heads/main"));

    let result = handle.await.unwrap().result().cloned().unwrap();

    let compile = step(&result, "build", "compile");
    assert_eq!(compile.status, StepStatus::Cancelled);
    assert_eq!(compile.error, Some(StepError::Cancelled));
    assert_step_status(&result, "build", "package", StepStatus::Skipped);
    assert_step_status(&result, "build", "cleanup", StepStatus::Skipped);
    assert_job_status(&result, "build", JobStatus::Cancelled);

    assert_job_status(&result, "deploy", JobStatus::Skipped);
    assert_eq!(job(&result, "deploy").reason.as_deref(), Some(CANCELLED_REASON));
    assert_pipeline_status(&result, PipelineStatus::Cancelled);

    assert_eq!(provisioner.commands(), vec!["make compile"]);
    assert!(provisioner.timeline().contains(&"dropped:build:make compile".to_string()));
    assert_eq!(provisioner.provisioned(), 1);
    assert_eq!(provisioner.released(), 1);
    assert!(harness.engine.active_runs().is_empty());
}

/// A newer push to the same ref cancels the older run
#[tokio::test]
async fn test_newer_run_supersedes_older() {
    let provisioner =
        ScriptedProvisioner::new().on("make compile", Behavior::Sleep(Duration::from_millis(300), 0));
    let harness = Harness::new(provisioner.clone());

    let first = spawn_trigger(&harness, SHIP);
    provisioner.wait_for_start("make compile").await;
    let second = harness.run(SHIP, Event::push("refs/heads/main")).await;
    let first = first.await.unwrap().result().cloned().unwrap();

    assert_pipeline_status(&first, PipelineStatus::Cancelled);
    assert_pipeline_status(&second, PipelineStatus::Succeeded);
    assert_ne!(first.execution_id, second.execution_id);

    let superseded: Vec<_> = harness
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ExecutionEvent::RunSuperseded {
                execution_id,
                superseded_by,
            } => Some((execution_id, superseded_by)),
            _ => None,
        })
        .collect();
    assert_eq!(superseded, vec![(first.execution_id, second.execution_id)]);
    assert!(harness.engine.active_runs().is_empty());
}

/// With superseding disabled both runs complete
#[tokio::test]
async fn test_superseding_disabled() {
    let settings = EngineSettings {
        cancel_superseded: false,
        ..EngineSettings::default()
    };
    let provisioner =
        ScriptedProvisioner::new().on("make compile", Behavior::Sleep(Duration::from_millis(200), 0));
    let harness = Harness::with_settings(provisioner.clone(), settings);

    let first = spawn_trigger(&harness, SHIP);
    provisioner.wait_for_start("make compile").await;
    let second = harness.run(SHIP, Event::push("refs/heads/main")).await;
    let first = first.await.unwrap().result().cloned().unwrap();

    assert_pipeline_status(&first, PipelineStatus::Succeeded);
    assert_pipeline_status(&second, PipelineStatus::Succeeded);
    assert!(!harness
        .events()
        .iter()
        .any(|e| matches!(e, ExecutionEvent::RunSuperseded { .. })));
}

/// Cancelling when nothing is in flight does nothing
#[tokio::test]
async fn test_cancel_unknown_run() {
    let harness = Harness::new(ScriptedProvisioner::new());

    assert!(!harness.engine.cancel("ship", "refs/heads/main"));

    let result = harness.run(SHIP, Event::push("refs/heads/main")).await;
    assert_pipeline_status(&result, PipelineStatus::Succeeded);
    assert!(!harness.engine.cancel("ship", "refs/heads/main"));
}
