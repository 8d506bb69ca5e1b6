//! Test: concurrency limits and isolation of failing job tasks

use crate::helpers::*;
use pipeline_engine::core::{
    settings::EngineSettings,
    state::{JobStatus, PipelineStatus},
    trigger::Event,
};
use std::time::Duration;
use tokio::time::Instant;

fn fan_out(jobs: usize) -> String {
    let mut yaml = String::from("name: fan-out\non: push\njobs:\n");
    for i in 0..jobs {
        yaml.push_str(&format!(
            "  shard-{i}:\n    runs-on: linux\n    steps:\n      - run: ./test-shard.sh {i}\n"
        ));
    }
    yaml
}

/// No more jobs hold an environment at once than the concurrency limit
#[tokio::test(start_paused = true)]
async fn test_concurrency_limit() {
    let settings = EngineSettings {
        concurrency: 2,
        ..EngineSettings::default()
    };
    let provisioner = ScriptedProvisioner::new().on(
        "./test-shard.sh",
        Behavior::Sleep(Duration::from_secs(10), 0),
    );
    let harness = Harness::with_settings(provisioner.clone(), settings);
    let start = Instant::now();

    let result = harness.run(&fan_out(6), Event::push("main")).await;

    assert_pipeline_status(&result, PipelineStatus::Succeeded);
    assert_eq!(provisioner.provisioned(), 6);
    assert_eq!(provisioner.released(), 6);
    assert_eq!(provisioner.max_active(), 2);
    assert!(start.elapsed() >= Duration::from_secs(30));
}

/// Independent jobs run side by side
#[tokio::test(start_paused = true)]
async fn test_independent_jobs_run_in_parallel() {
    let provisioner = ScriptedProvisioner::new().on(
        "./test-shard.sh",
        Behavior::Sleep(Duration::from_secs(10), 0),
    );
    let harness = Harness::new(provisioner.clone());
    let start = Instant::now();

    let result = harness.run(&fan_out(3), Event::push("main")).await;

    assert_pipeline_status(&result, PipelineStatus::Succeeded);
    assert_eq!(provisioner.max_active(), 3);
    assert!(start.elapsed() < Duration::from_secs(20));
}

/// A job whose task panics is recorded as failed; other jobs are unaffected
#[tokio::test]
async fn test_panicking_job_is_contained() {
    let yaml = r#"
name: flaky
on: push
jobs:
  boom:
    runs-on: linux
    steps:
      - run: ./explode.sh
  steady:
    runs-on: linux
    steps:
      - run: ./steady.sh
  after-boom:
    runs-on: linux
    needs: boom
    steps:
      - run: ./after.sh
"#;
    let provisioner = ScriptedProvisioner::new().on("./explode.sh", Behavior::Panic);
    let harness = Harness::new(provisioner.clone());

    let result = harness.run(yaml, Event::push("main")).await;

    assert_job_status(&result, "boom", JobStatus::Failed);
    assert!(job(&result, "boom")
        .reason
        .as_deref()
        .is_some_and(|r| r.starts_with("job task failed")));
    assert_job_status(&result, "steady", JobStatus::Succeeded);
    assert_job_status(&result, "after-boom", JobStatus::Skipped);
    assert_pipeline_status(&result, PipelineStatus::Failed);
    assert!(provisioner.commands_for("after-boom").is_empty());
}
