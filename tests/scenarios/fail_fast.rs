//! Test: step ordering and fail-fast behavior inside a job

use crate::helpers::*;
use pipeline_engine::core::{
    state::{JobStatus, PipelineStatus, StepStatus},
    trigger::Event,
};

const CHECKS: &str = r#"
name: checks
on: push
jobs:
  lint:
    runs-on: linux
    steps:
      - id: fmt
        run: cargo fmt --check
      - id: clippy
        run: cargo clippy
      - id: audit
        run: cargo audit
      - id: report
        if: failure()
        run: ./report-failure.sh
      - id: cleanup
        if: always()
        run: ./cleanup.sh
      - id: notify
        if: success()
        run: ./notify.sh
"#;

/// Steps run strictly one after another, each finishing before the next starts
#[tokio::test]
async fn test_steps_run_in_order() {
    let provisioner = ScriptedProvisioner::new();
    let harness = Harness::new(provisioner.clone());

    let result = harness.run(CHECKS, Event::push("main")).await;

    assert_pipeline_status(&result, PipelineStatus::Succeeded);
    assert_eq!(
        provisioner.timeline(),
        vec![
            "start:lint:cargo fmt --check",
            "finish:lint:cargo fmt --check",
            "start:lint:cargo clippy",
            "finish:lint:cargo clippy",
            "start:lint:cargo audit",
            "finish:lint:cargo audit",
            "start:lint:./cleanup.sh",
            "finish:lint:./cleanup.sh",
            "start:lint:./notify.sh",
            "finish:lint:./notify.sh",
        ]
    );
    assert_step_status(&result, "lint", "report", StepStatus::Skipped);
    assert!(step(&result, "lint", "report").started_at.is_none());
}

/// The first failure skips every later step that has no status function
#[tokio::test]
async fn test_first_failure_skips_remaining_steps() {
    let provisioner = ScriptedProvisioner::new().on("cargo clippy", Behavior::Fail(101));
    let harness = Harness::new(provisioner.clone());

    let result = harness.run(CHECKS, Event::push("main")).await;

    assert_job_status(&result, "lint", JobStatus::Failed);
    assert_pipeline_status(&result, PipelineStatus::Failed);
    assert_step_status(&result, "lint", "fmt", StepStatus::Succeeded);
    assert_step_status(&result, "lint", "clippy", StepStatus::Failed);
    assert_step_status(&result, "lint", "audit", StepStatus::Skipped);
    assert_step_status(&result, "lint", "report", StepStatus::Succeeded);
    assert_step_status(&result, "lint", "cleanup", StepStatus::Succeeded);
    assert_step_status(&result, "lint", "notify", StepStatus::Skipped);

    assert_eq!(
        provisioner.commands(),
        vec!["cargo fmt --check", "cargo clippy", "./report-failure.sh", "./cleanup.sh"]
    );
    assert_eq!(step(&result, "lint", "clippy").exit_code, Some(101));
}

/// A tolerated failure is recorded but the job keeps going and succeeds
#[tokio::test]
async fn test_continue_on_error() {
    let yaml = CHECKS.replace(
        "        run: cargo clippy\n",
        "        run: cargo clippy\n        continue-on-error: true\n",
    );
    let provisioner = ScriptedProvisioner::new().on("cargo clippy", Behavior::Fail(1));
    let harness = Harness::new(provisioner.clone());

    let result = harness.run(&yaml, Event::push("main")).await;

    let clippy = step(&result, "lint", "clippy");
    assert_eq!(clippy.status, StepStatus::Failed);
    assert!(clippy.continue_on_error);

    assert_step_status(&result, "lint", "audit", StepStatus::Succeeded);
    assert_step_status(&result, "lint", "report", StepStatus::Skipped);
    assert_step_status(&result, "lint", "notify", StepStatus::Succeeded);
    assert_job_status(&result, "lint", JobStatus::Succeeded);
    assert_pipeline_status(&result, PipelineStatus::Succeeded);
}

/// `continue-on-error` on a step that succeeds is not flagged
#[tokio::test]
async fn test_continue_on_error_flag_only_set_on_failure() {
    let yaml = CHECKS.replace(
        "        run: cargo fmt --check\n",
        "        run: cargo fmt --check\n        continue-on-error: true\n",
    );
    let harness = Harness::new(ScriptedProvisioner::new());

    let result = harness.run(&yaml, Event::push("main")).await;

    assert!(!step(&result, "lint", "fmt").continue_on_error);
    assert_pipeline_status(&result, PipelineStatus::Succeeded);
}

/// Outputs set by one step are visible to later steps of the same job
#[tokio::test]
async fn test_step_outputs_flow_to_later_steps() {
    let yaml = r#"
name: version
on: push
jobs:
  tag:
    runs-on: linux
    outputs:
      version: ${{ steps.read.outputs.version }}
    steps:
      - id: read
        run: ./read-version.sh
      - id: tag
        run: git tag v${{ steps.read.outputs.version }}
      - id: check
        if: steps.read.outputs.version == '1.4.2'
        run: ./check.sh
      - id: never
        if: steps.read.outputs.version == '0.0.0'
        run: ./never.sh
"#;
    let provisioner = ScriptedProvisioner::new().on(
        "./read-version.sh",
        Behavior::Succeed(vec![
            "reading Cargo.toml".to_string(),
            "::set-output name=version::1.4.1".to_string(),
            "::set-output name=version::1.4.2".to_string(),
        ]),
    );
    let harness = Harness::new(provisioner.clone());

    let result = harness.run(yaml, Event::push("main")).await;

    assert_pipeline_status(&result, PipelineStatus::Succeeded);
    assert_eq!(
        step(&result, "tag", "read").outputs.get("version").map(String::as_str),
        Some("1.4.2")
    );
    assert_eq!(
        provisioner.commands(),
        vec!["./read-version.sh", "git tag v1.4.2", "./check.sh"]
    );
    assert_step_status(&result, "tag", "never", StepStatus::Skipped);
    assert_eq!(
        job(&result, "tag").outputs.get("version").map(String::as_str),
        Some("1.4.2")
    );
}
