//! Test: job dependencies, skip cascades and data passed between jobs

use crate::helpers::*;
use pipeline_engine::core::{
    state::{JobStatus, PipelineStatus, StepStatus},
    trigger::Event,
};
use pipeline_engine::execution::ExecutionEvent;

const CHAIN: &str = r#"
name: chain
on: push
jobs:
  a:
    runs-on: linux
    steps:
      - run: step-a
  b:
    runs-on: linux
    needs: a
    steps:
      - run: step-b
  c:
    runs-on: linux
    needs: b
    steps:
      - run: step-c
  d:
    runs-on: linux
    steps:
      - run: step-d
"#;

/// A failure skips every transitive dependent; independent jobs still run
#[tokio::test]
async fn test_failure_cascades_to_dependents() {
    let provisioner = ScriptedProvisioner::new().on("step-a", Behavior::Fail(1));
    let harness = Harness::new(provisioner.clone());

    let result = harness.run(CHAIN, Event::push("main")).await;

    assert_job_status(&result, "a", JobStatus::Failed);
    assert_job_status(&result, "b", JobStatus::Skipped);
    assert_job_status(&result, "c", JobStatus::Skipped);
    assert_job_status(&result, "d", JobStatus::Succeeded);
    assert_pipeline_status(&result, PipelineStatus::Failed);

    assert_eq!(job(&result, "b").reason.as_deref(), Some("dependency `a` failure"));
    assert_eq!(job(&result, "c").reason.as_deref(), Some("dependency `b` skipped"));
    assert_eq!(job(&result, "c").steps[0].status, StepStatus::Skipped);

    let mut commands = provisioner.commands();
    commands.sort();
    assert_eq!(commands, vec!["step-a", "step-d"]);
    assert_eq!(provisioner.provisioned(), 2);

    let skipped: Vec<String> = harness
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ExecutionEvent::JobSkipped { job, .. } => Some(job),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, vec!["b", "c"]);
}

/// Results list jobs in declaration order whatever order they finished in
#[tokio::test]
async fn test_results_keep_declaration_order() {
    let harness = Harness::new(ScriptedProvisioner::new());

    let result = harness.run(CHAIN, Event::push("main")).await;

    let ids: Vec<&str> = result.jobs.iter().map(|j| j.job_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c", "d"]);
    assert_pipeline_status(&result, PipelineStatus::Succeeded);
}

/// A dependent only starts after its dependency finished
#[tokio::test]
async fn test_dependent_starts_after_dependency() {
    let provisioner = ScriptedProvisioner::new();
    let harness = Harness::new(provisioner.clone());

    harness.run(CHAIN, Event::push("main")).await;

    let timeline = provisioner.timeline();
    let position = |entry: &str| {
        timeline
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{} missing from {:?}", entry, timeline))
    };
    assert!(position("finish:a:step-a") < position("start:b:step-b"));
    assert!(position("finish:b:step-b") < position("start:c:step-c"));
}

/// Job outputs and results are readable through `needs`
#[tokio::test]
async fn test_needs_outputs_and_result() {
    let yaml = r#"
name: deploy
on: push
jobs:
  build:
    runs-on: linux
    outputs:
      image: registry.local/app:${{ steps.meta.outputs.tag }}
    steps:
      - id: meta
        run: ./meta.sh
  deploy:
    runs-on: linux
    needs: [build]
    if: needs.build.result == 'success'
    steps:
      - id: rollout
        run: kubectl set image app=${{ needs.build.outputs.image }}
"#;
    let provisioner = ScriptedProvisioner::new().on(
        "./meta.sh",
        Behavior::Succeed(vec!["::set-output name=tag::9c1f2e".to_string()]),
    );
    let harness = Harness::new(provisioner.clone());

    let result = harness.run(yaml, Event::push("main")).await;

    assert_pipeline_status(&result, PipelineStatus::Succeeded);
    assert_eq!(
        job(&result, "build").outputs.get("image").map(String::as_str),
        Some("registry.local/app:9c1f2e")
    );
    assert_eq!(
        provisioner.commands_for("deploy"),
        vec!["kubectl set image app=registry.local/app:9c1f2e"]
    );
}

/// A job whose own condition is false is skipped, and the run reports Skipped
#[tokio::test]
async fn test_job_condition_false() {
    let yaml = r#"
name: tags-only
on: push
jobs:
  release:
    runs-on: linux
    if: github.ref_type == 'tag'
    steps:
      - run: ./release.sh
"#;
    let provisioner = ScriptedProvisioner::new();
    let harness = Harness::new(provisioner.clone());

    let result = harness.run(yaml, Event::push("refs/heads/main")).await;

    assert_job_status(&result, "release", JobStatus::Skipped);
    assert!(job(&result, "release")
        .reason
        .as_deref()
        .is_some_and(|r| r.starts_with("condition")));
    assert_pipeline_status(&result, PipelineStatus::Skipped);
    assert_eq!(provisioner.provisioned(), 0);

    let result = harness.run(yaml, Event::push("refs/tags/v2.0.0")).await;
    assert_job_status(&result, "release", JobStatus::Succeeded);
}

/// An environment that cannot be provisioned fails the job and skips its dependents
#[tokio::test]
async fn test_provision_failure() {
    let yaml = r#"
name: gpu
on: push
jobs:
  train:
    runs-on: unavailable
    steps:
      - run: ./train.sh
  evaluate:
    runs-on: linux
    needs: train
    steps:
      - run: ./evaluate.sh
"#;
    let provisioner = ScriptedProvisioner::new();
    let harness = Harness::new(provisioner.clone());

    let result = harness.run(yaml, Event::push("main")).await;

    assert_job_status(&result, "train", JobStatus::Failed);
    assert!(job(&result, "train")
        .reason
        .as_deref()
        .is_some_and(|r| r.contains("no environment available")));
    assert_eq!(job(&result, "train").steps[0].status, StepStatus::Skipped);
    assert_job_status(&result, "evaluate", JobStatus::Skipped);
    assert_pipeline_status(&result, PipelineStatus::Failed);
    assert!(provisioner.commands().is_empty());
}

/// Step env overrides job env, which overrides pipeline env
#[tokio::test]
async fn test_env_layering() {
    let yaml = r#"
name: env
on: push
env:
  REGION: eu-west-1
  STAGE: dev
  LEVEL: pipeline
jobs:
  show:
    runs-on: linux
    env:
      STAGE: staging
      LEVEL: job
    steps:
      - run: printenv
        env:
          LEVEL: step
      - run: printenv again
"#;
    let provisioner = ScriptedProvisioner::new().on("printenv", Behavior::EchoEnv);
    let harness = Harness::new(provisioner.clone());

    harness.run(yaml, Event::push("main")).await;

    let execs = provisioner.execs();
    let first = &execs[0].env;
    assert_eq!(first.get("REGION").map(String::as_str), Some("eu-west-1"));
    assert_eq!(first.get("STAGE").map(String::as_str), Some("staging"));
    assert_eq!(first.get("LEVEL").map(String::as_str), Some("step"));

    let second = &execs[1].env;
    assert_eq!(second.get("LEVEL").map(String::as_str), Some("job"));
}
