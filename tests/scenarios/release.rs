//! Test: build-and-publish release pipeline

use crate::helpers::*;
use pipeline_engine::core::{
    error::StepError,
    state::{JobStatus, PipelineStatus, StepStatus},
    trigger::{Event, EventKind},
};
use pipeline_engine::environment::OutputStream;
use pipeline_engine::execution::{ExecutionEvent, TriggerOutcome};

fn any_branch_release() -> String {
    RELEASE.replace("branches: [main]", "branches: ['**']")
}

/// Compile fails on main: build fails, publish never runs
#[tokio::test]
async fn test_compile_failure_skips_publish() {
    let provisioner = ScriptedProvisioner::new().on("npm run build", Behavior::Fail(2));
    let harness = Harness::new(provisioner.clone());

    let result = harness.run(RELEASE, Event::push("refs/heads/main")).await;

    assert_job_status(&result, "build", JobStatus::Failed);
    assert_job_status(&result, "publish", JobStatus::Skipped);
    assert_pipeline_status(&result, PipelineStatus::Failed);

    assert_step_status(&result, "build", "install-deps", StepStatus::Succeeded);
    assert_step_status(&result, "build", "compile", StepStatus::Failed);
    assert_step_status(&result, "build", "test", StepStatus::Skipped);
    assert_eq!(
        step(&result, "build", "compile").error,
        Some(StepError::Execution { exit_code: Some(2) })
    );
    assert_step_status(&result, "publish", "push-artifact", StepStatus::Skipped);

    assert_eq!(provisioner.commands(), vec!["npm ci", "npm run build"]);
    assert!(provisioner.commands_for("publish").is_empty());
    assert_eq!(provisioner.provisioned(), 1);
    assert_eq!(provisioner.released(), 1);
}

/// Push to a branch outside the trigger rules runs nothing
#[tokio::test]
async fn test_feature_branch_not_triggered() {
    let provisioner = ScriptedProvisioner::new();
    let harness = Harness::new(provisioner.clone());

    let outcome = harness.trigger(RELEASE, Event::push("refs/heads/feature/x")).await;

    match outcome {
        TriggerOutcome::NotTriggered(ctx) => assert_eq!(ctx.branch, "feature/x"),
        TriggerOutcome::Completed(result) => panic!("unexpected run: {:?}", result.status),
    }
    assert_eq!(provisioner.provisioned(), 0);
    assert!(provisioner.commands().is_empty());
    assert!(harness.events().is_empty());
}

/// The vault refuses REGISTRY_TOKEN on an unprotected branch
#[tokio::test]
async fn test_access_denied_on_unprotected_branch() {
    let provisioner = ScriptedProvisioner::new();
    let harness = Harness::new(provisioner.clone());

    let result = harness
        .run(&any_branch_release(), Event::push("refs/heads/feature/x"))
        .await;

    assert_job_status(&result, "build", JobStatus::Succeeded);
    assert_job_status(&result, "publish", JobStatus::Failed);
    assert_pipeline_status(&result, PipelineStatus::Failed);
    assert_step_status(&result, "publish", "push-artifact", StepStatus::Failed);
    match &step(&result, "publish", "push-artifact").error {
        Some(StepError::AccessDenied { secret, .. }) => assert_eq!(secret, "REGISTRY_TOKEN"),
        other => panic!("expected access denied, got {:?}", other),
    }

    // The step never reached the environment
    assert!(provisioner.commands_for("publish").is_empty());
    assert_eq!(provisioner.released(), provisioner.provisioned());
}

/// On main the token reaches only the declaring step, via its environment
#[tokio::test]
async fn test_release_injects_secret_into_declaring_step_only() {
    let provisioner = ScriptedProvisioner::new();
    let harness = Harness::new(provisioner.clone());

    let result = harness.run(RELEASE, Event::push("refs/heads/main")).await;
    assert_pipeline_status(&result, PipelineStatus::Succeeded);

    let execs = provisioner.execs();
    let push = execs.iter().find(|e| e.job == "publish").unwrap();
    assert_eq!(push.command, "./push.sh --token \"${REGISTRY_TOKEN}\"");
    assert_eq!(push.env.get("REGISTRY_TOKEN").map(String::as_str), Some(REGISTRY_TOKEN));

    for exec in execs.iter().filter(|e| e.job == "build") {
        assert!(!exec.env.contains_key("REGISTRY_TOKEN"));
        assert!(exec.env.values().all(|v| v != REGISTRY_TOKEN));
    }
    assert_secret_absent(&result, REGISTRY_TOKEN);
}

/// A step echoing its environment never leaks the value into results or events
#[tokio::test]
async fn test_secret_masked_in_output_and_events() {
    let provisioner = ScriptedProvisioner::new().on("./push.sh", Behavior::EchoEnv);
    let harness = Harness::new(provisioner);

    let result = harness.run(RELEASE, Event::push("refs/heads/main")).await;

    let push = step(&result, "publish", "push-artifact");
    assert_eq!(push.status, StepStatus::Succeeded);
    assert!(push.output.contains("REGISTRY_TOKEN=***"), "output: {}", push.output);
    assert_secret_absent(&result, REGISTRY_TOKEN);

    let lines: Vec<String> = harness
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ExecutionEvent::StepOutput { stream: OutputStream::Stdout, line, .. } => Some(line),
            _ => None,
        })
        .collect();
    assert!(lines.iter().any(|l| l == "REGISTRY_TOKEN=***"));
    assert!(lines.iter().all(|l| !l.contains(REGISTRY_TOKEN)));
}

/// Pull requests match their target branch but never get protected secrets
#[tokio::test]
async fn test_pull_request_into_main() {
    let yaml = RELEASE.replace("  push:\n", "  pull_request:\n");
    let provisioner = ScriptedProvisioner::new();
    let harness = Harness::new(provisioner.clone());

    let result = harness.run(&yaml, Event::pull_request("main", "feature/x")).await;

    assert_eq!(result.ref_context.event, EventKind::PullRequest);
    assert_eq!(result.ref_context.branch, "main");
    assert_job_status(&result, "build", JobStatus::Succeeded);
    assert_job_status(&result, "publish", JobStatus::Failed);
    assert!(matches!(
        step(&result, "publish", "push-artifact").error,
        Some(StepError::AccessDenied { .. })
    ));
}

/// A denied secret on a continue-on-error step is tolerated like any other failure
#[tokio::test]
async fn test_access_denied_with_continue_on_error() {
    let yaml = any_branch_release().replace(
        "        secrets: [REGISTRY_TOKEN]\n",
        "        secrets: [REGISTRY_TOKEN]\n        continue-on-error: true\n      - id: announce\n        run: ./announce.sh\n",
    );
    let provisioner = ScriptedProvisioner::new();
    let harness = Harness::new(provisioner.clone());

    let result = harness.run(&yaml, Event::push("refs/heads/feature/x")).await;

    let push = step(&result, "publish", "push-artifact");
    assert_eq!(push.status, StepStatus::Failed);
    assert!(matches!(push.error, Some(StepError::AccessDenied { .. })));
    assert!(push.continue_on_error);

    assert_step_status(&result, "publish", "announce", StepStatus::Succeeded);
    assert_job_status(&result, "publish", JobStatus::Succeeded);
    assert_pipeline_status(&result, PipelineStatus::Succeeded);
    assert_eq!(provisioner.commands_for("publish"), vec!["./announce.sh"]);
}

/// A tag named like a protected branch is not a protected branch
#[tokio::test]
async fn test_tag_named_main_gets_no_secret() {
    let yaml = RELEASE.replace("branches: [main]", "tags: ['**']");
    let provisioner = ScriptedProvisioner::new();
    let harness = Harness::new(provisioner.clone());

    let result = harness.run(&yaml, Event::push("refs/tags/main")).await;

    assert_job_status(&result, "build", JobStatus::Succeeded);
    assert_job_status(&result, "publish", JobStatus::Failed);
    assert!(matches!(
        step(&result, "publish", "push-artifact").error,
        Some(StepError::AccessDenied { .. })
    ));
    assert!(provisioner.commands_for("publish").is_empty());
}
