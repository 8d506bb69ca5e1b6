use anyhow::{Context, Result};
use pipeline_engine::cli::commands::{HistoryCommand, ListCommand, MatchCommand, RunCommand, ValidateCommand};
use pipeline_engine::cli::output::*;
use pipeline_engine::cli::{Cli, Command};
use pipeline_engine::core::{
    pipeline::PipelineDefinition,
    settings::EngineSettings,
    state::PipelineStatus,
    trigger::should_run,
};
use pipeline_engine::execution::{ExecutionEngine, ExecutionEvent, TriggerOutcome};
use pipeline_engine::report::{LogSink, ResultReporter};
use pipeline_engine::vault::{CredentialVault, EnvSecretStore, SecretStore, StaticSecretStore};
use pipeline_engine::LocalProvisioner;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    let settings = EngineSettings::load(cli.config.as_deref()).context("Failed to load engine settings")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd, &cli, settings).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::Match(cmd) => match_event(cmd)?,
        Command::History(cmd) => show_history(cmd, &settings).await?,
        Command::List(cmd) => list_pipelines(cmd, &settings).await?,
    }

    Ok(())
}

fn load_definition(file: &std::path::Path) -> PipelineDefinition {
    match PipelineDefinition::from_file(file) {
        Ok(definition) => definition,
        Err(e) => {
            eprintln!("{} Invalid pipeline definition {}:", CROSS, file.display());
            eprintln!("  {}", style(e).red());
            std::process::exit(2);
        }
    }
}

async fn run_pipeline(cmd: &RunCommand, cli: &Cli, mut settings: EngineSettings) -> Result<()> {
    let definition = Arc::new(load_definition(&cmd.file));

    if let Some(concurrency) = cmd.concurrency {
        settings.concurrency = concurrency.max(1);
    }
    if let Some(source_dir) = &cmd.source_dir {
        settings.environment.source_dir = Some(source_dir.clone());
    }

    let store: Arc<dyn SecretStore> = if cmd.secret.is_empty() {
        Arc::new(EnvSecretStore::new(settings.vault.env_prefix.clone()))
    } else {
        Arc::new(StaticSecretStore::from_pairs(
            cmd.secret.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ))
    };
    let vault = Arc::new(CredentialVault::new(store, settings.vault.policy.clone()));
    let provisioner = Arc::new(LocalProvisioner::new(&settings.environment));
    let engine = Arc::new(ExecutionEngine::new(provisioner, vault, &settings));

    // Set up event handler for console output
    let progress = (!cmd.json).then(|| create_progress_bar(definition.jobs.len()));
    let stream = cli.stream;
    if let Some(progress) = progress.clone() {
        engine.add_event_handler(move |event| {
            if matches!(
                event,
                ExecutionEvent::JobFinished { .. } | ExecutionEvent::JobSkipped { .. }
            ) {
                progress.inc(1);
            }
            if let ExecutionEvent::JobStarted { job, .. } = &event {
                progress.set_message(job.clone());
            }
            if let Some(line) = format_execution_event(&event, stream) {
                progress.println(line);
            }
        });
    }

    // Ctrl-C cancels the run; the engine still reports what finished
    let canceller = engine.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling run");
            canceller.cancel_all();
        }
    });

    let event = cmd.event.to_event();
    let outcome = engine.trigger(&event, definition.clone()).await;
    interrupt.abort();
    if let Some(progress) = &progress {
        progress.finish_and_clear();
    }

    let result = match outcome {
        TriggerOutcome::NotTriggered(ref_context) => {
            if cmd.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "triggered": false,
                        "ref_context": ref_context,
                    }))?
                );
            } else {
                println!(
                    "{} {} is not triggered by {} on {}",
                    INFO,
                    style(&definition.name).bold(),
                    event.kind,
                    style(&ref_context.git_ref).cyan()
                );
            }
            return Ok(());
        }
        TriggerOutcome::Completed(result) => result,
    };

    let mut reporter = ResultReporter::new().with_sink(Arc::new(LogSink));
    if !cmd.no_history {
        reporter = with_history(reporter, &settings).await;
    }
    if let Err(e) = reporter.publish(result.clone()).await {
        warn!("Result delivery task failed: {}", e);
    }

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(result.as_ref())?);
    } else {
        println!("\n{}", format_pipeline_result(&result, cli.verbose));
        if !cmd.no_history {
            println!(
                "\n{} Run saved to history (ID: {})",
                INFO,
                style(result.execution_id).dim()
            );
        }
    }

    match result.status {
        PipelineStatus::Succeeded | PipelineStatus::Skipped => Ok(()),
        PipelineStatus::Failed | PipelineStatus::Cancelled => std::process::exit(1),
    }
}

#[cfg(feature = "sqlite")]
async fn with_history(reporter: ResultReporter, settings: &EngineSettings) -> ResultReporter {
    use pipeline_engine::report::SqliteStatusStore;

    match SqliteStatusStore::open(&settings.history_path()).await {
        Ok(store) => reporter.with_sink(Arc::new(store)),
        Err(e) => {
            warn!("Run history unavailable: {:#}", e);
            reporter
        }
    }
}

#[cfg(not(feature = "sqlite"))]
async fn with_history(reporter: ResultReporter, _settings: &EngineSettings) -> ResultReporter {
    reporter
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    let definition = load_definition(&cmd.file);
    let secrets: Vec<&str> = definition.secret_names().into_iter().collect();

    if cmd.json {
        let jobs: Vec<_> = definition
            .jobs
            .iter()
            .map(|job| {
                serde_json::json!({
                    "id": job.id,
                    "name": job.name,
                    "runs_on": job.runs_on,
                    "needs": job.needs,
                    "steps": job.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
                })
            })
            .collect();
        let data = serde_json::json!({
            "name": definition.name,
            "events": definition.triggers.event_kinds().map(|k| k.as_str()).collect::<Vec<_>>(),
            "execution_order": definition.execution_order(),
            "jobs": jobs,
            "secrets": secrets,
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!("{} Pipeline definition is valid!", CHECK);
    println!("  Name: {}", style(&definition.name).bold());
    println!(
        "  Events: {}",
        style(
            definition
                .triggers
                .event_kinds()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
        .cyan()
    );
    println!("  Jobs: {}", style(definition.jobs.len()).cyan());
    for job_id in definition.execution_order() {
        if let Some(job) = definition.job(job_id) {
            let needs = if job.needs.is_empty() {
                String::new()
            } else {
                format!(" (needs {})", job.needs.join(", "))
            };
            println!(
                "    {} {} steps{}",
                style(&job.id).bold(),
                job.steps.len(),
                style(needs).dim()
            );
        }
    }
    if !secrets.is_empty() {
        println!("  Secrets: {}", style(secrets.join(", ")).yellow());
    }
    Ok(())
}

fn match_event(cmd: &MatchCommand) -> Result<()> {
    let definition = load_definition(&cmd.file);
    let event = cmd.event.to_event();
    let decision = should_run(&event, &definition);

    if cmd.json {
        let data = serde_json::json!({
            "run": decision.run,
            "ref_context": decision.ref_context,
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else if decision.run {
        println!(
            "{} {} runs for {} on {} (branch {})",
            CHECK,
            style(&definition.name).bold(),
            event.kind,
            style(&decision.ref_context.git_ref).cyan(),
            decision.ref_context.branch
        );
    } else {
        println!(
            "{} {} does not run for {} on {}",
            CROSS,
            style(&definition.name).bold(),
            event.kind,
            style(&decision.ref_context.git_ref).cyan()
        );
    }
    Ok(())
}

#[cfg(feature = "sqlite")]
async fn show_history(cmd: &HistoryCommand, settings: &EngineSettings) -> Result<()> {
    use pipeline_engine::report::SqliteStatusStore;

    let store = SqliteStatusStore::open(&settings.history_path()).await?;

    if let Some(id) = &cmd.execution_id {
        let execution_id = uuid::Uuid::parse_str(id).context("Invalid execution ID format")?;
        match store.load(execution_id).await? {
            Some(result) if cmd.json => println!("{}", serde_json::to_string_pretty(&result)?),
            Some(result) => println!("{}", format_pipeline_result(&result, cmd.details)),
            None => println!("{} Run not found", WARN),
        }
        return Ok(());
    }

    let runs = store.list(cmd.pipeline.as_deref(), cmd.limit).await?;
    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }
    println!("{} Run history (showing latest {}):", INFO, cmd.limit);
    for summary in &runs {
        println!("  {}", format_run_summary(summary));
    }
    Ok(())
}

#[cfg(feature = "sqlite")]
async fn list_pipelines(cmd: &ListCommand, settings: &EngineSettings) -> Result<()> {
    use pipeline_engine::report::SqliteStatusStore;

    let store = SqliteStatusStore::open(&settings.history_path()).await?;
    let pipelines = store.pipelines().await?;

    let mut rows = Vec::with_capacity(pipelines.len());
    for name in &pipelines {
        let runs = if cmd.with_counts || cmd.json {
            store.list(Some(name), usize::MAX >> 1).await?
        } else {
            Vec::new()
        };
        rows.push((name, runs));
    }

    if cmd.json {
        let data: Vec<_> = rows
            .iter()
            .map(|(name, runs)| serde_json::json!({ "name": name, "runs": runs.len() }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "pipelines": data }))?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("{} No pipelines found in history", INFO);
        return Ok(());
    }
    println!("{} Pipelines in history:", INFO);
    for (name, runs) in &rows {
        if cmd.with_counts {
            let succeeded = runs.iter().filter(|r| r.status == PipelineStatus::Succeeded).count();
            let failed = runs.iter().filter(|r| r.status == PipelineStatus::Failed).count();
            println!(
                "  {} ({} runs: {} succeeded, {} failed)",
                style(name).bold(),
                style(runs.len()).cyan(),
                style(succeeded).green(),
                style(failed).red()
            );
        } else {
            println!("  {}", style(name).bold());
        }
    }
    Ok(())
}

#[cfg(not(feature = "sqlite"))]
async fn show_history(_cmd: &HistoryCommand, _settings: &EngineSettings) -> Result<()> {
    tracing::error!("Run history requires the `sqlite` feature");
    std::process::exit(1);
}

#[cfg(not(feature = "sqlite"))]
async fn list_pipelines(_cmd: &ListCommand, _settings: &EngineSettings) -> Result<()> {
    tracing::error!("Run history requires the `sqlite` feature");
    std::process::exit(1);
}
