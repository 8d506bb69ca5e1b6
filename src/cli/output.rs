//! CLI output formatting

use crate::{
    core::state::{JobResult, JobStatus, PipelineResult, PipelineStatus, StepResult, StepStatus},
    environment::OutputStream,
    execution::ExecutionEvent,
    report::RunSummary,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

/// Create a job progress bar
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    if let Ok(bar_style) =
        ProgressStyle::default_bar().template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} jobs {msg}")
    {
        progress.set_style(bar_style.progress_chars("#>-"));
    }
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

pub fn format_pipeline_status(status: PipelineStatus) -> String {
    match status {
        PipelineStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        PipelineStatus::Failed => style("FAILED").red().to_string(),
        PipelineStatus::Skipped => style("SKIPPED").dim().to_string(),
        PipelineStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

pub fn format_job_status(status: JobStatus) -> String {
    match status {
        JobStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        JobStatus::Failed => style("FAILED").red().to_string(),
        JobStatus::Skipped => style("SKIPPED").dim().to_string(),
        JobStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

pub fn format_step_status(status: StepStatus) -> String {
    match status {
        StepStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        StepStatus::Failed => style("FAILED").red().to_string(),
        StepStatus::Skipped => style("SKIPPED").dim().to_string(),
        StepStatus::TimedOut => style("TIMED OUT").red().to_string(),
        StepStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format an execution event for display; `None` for events not shown
pub fn format_execution_event(event: &ExecutionEvent, show_output: bool) -> Option<String> {
    let line = match event {
        ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline,
            git_ref,
        } => format!(
            "{} Starting pipeline {} on {} ({})",
            ROCKET,
            style(pipeline).bold(),
            style(git_ref).cyan(),
            style(short_id(execution_id)).dim()
        ),
        ExecutionEvent::RunSuperseded {
            execution_id,
            superseded_by,
        } => format!(
            "{} Run {} superseded by {}",
            WARN,
            style(short_id(execution_id)).dim(),
            style(short_id(superseded_by)).dim()
        ),
        ExecutionEvent::JobStarted { job, environment, .. } => format!(
            "{} {} {}",
            SPINNER,
            style(job).cyan().bold(),
            style(format!("({})", environment)).dim()
        ),
        ExecutionEvent::JobSkipped { job, reason, .. } => {
            format!("{} {} skipped: {}", SKIP, style(job).dim(), style(reason).dim())
        }
        ExecutionEvent::JobFinished { job, status, .. } => {
            let icon = if *status == JobStatus::Succeeded { CHECK } else { CROSS };
            format!("{} {} {}", icon, style(job).bold(), format_job_status(*status))
        }
        ExecutionEvent::StepStarted { job, name, .. } => {
            format!("   {} {}", style(format!("{} ›", job)).dim(), name)
        }
        ExecutionEvent::StepOutput { stream, line, .. } => {
            if !show_output {
                return None;
            }
            match stream {
                OutputStream::Stdout => format!("     {}", style(line).dim()),
                OutputStream::Stderr => format!("     {}", style(line).yellow()),
            }
        }
        ExecutionEvent::StepFinished {
            job, status, error, ..
        } => match (status, error) {
            (StepStatus::Succeeded, _) | (StepStatus::Skipped, _) => return None,
            (_, Some(error)) => format!(
                "   {} {} {}",
                style(format!("{} ›", job)).dim(),
                format_step_status(*status),
                style(error).red()
            ),
            (_, None) => format!("   {} {}", style(format!("{} ›", job)).dim(), format_step_status(*status)),
        },
        ExecutionEvent::PipelineCompleted {
            execution_id,
            pipeline,
            status,
        } => format!(
            "{} Pipeline {} ({}) {}",
            INFO,
            style(pipeline).bold(),
            style(short_id(execution_id)).dim(),
            format_pipeline_status(*status)
        ),
    };
    Some(line)
}

fn format_step(step: &StepResult) -> String {
    let duration = step
        .duration_ms()
        .map(|ms| format!(" {}", style(format_duration(Duration::from_millis(ms.max(0) as u64))).dim()))
        .unwrap_or_default();
    let mut line = format!("    {} {}{}", format_step_status(step.status), step.name, duration);
    if let Some(error) = &step.error {
        line.push_str(&format!(" - {}", style(error).red()));
    }
    if step.continue_on_error {
        line.push_str(&format!(" {}", style("(continue-on-error)").dim()));
    }
    line
}

fn format_job(job: &JobResult, details: bool) -> Vec<String> {
    let mut lines = vec![match &job.reason {
        Some(reason) => format!(
            "  {} {} {}",
            format_job_status(job.status),
            style(&job.job_id).bold(),
            style(format!("({})", reason)).dim()
        ),
        None => format!("  {} {}", format_job_status(job.status), style(&job.job_id).bold()),
    }];
    if details || job.status == JobStatus::Failed {
        lines.extend(
            job.steps
                .iter()
                .filter(|s| details || s.status != StepStatus::Skipped)
                .map(format_step),
        );
    }
    lines
}

/// Per-job summary of a finished run
pub fn format_pipeline_result(result: &PipelineResult, details: bool) -> String {
    let mut lines = vec![format!(
        "{} {} on {}: {} in {}",
        if result.status.is_success() { CHECK } else { CROSS },
        style(&result.pipeline).bold(),
        style(&result.ref_context.git_ref).cyan(),
        format_pipeline_status(result.status),
        format_duration(Duration::from_millis(result.duration_ms().max(0) as u64))
    )];
    for job in &result.jobs {
        lines.extend(format_job(job, details));
    }
    lines.join("\n")
}

/// One line of run history
pub fn format_run_summary(summary: &RunSummary) -> String {
    let status_icon = match summary.status {
        PipelineStatus::Succeeded => CHECK,
        PipelineStatus::Failed => CROSS,
        PipelineStatus::Cancelled => WARN,
        PipelineStatus::Skipped => SKIP,
    };

    format!(
        "{} {} - {} - {} - {} ({} jobs, {} failed) - {}",
        status_icon,
        style(short_id(&summary.execution_id)).dim(),
        style(&summary.pipeline).bold(),
        style(&summary.git_ref).cyan(),
        format_pipeline_status(summary.status),
        summary.jobs,
        summary.failed_jobs,
        style(summary.started_at.format("%Y-%m-%d %H:%M:%S")).dim()
    )
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
