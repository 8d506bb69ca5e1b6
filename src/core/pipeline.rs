//! Pipeline definition model and graph builder

use crate::core::{
    config::{EventFilterConfig, JobConfig, PipelineConfig, ScheduleConfig, TriggerConfig},
    error::DefinitionError,
    expression::{Condition, Reference, Template},
    step::{parse_condition, parse_template, parse_template_map, parse_timeout, Step},
    trigger::{EventFilter, EventKind, TriggerRules},
};
use glob::Pattern;
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// A named unit of work with its own environment and ordered steps
#[derive(Debug, Clone)]
pub struct Job {
    /// Key under `jobs:`; unique within the definition
    pub id: String,

    /// Display name
    pub name: String,

    /// Execution environment labels
    pub runs_on: Vec<String>,

    /// Jobs that must succeed before this one starts
    pub needs: Vec<String>,

    pub condition: Condition,

    pub env: BTreeMap<String, Template>,

    pub outputs: BTreeMap<String, Template>,

    /// Default step timeout
    pub timeout: Option<Duration>,

    pub steps: Vec<Step>,
}

impl Job {
    /// Secret names declared by any step of this job
    pub fn declared_secrets(&self) -> BTreeSet<&str> {
        self.steps
            .iter()
            .flat_map(|s| s.secrets.iter().map(String::as_str))
            .collect()
    }
}

/// Immutable, parsed pipeline definition.
///
/// Shared read-only (behind an `Arc`) by every run triggered from it. Holds
/// secret names only, never values.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub name: String,

    pub triggers: TriggerRules,

    /// Process-wide environment defaults
    pub env: BTreeMap<String, Template>,

    /// Jobs in declaration order
    pub jobs: Vec<Job>,

    /// Job ids in dependency order
    execution_order: Vec<String>,
}

/// Parse and validate a definition source
pub fn build(source: &str) -> Result<PipelineDefinition, DefinitionError> {
    let config = PipelineConfig::from_yaml(source)?;
    PipelineDefinition::from_config(&config)
}

impl PipelineDefinition {
    /// Load and validate a definition from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, DefinitionError> {
        let config = PipelineConfig::from_file(path)?;
        Self::from_config(&config)
    }

    /// Build a definition from parsed configuration, validating the job graph
    /// and every expression against its namespace
    pub fn from_config(config: &PipelineConfig) -> Result<Self, DefinitionError> {
        if config.jobs.is_empty() {
            return Err(DefinitionError::schema("jobs", "definition has no jobs"));
        }

        let triggers = parse_triggers(&config.on)?;
        let env = parse_template_map(&config.env, "env")?;

        let jobs = config
            .jobs
            .iter()
            .map(|(id, job)| job_from_config(id, job))
            .collect::<Result<Vec<_>, _>>()?;

        let execution_order = Self::topological_sort(&jobs)?;

        let definition = PipelineDefinition {
            name: config.name.clone().unwrap_or_else(|| "pipeline".to_string()),
            triggers,
            env,
            jobs,
            execution_order,
        };
        definition.validate_references()?;

        Ok(definition)
    }

    /// Get a job by id
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Job ids in an order where every job follows its dependencies
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Jobs that list `id` in their `needs`
    pub fn dependents(&self, id: &str) -> Vec<&Job> {
        self.jobs
            .iter()
            .filter(|j| j.needs.iter().any(|n| n == id))
            .collect()
    }

    /// Every secret name declared anywhere in the definition
    pub fn secret_names(&self) -> BTreeSet<&str> {
        self.jobs.iter().flat_map(Job::declared_secrets).collect()
    }

    /// Depth-first sort over `needs`; reports the first cycle found
    fn topological_sort(jobs: &[Job]) -> Result<Vec<String>, DefinitionError> {
        let by_id: HashMap<&str, &Job> = jobs.iter().map(|j| (j.id.as_str(), j)).collect();

        for job in jobs {
            for dep in &job.needs {
                if !by_id.contains_key(dep.as_str()) {
                    return Err(DefinitionError::schema(
                        format!("jobs.{}.needs", job.id),
                        format!("unknown job `{}`", dep),
                    ));
                }
            }
        }

        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for job in jobs {
            Self::visit(&job.id, &by_id, &mut visited, &mut stack, &mut result)?;
        }

        Ok(result)
    }

    fn visit<'a>(
        id: &'a str,
        jobs: &HashMap<&'a str, &'a Job>,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        result: &mut Vec<String>,
    ) -> Result<(), DefinitionError> {
        if visited.contains(id) {
            return Ok(());
        }
        if let Some(pos) = stack.iter().position(|s| *s == id) {
            let mut cycle: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Err(DefinitionError::CyclicDependency { cycle });
        }

        stack.push(id);
        if let Some(&job) = jobs.get(id) {
            for dep in &job.needs {
                Self::visit(dep, jobs, visited, stack, result)?;
            }
        }
        stack.pop();

        visited.insert(id);
        result.push(id.to_string());
        Ok(())
    }

    fn validate_references(&self) -> Result<(), DefinitionError> {
        let jobs: HashMap<&str, &Job> = self.jobs.iter().map(|j| (j.id.as_str(), j)).collect();

        for (key, template) in &self.env {
            let ns = Namespace::pipeline(&jobs);
            ns.check_all(template.references(), &format!("env.{}", key))?;
        }

        for job in &self.jobs {
            let path = format!("jobs.{}", job.id);
            let ns = Namespace::job(&jobs, job);

            ns.check_all(job.condition.references(), &format!("{}.if", path))?;
            for (key, template) in &job.env {
                ns.check_all(template.references(), &format!("{}.env.{}", path, key))?;
            }

            let outputs_ns = Namespace {
                earlier_steps: &job.steps,
                ..Namespace::job(&jobs, job)
            };
            for (key, template) in &job.outputs {
                outputs_ns.check_all(template.references(), &format!("{}.outputs.{}", path, key))?;
            }

            for (index, step) in job.steps.iter().enumerate() {
                let step_path = format!("{}.steps[{}]", path, index);
                let condition_ns = Namespace {
                    earlier_steps: &job.steps[..index],
                    ..Namespace::job(&jobs, job)
                };
                condition_ns.check_all(step.condition.references(), &format!("{}.if", step_path))?;

                let body_ns = Namespace {
                    step: Some(step),
                    ..condition_ns
                };
                for (field, template) in step.templates() {
                    body_ns.check_all(template.references(), &format!("{}.{}", step_path, field))?;
                }
            }
        }
        Ok(())
    }
}

/// The references visible from one field of the definition
#[derive(Clone, Copy)]
struct Namespace<'a> {
    jobs: &'a HashMap<&'a str, &'a Job>,
    job: Option<&'a Job>,
    /// Steps whose outcome/outputs may be referenced
    earlier_steps: &'a [Step],
    /// Set for step bodies, where the step's declared secrets are visible
    step: Option<&'a Step>,
}

impl<'a> Namespace<'a> {
    fn pipeline(jobs: &'a HashMap<&'a str, &'a Job>) -> Self {
        Self {
            jobs,
            job: None,
            earlier_steps: &[],
            step: None,
        }
    }

    fn job(jobs: &'a HashMap<&'a str, &'a Job>, job: &'a Job) -> Self {
        Self {
            job: Some(job),
            ..Self::pipeline(jobs)
        }
    }

    fn check_all(&self, references: Vec<&Reference>, path: &str) -> Result<(), DefinitionError> {
        references.into_iter().try_for_each(|r| self.check(r, path))
    }

    fn check(&self, reference: &Reference, path: &str) -> Result<(), DefinitionError> {
        let unavailable = |what: &str| {
            DefinitionError::schema(path, format!("`{}` is not available here ({})", reference, what))
        };

        match reference {
            Reference::Github(_) => Ok(()),
            Reference::Env(_) => match self.job {
                Some(_) => Ok(()),
                None => Err(unavailable("pipeline env may only reference github")),
            },
            Reference::NeedsResult { job } | Reference::NeedsOutput { job, .. } => {
                let current = self.job.ok_or_else(|| unavailable("no job dependencies"))?;
                if !current.needs.iter().any(|n| n == job) {
                    return Err(unavailable(&format!("`{}` is not listed in needs", job)));
                }
                if let Reference::NeedsOutput { output, .. } = reference {
                    let declared = self
                        .jobs
                        .get(job.as_str())
                        .is_some_and(|j| j.outputs.contains_key(output));
                    if !declared {
                        return Err(unavailable(&format!(
                            "job `{}` declares no output `{}`",
                            job, output
                        )));
                    }
                }
                Ok(())
            }
            Reference::StepOutcome { step } | Reference::StepOutput { step, .. } => {
                let known = self
                    .earlier_steps
                    .iter()
                    .any(|s| s.id.as_deref() == Some(step.as_str()));
                if known {
                    Ok(())
                } else {
                    Err(unavailable(&format!("no earlier step with id `{}`", step)))
                }
            }
            Reference::Secret(name) => match (self.job, self.step) {
                (Some(job), Some(step)) if !step.declares_secret(name) => {
                    Err(DefinitionError::UnknownSecretReference {
                        job: job.id.clone(),
                        step: step.name.clone(),
                        secret: name.clone(),
                    })
                }
                (Some(_), Some(_)) => Ok(()),
                _ => Err(unavailable("secrets are only available in step commands, inputs and env")),
            },
        }
    }
}

fn job_from_config(id: &str, config: &JobConfig) -> Result<Job, DefinitionError> {
    let path = format!("jobs.{}", id);

    if id.is_empty() {
        return Err(DefinitionError::schema("jobs", "job name cannot be empty"));
    }

    let runs_on = config.runs_on.to_vec();
    if runs_on.is_empty() || runs_on.iter().any(|l| l.trim().is_empty()) {
        return Err(DefinitionError::schema(
            format!("{}.runs-on", path),
            "at least one non-empty environment label is required",
        ));
    }

    if config.steps.is_empty() {
        return Err(DefinitionError::schema(
            format!("{}.steps", path),
            "job must have at least one step",
        ));
    }

    let mut seen_ids = HashSet::new();
    let mut steps = Vec::with_capacity(config.steps.len());
    for (index, step_config) in config.steps.iter().enumerate() {
        let step_path = format!("{}.steps[{}]", path, index);
        let step = Step::from_config(step_config, index, &step_path)?;
        if let Some(step_id) = &step.id {
            if !seen_ids.insert(step_id.clone()) {
                return Err(DefinitionError::schema(
                    format!("{}.id", step_path),
                    format!("duplicate step id `{}`", step_id),
                ));
            }
        }
        steps.push(step);
    }

    let condition = match &config.condition {
        Some(c) => parse_condition(&c.as_expression(), &format!("{}.if", path))?,
        None => Condition::success(),
    };

    let outputs = config
        .outputs
        .iter()
        .map(|(key, source)| {
            let template = parse_template(source, &format!("{}.outputs.{}", path, key))?;
            Ok((key.clone(), template))
        })
        .collect::<Result<BTreeMap<_, _>, DefinitionError>>()?;

    Ok(Job {
        id: id.to_string(),
        name: config.name.clone().unwrap_or_else(|| id.to_string()),
        runs_on,
        needs: config.needs.to_vec(),
        condition,
        env: parse_template_map(&config.env, &format!("{}.env", path))?,
        outputs,
        timeout: parse_timeout(config.timeout_minutes, &format!("{}.timeout-minutes", path))?,
        steps,
    })
}

fn parse_triggers(config: &TriggerConfig) -> Result<TriggerRules, DefinitionError> {
    let mut rules = TriggerRules::default();

    let names: Vec<(String, Option<&Value>)> = match config {
        TriggerConfig::Single(name) => vec![(name.clone(), None)],
        TriggerConfig::Multiple(names) => names.iter().map(|n| (n.clone(), None)).collect(),
        TriggerConfig::Detailed(map) => map.iter().map(|(k, v)| (k.clone(), Some(v))).collect(),
    };

    if names.is_empty() {
        return Err(DefinitionError::schema("on", "at least one event is required"));
    }

    for (name, value) in names {
        let path = format!("on.{}", name);
        let kind: EventKind = name
            .parse()
            .map_err(|e: String| DefinitionError::schema(&path, e))?;

        let filter = match (kind, value) {
            (_, None) | (_, Some(Value::Null)) => EventFilter::default(),
            (EventKind::Push | EventKind::PullRequest, Some(value)) => {
                let config: EventFilterConfig = serde_yaml::from_value(value.clone())
                    .map_err(|e| DefinitionError::schema(&path, e.to_string()))?;
                compile_filter(&config, &path)?
            }
            (EventKind::Schedule, Some(value)) => {
                let entries: Vec<ScheduleConfig> = serde_yaml::from_value(value.clone())
                    .map_err(|e| DefinitionError::schema(&path, e.to_string()))?;
                rules.schedules.extend(entries.into_iter().map(|e| e.cron));
                EventFilter::default()
            }
            // Dispatch inputs are accepted but carry no filter
            (EventKind::Manual, Some(_)) => EventFilter::default(),
        };
        rules.events.insert(kind, filter);
    }

    Ok(rules)
}

fn compile_filter(config: &EventFilterConfig, path: &str) -> Result<EventFilter, DefinitionError> {
    let compile = |patterns: &[String], field: &str| -> Result<Vec<Pattern>, DefinitionError> {
        patterns
            .iter()
            .enumerate()
            .map(|(i, p)| {
                Pattern::new(p).map_err(|e| {
                    DefinitionError::schema(format!("{}.{}[{}]", path, field, i), e.to_string())
                })
            })
            .collect()
    };

    if !config.branches.is_empty() && !config.branches_ignore.is_empty() {
        return Err(DefinitionError::schema(
            path,
            "`branches` and `branches-ignore` cannot be combined",
        ));
    }
    if !config.tags.is_empty() && !config.tags_ignore.is_empty() {
        return Err(DefinitionError::schema(path, "`tags` and `tags-ignore` cannot be combined"));
    }

    Ok(EventFilter {
        branches: compile(&config.branches, "branches")?,
        branches_ignore: compile(&config.branches_ignore, "branches-ignore")?,
        tags: compile(&config.tags, "tags")?,
        tags_ignore: compile(&config.tags_ignore, "tags-ignore")?,
    })
}
