//! Step domain model

use crate::core::{
    config::{scalar_to_string, StepConfig},
    error::DefinitionError,
    expression::{Condition, Template},
};
use std::collections::BTreeMap;
use std::time::Duration;

/// Shell used for inline commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// `sh -e -c`
    Sh,
    /// `bash --noprofile --norc -eo pipefail -c`
    Bash,
}

impl Shell {
    fn parse(name: &str, path: &str) -> Result<Self, DefinitionError> {
        match name {
            "sh" => Ok(Shell::Sh),
            "bash" => Ok(Shell::Bash),
            other => Err(DefinitionError::schema(
                path,
                format!("unsupported shell `{}` (expected `sh` or `bash`)", other),
            )),
        }
    }
}

/// What a step executes
#[derive(Debug, Clone)]
pub enum StepAction {
    /// Inline shell command
    Run { script: Template, shell: Shell },
    /// Named reusable action with input parameters
    Uses {
        action: String,
        inputs: BTreeMap<String, Template>,
    },
}

/// A single step in a job
#[derive(Debug, Clone)]
pub struct Step {
    /// Position within the job; determines execution order
    pub index: usize,

    pub id: Option<String>,

    /// Display name
    pub name: String,

    pub action: StepAction,

    pub env: BTreeMap<String, Template>,

    pub condition: Condition,

    pub continue_on_error: bool,

    /// Overrides the job/engine default when set
    pub timeout: Option<Duration>,

    pub working_directory: Option<String>,

    /// Declared secret names (resolved only at run time)
    pub secrets: Vec<String>,
}

pub(crate) fn parse_template(source: &str, path: &str) -> Result<Template, DefinitionError> {
    Template::parse(source).map_err(|e| DefinitionError::schema(path, e.to_string()))
}

pub(crate) fn parse_condition(source: &str, path: &str) -> Result<Condition, DefinitionError> {
    Condition::parse(source).map_err(|e| DefinitionError::schema(path, e.to_string()))
}

pub(crate) fn parse_timeout(minutes: Option<f64>, path: &str) -> Result<Option<Duration>, DefinitionError> {
    match minutes {
        None => Ok(None),
        Some(m) if m.is_finite() && m > 0.0 => Duration::try_from_secs_f64(m * 60.0)
            .map(Some)
            .map_err(|_| DefinitionError::schema(path, format!("timeout of {} minutes is too large", m))),
        Some(m) => Err(DefinitionError::schema(
            path,
            format!("timeout must be a positive number of minutes, got {}", m),
        )),
    }
}

pub(crate) fn parse_template_map(
    values: &BTreeMap<String, serde_yaml::Value>,
    path: &str,
) -> Result<BTreeMap<String, Template>, DefinitionError> {
    values
        .iter()
        .map(|(key, value)| {
            let entry_path = format!("{}.{}", path, key);
            let text = scalar_to_string(value, &entry_path)?;
            Ok((key.clone(), parse_template(&text, &entry_path)?))
        })
        .collect()
}

impl Step {
    /// Create a step from a step config; `path` is e.g. `jobs.build.steps[2]`
    pub fn from_config(config: &StepConfig, index: usize, path: &str) -> Result<Self, DefinitionError> {
        let action = match (&config.run, &config.uses) {
            (Some(script), None) => StepAction::Run {
                script: parse_template(script, &format!("{}.run", path))?,
                shell: match &config.shell {
                    Some(name) => Shell::parse(name, &format!("{}.shell", path))?,
                    None => Shell::Sh,
                },
            },
            (None, Some(action)) => {
                if action.trim().is_empty() {
                    return Err(DefinitionError::schema(
                        format!("{}.uses", path),
                        "action reference is empty",
                    ));
                }
                StepAction::Uses {
                    action: action.clone(),
                    inputs: parse_template_map(&config.with, &format!("{}.with", path))?,
                }
            }
            (Some(_), Some(_)) => {
                return Err(DefinitionError::schema(path, "step cannot have both `run` and `uses`"))
            }
            (None, None) => {
                return Err(DefinitionError::schema(path, "step must have either `run` or `uses`"))
            }
        };

        if matches!(action, StepAction::Run { .. }) && !config.with.is_empty() {
            return Err(DefinitionError::schema(
                format!("{}.with", path),
                "`with` is only valid on `uses` steps",
            ));
        }

        let condition = match &config.condition {
            Some(c) => parse_condition(&c.as_expression(), &format!("{}.if", path))?,
            None => Condition::success(),
        };

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| default_name(config));

        Ok(Step {
            index,
            id: config.id.clone(),
            name,
            action,
            env: parse_template_map(&config.env, &format!("{}.env", path))?,
            condition,
            continue_on_error: config.continue_on_error,
            timeout: parse_timeout(config.timeout_minutes, &format!("{}.timeout-minutes", path))?,
            working_directory: config.working_directory.clone(),
            secrets: config.secrets.clone(),
        })
    }

    /// Stable label for logs: the step id if present, otherwise its position
    pub fn label(&self) -> String {
        self.id.clone().unwrap_or_else(|| format!("#{}", self.index + 1))
    }

    /// Every template on this step, paired with its field name
    pub fn templates(&self) -> Vec<(String, &Template)> {
        let mut out = Vec::new();
        match &self.action {
            StepAction::Run { script, .. } => out.push(("run".to_string(), script)),
            StepAction::Uses { inputs, .. } => {
                out.extend(inputs.iter().map(|(k, t)| (format!("with.{}", k), t)));
            }
        }
        out.extend(self.env.iter().map(|(k, t)| (format!("env.{}", k), t)));
        out
    }

    pub fn declares_secret(&self, name: &str) -> bool {
        self.secrets.iter().any(|s| s == name)
    }
}

fn default_name(config: &StepConfig) -> String {
    match (&config.run, &config.uses) {
        (Some(script), _) => {
            let first_line = script.lines().next().unwrap_or("").trim();
            format!("Run {}", first_line)
        }
        (None, Some(action)) => format!("Run {}", action),
        (None, None) => "step".to_string(),
    }
}
