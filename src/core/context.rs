//! Per-job run context

use crate::core::{
    expression::{ContextField, Reference, Scope, StatusFlags, Template, Value},
    state::{JobStatus, StepResult, StepStatus},
    trigger::{RefContext, RefType},
};
use crate::vault::SecretMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// What a dependency job left behind for its dependents
#[derive(Debug, Clone, PartialEq)]
pub struct NeedsEntry {
    pub result: JobStatus,
    pub outputs: BTreeMap<String, String>,
}

/// How `secrets.<NAME>` renders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretRendering {
    /// `${NAME}`, for shell scripts; the value arrives through the environment
    ShellReference,
    /// The plain value, for process environment and action inputs
    Value,
}

/// Mutable state owned by one job execution.
///
/// Holds resolved environment, dependency results, step outcomes and the
/// secrets resolved so far. Never shared between jobs; dropping it drops (and
/// zeroes) every secret it holds.
#[derive(Debug)]
pub struct RunContext {
    pub ref_context: Arc<RefContext>,
    env: BTreeMap<String, String>,
    needs: HashMap<String, NeedsEntry>,
    step_outcomes: HashMap<String, StepStatus>,
    step_outputs: HashMap<String, BTreeMap<String, String>>,
    secrets: SecretMap,
    flags: StatusFlags,
}

impl RunContext {
    pub fn new(ref_context: Arc<RefContext>) -> Self {
        Self {
            ref_context,
            env: BTreeMap::new(),
            needs: HashMap::new(),
            step_outcomes: HashMap::new(),
            step_outputs: HashMap::new(),
            secrets: SecretMap::new(),
            flags: StatusFlags::default(),
        }
    }

    /// Render `templates` in order and merge them into the environment; each
    /// entry may reference the ones merged before it
    pub fn apply_env(&mut self, templates: &BTreeMap<String, Template>) {
        for (key, template) in templates {
            let value = template.render(&self.scope(SecretRendering::Value));
            self.env.insert(key.clone(), value);
        }
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn set_needs(&mut self, job: impl Into<String>, entry: NeedsEntry) {
        self.needs.insert(job.into(), entry);
    }

    /// Record a finished step so later steps can see its outcome and outputs
    pub fn record_step(&mut self, result: &StepResult) {
        if let Some(id) = &result.id {
            self.step_outcomes.insert(id.clone(), result.status);
            self.step_outputs.insert(id.clone(), result.outputs.clone());
        }
    }

    pub fn add_secrets(&mut self, secrets: SecretMap) {
        self.secrets.extend(secrets);
    }

    pub fn secrets(&self) -> &SecretMap {
        &self.secrets
    }

    /// Mask every secret resolved so far in this job
    pub fn mask(&self, text: &str) -> String {
        self.secrets.mask(text)
    }

    pub fn set_flags(&mut self, flags: StatusFlags) {
        self.flags = flags;
    }

    pub fn scope(&self, rendering: SecretRendering) -> ContextScope<'_> {
        ContextScope {
            context: self,
            rendering,
        }
    }
}

/// Expression scope over a [`RunContext`]
pub struct ContextScope<'a> {
    context: &'a RunContext,
    rendering: SecretRendering,
}

fn string_or_null(value: Option<&String>) -> Value {
    value.map(|v| Value::String(v.clone())).unwrap_or(Value::Null)
}

impl Scope for ContextScope<'_> {
    fn lookup(&self, reference: &Reference) -> Value {
        let ctx = self.context;
        let refs = &ctx.ref_context;
        match reference {
            Reference::Github(field) => match field {
                ContextField::EventName => Value::String(refs.event.as_str().to_string()),
                ContextField::Ref => Value::String(refs.git_ref.clone()),
                ContextField::RefName => Value::String(refs.ref_name.clone()),
                ContextField::RefType => Value::String(
                    match refs.ref_type {
                        RefType::Branch => "branch",
                        RefType::Tag => "tag",
                    }
                    .to_string(),
                ),
                ContextField::BaseRef => string_or_null(refs.base_ref.as_ref()),
                ContextField::HeadRef => string_or_null(refs.head_ref.as_ref()),
                ContextField::Sha => string_or_null(refs.sha.as_ref()),
                ContextField::Actor => string_or_null(refs.actor.as_ref()),
                ContextField::Repository => string_or_null(refs.repository.as_ref()),
            },
            Reference::Env(name) => string_or_null(ctx.env.get(name)),
            Reference::NeedsResult { job } => ctx
                .needs
                .get(job)
                .map(|n| Value::String(n.result.result().to_string()))
                .unwrap_or(Value::Null),
            Reference::NeedsOutput { job, output } => {
                string_or_null(ctx.needs.get(job).and_then(|n| n.outputs.get(output)))
            }
            Reference::StepOutcome { step } => ctx
                .step_outcomes
                .get(step)
                .map(|s| Value::String(s.outcome().to_string()))
                .unwrap_or(Value::Null),
            Reference::StepOutput { step, output } => {
                string_or_null(ctx.step_outputs.get(step).and_then(|o| o.get(output)))
            }
            Reference::Secret(name) => match self.rendering {
                SecretRendering::ShellReference => Value::String(format!("${{{}}}", name)),
                SecretRendering::Value => ctx
                    .secrets
                    .get(name)
                    .map(|s| Value::String(s.expose().to_string()))
                    .unwrap_or(Value::Null),
            },
        }
    }

    fn status(&self) -> StatusFlags {
        self.context.flags
    }
}
