//! Pipeline definition schema as written in YAML

use crate::core::error::DefinitionError;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

/// Top-level pipeline definition loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    #[serde(default)]
    pub name: Option<String>,

    /// Trigger rules
    #[serde(rename = "on")]
    pub on: TriggerConfig,

    /// Process-wide environment defaults
    #[serde(default)]
    pub env: BTreeMap<String, Value>,

    /// Named jobs, in declaration order
    pub jobs: JobMap,
}

/// Trigger configuration.
///
/// - `on: push`
/// - `on: [push, pull_request]`
/// - `on: { push: { branches: [main] } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TriggerConfig {
    Single(String),
    Multiple(Vec<String>),
    Detailed(BTreeMap<String, Value>),
}

/// Ref filters for `push` / `pull_request`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventFilterConfig {
    #[serde(default)]
    pub branches: Vec<String>,

    #[serde(default, rename = "branches-ignore")]
    pub branches_ignore: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, rename = "tags-ignore")]
    pub tags_ignore: Vec<String>,

    #[serde(default)]
    pub types: Vec<String>,
}

/// One `schedule` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub cron: String,
}

/// Jobs keyed by name; keeps declaration order and rejects duplicate names
#[derive(Debug, Clone, Default)]
pub struct JobMap(pub Vec<(String, JobConfig)>);

impl JobMap {
    pub fn iter(&self) -> impl Iterator<Item = (&String, &JobConfig)> {
        self.0.iter().map(|(name, job)| (name, job))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for JobMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct JobMapVisitor;

        impl<'de> Visitor<'de> for JobMapVisitor {
            type Value = JobMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of job names to jobs")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<JobMap, A::Error> {
                let mut seen = HashSet::new();
                let mut jobs = Vec::new();
                while let Some(name) = map.next_key::<String>()? {
                    if !seen.insert(name.clone()) {
                        return Err(de::Error::custom(format!("duplicate job name `{}`", name)));
                    }
                    let job = map.next_value::<JobConfig>()?;
                    jobs.push((name, job));
                }
                Ok(JobMap(jobs))
            }
        }

        deserializer.deserialize_map(JobMapVisitor)
    }
}

impl Serialize for JobMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, job) in &self.0 {
            map.serialize_entry(name, job)?;
        }
        map.end()
    }
}

/// A single name or a list of names (`needs`, `runs-on`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s.clone()],
            OneOrMany::Many(v) => v.clone(),
        }
    }
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

/// `if:` accepts a bare boolean or an expression string
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionConfig {
    Bool(bool),
    Expression(String),
}

impl ConditionConfig {
    pub fn as_expression(&self) -> String {
        match self {
            ConditionConfig::Bool(b) => b.to_string(),
            ConditionConfig::Expression(s) => s.clone(),
        }
    }
}

/// Job configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Execution environment labels
    #[serde(rename = "runs-on")]
    pub runs_on: OneOrMany,

    /// Jobs that must succeed first
    #[serde(default)]
    pub needs: OneOrMany,

    #[serde(default, rename = "if")]
    pub condition: Option<ConditionConfig>,

    #[serde(default)]
    pub env: BTreeMap<String, Value>,

    /// Job outputs (name -> template over step outputs)
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    /// Default step timeout for this job
    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<f64>,

    pub steps: Vec<StepConfig>,
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Identifier used by `steps.<id>` references
    #[serde(default)]
    pub id: Option<String>,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Inline shell command
    #[serde(default)]
    pub run: Option<String>,

    /// Reusable action reference
    #[serde(default)]
    pub uses: Option<String>,

    /// Action inputs
    #[serde(default)]
    pub with: BTreeMap<String, Value>,

    #[serde(default)]
    pub env: BTreeMap<String, Value>,

    #[serde(default, rename = "if")]
    pub condition: Option<ConditionConfig>,

    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: bool,

    #[serde(default, rename = "timeout-minutes")]
    pub timeout_minutes: Option<f64>,

    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,

    /// Secret names this step may read
    #[serde(default)]
    pub secrets: Vec<String>,
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, DefinitionError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, DefinitionError> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }
}

/// Render a scalar YAML value as an environment/input string
pub(crate) fn scalar_to_string(value: &Value, path: &str) -> Result<String, DefinitionError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        _ => Err(DefinitionError::schema(path, "expected a string, number or boolean")),
    }
}
