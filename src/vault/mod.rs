//! Credential vault adapter
//!
//! Resolves declared secret names to values for a single step. Values are
//! handed to the step runner only; they never reach the definition, results,
//! events or logs.

pub mod store;

pub use store::{EnvSecretStore, StaticSecretStore};

use crate::core::{
    error::StepError,
    trigger::{EventKind, RefContext, RefType},
};
use async_trait::async_trait;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// A secret value that is zeroed when dropped and never printed
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(Zeroizing<String>);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Borrow the plain value; only for injection into a step process
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

/// Resolved secrets for one step, keyed by name
#[derive(Debug, Clone, Default)]
pub struct SecretMap(BTreeMap<String, SecretValue>);

impl SecretMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: SecretValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&SecretValue> {
        self.0.get(name)
    }

    pub fn extend(&mut self, other: SecretMap) {
        let mut other = other;
        self.0.append(&mut other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SecretValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Replace every secret value occurring in `text` with `***`
    pub fn mask(&self, text: &str) -> String {
        let mut values: Vec<&str> = self
            .0
            .values()
            .map(SecretValue::expose)
            .filter(|v| !v.is_empty())
            .collect();
        // Longest first so a value containing another is masked whole
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));

        let mut masked = text.to_string();
        for value in values {
            if masked.contains(value) {
                masked = masked.replace(value, "***");
            }
        }
        masked
    }
}

/// Who is asking for secrets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretScope {
    pub pipeline: String,
    pub job: String,
    pub event: EventKind,
    pub ref_type: RefType,
    /// Branch the run was matched against (a PR's target branch)
    pub branch: String,
    pub git_ref: String,
}

impl SecretScope {
    pub fn new(pipeline: &str, job: &str, ref_context: &RefContext) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            job: job.to_string(),
            event: ref_context.event,
            ref_type: ref_context.ref_type,
            branch: ref_context.branch.clone(),
            git_ref: ref_context.git_ref.clone(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("access to secret '{secret}' denied: {reason}")]
    AccessDenied { secret: String, reason: String },

    #[error("secret '{0}' not found")]
    NotFound(String),

    #[error("secret store unavailable: {0}")]
    Store(String),
}

impl VaultError {
    /// Every vault failure fails the step closed as access denied
    pub fn into_step_error(self, secret: &str) -> StepError {
        match self {
            VaultError::AccessDenied { secret, reason } => StepError::AccessDenied { secret, reason },
            VaultError::NotFound(name) => StepError::AccessDenied {
                secret: name,
                reason: "not found in secret store".to_string(),
            },
            VaultError::Store(reason) => StepError::AccessDenied {
                secret: secret.to_string(),
                reason,
            },
        }
    }

    pub fn secret(&self) -> Option<&str> {
        match self {
            VaultError::AccessDenied { secret, .. } => Some(secret),
            VaultError::NotFound(name) => Some(name),
            VaultError::Store(_) => None,
        }
    }
}

/// External secret store collaborator
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Establish per-request authentication for `scope`
    async fn authenticate(&self, _scope: &SecretScope) -> Result<(), VaultError> {
        Ok(())
    }

    /// Fetch one secret; `Ok(None)` when the store has no such secret
    async fn get(&self, name: &str, scope: &SecretScope) -> Result<Option<SecretValue>, VaultError>;
}

/// Which runs may read which secrets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretPolicy {
    /// Branch globs considered protected
    pub protected_branches: Vec<String>,
    /// Secret name globs that require a protected branch
    pub protected_secrets: Vec<String>,
}

impl Default for SecretPolicy {
    fn default() -> Self {
        Self::protected_main()
    }
}

impl SecretPolicy {
    /// Everything is protected and only `main` may read it
    pub fn protected_main() -> Self {
        Self {
            protected_branches: vec!["main".to_string()],
            protected_secrets: vec!["*".to_string()],
        }
    }

    fn matches(patterns: &[String], value: &str) -> bool {
        patterns.iter().any(|p| match Pattern::new(p) {
            Ok(pattern) => pattern.matches(value),
            // An unparsable pattern only matches itself literally
            Err(_) => p == value,
        })
    }

    /// Check whether `scope` may read `secret`
    pub fn authorize(&self, secret: &str, scope: &SecretScope) -> Result<(), VaultError> {
        if !Self::matches(&self.protected_secrets, secret) {
            return Ok(());
        }
        if scope.event == EventKind::PullRequest {
            return Err(VaultError::AccessDenied {
                secret: secret.to_string(),
                reason: "protected secrets are not available to pull requests".to_string(),
            });
        }
        if scope.ref_type != RefType::Branch {
            return Err(VaultError::AccessDenied {
                secret: secret.to_string(),
                reason: format!("'{}' is not a branch", scope.git_ref),
            });
        }
        if !Self::matches(&self.protected_branches, &scope.branch) {
            return Err(VaultError::AccessDenied {
                secret: secret.to_string(),
                reason: format!("branch '{}' is not protected", scope.branch),
            });
        }
        Ok(())
    }
}

/// Adapter between the scheduler and a [`SecretStore`].
///
/// Shared by all jobs of all runs. Resolution is serialized so per-request
/// authentication on the store never interleaves.
pub struct CredentialVault {
    store: Arc<dyn SecretStore>,
    policy: SecretPolicy,
    session: Mutex<()>,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn SecretStore>, policy: SecretPolicy) -> Self {
        Self {
            store,
            policy,
            session: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &SecretPolicy {
        &self.policy
    }

    /// Resolve `names` for `scope`. Fails closed on the first denied, missing
    /// or unreachable secret; nothing partial is returned.
    pub async fn resolve(&self, names: &[String], scope: &SecretScope) -> Result<SecretMap, VaultError> {
        let mut resolved = SecretMap::new();
        if names.is_empty() {
            return Ok(resolved);
        }

        for name in names {
            if let Err(e) = self.policy.authorize(name, scope) {
                warn!(pipeline = %scope.pipeline, job = %scope.job, secret = %name, "Secret access denied by policy");
                return Err(e);
            }
        }

        let _session = self.session.lock().await;
        self.store.authenticate(scope).await?;

        for name in names {
            match self.store.get(name, scope).await? {
                Some(value) => resolved.insert(name.clone(), value),
                None => return Err(VaultError::NotFound(name.clone())),
            }
        }

        debug!(pipeline = %scope.pipeline, job = %scope.job, count = resolved.len(), "Resolved secrets");
        Ok(resolved)
    }
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
