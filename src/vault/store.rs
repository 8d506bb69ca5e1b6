//! Secret store implementations

use super::{SecretScope, SecretStore, SecretValue, VaultError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// Reads secrets from the engine's own process environment as `<prefix><NAME>`
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new("PIPELINE_SECRET_")
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, name: &str, _scope: &SecretScope) -> Result<Option<SecretValue>, VaultError> {
        match std::env::var(format!("{}{}", self.prefix, name)) {
            Ok(value) => Ok(Some(SecretValue::new(value))),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => {
                Err(VaultError::Store(format!("secret '{}' is not valid UTF-8", name)))
            }
        }
    }
}

/// In-memory secret store
#[derive(Debug, Default)]
pub struct StaticSecretStore {
    secrets: RwLock<HashMap<String, SecretValue>>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        for (name, value) in pairs {
            store.set(name, value);
        }
        store
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut secrets) = self.secrets.write() {
            secrets.insert(name.into(), SecretValue::new(value));
        }
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get(&self, name: &str, _scope: &SecretScope) -> Result<Option<SecretValue>, VaultError> {
        let secrets = self
            .secrets
            .read()
            .map_err(|_| VaultError::Store("secret map poisoned".to_string()))?;
        Ok(secrets.get(name).cloned())
    }
}
