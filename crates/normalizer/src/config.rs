use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::OrchestratorError;
use crate::model::{ProviderConfig, StageFlags};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDefaults {
    pub priority: i32,
    pub timeout_seconds: i64,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            priority: 0,
            timeout_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub default_provider: String,
    pub default_model_per_provider: HashMap<String, String>,
    pub global_max_workers: usize,
    pub providers: Vec<ProviderConfig>,
    pub session_defaults: SessionDefaults,
    pub stage_flags: StageFlags,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_provider: String::new(),
            default_model_per_provider: HashMap::new(),
            global_max_workers: 5,
            providers: Vec::new(),
            session_defaults: SessionDefaults::default(),
            stage_flags: StageFlags::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if !(1..=100).contains(&self.global_max_workers) {
            return Err(OrchestratorError::validation(
                "global_max_workers must be in [1, 100]",
            ));
        }
        if !self.default_provider.is_empty()
            && !self.providers.iter().any(|p| p.name == self.default_provider)
        {
            return Err(OrchestratorError::validation(format!(
                "default_provider '{}' is not a configured provider",
                self.default_provider
            )));
        }
        for (provider, model) in &self.default_model_per_provider {
            let provider_cfg = self.providers.iter().find(|p| &p.name == provider);
            match provider_cfg {
                None => {
                    return Err(OrchestratorError::validation(format!(
                        "default model set for unknown provider '{}'",
                        provider
                    )))
                }
                Some(cfg) if !cfg.models.iter().any(|m| &m.name == model) => {
                    return Err(OrchestratorError::validation(format!(
                        "default model '{}' is unknown for provider '{}'",
                        model, provider
                    )))
                }
                _ => {}
            }
        }
        for provider in &self.providers {
            provider
                .validate()
                .map_err(OrchestratorError::validation)?;
        }
        Ok(())
    }
}

/// Read-mostly configuration cache. Writers serialize through the lock; a
/// version counter lets callers detect concurrent changes without polling
/// the whole struct for equality.
#[derive(Clone)]
pub struct Config {
    inner: Arc<RwLock<OrchestratorConfig>>,
    version: Arc<std::sync::atomic::AtomicU64>,
}

impl Config {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            version: Arc::new(std::sync::atomic::AtomicU64::new(1)),
        }
    }

    pub async fn snapshot(&self) -> OrchestratorConfig {
        self.inner.read().await.clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Replace the configuration wholesale after validating it. Changes to
    /// an active provider take effect only for new calls; callers holding an
    /// `Arc<dyn Provider>` for an in-flight request are unaffected.
    pub async fn update(&self, new_config: OrchestratorConfig) -> Result<(), OrchestratorError> {
        new_config.validate()?;
        let mut guard = self.inner.write().await;
        *guard = new_config;
        self.version
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> Result<Self, OrchestratorError> {
        let config: OrchestratorConfig =
            toml::from_str(s).map_err(|e| OrchestratorError::validation(e.to_string()))?;
        config.validate()?;
        Ok(Self::new(config))
    }
}
