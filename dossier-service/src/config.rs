// Engine Configuration
// YAML-backed settings for concurrency, deadlines, worker overrides and providers

use crate::error::{ServiceError, ServiceResult};
use crate::execution::executor::{ExecutorConfig, DEFAULT_CONCURRENCY};
use crate::providers::{FixtureSet, HttpProvider, ProviderSet};
use crate::registry::WorkerSpec;
use crate::retry::RetryPolicy;
use crate::workers::research::PROVIDER_NAMES;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Environment variable overriding `default_concurrency`
pub const CONCURRENCY_ENV: &str = "DOSSIER_CONCURRENCY";

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Workers in flight when a request gives no limit
    pub default_concurrency: usize,
    /// Cancel runs that take longer than this
    pub run_deadline_ms: Option<u64>,
    /// Per-worker overrides keyed by worker name
    pub workers: BTreeMap<String, WorkerOverride>,
    /// External collaborators
    pub providers: ProviderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_concurrency: DEFAULT_CONCURRENCY,
            run_deadline_ms: None,
            workers: BTreeMap::new(),
            providers: ProviderConfig::default(),
        }
    }
}

/// Overrides for one registered worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOverride {
    pub timeout_ms: Option<u64>,
    pub retry: Option<RetryPolicy>,
    pub optional: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Limit for a single provider call
    pub call_timeout_ms: Option<u64>,
    /// Retries within one worker invocation
    pub retry: RetryPolicy,
    /// Live HTTP services
    pub http: Option<HttpConfig>,
    /// YAML file of canned responses; takes precedence over `http`
    pub fixtures: Option<PathBuf>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: Some(10_000),
            retry: RetryPolicy::exponential(3, Duration::from_millis(200), Duration::from_secs(2)),
            http: None,
            fixtures: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Each provider is served under `{base_url}/{provider}`
    pub base_url: String,
    /// Name of the environment variable holding the bearer token
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl EngineConfig {
    pub fn from_yaml_str(content: &str) -> ServiceResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ServiceResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServiceError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml_str(&content)?;

        // Relative fixture paths are resolved against the config file
        let resolved = match (&config.providers.fixtures, path.parent()) {
            (Some(fixtures), Some(dir)) if fixtures.is_relative() => Some(dir.join(fixtures)),
            _ => None,
        };
        if resolved.is_some() {
            config.providers.fixtures = resolved;
        }
        Ok(config)
    }

    /// Load from an optional file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> ServiceResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> ServiceResult<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_env_from<F>(&mut self, lookup: F) -> ServiceResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(CONCURRENCY_ENV) {
            let value = raw.trim().parse::<usize>().map_err(|_| {
                ServiceError::Config(format!("{} must be a positive integer, got '{}'", CONCURRENCY_ENV, raw))
            })?;
            self.default_concurrency = value;
            debug!(concurrency = value, "concurrency overridden from environment");
        }
        self.validate()
    }

    fn validate(&self) -> ServiceResult<()> {
        if self.default_concurrency == 0 {
            return Err(ServiceError::Config(
                "default_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            default_concurrency: self.default_concurrency,
            run_deadline: self.run_deadline_ms.map(Duration::from_millis),
        }
    }

    /// Apply `workers` overrides to a catalog. Overrides naming unknown workers are rejected.
    pub fn apply_overrides(&self, specs: Vec<WorkerSpec>) -> ServiceResult<Vec<WorkerSpec>> {
        if let Some(unknown) = self
            .workers
            .keys()
            .find(|name| !specs.iter().any(|spec| &spec.name == *name))
        {
            return Err(ServiceError::Config(format!(
                "override for unknown worker '{}'",
                unknown
            )));
        }

        Ok(specs
            .into_iter()
            .map(|mut spec| {
                if let Some(overrides) = self.workers.get(&spec.name) {
                    if let Some(ms) = overrides.timeout_ms {
                        spec.timeout = Duration::from_millis(ms);
                    }
                    if let Some(retry) = &overrides.retry {
                        spec.retry = retry.clone();
                    }
                    if let Some(optional) = overrides.optional {
                        spec.optional = optional;
                    }
                }
                spec
            })
            .collect())
    }

    /// Build the provider set: fixtures if configured, otherwise HTTP, wrapped with retries
    pub fn build_providers(&self) -> ServiceResult<ProviderSet> {
        let providers = &self.providers;
        let base = if let Some(path) = &providers.fixtures {
            debug!(path = %path.display(), "using fixture providers");
            FixtureSet::from_file(path)?.into_providers()
        } else if let Some(http) = &providers.http {
            let api_key = http
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok());
            let mut set = ProviderSet::new();
            for name in PROVIDER_NAMES {
                let base_url = format!("{}/{}", http.base_url.trim_end_matches('/'), name);
                set.insert(
                    name,
                    Arc::new(HttpProvider::new(name, base_url).with_api_key(api_key.clone())),
                );
            }
            set
        } else {
            return Err(ServiceError::Config(
                "no providers configured: set providers.fixtures or providers.http".to_string(),
            ));
        };

        Ok(base.with_retries(
            providers.retry.clone(),
            providers.call_timeout_ms.map(Duration::from_millis),
        ))
    }
}
