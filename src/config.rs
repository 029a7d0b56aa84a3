// System
use std::str::FromStr;

// Third Party
use anyhow::{anyhow, bail, Context};
use tokio::time::Duration;

// Local
use crate::{
    filter::{NamespaceFilter, DEFAULT_EXCLUDED_NAMESPACES, DEFAULT_EXCLUDED_PATTERN},
    utils::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WATCH_TIMEOUT},
};

pub const ENV_CLUSTER_NAME: &str = "CLUSTER_NAME";
pub const ENV_CLOUD: &str = "CLOUD";
pub const ENV_SITE_URL: &str = "SITE_URL";
pub const ENV_RUN_ENV: &str = "RUN_ENV";
pub const ENV_EXCLUDED_NAMESPACES: &str = "EXCLUDED_NAMESPACES";
pub const ENV_EXCLUDED_NAMESPACE_PATTERN: &str = "EXCLUDED_NAMESPACE_PATTERN";
pub const ENV_WATCH_TIMEOUT_SECS: &str = "WATCH_TIMEOUT_SECS";
pub const ENV_EVENT_QUEUE_CAPACITY: &str = "EVENT_QUEUE_CAPACITY";

/// Where the kube client configuration comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnv {
    /// Local kubeconfig if present, otherwise the in-cluster service account.
    Dev,
    /// Always the in-cluster service account.
    Cluster,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub cluster_name: String,
    pub cloud: String,
    pub site_url: String,
    pub run_env: RunEnv,
    pub excluded_namespaces: Vec<String>,
    pub excluded_namespace_pattern: String,
    pub watch_timeout: Duration,
    pub queue_capacity: usize,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from `lookup`, which returns the value of a variable if set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let site_url = value(ENV_SITE_URL)
            .ok_or_else(|| anyhow!("{} must be set to the reporting endpoint", ENV_SITE_URL))?;
        let run_env = match value(ENV_RUN_ENV).as_deref() {
            None | Some("DEV") => RunEnv::Dev,
            Some(_) => RunEnv::Cluster,
        };
        let excluded_namespaces = match value(ENV_EXCLUDED_NAMESPACES) {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect(),
            None => DEFAULT_EXCLUDED_NAMESPACES
                .iter()
                .map(|name| name.to_string())
                .collect(),
        };
        let watch_timeout_secs: u64 = parse_or(
            value(ENV_WATCH_TIMEOUT_SECS),
            ENV_WATCH_TIMEOUT_SECS,
            DEFAULT_WATCH_TIMEOUT.as_secs(),
        )?;
        if !(1..295).contains(&watch_timeout_secs) {
            bail!(
                "{} must be between 1 and 294 seconds, got {}",
                ENV_WATCH_TIMEOUT_SECS,
                watch_timeout_secs
            );
        }
        let queue_capacity: usize = parse_or(
            value(ENV_EVENT_QUEUE_CAPACITY),
            ENV_EVENT_QUEUE_CAPACITY,
            DEFAULT_QUEUE_CAPACITY,
        )?;
        if queue_capacity == 0 {
            bail!("{} must be greater than zero", ENV_EVENT_QUEUE_CAPACITY);
        }

        let config = Self {
            cluster_name: value(ENV_CLUSTER_NAME).unwrap_or_else(|| "default-cluster".to_string()),
            cloud: value(ENV_CLOUD).unwrap_or_else(|| "default-cloud".to_string()),
            site_url,
            run_env,
            excluded_namespaces,
            excluded_namespace_pattern: value(ENV_EXCLUDED_NAMESPACE_PATTERN)
                .unwrap_or_else(|| DEFAULT_EXCLUDED_PATTERN.to_string()),
            watch_timeout: Duration::from_secs(watch_timeout_secs),
            queue_capacity,
        };
        // Fail early on a bad pattern.
        config.namespace_filter()?;
        Ok(config)
    }

    pub fn namespace_filter(&self) -> Result<NamespaceFilter, anyhow::Error> {
        NamespaceFilter::new(
            self.excluded_namespaces.iter().cloned(),
            &self.excluded_namespace_pattern,
        )
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T, anyhow::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value `{}`", key, raw)),
        None => Ok(default),
    }
}
