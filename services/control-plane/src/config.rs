use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use stevedore_reconcile::FailurePolicy;

use crate::controller::ControllerSettings;
use crate::scale::DEFAULT_MAX_PER_TYPE;
use crate::scheduler::{
    ChaosConfigError, ChaosRates, ChaosScheduler, MockScheduler, SchedulerAdapter,
};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => bail!("unknown log format '{other}' (expected json or pretty)"),
        }
    }
}

/// Which scheduler backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerBackend {
    Mock,
    Chaos,
}

impl FromStr for SchedulerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "chaos" => Ok(Self::Chaos),
            other => bail!("unknown scheduler '{other}' (expected mock or chaos)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub log_format: LogFormat,
    pub scheduler: SchedulerBackend,
    pub chaos_rates: ChaosRates,
    pub chaos_seed: Option<u64>,
    pub lock_timeout: Duration,
    pub failure_policy: FailurePolicy,
    pub max_per_type: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_level = lookup("STEVEDORE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let log_format = lookup("STEVEDORE_LOG_FORMAT")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(LogFormat::Json);

        let scheduler = lookup("STEVEDORE_SCHEDULER")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(SchedulerBackend::Mock);

        let rate = |key: &str| -> Result<f64> {
            match lookup(key) {
                Some(v) => v
                    .trim()
                    .parse::<f64>()
                    .with_context(|| format!("{key} must be a number, got '{v}'")),
                None => Ok(0.0),
            }
        };
        let chaos_rates = ChaosRates {
            create: rate("STEVEDORE_CHAOS_CREATE_RATE")?,
            start: rate("STEVEDORE_CHAOS_START_RATE")?,
            stop: rate("STEVEDORE_CHAOS_STOP_RATE")?,
            destroy: rate("STEVEDORE_CHAOS_DESTROY_RATE")?,
        };
        chaos_rates.validate()?;

        let chaos_seed = lookup("STEVEDORE_CHAOS_SEED")
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .with_context(|| format!("STEVEDORE_CHAOS_SEED must be an integer, got '{v}'"))
            })
            .transpose()?;

        let lock_timeout = match lookup("STEVEDORE_LOCK_TIMEOUT_MS") {
            Some(v) => {
                let millis = v.trim().parse::<u64>().with_context(|| {
                    format!("STEVEDORE_LOCK_TIMEOUT_MS must be an integer, got '{v}'")
                })?;
                Duration::from_millis(millis)
            }
            None => Duration::from_millis(5000),
        };

        let failure_policy = match lookup("STEVEDORE_FAILURE_POLICY") {
            Some(v) => v
                .parse::<FailurePolicy>()
                .context("invalid STEVEDORE_FAILURE_POLICY")?,
            None => FailurePolicy::default(),
        };

        let max_per_type = match lookup("STEVEDORE_MAX_CONTAINERS_PER_TYPE") {
            Some(v) => v.trim().parse::<u32>().with_context(|| {
                format!("STEVEDORE_MAX_CONTAINERS_PER_TYPE must be an integer, got '{v}'")
            })?,
            None => DEFAULT_MAX_PER_TYPE,
        };

        Ok(Self {
            log_level,
            log_format,
            scheduler,
            chaos_rates,
            chaos_seed,
            lock_timeout,
            failure_policy,
            max_per_type,
        })
    }

    /// Builds the configured scheduler backend.
    pub fn scheduler(&self) -> Result<Arc<dyn SchedulerAdapter>, ChaosConfigError> {
        let mock: Arc<dyn SchedulerAdapter> = Arc::new(MockScheduler::new());
        match self.scheduler {
            SchedulerBackend::Mock => Ok(mock),
            SchedulerBackend::Chaos => Ok(Arc::new(ChaosScheduler::new(
                mock,
                self.chaos_rates,
                self.chaos_seed,
            )?)),
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            lock_timeout: self.lock_timeout,
            failure_policy: self.failure_policy.clone(),
            max_per_type: self.max_per_type,
        }
    }
}
