use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::batch::RunError;
use crate::handle::IsolationLevel;

/// Environment variable prefix read by [`RunOptions::from_env`]
pub const ENV_PREFIX: &str = "PARALLEL_TX_";

/// What to do with a chunk when some of its units of work fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Roll back every transaction in the chunk and stop the run
    #[default]
    FailFast,
    /// Roll back failed transactions, commit the rest and keep going
    RetainSuccessful,
    /// Report each failure to the error callback, commit the rest, then fail
    ErrorCallback,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailurePolicy::FailFast => "fail_fast",
            FailurePolicy::RetainSuccessful => "retain_successful",
            FailurePolicy::ErrorCallback => "error_callback",
        };
        f.write_str(name)
    }
}

impl FromStr for FailurePolicy {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_fast" | "rollback_all" => Ok(FailurePolicy::FailFast),
            "retain_successful" => Ok(FailurePolicy::RetainSuccessful),
            "error_callback" => Ok(FailurePolicy::ErrorCallback),
            other => Err(RunError::InvalidOptions(format!(
                "unknown failure policy: {}",
                other
            ))),
        }
    }
}

/// Callback receiving each item failure under [`FailurePolicy::ErrorCallback`]
pub type ErrorCallback = Arc<dyn Fn(&ItemError) + Send + Sync>;

/// Options for one coordinator run
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Maximum number of transactions open at once
    pub max_concurrency: Option<usize>,
    /// Isolation passed to every `start_transaction`
    pub isolation_level: Option<IsolationLevel>,
    pub failure_policy: FailurePolicy,
    #[serde(skip)]
    pub on_error: Option<ErrorCallback>,
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("max_concurrency", &self.max_concurrency)
            .field("isolation_level", &self.isolation_level)
            .field("failure_policy", &self.failure_policy)
            .field("on_error", &self.on_error.as_ref().map(|_| "ErrorCallback"))
            .finish()
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of simultaneously open transactions
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Route item failures to `callback`; selects [`FailurePolicy::ErrorCallback`]
    pub fn with_error_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ItemError) + Send + Sync + 'static,
    {
        self.failure_policy = FailurePolicy::ErrorCallback;
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Check the options before any handle is created
    pub fn validate(&self) -> Result<(), RunError> {
        if self.max_concurrency == Some(0) {
            return Err(RunError::InvalidOptions(
                "max_concurrency must be a positive integer".to_string(),
            ));
        }
        if self.failure_policy == FailurePolicy::ErrorCallback && self.on_error.is_none() {
            return Err(RunError::InvalidOptions(
                "error_callback policy requires an on_error callback".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse the serialisable fields from JSON
    pub fn from_json(json: &str) -> Result<Self, RunError> {
        serde_json::from_str(json)
            .map_err(|e| RunError::InvalidOptions(format!("malformed run options: {}", e)))
    }

    /// Read `PARALLEL_TX_MAX_CONCURRENCY`, `PARALLEL_TX_ISOLATION_LEVEL` and
    /// `PARALLEL_TX_FAILURE_POLICY`; unset variables keep their defaults
    pub fn from_env() -> Result<Self, RunError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<L>(lookup: L) -> Result<Self, RunError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut options = Self::default();

        if let Some(raw) = var("MAX_CONCURRENCY") {
            let limit = raw.trim().parse::<usize>().map_err(|e| {
                RunError::InvalidOptions(format!("invalid max_concurrency {:?}: {}", raw, e))
            })?;
            options.max_concurrency = Some(limit);
        }
        if let Some(raw) = var("ISOLATION_LEVEL") {
            let level = raw
                .parse::<IsolationLevel>()
                .map_err(|e| RunError::InvalidOptions(e.to_string()))?;
            options.isolation_level = Some(level);
        }
        if let Some(raw) = var("FAILURE_POLICY") {
            options.failure_policy = raw.parse()?;
        }

        Ok(options)
    }
}

/// Error returned by one item's unit of work
#[derive(Debug, Error)]
#[error("item {index} failed: {error}")]
pub struct ItemError {
    /// Position of the item in the run's input
    pub index: usize,
    #[source]
    pub error: anyhow::Error,
}

impl ItemError {
    pub fn new(index: usize, error: anyhow::Error) -> Self {
        Self { index, error }
    }
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub items: usize,
    pub chunks: usize,
    pub handles_opened: usize,
    pub committed: usize,
    pub rolled_back: usize,
}

/// Everything a run produced
#[derive(Debug)]
pub struct RunReport<R> {
    pub run_id: Uuid,
    /// Values of succeeded items, in input order
    pub values: Vec<R>,
    /// Failures kept under [`FailurePolicy::RetainSuccessful`], in input order
    pub failures: Vec<ItemError>,
    pub stats: RunStats,
}

impl<R> RunReport<R> {
    pub(crate) fn new(run_id: Uuid, items: usize) -> Self {
        Self {
            run_id,
            values: Vec::new(),
            failures: Vec::new(),
            stats: RunStats {
                items,
                ..RunStats::default()
            },
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Input indexes of the failed items
    pub fn failed_indexes(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.index).collect()
    }
}
