use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const ENV_SINGLE_THREAD: &str = "ACTORVM_SINGLE_THREAD";
pub const ENV_WORKERS: &str = "ACTORVM_WORKERS";
pub const ENV_TIMEOUT_MS: &str = "ACTORVM_TIMEOUT_MS";

/// Runtime tuning, read from TOML and then overridden by `ACTORVM_*` variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Run every context on one current-thread tokio runtime.
    pub single_thread: bool,
    /// Worker count of the multi-thread runtime; tokio's default when unset.
    pub worker_threads: Option<usize>,
    /// Deadline applied to requests that do not carry one.
    pub default_timeout_ms: Option<u64>,
    /// Frames deeper than this abort the fiber.
    pub max_frame_depth: usize,
    /// Steps a fiber runs before yielding its context.
    pub step_budget: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            single_thread: false,
            worker_threads: None,
            default_timeout_ms: None,
            max_frame_depth: 4096,
            step_budget: 10_000,
        }
    }
}

fn env_toggle(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false") || value.eq_ignore_ascii_case("off"))
}

impl RuntimeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).context("invalid runtime config")
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&source).with_context(|| format!("parsing {}", path.display()))
    }

    /// Apply overrides from the process environment.
    pub fn with_env(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (an environment-like key/value source).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup(ENV_SINGLE_THREAD) {
            self.single_thread = env_toggle(&v);
        }
        if let Some(v) = lookup(ENV_WORKERS) {
            let workers = v
                .trim()
                .parse::<usize>()
                .with_context(|| format!("{ENV_WORKERS} must be a positive integer, got {v:?}"))?;
            self.worker_threads = Some(workers.max(1));
        }
        if let Some(v) = lookup(ENV_TIMEOUT_MS) {
            let ms = v
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{ENV_TIMEOUT_MS} must be milliseconds, got {v:?}"))?;
            self.default_timeout_ms = (ms > 0).then_some(ms);
        }
        Ok(self)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}
