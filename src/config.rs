use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::executor::CommandExecutor;
use crate::model::{Tier, DEFAULT_MAX_RETRIES};
use crate::paths;
use crate::recovery::{RecoveryPolicy, DEFAULT_SIGNATURE_THRESHOLD};
use crate::router::{Capability, TierTable};

const DEFAULT_WORKERS: usize = 1;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tiers: TierTable,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub max_retries: Option<u32>,
    pub signature_threshold: Option<u32>,
    pub workers: Option<usize>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    /// Load config from `WORKQ_CONFIG` or `~/.workq/config.toml`.
    /// Returns default config if the file doesn't exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        if self.engine.signature_threshold == Some(0) {
            bail!(
                "failed to parse {}: engine.signature_threshold must be at least 1",
                path.display()
            );
        }
        if self.engine.workers == Some(0) {
            bail!("failed to parse {}: engine.workers must be at least 1", path.display());
        }
        for tier in Tier::ALL {
            if self.tiers.limits(*tier).timeout_secs == 0 {
                bail!(
                    "failed to parse {}: tiers.{tier}.timeout_secs must be at least 1",
                    path.display()
                );
            }
        }
        if matches!(&self.executor.command, Some(c) if c.trim().is_empty()) {
            bail!("failed to parse {}: executor.command must not be empty", path.display());
        }
        Ok(())
    }

    pub fn max_retries(&self) -> u32 {
        self.engine.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            signature_threshold: self
                .engine
                .signature_threshold
                .unwrap_or(DEFAULT_SIGNATURE_THRESHOLD),
        }
    }

    pub fn workers(&self) -> usize {
        self.engine.workers.unwrap_or(DEFAULT_WORKERS)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.engine.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS))
    }

    /// The configured command executor, if any.
    pub fn command_executor(&self) -> Option<CommandExecutor> {
        self.executor
            .command
            .as_deref()
            .map(|command| CommandExecutor::new(command, &self.executor.args))
    }
}
