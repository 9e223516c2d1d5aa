use crate::database::{DatabaseError, DirectoryDatabase, ExampleDatabase, InMemoryDatabase};
use serde::Deserialize;
use std::path::PathBuf;

/// A phase of the run, in its default execution order.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Replay previously persisted buffers and re-confirm them.
    Reuse,
    /// Draw fresh pseudo-random buffers.
    Generate,
    /// Hill-climb near the best-known objective scores.
    Target,
    /// Minimize queued interesting examples.
    Shrink,
}

/// A health check the runner may trip, each individually suppressible.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum HealthCheckKind {
    /// The predicate rejects far more runs than it accepts.
    FilterTooMuch,
    /// Runs routinely exceed the per-execution byte budget.
    DataTooLarge,
    /// Individual executions take too long on average.
    TooSlow,
}

/// Which example database a harness configured, if any.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseSettings {
    InMemory,
    Directory { path: PathBuf },
}

impl DatabaseSettings {
    /// Opens the configured store.
    pub fn open(&self) -> Result<Box<dyn ExampleDatabase>, DatabaseError> {
        match self {
            DatabaseSettings::InMemory => Ok(Box::new(InMemoryDatabase::new())),
            DatabaseSettings::Directory { path } => {
                Ok(Box::new(DirectoryDatabase::new(path.clone())?))
            }
        }
    }
}

/// Engine configuration consumed by [`crate::runner::Runner`].
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Generation budget: the run ends once this many valid examples have
    /// been seen (interesting and rejected runs are bounded separately).
    #[serde(default = "default_max_examples")]
    pub max_examples: u64,

    /// Per-execution byte budget; a draw past it overruns.
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Seed for the runner-owned RNG. Equal seeds reproduce equal runs.
    #[serde(default)]
    pub seed: u64,

    /// Phases to execute, in order.
    #[serde(default = "default_phases")]
    pub phases: Vec<Phase>,

    /// Health checks that should not abort the run.
    #[serde(default)]
    pub suppressed_health_checks: Vec<HealthCheckKind>,

    /// Wall-clock bound on the Generate and Target phases, in milliseconds.
    #[serde(default)]
    pub deadline_ms: Option<u64>,

    /// Shrinker execution budget per interesting origin.
    #[serde(default = "default_shrink_calls")]
    pub shrink_calls: u64,

    /// Persistence configuration, for harnesses that set the store up from a
    /// file rather than handing the runner a handle directly.
    #[serde(default)]
    pub database: Option<DatabaseSettings>,
}

fn default_max_examples() -> u64 {
    100
}

fn default_max_length() -> usize {
    8 * 1024
}

fn default_phases() -> Vec<Phase> {
    vec![Phase::Reuse, Phase::Generate, Phase::Target, Phase::Shrink]
}

fn default_shrink_calls() -> u64 {
    2000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_examples: default_max_examples(),
            max_length: default_max_length(),
            seed: 0,
            phases: default_phases(),
            suppressed_health_checks: Vec::new(),
            deadline_ms: None,
            shrink_calls: default_shrink_calls(),
            database: None,
        }
    }
}

impl EngineConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file at {:?}: {}", path, e))?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse TOML from config file {:?}: {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.max_examples == 0 {
            return Err(anyhow::anyhow!("max-examples must be positive"));
        }
        if self.max_length == 0 {
            return Err(anyhow::anyhow!("max-length must be positive"));
        }
        Ok(())
    }

    pub(crate) fn health_check_enabled(&self, kind: HealthCheckKind) -> bool {
        !self.suppressed_health_checks.contains(&kind)
    }
}
