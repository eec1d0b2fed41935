use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::arbiter::protocol::DEFAULT_PORT;
use crate::error::{CorelockError, Result};
use crate::executor::{Classification, ProverSpec};

/// Daemon settings, normally assembled from CLI flags.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub max_cores: u32,
    pub log_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_cores: detected_cores(),
            log_file: None,
        }
    }
}

/// Cores visible to this process; the daemon's default capacity.
pub fn detected_cores() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Benchmark configuration parsed from a TOML file:
///
/// ```toml
/// timeout = 60
/// memory = 4096
/// parallelism = 8
/// default_expect = "unknown"
///
/// [[prover]]
/// name = "z3"
/// cmd = "z3 -T:$timeout -memory:$memory $file"
/// sat = "^sat"
/// unsat = "^unsat"
/// unknown = "^unknown"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenchConfig {
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_memory")]
    pub memory: u64,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub default_expect: Option<Classification>,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
    #[serde(default, rename = "prover")]
    pub provers: Vec<ProverSpec>,
}

fn default_timeout() -> u64 {
    30
}

fn default_memory() -> u64 {
    2048
}

fn default_parallelism() -> usize {
    1
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for prover in &self.provers {
            if !names.insert(prover.name.as_str()) {
                return Err(CorelockError::Config(format!(
                    "duplicate prover name: {}",
                    prover.name
                )));
            }
            prover.validate()?;
        }
        Ok(())
    }

    /// Look up a prover by name, e.g. from a CLI `--prover` selection.
    pub fn find_prover(&self, name: &str) -> Result<&ProverSpec> {
        self.provers
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| CorelockError::UnknownProver(name.to_string()))
    }
}
