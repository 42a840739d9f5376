//! Experiment configuration file (`fuzzlab.yaml`).
//!
//! Every field has a default so a file only needs to name what it changes;
//! command-line flags are layered on top by the CLI.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "fuzzlab.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub fuzzers: Vec<String>,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub run: RunSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSettings {
    pub concurrency: usize,
    /// Directory holding the base Dockerfile plus `targets/` and `fuzzers/`.
    pub root: PathBuf,
    pub image_prefix: String,
    pub log_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            concurrency: 0,
            root: PathBuf::from("."),
            image_prefix: "fuzztest".to_string(),
            log_dir: PathBuf::from("fuzzer_build_logs"),
            cache_dir: PathBuf::from(".fuzzlab/cache"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Docker,
    Local,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Docker => "docker",
            ExecutorKind::Local => "local",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSettings {
    pub trials: usize,
    pub timeout_secs: f64,
    pub concurrency: usize,
    pub data_dir: PathBuf,
    pub executor: ExecutorKind,
    pub command: Vec<String>,
    /// Explicit core ids; the process affinity mask is used when absent.
    pub cores: Option<Vec<usize>>,
    pub grace_secs: f64,
    pub poll_ms: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            trials: 1,
            timeout_secs: 600.0,
            concurrency: 0,
            data_dir: PathBuf::from("results"),
            executor: ExecutorKind::Docker,
            command: Vec::new(),
            cores: None,
            grace_secs: 5.0,
            poll_ms: 100,
        }
    }
}

impl RunSettings {
    /// Out-of-range values saturate; `validate` rejects them up front.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::MAX)
    }

    pub fn grace(&self) -> Duration {
        Duration::try_from_secs_f64(self.grace_secs).unwrap_or(Duration::MAX)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Loads `path` when given, else `fuzzlab.yaml` from the working
    /// directory if present, else defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn total_trials(&self) -> usize {
        self.run.trials * self.targets.len() * self.fuzzers.len()
    }

    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.targets.is_empty() {
            missing.push("targets must not be empty");
        }
        if self.fuzzers.is_empty() {
            missing.push("fuzzers must not be empty");
        }
        if !(self.run.timeout_secs > 0.0
            && Duration::try_from_secs_f64(self.run.timeout_secs).is_ok())
        {
            missing.push("run.timeout_secs must be a positive number of seconds in range");
        }
        if Duration::try_from_secs_f64(self.run.grace_secs).is_err() {
            missing.push("run.grace_secs must be a non-negative number of seconds in range");
        }
        if self.run.executor == ExecutorKind::Local && self.run.command.is_empty() {
            missing.push("run.command is required for the local executor");
        }
        if let Some(cores) = &self.run.cores {
            if cores.is_empty() {
                missing.push("run.cores must not be empty when set");
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("invalid experiment config: {}", missing.join("; ")))
        }
    }
}

pub const CONFIG_TEMPLATE: &str = "\
# Targets are built from targets/<name>/Dockerfile, fuzzers from fuzzers/<name>/Dockerfile.
targets: []                # REQUIRED
fuzzers: []                # REQUIRED
build:
  concurrency: 0           # 0 builds sequentially and stops at the first failure
  root: .
  image_prefix: fuzztest
  log_dir: fuzzer_build_logs
  cache_dir: .fuzzlab/cache
run:
  trials: 1
  timeout_secs: 600
  concurrency: 0           # 0 runs trials one at a time on the first core
  data_dir: results
  executor: docker         # docker | local
  command: []              # local executor only; supports {target} {fuzzer} {trial} {input} {output} {cpu}
  grace_secs: 5
  poll_ms: 100
";
