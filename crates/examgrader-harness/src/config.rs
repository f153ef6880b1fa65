//! Harness configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is a usable
//! configuration. CLI flags are applied on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use examgrader_exec::RunLimits;
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::frameworks::{FrameworkRegistry, FrameworkSpec};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolchainConfig {
    pub c_compiler: String,
    pub cxx_compiler: String,
    /// Prepended to every fixture's own flags.
    pub default_flags: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            c_compiler: "cc".to_string(),
            cxx_compiler: "c++".to_string(),
            default_flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub timeout_ms: u64,
    pub build_timeout_ms: u64,
    pub max_output_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            build_timeout_ms: 120_000,
            max_output_bytes: examgrader_exec::process::DEFAULT_MAX_OUTPUT_BYTES,
            memory_limit_bytes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub toolchain: ToolchainConfig,
    pub frameworks: Vec<FrameworkSpec>,
    pub limits: LimitsConfig,
    /// Worker count; `None` means available parallelism.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    pub build_root: PathBuf,
    pub keep_artifacts: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            toolchain: ToolchainConfig::default(),
            frameworks: vec![FrameworkSpec::gtest()],
            limits: LimitsConfig::default(),
            concurrency: None,
            build_root: default_build_root(),
            keep_artifacts: false,
        }
    }
}

/// Scratch root private to this process.
fn default_build_root() -> PathBuf {
    std::env::temp_dir().join(format!("examgrader-build-{}", std::process::id()))
}

impl HarnessConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, HarnessError> {
        let content = std::fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        let config = Self::from_json(&content).map_err(|source| HarnessError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.limits.timeout_ms == 0 {
            return Err(HarnessError::Config("limits.timeout_ms must be > 0".into()));
        }
        if self.limits.build_timeout_ms == 0 {
            return Err(HarnessError::Config(
                "limits.build_timeout_ms must be > 0".into(),
            ));
        }
        if self.limits.max_output_bytes == 0 {
            return Err(HarnessError::Config(
                "limits.max_output_bytes must be > 0".into(),
            ));
        }
        if self.concurrency == Some(0) {
            return Err(HarnessError::Config("concurrency must be >= 1".into()));
        }
        if self.toolchain.c_compiler.is_empty() || self.toolchain.cxx_compiler.is_empty() {
            return Err(HarnessError::Config("compiler names must not be empty".into()));
        }
        Ok(())
    }

    pub fn registry(&self) -> Result<FrameworkRegistry, HarnessError> {
        FrameworkRegistry::from_specs(self.frameworks.iter().cloned())
    }

    #[must_use]
    pub fn run_limits(&self) -> RunLimits {
        RunLimits {
            timeout: Duration::from_millis(self.limits.timeout_ms),
            max_output_bytes: self.limits.max_output_bytes,
            memory_limit_bytes: self.limits.memory_limit_bytes,
        }
    }

    #[must_use]
    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.build_timeout_ms)
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.concurrency
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, usize::from))
            .max(1)
    }
}
