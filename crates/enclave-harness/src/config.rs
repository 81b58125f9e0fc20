//! Configuration for the enclave test harness

use crate::artifact::{BuildConfig, BuildProfile};
use crate::error::{HarnessError, HarnessResult};
use crate::harness::TransportMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Selects the transport for a test run
pub const ENV_MODE: &str = "ENCLAVE_TEST_MODE";
/// Root directory of signed enclave artifacts
pub const ENV_ARTIFACT_DIR: &str = "ENCLAVE_ARTIFACT_DIR";
/// Build profile of the artifacts to load
pub const ENV_BUILD_PROFILE: &str = "ENCLAVE_BUILD_PROFILE";
pub const ENV_HEAP_SIZE: &str = "ENCLAVE_HEAP_SIZE";
pub const ENV_STACK_SIZE: &str = "ENCLAVE_STACK_SIZE";

/// Harness configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Transport used for every handle this harness creates
    pub mode: TransportMode,

    /// Artifact store root (native mode only)
    pub artifact_dir: Option<PathBuf>,

    /// Build configuration of descriptors made by `EnclaveTestHarness::logic`
    pub build: BuildConfig,
}

impl HarnessConfig {
    pub fn mock() -> Self {
        Self::default()
    }

    pub fn native(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode: TransportMode::Native,
            artifact_dir: Some(artifact_dir.into()),
            build: BuildConfig::default(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> HarnessResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> HarnessResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mode = match lookup(ENV_MODE) {
            Some(value) => value.parse()?,
            None => TransportMode::Mock,
        };

        let artifact_dir = lookup(ENV_ARTIFACT_DIR)
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        let mut build = BuildConfig::default();
        if let Some(value) = lookup(ENV_BUILD_PROFILE) {
            build.profile = value.parse::<BuildProfile>()?;
        }
        if let Some(value) = lookup(ENV_HEAP_SIZE) {
            build.heap_size_bytes = parse_size(ENV_HEAP_SIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_STACK_SIZE) {
            build.stack_size_bytes = parse_size(ENV_STACK_SIZE, &value)?;
        }

        Ok(Self {
            mode,
            artifact_dir,
            build,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> HarnessResult<()> {
        self.build.validate()?;
        if let Some(dir) = &self.artifact_dir {
            if dir.as_os_str().is_empty() {
                return Err(HarnessError::Config("artifact directory is empty".into()));
            }
        }
        Ok(())
    }
}

fn parse_size(key: &str, value: &str) -> HarnessResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| HarnessError::Config(format!("{} must be a byte count: {}", key, e)))
}
