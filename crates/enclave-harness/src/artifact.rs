//! Enclave artifacts and the store that resolves them.
//!
//! The harness never builds enclave binaries. A separate build step drops
//! signed artifacts into a directory tree, and [`ArtifactStore`] looks them up
//! by target logic and build configuration:
//!
//! ```text
//! <root>/<logic id>/<build tag>/enclave.signed.so
//! ```
//!
//! The store is an explicit object: acquired when a harness is built and
//! released when the harness is torn down.

use crate::error::{HarnessError, HarnessResult, LoaderError};
use crate::logic::LogicDescriptor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// File name of a signed enclave inside its build directory.
pub const ARTIFACT_FILE_NAME: &str = "enclave.signed.so";

const DEFAULT_HEAP_SIZE: u64 = 64 * 1024 * 1024;
const DEFAULT_STACK_SIZE: u64 = 256 * 1024;

/// How an enclave binary was built, and how it must be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildProfile {
    /// Runs on the SDK simulator, no hardware required
    #[default]
    Simulation,
    /// Hardware enclave with debugging enabled
    Debug,
    /// Production hardware enclave
    Release,
}

impl fmt::Display for BuildProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildProfile::Simulation => write!(f, "simulation"),
            BuildProfile::Debug => write!(f, "debug"),
            BuildProfile::Release => write!(f, "release"),
        }
    }
}

impl FromStr for BuildProfile {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simulation" | "sim" => Ok(BuildProfile::Simulation),
            "debug" => Ok(BuildProfile::Debug),
            "release" => Ok(BuildProfile::Release),
            other => Err(HarnessError::Config(format!("unknown build profile '{}'", other))),
        }
    }
}

/// Build configuration of an enclave artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildConfig {
    pub profile: BuildProfile,
    pub heap_size_bytes: u64,
    pub stack_size_bytes: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            profile: BuildProfile::Simulation,
            heap_size_bytes: DEFAULT_HEAP_SIZE,
            stack_size_bytes: DEFAULT_STACK_SIZE,
        }
    }
}

impl BuildConfig {
    pub fn with_profile(mut self, profile: BuildProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_heap_size(mut self, bytes: u64) -> Self {
        self.heap_size_bytes = bytes;
        self
    }

    pub fn with_stack_size(mut self, bytes: u64) -> Self {
        self.stack_size_bytes = bytes;
        self
    }

    /// Directory name for artifacts of this configuration.
    ///
    /// Default sizes map to the bare profile name so the common case stays
    /// readable on disk.
    pub fn tag(&self) -> String {
        if self.heap_size_bytes == DEFAULT_HEAP_SIZE && self.stack_size_bytes == DEFAULT_STACK_SIZE {
            self.profile.to_string()
        } else {
            format!(
                "{}-h{}-s{}",
                self.profile, self.heap_size_bytes, self.stack_size_bytes
            )
        }
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.heap_size_bytes == 0 {
            return Err(HarnessError::Config("enclave heap size must be non-zero".into()));
        }
        if self.stack_size_bytes == 0 {
            return Err(HarnessError::Config("enclave stack size must be non-zero".into()));
        }
        Ok(())
    }
}

/// A resolved, signed enclave binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveArtifact {
    pub logic_id: String,
    pub build: BuildConfig,
    pub path: PathBuf,
    /// SHA-256 of the artifact bytes
    pub measurement: [u8; 32],
}

impl EnclaveArtifact {
    /// Read `path` and record its measurement.
    pub fn from_file(
        logic_id: impl Into<String>,
        build: BuildConfig,
        path: impl Into<PathBuf>,
    ) -> Result<Self, LoaderError> {
        let path = path.into();
        let bytes = std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LoaderError::ArtifactMissing(path.display().to_string()),
            _ => LoaderError::Other(format!("failed to read {}: {}", path.display(), e)),
        })?;

        Ok(Self {
            logic_id: logic_id.into(),
            build,
            path,
            measurement: Sha256::digest(&bytes).into(),
        })
    }

    pub fn measurement_hex(&self) -> String {
        hex::encode(self.measurement)
    }
}

/// Resolves signed artifacts under one root directory.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    cache: Mutex<HashMap<LogicDescriptor, EnclaveArtifact>>,
}

impl ArtifactStore {
    /// Open the store rooted at `root`, which must be an existing directory.
    pub fn acquire(root: impl Into<PathBuf>) -> HarnessResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(HarnessError::Config(format!(
                "artifact directory {} does not exist",
                root.display()
            )));
        }
        info!(root = %root.display(), "Acquired enclave artifact store");
        Ok(Self {
            root,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the artifact for `descriptor` is expected on disk.
    ///
    /// The logic id must be a single plain path component so every artifact
    /// stays under the store root.
    pub fn artifact_path(&self, descriptor: &LogicDescriptor) -> Result<PathBuf, LoaderError> {
        let id = descriptor.id.as_str();
        let mut components = Path::new(id).components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) && !id.contains(|c: char| c == '/' || c == '\\');
        if !plain {
            return Err(LoaderError::InvalidLogicId(id.to_string()));
        }

        Ok(self
            .root
            .join(id)
            .join(descriptor.build.tag())
            .join(ARTIFACT_FILE_NAME))
    }

    /// Resolve the artifact for `descriptor`, reading it at most once.
    pub fn resolve(&self, descriptor: &LogicDescriptor) -> Result<EnclaveArtifact, LoaderError> {
        if let Some(artifact) = self.cache.lock().get(descriptor) {
            return Ok(artifact.clone());
        }

        let path = self.artifact_path(descriptor)?;
        let artifact = EnclaveArtifact::from_file(&descriptor.id, descriptor.build.clone(), path)?;
        debug!(
            logic = %descriptor,
            measurement = %artifact.measurement_hex(),
            "Resolved enclave artifact"
        );
        self.cache.lock().insert(descriptor.clone(), artifact.clone());
        Ok(artifact)
    }

    /// Number of artifacts resolved so far.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    /// End the store's lifecycle and drop every cached artifact.
    pub fn release(self) {
        let cached = self.cache.lock().len();
        info!(root = %self.root.display(), cached, "Released enclave artifact store");
    }
}
