//! Transport selection for enclave-based tests.
//!
//! ```text
//!                       ┌──────────────────────────┐
//!                       │   EnclaveTestHarness     │
//!                       │   mode fixed at build    │
//!                       └────────────┬─────────────┘
//!                                    │ create_with_handler(handler, logic)
//!                 ┌──────────────────┴──────────────────┐
//!                 ▼                                     ▼
//!        ┌─────────────────┐                 ┌─────────────────────┐
//!        │      Mock       │                 │       Native        │
//!        │ registry factory│                 │ ArtifactStore       │
//!        │ in-process wire │                 │ + EnclaveLoader     │
//!        └────────┬────────┘                 └──────────┬──────────┘
//!                 └──────────────► EnclaveHandle<C> ◄───┘
//! ```
//!
//! A harness configured for native mode never substitutes the mock
//! transport. Without a loader or an artifact store it fails with
//! `UnsupportedTransport` before any handler is attached, so a native test
//! cannot pass for the wrong reason.

use crate::{
    artifact::ArtifactStore,
    config::HarnessConfig,
    error::{HarnessError, HarnessResult},
    handle::EnclaveHandle,
    handler::Handler,
    logic::{LogicDescriptor, LogicRegistry},
    mock::MockTransport,
    mux::{MuxConnection, MuxHandler},
    native::{EnclaveLoader, NativeHostApi},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Which transport a harness routes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Real enclave loaded by an external loader
    Native,
    /// In-process simulation, debuggable, no isolation
    #[default]
    Mock,
}

impl TransportMode {
    /// Every mode, for tests parameterized over transports.
    pub fn all() -> [TransportMode; 2] {
        [TransportMode::Native, TransportMode::Mock]
    }

    /// Parse a comma separated list such as `"mock,native"`.
    pub fn parse_list(list: &str) -> HarnessResult<Vec<TransportMode>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse::<TransportMode>)
            .collect()
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Native => write!(f, "native"),
            TransportMode::Mock => write!(f, "mock"),
        }
    }
}

impl FromStr for TransportMode {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "native" => Ok(TransportMode::Native),
            "mock" => Ok(TransportMode::Mock),
            other => Err(HarnessError::Config(format!("unknown transport mode '{}'", other))),
        }
    }
}

/// Entry point for tests that drive handler chains against target logic.
///
/// Owns its artifact store: it is acquired when the harness is built and
/// released by [`teardown`](Self::teardown).
pub struct EnclaveTestHarness {
    config: HarnessConfig,
    mock: MockTransport,
    native: Option<NativeHostApi>,
    artifacts: Option<ArtifactStore>,
}

impl EnclaveTestHarness {
    /// Harness with no native loader attached.
    pub fn new(config: HarnessConfig, registry: LogicRegistry) -> HarnessResult<Self> {
        HarnessBuilder::new(config).registry(registry).build()
    }

    pub fn builder(config: HarnessConfig) -> HarnessBuilder {
        HarnessBuilder::new(config)
    }

    pub fn mode(&self) -> TransportMode {
        self.config.mode
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn artifacts(&self) -> Option<&ArtifactStore> {
        self.artifacts.as_ref()
    }

    /// Descriptor for `id` using the configured build.
    pub fn logic(&self, id: impl Into<String>) -> LogicDescriptor {
        LogicDescriptor::new(id).with_build(self.config.build.clone())
    }

    /// Attach `handler` to the target logic through the configured transport.
    pub fn create_with_handler<H: Handler>(
        &self,
        handler: H,
        logic: &LogicDescriptor,
    ) -> HarnessResult<EnclaveHandle<H::Connection>> {
        debug!(mode = %self.config.mode, logic = %logic, "Creating enclave handle");
        match self.config.mode {
            TransportMode::Mock => self.mock.create_enclave(handler, &logic.id),
            TransportMode::Native => {
                let native = self.native.as_ref().ok_or_else(|| {
                    HarnessError::UnsupportedTransport(format!(
                        "native mode requested for '{}' but no enclave loader is configured",
                        logic
                    ))
                })?;
                let artifacts = self.artifacts.as_ref().ok_or_else(|| {
                    HarnessError::UnsupportedTransport(format!(
                        "native mode requested for '{}' but no artifact directory is configured",
                        logic
                    ))
                })?;
                let artifact = artifacts.resolve(logic).map_err(|source| HarnessError::Native {
                    loader: native.loader_name().to_string(),
                    logic: logic.id.clone(),
                    source,
                })?;
                native.create_enclave(handler, &artifact)
            }
        }
    }

    /// Attach a multiplexing root handler, for chains built after the fact.
    pub fn create_enclave(
        &self,
        logic: &LogicDescriptor,
    ) -> HarnessResult<EnclaveHandle<MuxConnection>> {
        self.create_with_handler(MuxHandler::new(), logic)
    }

    /// Run `block` against a fresh handle and destroy it afterwards.
    ///
    /// The handle is destroyed in every mode. If the block succeeded but
    /// teardown failed, the teardown error is returned.
    pub fn with_enclave_handle<H, F, R>(
        &self,
        handler: H,
        logic: &LogicDescriptor,
        block: F,
    ) -> HarnessResult<R>
    where
        H: Handler,
        F: FnOnce(&EnclaveHandle<H::Connection>) -> HarnessResult<R>,
    {
        let mut handle = self.create_with_handler(handler, logic)?;
        let result = block(&handle);
        let destroyed = handle.destroy();
        let value = result?;
        destroyed?;
        Ok(value)
    }

    /// Release the artifact store. The harness cannot be used afterwards.
    pub fn teardown(self) {
        info!(mode = %self.config.mode, "Tearing down enclave test harness");
        if let Some(artifacts) = self.artifacts {
            artifacts.release();
        }
    }
}

impl fmt::Debug for EnclaveTestHarness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnclaveTestHarness")
            .field("mode", &self.config.mode)
            .field("logic", &self.mock.registry().ids())
            .field("native", &self.native)
            .field("artifacts", &self.artifacts.as_ref().map(|a| a.root().to_path_buf()))
            .finish()
    }
}

/// Builder for [`EnclaveTestHarness`]
pub struct HarnessBuilder {
    config: HarnessConfig,
    registry: LogicRegistry,
    loader: Option<Arc<dyn EnclaveLoader>>,
}

impl HarnessBuilder {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            registry: LogicRegistry::new(),
            loader: None,
        }
    }

    /// Target logic available to the mock transport.
    pub fn registry(mut self, registry: LogicRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// External loader backing the native transport.
    pub fn loader(mut self, loader: Arc<dyn EnclaveLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn build(self) -> HarnessResult<EnclaveTestHarness> {
        self.config.validate()?;

        // Only native mode reads artifacts; a stale directory must not break mock runs.
        let artifacts = match (&self.config.mode, &self.config.artifact_dir) {
            (TransportMode::Native, Some(dir)) => Some(ArtifactStore::acquire(dir)?),
            _ => None,
        };

        info!(
            mode = %self.config.mode,
            logic = self.registry.len(),
            loader = %self.loader.as_ref().map(|l| l.name().to_string()).unwrap_or_default(),
            "Enclave test harness ready"
        );

        Ok(EnclaveTestHarness {
            mock: MockTransport::new(Arc::new(self.registry)),
            native: self.loader.map(NativeHostApi::new),
            artifacts,
            config: self.config,
        })
    }
}
