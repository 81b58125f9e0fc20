//! Test doubles for handler chains and the native transport.
//!
//! - [`EchoHandler`] / [`EchoLogic`]: host handler and target logic that
//!   bounce every message back
//! - [`MuxEchoLogic`]: echoes on every channel a host mux opens
//! - [`RejectingLogic`], [`FailingLogic`]: refuse the attach, or every message
//! - [`FakeLoader`]: an [`EnclaveLoader`] that runs a logic in-process and
//!   records what the harness asked of it

use crate::{
    artifact::EnclaveArtifact,
    error::{BoundaryError, HarnessError, HarnessResult, LoaderError},
    handler::{Connected, Handler, Receiver, Sender},
    logic::{EnclaveLogic, LogicRegistry},
    mux::{accept_each, MuxHandler},
    native::{EnclaveLoader, LoadedEnclave},
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Host handler that records every message it receives.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

pub struct EchoConnection {
    upstream: Arc<dyn Sender>,
    received: Mutex<Vec<Bytes>>,
}

impl EchoConnection {
    pub fn send(&self, message: impl Into<Bytes>) -> HarnessResult<()> {
        self.upstream.send(message.into())
    }

    /// Send and return the first reply that arrived while sending.
    pub fn send_and_receive(&self, message: impl Into<Bytes>) -> HarnessResult<Bytes> {
        let before = self.received.lock().len();
        self.send(message)?;
        self.received
            .lock()
            .get(before)
            .cloned()
            .ok_or_else(|| HarnessError::MalformedMessage("no reply received".into()))
    }

    pub fn received(&self) -> Vec<Bytes> {
        self.received.lock().clone()
    }

    pub fn take_received(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.received.lock())
    }
}

impl Handler for EchoHandler {
    type Connection = EchoConnection;

    fn attach(&self, upstream: Arc<dyn Sender>) -> HarnessResult<EchoConnection> {
        Ok(EchoConnection {
            upstream,
            received: Mutex::new(Vec::new()),
        })
    }

    fn on_receive(&self, connection: &EchoConnection, message: Bytes) -> HarnessResult<()> {
        connection.received.lock().push(message);
        Ok(())
    }
}

/// Target-side handler sending every message straight back.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reflector;

impl Handler for Reflector {
    type Connection = Arc<dyn Sender>;

    fn attach(&self, upstream: Arc<dyn Sender>) -> HarnessResult<Arc<dyn Sender>> {
        Ok(upstream)
    }

    fn on_receive(&self, connection: &Arc<dyn Sender>, message: Bytes) -> HarnessResult<()> {
        connection.send(message)
    }
}

/// Target logic echoing every message.
#[derive(Debug, Default)]
pub struct EchoLogic;

impl EnclaveLogic for EchoLogic {
    fn initialize(self: Box<Self>, upstream: Arc<dyn Sender>) -> HarnessResult<Box<dyn Receiver>> {
        Ok(Connected::attach(Reflector, upstream)?.boxed())
    }
}

/// Target logic echoing on every channel the host opens.
#[derive(Debug, Default)]
pub struct MuxEchoLogic;

impl EnclaveLogic for MuxEchoLogic {
    fn initialize(self: Box<Self>, upstream: Arc<dyn Sender>) -> HarnessResult<Box<dyn Receiver>> {
        let root = MuxHandler::accepting(accept_each(|_| Reflector));
        Ok(Connected::attach(root, upstream)?.boxed())
    }
}

/// Target logic that is never ready.
#[derive(Debug, Default)]
pub struct RejectingLogic;

impl EnclaveLogic for RejectingLogic {
    fn initialize(self: Box<Self>, _upstream: Arc<dyn Sender>) -> HarnessResult<Box<dyn Receiver>> {
        Err(HarnessError::AttachRejected("logic is not ready".into()))
    }
}

/// Target logic that attaches but refuses every message.
#[derive(Debug, Default)]
pub struct FailingLogic;

struct Refuse;

impl Receiver for Refuse {
    fn on_receive(&self, message: Bytes) -> HarnessResult<()> {
        Err(HarnessError::MalformedMessage(format!(
            "refusing {} byte message",
            message.len()
        )))
    }
}

impl EnclaveLogic for FailingLogic {
    fn initialize(self: Box<Self>, _upstream: Arc<dyn Sender>) -> HarnessResult<Box<dyn Receiver>> {
        Ok(Box::new(Refuse))
    }
}

type LogicMaker = Arc<dyn Fn() -> Box<dyn EnclaveLogic> + Send + Sync>;

#[derive(Default)]
struct LoaderStats {
    loads: AtomicUsize,
    ecalls: AtomicUsize,
    unloads: AtomicUsize,
    measurements: Mutex<Vec<[u8; 32]>>,
}

/// Loader double for exercising the native path without enclave hardware.
pub struct FakeLoader {
    name: String,
    logic: Option<LogicMaker>,
    registry: Option<LogicRegistry>,
    load_error: Option<LoaderError>,
    unload_error: Option<LoaderError>,
    stats: Arc<LoaderStats>,
}

impl FakeLoader {
    /// A loader with no logic: every load fails with `ArtifactMissing`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logic: None,
            registry: None,
            load_error: None,
            unload_error: None,
            stats: Arc::new(LoaderStats::default()),
        }
    }

    /// Run logic from `make` inside every loaded enclave.
    pub fn with_logic<F>(mut self, make: F) -> Self
    where
        F: Fn() -> Box<dyn EnclaveLogic> + Send + Sync + 'static,
    {
        self.logic = Some(Arc::new(make) as LogicMaker);
        self
    }

    /// Pick the logic for each artifact from `registry` by its logic id.
    pub fn with_registry(mut self, registry: LogicRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn failing_load(mut self, error: LoaderError) -> Self {
        self.load_error = Some(error);
        self
    }

    pub fn failing_unload(mut self, error: LoaderError) -> Self {
        self.unload_error = Some(error);
        self
    }

    pub fn loads(&self) -> usize {
        self.stats.loads.load(Ordering::SeqCst)
    }

    pub fn ecalls(&self) -> usize {
        self.stats.ecalls.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.stats.unloads.load(Ordering::SeqCst)
    }

    /// Measurements of every artifact loaded, in order.
    pub fn loaded_measurements(&self) -> Vec<[u8; 32]> {
        self.stats.measurements.lock().clone()
    }
}

impl EnclaveLoader for FakeLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(
        &self,
        artifact: &EnclaveArtifact,
        ocalls: Arc<dyn Sender>,
    ) -> Result<Box<dyn LoadedEnclave>, BoundaryError> {
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.load_error {
            return Err(error.clone().into());
        }
        let logic = match (&self.registry, &self.logic) {
            (Some(registry), _) if registry.contains(&artifact.logic_id) => {
                let factory = registry.resolve(&artifact.logic_id)?;
                factory().map_err(|e| HarnessError::InstantiationError {
                    logic: artifact.logic_id.clone(),
                    reason: format!("{:#}", e),
                })?
            }
            (_, Some(make)) => make(),
            _ => {
                return Err(
                    LoaderError::ArtifactMissing(artifact.path.display().to_string()).into(),
                )
            }
        };

        let root = logic.initialize(ocalls)?;
        self.stats.measurements.lock().push(artifact.measurement);

        Ok(Box::new(FakeEnclave {
            id: format!("fake-{}", self.loads()),
            root,
            unload_error: self.unload_error.clone(),
            unloaded: AtomicBool::new(false),
            stats: self.stats.clone(),
        }))
    }
}

struct FakeEnclave {
    id: String,
    root: Box<dyn Receiver>,
    unload_error: Option<LoaderError>,
    unloaded: AtomicBool,
    stats: Arc<LoaderStats>,
}

impl LoadedEnclave for FakeEnclave {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn ecall(&self, message: Bytes) -> Result<(), BoundaryError> {
        if self.unloaded.load(Ordering::SeqCst) {
            return Err(LoaderError::Unloaded.into());
        }
        self.stats.ecalls.fetch_add(1, Ordering::SeqCst);
        Ok(self.root.on_receive(message)?)
    }

    fn unload(&self) -> Result<(), LoaderError> {
        if self.unloaded.swap(true, Ordering::SeqCst) {
            return Err(LoaderError::Unloaded);
        }
        self.stats.unloads.fetch_add(1, Ordering::SeqCst);
        match &self.unload_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}
