//! Target logic: the code that runs behind the boundary.
//!
//! In native mode the logic lives inside a signed enclave binary and the
//! loader constructs it. In mock mode the harness constructs it from a
//! [`LogicRegistry`] factory, in the current process.

use crate::artifact::BuildConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::handler::{Receiver, Sender};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Logic that can be wired behind the boundary.
pub trait EnclaveLogic: Send + 'static {
    /// Wire the logic's root receiver to `upstream`, the channel back to the host.
    fn initialize(self: Box<Self>, upstream: Arc<dyn Sender>) -> HarnessResult<Box<dyn Receiver>>;
}

/// Constructs one instance of a target logic.
pub type LogicFactory = Arc<dyn Fn() -> anyhow::Result<Box<dyn EnclaveLogic>> + Send + Sync>;

/// Identifies a target logic and the build it should come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicDescriptor {
    pub id: String,
    pub build: BuildConfig,
}

impl LogicDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            build: BuildConfig::default(),
        }
    }

    pub fn with_build(mut self, build: BuildConfig) -> Self {
        self.build = build;
        self
    }
}

impl fmt::Display for LogicDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.build.profile)
    }
}

/// Maps target-logic identifiers to factories.
#[derive(Clone, Default)]
pub struct LogicRegistry {
    factories: HashMap<String, LogicFactory>,
}

impl LogicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `id`.
    pub fn register<F>(&mut self, id: impl Into<String>, factory: F) -> HarnessResult<()>
    where
        F: Fn() -> anyhow::Result<Box<dyn EnclaveLogic>> + Send + Sync + 'static,
    {
        let id = id.into();
        if self.factories.contains_key(&id) {
            return Err(HarnessError::Registry(format!(
                "target logic '{}' is already registered",
                id
            )));
        }
        self.factories.insert(id, Arc::new(factory));
        Ok(())
    }

    /// Register a logic type constructed through `Default`.
    pub fn register_default<L>(&mut self, id: impl Into<String>) -> HarnessResult<()>
    where
        L: EnclaveLogic + Default,
    {
        self.register(id, || Ok(Box::new(L::default()) as Box<dyn EnclaveLogic>))
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F>(mut self, id: impl Into<String>, factory: F) -> HarnessResult<Self>
    where
        F: Fn() -> anyhow::Result<Box<dyn EnclaveLogic>> + Send + Sync + 'static,
    {
        self.register(id, factory)?;
        Ok(self)
    }

    /// Look up the factory for `id`.
    pub fn resolve(&self, id: &str) -> HarnessResult<LogicFactory> {
        self.factories.get(id).cloned().ok_or_else(|| {
            HarnessError::AttachRejected(format!("no target logic registered as '{}'", id))
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for LogicRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}
