//! Mock transport for development and testing.
//!
//! The mock transport simulates the enclave boundary without any process or
//! privilege isolation. It provides:
//! - In-process construction of the target logic from a registry factory
//! - Direct, synchronous dispatch in both directions
//! - Code paths that can be stepped through under a debugger
//!
//! It never performs isolation, signing or measurement checks, and it must
//! never be used as a production path.

use crate::{
    error::{HarnessError, HarnessResult},
    handle::{wire, Boundary, EnclaveHandle},
    handler::{Handler, Receiver},
    harness::TransportMode,
    logic::{EnclaveLogic, LogicRegistry},
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// The target logic's root receiver, called directly.
struct MockBoundary {
    root: Box<dyn Receiver>,
}

impl Boundary for MockBoundary {
    fn deliver(&self, message: Bytes) -> HarnessResult<()> {
        self.root.on_receive(message)
    }

    fn teardown(&self) -> HarnessResult<()> {
        // Nothing lives outside this process.
        Ok(())
    }
}

/// In-process dispatcher standing in for the enclave boundary
#[derive(Debug, Clone)]
pub struct MockTransport {
    registry: Arc<LogicRegistry>,
}

impl MockTransport {
    pub fn new(registry: Arc<LogicRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &LogicRegistry {
        &self.registry
    }

    /// Construct the logic registered as `logic_id` and wire it to `handler`.
    ///
    /// The factory runs exactly once. If it fails the attach fails with
    /// `InstantiationError`; constructing arbitrary logic twice is not
    /// assumed to be safe, so there is no retry.
    pub fn create_enclave<H: Handler>(
        &self,
        handler: H,
        logic_id: &str,
    ) -> HarnessResult<EnclaveHandle<H::Connection>> {
        let factory = self.registry.resolve(logic_id).map_err(|e| {
            warn!(logic = %logic_id, "Unknown target logic");
            e
        })?;

        let logic = factory().map_err(|e| HarnessError::InstantiationError {
            logic: logic_id.to_string(),
            reason: format!("{:#}", e),
        })?;

        debug!(logic = %logic_id, "Constructed target logic in-process");
        Self::create_with_logic(handler, logic)
    }

    /// Wire an already constructed logic instance to `handler`.
    pub fn create_with_logic<H: Handler>(
        handler: H,
        logic: Box<dyn EnclaveLogic>,
    ) -> HarnessResult<EnclaveHandle<H::Connection>> {
        let enclave_id = format!("mock-{}", uuid::Uuid::new_v4());
        wire(handler, TransportMode::Mock, enclave_id, move |upstream| {
            let root = logic.initialize(upstream)?;
            Ok(Arc::new(MockBoundary { root }) as Arc<dyn Boundary>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EchoHandler, EchoLogic, FailingLogic, RejectingLogic};
    use parking_lot::Mutex;

    fn registry() -> Arc<LogicRegistry> {
        let mut registry = LogicRegistry::new();
        registry.register_default::<EchoLogic>("echo").unwrap();
        registry.register_default::<RejectingLogic>("rejecting").unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_mock_echo_is_synchronous() {
        let transport = MockTransport::new(registry());
        let mut handle = transport.create_enclave(EchoHandler, "echo").unwrap();

        assert_eq!(handle.transport(), TransportMode::Mock);
        assert!(handle.enclave_id().starts_with("mock-"));

        let connection = handle.connection().unwrap();
        connection.send("ping").unwrap();
        // The reply arrived before send returned.
        assert_eq!(connection.received(), vec![Bytes::from_static(b"ping")]);

        handle.destroy().unwrap();
    }

    #[test]
    fn test_mock_unknown_logic_is_rejected() {
        let transport = MockTransport::new(registry());
        let result = transport.create_enclave(EchoHandler, "nope");
        assert!(matches!(result, Err(HarnessError::AttachRejected(_))));
    }

    #[test]
    fn test_mock_factory_failure_is_not_retried() {
        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();
        let mut registry = LogicRegistry::new();
        registry
            .register("broken", move || {
                *counter.lock() += 1;
                Err(anyhow::anyhow!("constructor exploded"))
            })
            .unwrap();

        let transport = MockTransport::new(Arc::new(registry));
        let result = transport.create_enclave(EchoHandler, "broken");

        match result {
            Err(HarnessError::InstantiationError { logic, reason }) => {
                assert_eq!(logic, "broken");
                assert!(reason.contains("constructor exploded"));
            }
            other => panic!("expected InstantiationError, got {:?}", other),
        }
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn test_mock_logic_rejecting_attach() {
        let transport = MockTransport::new(registry());
        let result = transport.create_enclave(EchoHandler, "rejecting");
        assert!(matches!(result, Err(HarnessError::AttachRejected(_))));
    }

    #[test]
    fn test_mock_create_with_logic() {
        let mut handle =
            MockTransport::create_with_logic(EchoHandler, Box::new(FailingLogic::default()))
                .unwrap();
        let result = handle.connection().unwrap().send("boom");
        assert!(matches!(result, Err(HarnessError::MalformedMessage(_))));
        handle.destroy().unwrap();
    }

    #[test]
    fn test_mock_messages_fail_after_destroy() {
        let transport = MockTransport::new(registry());
        let mut handle = transport.create_enclave(EchoHandler, "echo").unwrap();
        handle.destroy().unwrap();
        assert!(matches!(handle.connection(), Err(HarnessError::HandleClosed)));
        assert!(matches!(handle.destroy(), Err(HarnessError::HandleClosed)));
    }
}
