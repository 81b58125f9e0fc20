//! Native transport: the real trust boundary, delegated to an external loader.
//!
//! The harness does not load, sign or measure enclaves itself. A platform
//! integration implements [`EnclaveLoader`] on top of its SDK's ECALL/OCALL
//! primitives; [`NativeHostApi`] wires the caller's handler to whatever the
//! loader returns, exactly as the mock transport wires an in-process logic.
//!
//! Every loader error is surfaced verbatim inside
//! [`HarnessError::Native`], tagged with the loader and the target logic so
//! a failing test names the transport attempt that broke. Errors raised by
//! the logic inside the enclave come back as [`BoundaryError::Logic`] and
//! reach the caller untouched.

use crate::{
    artifact::EnclaveArtifact,
    error::{BoundaryError, HarnessError, HarnessResult, LoaderError},
    handle::{wire, Boundary, EnclaveHandle},
    handler::{Handler, Sender},
    harness::TransportMode,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::info;

/// An external enclave loader
pub trait EnclaveLoader: Send + Sync {
    /// Loader name used in error context and logs.
    fn name(&self) -> &str;

    /// Load `artifact` and connect its OCALLs to `ocalls`.
    fn load(
        &self,
        artifact: &EnclaveArtifact,
        ocalls: Arc<dyn Sender>,
    ) -> Result<Box<dyn LoadedEnclave>, BoundaryError>;
}

/// A loaded enclave instance
pub trait LoadedEnclave: Send + Sync {
    /// Platform identifier of this instance.
    fn id(&self) -> String;

    /// Deliver one message into the enclave.
    fn ecall(&self, message: Bytes) -> Result<(), BoundaryError>;

    /// Run the platform unload sequence.
    fn unload(&self) -> Result<(), LoaderError>;
}

struct NativeBoundary {
    loader: String,
    logic: String,
    enclave: Box<dyn LoadedEnclave>,
}

fn with_context(loader: &str, logic: &str, error: BoundaryError) -> HarnessError {
    match error {
        BoundaryError::Loader(source) => HarnessError::Native {
            loader: loader.to_string(),
            logic: logic.to_string(),
            source,
        },
        BoundaryError::Logic(error) => error,
    }
}

impl Boundary for NativeBoundary {
    fn deliver(&self, message: Bytes) -> HarnessResult<()> {
        self.enclave
            .ecall(message)
            .map_err(|e| with_context(&self.loader, &self.logic, e))
    }

    fn teardown(&self) -> HarnessResult<()> {
        self.enclave
            .unload()
            .map_err(|e| with_context(&self.loader, &self.logic, e.into()))
    }
}

/// Host-side entry point of the native transport
#[derive(Clone)]
pub struct NativeHostApi {
    loader: Arc<dyn EnclaveLoader>,
}

impl NativeHostApi {
    pub fn new(loader: Arc<dyn EnclaveLoader>) -> Self {
        Self { loader }
    }

    pub fn loader_name(&self) -> &str {
        self.loader.name()
    }

    /// Load `artifact` through the loader and attach `handler` to it.
    pub fn create_enclave<H: Handler>(
        &self,
        handler: H,
        artifact: &EnclaveArtifact,
    ) -> HarnessResult<EnclaveHandle<H::Connection>> {
        let loader = self.loader.clone();
        let loader_name = loader.name().to_string();
        let logic = artifact.logic_id.clone();

        info!(
            loader = %loader_name,
            logic = %logic,
            profile = %artifact.build.profile,
            measurement = %artifact.measurement_hex(),
            "Loading enclave"
        );

        let enclave_id = format!("native-{}-{}", logic, uuid::Uuid::new_v4());
        wire(handler, TransportMode::Native, enclave_id, move |ocalls| {
            let enclave = loader
                .load(artifact, ocalls)
                .map_err(|e| with_context(&loader_name, &logic, e))?;
            info!(loader = %loader_name, platform_id = %enclave.id(), "Enclave loaded");
            Ok(Arc::new(NativeBoundary {
                loader: loader_name,
                logic,
                enclave,
            }) as Arc<dyn Boundary>)
        })
    }
}

impl std::fmt::Debug for NativeHostApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHostApi")
            .field("loader", &self.loader.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::BuildConfig;
    use crate::testing::{EchoHandler, EchoLogic, FailingLogic, FakeLoader, RejectingLogic};
    use std::path::PathBuf;

    fn artifact() -> EnclaveArtifact {
        EnclaveArtifact {
            logic_id: "echo".to_string(),
            build: BuildConfig::default(),
            path: PathBuf::from("/artifacts/echo/simulation/enclave.signed.so"),
            measurement: [7u8; 32],
        }
    }

    #[test]
    fn test_native_echo_through_loader() {
        let loader = Arc::new(FakeLoader::new("fake-sgx").with_logic(|| Box::new(EchoLogic)));
        let api = NativeHostApi::new(loader.clone());

        let mut handle = api.create_enclave(EchoHandler, &artifact()).unwrap();
        assert_eq!(handle.transport(), TransportMode::Native);

        let reply = handle.connection().unwrap().send_and_receive("ping").unwrap();
        assert_eq!(reply, Bytes::from_static(b"ping"));
        assert_eq!(loader.ecalls(), 1);

        handle.destroy().unwrap();
        assert_eq!(loader.unloads(), 1);
        assert_eq!(loader.loaded_measurements(), vec![[7u8; 32]]);
    }

    #[test]
    fn test_native_load_error_surfaces_verbatim() {
        let loader = Arc::new(
            FakeLoader::new("fake-sgx")
                .failing_load(LoaderError::SignatureInvalid("untrusted signer".into())),
        );
        let api = NativeHostApi::new(loader);

        match api.create_enclave(EchoHandler, &artifact()) {
            Err(HarnessError::Native { loader, logic, source }) => {
                assert_eq!(loader, "fake-sgx");
                assert_eq!(logic, "echo");
                assert!(matches!(source, LoaderError::SignatureInvalid(ref s) if s == "untrusted signer"));
            }
            other => panic!("expected native loader error, got {:?}", other),
        }
    }

    #[test]
    fn test_native_unload_failure_propagates_once() {
        let loader = Arc::new(
            FakeLoader::new("fake-sgx")
                .with_logic(|| Box::new(EchoLogic))
                .failing_unload(LoaderError::Other("device busy".into())),
        );
        let api = NativeHostApi::new(loader.clone());
        let mut handle = api.create_enclave(EchoHandler, &artifact()).unwrap();

        let result = handle.destroy();
        assert!(matches!(
            result,
            Err(HarnessError::Native { source: LoaderError::Other(_), .. })
        ));
        // Closed regardless; no second unload attempt.
        assert!(matches!(handle.destroy(), Err(HarnessError::HandleClosed)));
        assert_eq!(loader.unloads(), 1);
    }

    #[test]
    fn test_native_attach_rejection_is_not_wrapped() {
        let loader = Arc::new(FakeLoader::new("fake-sgx").with_logic(|| Box::new(RejectingLogic)));
        let api = NativeHostApi::new(loader.clone());

        let result = api.create_enclave(EchoHandler, &artifact());
        assert!(matches!(result, Err(HarnessError::AttachRejected(ref s)) if s == "logic is not ready"));
        assert_eq!(loader.loads(), 1);
    }

    #[test]
    fn test_native_logic_error_is_not_wrapped() {
        let loader = Arc::new(FakeLoader::new("fake-sgx").with_logic(|| Box::new(FailingLogic)));
        let api = NativeHostApi::new(loader.clone());
        let mut handle = api.create_enclave(EchoHandler, &artifact()).unwrap();

        let result = handle.connection().unwrap().send("ping");
        assert!(matches!(result, Err(HarnessError::MalformedMessage(ref s)) if s == "refusing 4 byte message"));
        handle.destroy().unwrap();
    }
}
