//! # Enclave Harness
//!
//! Boundary-transparent call routing between host handlers and enclave logic.
//!
//! Protocol code that will eventually run split across a trusted execution
//! boundary is written once, against the [`Handler`] contract, and then
//! driven through either transport:
//!
//! - **Mock**: target logic is constructed in-process and called directly,
//!   so the whole chain can be stepped through in a debugger
//! - **Native**: an external [`EnclaveLoader`] loads a signed enclave
//!   artifact and carries messages across the real boundary
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Enclave Harness                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                      EnclaveTestHarness                          │   │
//! │  │  • create_with_handler() - attach a handler to target logic     │   │
//! │  │  • create_enclave()      - attach a multiplexing root handler   │   │
//! │  │  • with_enclave_handle() - scoped create + destroy              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                              │                                         │
//! │              ┌───────────────┼───────────────┐                         │
//! │              ▼                               ▼                         │
//! │  ┌───────────────────────┐      ┌───────────────────────┐             │
//! │  │    MockTransport      │      │    NativeHostApi      │             │
//! │  │  • LogicRegistry      │      │  • ArtifactStore      │             │
//! │  │  • In-process calls   │      │  • EnclaveLoader      │             │
//! │  │  • No isolation       │      │  • Real ECALL/OCALL   │             │
//! │  │  • For dev/test       │      │  • Signed artifacts   │             │
//! │  └───────────────────────┘      └───────────────────────┘             │
//! │              │                               │                         │
//! │              └───────────► EnclaveHandle<C> ◄┘                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The mock transport provides no confidentiality or integrity. A harness
//! configured for native mode never falls back to it.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use enclave_harness::{EnclaveTestHarness, HarnessConfig, LogicRegistry};
//! use enclave_harness::testing::{EchoHandler, EchoLogic};
//!
//! let mut registry = LogicRegistry::new();
//! registry.register_default::<EchoLogic>("echo")?;
//!
//! let harness = EnclaveTestHarness::new(HarnessConfig::from_env()?, registry)?;
//! let mut handle = harness.create_with_handler(EchoHandler, &harness.logic("echo"))?;
//!
//! let reply = handle.connection()?.send_and_receive("ping")?;
//! assert_eq!(&reply[..], b"ping");
//!
//! handle.destroy()?;
//! harness.teardown();
//! ```

pub mod artifact;
pub mod codec;
pub mod config;
pub mod error;
pub mod handle;
pub mod handler;
pub mod harness;
pub mod logic;
pub mod mock;
pub mod mux;
pub mod native;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types
pub use artifact::{ArtifactStore, BuildConfig, BuildProfile, EnclaveArtifact};
pub use config::HarnessConfig;
pub use error::{BoundaryError, HarnessError, HarnessResult, LoaderError};
pub use handle::EnclaveHandle;
pub use handler::{Connected, Handler, Receiver, Sender};
pub use harness::{EnclaveTestHarness, HarnessBuilder, TransportMode};
pub use logic::{EnclaveLogic, LogicDescriptor, LogicFactory, LogicRegistry};
pub use mux::{accept_each, ChannelId, MuxConnection, MuxHandler};
pub use mock::MockTransport;
pub use native::{EnclaveLoader, LoadedEnclave, NativeHostApi};
