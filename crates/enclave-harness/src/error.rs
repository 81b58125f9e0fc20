//! Error taxonomy for the harness.
//!
//! None of these conditions is transient: a rejected attach or a missing
//! artifact will not succeed on a second attempt without an external change,
//! so nothing in this crate retries. Every error reaches the immediate caller
//! unmodified.

use thiserror::Error;

/// Errors reported by an external enclave loader.
///
/// Loaders define these; the harness only wraps them with the transport
/// context in [`HarnessError::Native`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoaderError {
    #[error("Enclave signature is invalid: {0}")]
    SignatureInvalid(String),

    #[error("Platform does not support enclaves: {0}")]
    PlatformUnsupported(String),

    #[error("Enclave artifact not found: {0}")]
    ArtifactMissing(String),

    #[error("Enclave already unloaded")]
    Unloaded,

    #[error("Logic id cannot name an artifact: {0}")]
    InvalidLogicId(String),

    #[error("Loader failure: {0}")]
    Other(String),
}

/// Harness errors
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The target logic refused the attach, is not ready, or does not exist.
    #[error("Attach rejected: {0}")]
    AttachRejected(String),

    /// Mock-mode construction of the target logic failed.
    #[error("Failed to instantiate target logic '{logic}': {reason}")]
    InstantiationError { logic: String, reason: String },

    /// Native mode was requested but no loader or artifact source is available.
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// The enclave handle was already destroyed.
    #[error("Enclave handle is closed")]
    HandleClosed,

    /// A loader error, tagged with the transport attempt that produced it.
    #[error("Native transport ({loader}) failed for '{logic}': {source}")]
    Native {
        loader: String,
        logic: String,
        #[source]
        source: LoaderError,
    },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Logic registry error: {0}")]
    Registry(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type HarnessResult<T> = Result<T, HarnessError>;

/// A failure reported from the far side of the native boundary.
///
/// Loader and platform failures are wrapped with transport context; errors
/// returned by the logic inside the enclave reach the caller unchanged, the
/// same as they would in mock mode.
#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Logic(#[from] HarnessError),
}

impl HarnessError {
    /// Whether this error means the handle (or its boundary) is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, HarnessError::HandleClosed)
    }
}
