//! Enclave handles and the plumbing shared by both transports.
//!
//! ```text
//!            host                         │            target logic
//!                                         │
//!  EnclaveHandle ──owns──► HostEndpoint   │
//!                          (handler +     │
//!                           connection)   │
//!                               │ send    │
//!                               ▼         │
//!                          EcallChannel ──┼──► Boundary::deliver ──► root receiver
//!                                         │                              │
//!                          OcallChannel ◄─┼──────────────── upstream ────┘
//!                    (weak ref to host)   │
//! ```
//!
//! The handle holds the only strong reference to the host endpoint. Once it
//! is destroyed, messages in both directions fail with `HandleClosed`.
//!
//! Concurrent use of one handle from several callers is the caller's
//! responsibility; the harness is driven by one synchronous caller.

use crate::error::{HarnessError, HarnessResult};
use crate::handler::{Handler, Sender};
use crate::harness::TransportMode;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// One side of the boundary as seen from the host.
pub(crate) trait Boundary: Send + Sync {
    /// Deliver a host message to the target logic.
    fn deliver(&self, message: Bytes) -> HarnessResult<()>;

    /// Release everything behind the boundary.
    fn teardown(&self) -> HarnessResult<()>;
}

/// Host-to-target sender. This is the `upstream` the host handler attaches to.
pub(crate) struct EcallChannel {
    enclave_id: String,
    target: RwLock<Option<Arc<dyn Boundary>>>,
    closed: AtomicBool,
}

impl EcallChannel {
    fn new(enclave_id: String) -> Self {
        Self {
            enclave_id,
            target: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn install(&self, target: Arc<dyn Boundary>) {
        *self.target.write() = Some(target);
    }

    fn close(&self) -> Option<Arc<dyn Boundary>> {
        self.closed.store(true, Ordering::SeqCst);
        self.target.write().take()
    }
}

impl Sender for EcallChannel {
    fn send(&self, message: Bytes) -> HarnessResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HarnessError::HandleClosed);
        }
        // Clone out so the lock is not held while the target runs.
        let target = self.target.read().clone().ok_or_else(|| {
            HarnessError::AttachRejected(format!(
                "target logic of {} is not ready",
                self.enclave_id
            ))
        })?;
        debug!(enclave_id = %self.enclave_id, len = message.len(), "ecall");
        target.deliver(message)
    }
}

/// Host handler together with the connection it produced.
struct HostEndpoint<H: Handler> {
    handler: H,
    connection: H::Connection,
}

trait HostSide<C>: Send + Sync {
    fn connection(&self) -> &C;
}

impl<H: Handler> HostSide<H::Connection> for HostEndpoint<H> {
    fn connection(&self) -> &H::Connection {
        &self.connection
    }
}

/// Target-to-host sender handed to the target logic as its `upstream`.
struct OcallChannel<H: Handler> {
    host: Weak<HostEndpoint<H>>,
}

impl<H: Handler> Sender for OcallChannel<H> {
    fn send(&self, message: Bytes) -> HarnessResult<()> {
        let host = self.host.upgrade().ok_or(HarnessError::HandleClosed)?;
        host.handler.on_receive(&host.connection, message)
    }
}

/// Attach `handler` and wire it to the target produced by `connect_target`.
///
/// The host handler attaches first, then the target is connected with an
/// OCALL sender pointing back at it. Any failure tears the partial wiring
/// down; no handle escapes.
pub(crate) fn wire<H, F>(
    handler: H,
    transport: TransportMode,
    enclave_id: String,
    connect_target: F,
) -> HarnessResult<EnclaveHandle<H::Connection>>
where
    H: Handler,
    F: FnOnce(Arc<dyn Sender>) -> HarnessResult<Arc<dyn Boundary>>,
{
    let ecalls = Arc::new(EcallChannel::new(enclave_id.clone()));
    let connection = handler.attach(ecalls.clone())?;
    let host = Arc::new(HostEndpoint {
        handler,
        connection,
    });
    let ocalls: Arc<dyn Sender> = Arc::new(OcallChannel {
        host: Arc::downgrade(&host),
    });

    match connect_target(ocalls) {
        Ok(target) => ecalls.install(target),
        Err(e) => {
            ecalls.close();
            warn!(enclave_id = %enclave_id, %transport, error = %e, "Attach failed");
            return Err(e);
        }
    }

    info!(enclave_id = %enclave_id, %transport, "Enclave handle created");
    Ok(EnclaveHandle {
        enclave_id,
        transport,
        host: Some(host as Arc<dyn HostSide<H::Connection>>),
        ecalls,
    })
}

/// Uniform handle over an attached enclave, whichever transport backs it.
///
/// Owns exactly one connection. [`destroy`](Self::destroy) must be called
/// exactly once; a second call fails with `HandleClosed`.
pub struct EnclaveHandle<C: 'static> {
    enclave_id: String,
    transport: TransportMode,
    host: Option<Arc<dyn HostSide<C>>>,
    ecalls: Arc<EcallChannel>,
}

impl<C: 'static> EnclaveHandle<C> {
    /// The live connection of the root handler.
    pub fn connection(&self) -> HarnessResult<&C> {
        self.host
            .as_ref()
            .map(|host| host.connection())
            .ok_or(HarnessError::HandleClosed)
    }

    /// Release everything tied to this handle.
    ///
    /// Mock teardown has nothing to release. Native teardown runs the
    /// loader's unload sequence and returns its failure as-is; the handle is
    /// closed either way.
    pub fn destroy(&mut self) -> HarnessResult<()> {
        let host = self.host.take().ok_or(HarnessError::HandleClosed)?;
        let target = self.ecalls.close();
        drop(host);

        let result = match target {
            Some(target) => target.teardown(),
            None => Ok(()),
        };
        match &result {
            Ok(()) => info!(
                enclave_id = %self.enclave_id,
                transport = %self.transport,
                "Enclave handle destroyed"
            ),
            Err(e) => warn!(
                enclave_id = %self.enclave_id,
                transport = %self.transport,
                error = %e,
                "Enclave teardown failed"
            ),
        }
        result
    }

    pub fn enclave_id(&self) -> &str {
        &self.enclave_id
    }

    pub fn transport(&self) -> TransportMode {
        self.transport
    }

    pub fn is_destroyed(&self) -> bool {
        self.host.is_none()
    }
}

impl<C: 'static> Drop for EnclaveHandle<C> {
    fn drop(&mut self) {
        if self.host.is_some() {
            warn!(
                enclave_id = %self.enclave_id,
                transport = %self.transport,
                "Enclave handle dropped without destroy"
            );
            self.ecalls.close();
        }
    }
}

impl<C: 'static> std::fmt::Debug for EnclaveHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnclaveHandle")
            .field("enclave_id", &self.enclave_id)
            .field("transport", &self.transport)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EchoConnection, EchoHandler};
    use parking_lot::Mutex;

    /// Boundary that echoes straight back and counts teardowns.
    struct Loopback {
        upstream: Arc<dyn Sender>,
        teardowns: Arc<Mutex<u32>>,
    }

    impl Boundary for Loopback {
        fn deliver(&self, message: Bytes) -> HarnessResult<()> {
            self.upstream.send(message)
        }

        fn teardown(&self) -> HarnessResult<()> {
            *self.teardowns.lock() += 1;
            Ok(())
        }
    }

    fn loopback_handle(teardowns: Arc<Mutex<u32>>) -> EnclaveHandle<EchoConnection> {
        wire(EchoHandler, TransportMode::Mock, "test".into(), |upstream| {
            Ok(Arc::new(Loopback { upstream, teardowns }) as Arc<dyn Boundary>)
        })
        .unwrap()
    }

    #[test]
    fn test_destroy_exactly_once() {
        let teardowns = Arc::new(Mutex::new(0));
        let mut handle = loopback_handle(teardowns.clone());

        assert_eq!(
            handle.connection().unwrap().send_and_receive("ping").unwrap(),
            Bytes::from_static(b"ping")
        );

        handle.destroy().unwrap();
        assert!(handle.is_destroyed());
        assert!(matches!(handle.connection(), Err(HarnessError::HandleClosed)));
        assert!(matches!(handle.destroy(), Err(HarnessError::HandleClosed)));
        assert_eq!(*teardowns.lock(), 1);
    }

    #[test]
    fn test_failed_target_leaves_no_handle() {
        let result = wire(EchoHandler, TransportMode::Mock, "test".into(), |_| {
            Err(HarnessError::AttachRejected("not today".into()))
        });
        assert!(matches!(result, Err(HarnessError::AttachRejected(_))));
    }

    #[test]
    fn test_send_before_target_ready_is_rejected() {
        let channel = EcallChannel::new("early".into());
        let result = channel.send(Bytes::from_static(b"x"));
        assert!(matches!(result, Err(HarnessError::AttachRejected(_))));

        channel.close();
        let result = channel.send(Bytes::from_static(b"x"));
        assert!(matches!(result, Err(HarnessError::HandleClosed)));
    }

    #[test]
    fn test_ocall_after_host_gone_is_closed() {
        let host = Arc::new(HostEndpoint {
            handler: EchoHandler,
            connection: EchoHandler
                .attach(Arc::new(|_: Bytes| -> HarnessResult<()> { Ok(()) }))
                .unwrap(),
        });
        let ocalls = OcallChannel {
            host: Arc::downgrade(&host),
        };
        ocalls.send(Bytes::from_static(b"before")).unwrap();
        drop(host);
        assert!(matches!(
            ocalls.send(Bytes::from_static(b"after")),
            Err(HarnessError::HandleClosed)
        ));
    }
}
