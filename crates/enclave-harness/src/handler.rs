//! Handler contract shared by both sides of the boundary.
//!
//! Every participant in a handler chain (the host root handler, nested
//! handlers, and the logic running behind the boundary) implements the same
//! two operations:
//!
//! ```text
//! attach(upstream)               -> Connection
//! on_receive(connection, bytes)  -> ()
//! ```
//!
//! `upstream` is the [`Sender`] the transport hands out for talking back
//! across the link. The transport decides what that sender does (direct call
//! in mock mode, an ECALL/OCALL in native mode); handlers never know.
//!
//! Delivery is synchronous and may be re-entrant: a `send` can cause the peer
//! to reply, and that reply reaches `on_receive` before `send` returns. This
//! is why `on_receive` borrows the connection immutably; connections that
//! accumulate state use interior mutability.

use crate::error::HarnessResult;
use bytes::Bytes;
use std::sync::Arc;

/// Outgoing half of a link.
pub trait Sender: Send + Sync {
    /// Send one message to the peer.
    fn send(&self, message: Bytes) -> HarnessResult<()>;
}

/// A unit of message-processing logic.
pub trait Handler: Send + Sync + 'static {
    /// Session token handed to whoever requested the attach.
    type Connection: Send + Sync + 'static;

    /// Establish a session over `upstream`.
    ///
    /// Returns `AttachRejected` if the handler cannot serve this link.
    fn attach(&self, upstream: Arc<dyn Sender>) -> HarnessResult<Self::Connection>;

    /// Process one message arriving on `connection`.
    fn on_receive(&self, connection: &Self::Connection, message: Bytes) -> HarnessResult<()>;
}

/// An attached handler with its connection type erased.
pub trait Receiver: Send + Sync {
    fn on_receive(&self, message: Bytes) -> HarnessResult<()>;
}

/// A handler paired with the connection it produced.
pub struct Connected<H: Handler> {
    handler: H,
    connection: H::Connection,
}

impl<H: Handler> Connected<H> {
    /// Attach `handler` to `upstream` and keep both together.
    pub fn attach(handler: H, upstream: Arc<dyn Sender>) -> HarnessResult<Self> {
        let connection = handler.attach(upstream)?;
        Ok(Self { handler, connection })
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn connection(&self) -> &H::Connection {
        &self.connection
    }

    /// Box as a type-erased receiver.
    pub fn boxed(self) -> Box<dyn Receiver> {
        Box::new(self)
    }
}

impl<H: Handler> Receiver for Connected<H> {
    fn on_receive(&self, message: Bytes) -> HarnessResult<()> {
        self.handler.on_receive(&self.connection, message)
    }
}

impl<F> Sender for F
where
    F: Fn(Bytes) -> HarnessResult<()> + Send + Sync,
{
    fn send(&self, message: Bytes) -> HarnessResult<()> {
        self(message)
    }
}
