//! Channel multiplexing for handler chains.
//!
//! A [`MuxHandler`] sits at the root of a chain and owns any number of
//! nested handlers, each on its own numbered channel. Frames on the wire:
//!
//! ```text
//! ┌──────────────────────┬───────────────────────────┐
//! │ channel id (u32, BE) │ payload (handler defined) │
//! └──────────────────────┴───────────────────────────┘
//! ```
//!
//! The side that opens channels calls [`MuxConnection::add_downstream`]. The
//! other side builds a matching handler when the first frame for a new
//! channel arrives, using the acceptor given to [`MuxHandler::accepting`].

use crate::error::{HarnessError, HarnessResult};
use crate::handler::{Connected, Handler, Receiver, Sender};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Channel identifier within one multiplexed link.
pub type ChannelId = u32;

const HEADER_LEN: usize = 4;

/// Builds the receiver for a channel opened by the peer.
pub type Acceptor =
    Arc<dyn Fn(ChannelId, Arc<dyn Sender>) -> HarnessResult<Arc<dyn Receiver>> + Send + Sync>;

/// Acceptor attaching a fresh handler from `make` on every new channel.
pub fn accept_each<H, F>(make: F) -> Acceptor
where
    H: Handler,
    F: Fn(ChannelId) -> H + Send + Sync + 'static,
{
    Arc::new(move |id: ChannelId, upstream: Arc<dyn Sender>| -> HarnessResult<Arc<dyn Receiver>> {
        let connected = Connected::attach(make(id), upstream)?;
        Ok(Arc::new(connected) as Arc<dyn Receiver>)
    })
}

/// Root handler that routes frames to nested handlers by channel id.
#[derive(Clone, Default)]
pub struct MuxHandler {
    acceptor: Option<Acceptor>,
}

impl MuxHandler {
    /// A mux that only routes to channels opened locally.
    pub fn new() -> Self {
        Self::default()
    }

    /// A mux that also attaches handlers for channels opened by the peer.
    pub fn accepting(acceptor: Acceptor) -> Self {
        Self {
            acceptor: Some(acceptor),
        }
    }
}

impl Handler for MuxHandler {
    type Connection = MuxConnection;

    fn attach(&self, upstream: Arc<dyn Sender>) -> HarnessResult<MuxConnection> {
        Ok(MuxConnection {
            upstream,
            acceptor: self.acceptor.clone(),
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    fn on_receive(&self, connection: &MuxConnection, mut message: Bytes) -> HarnessResult<()> {
        if message.len() < HEADER_LEN {
            return Err(HarnessError::MalformedMessage(format!(
                "mux frame of {} bytes is shorter than its header",
                message.len()
            )));
        }
        let id = message.get_u32();
        let receiver = connection.receiver_for(id)?;
        debug!(channel = id, len = message.len(), "Dispatching mux frame");
        // No lock is held here: the child may reply and re-enter this mux.
        receiver.on_receive(message)
    }
}

/// Connection of a [`MuxHandler`]; owns every nested handler.
pub struct MuxConnection {
    upstream: Arc<dyn Sender>,
    acceptor: Option<Acceptor>,
    channels: Mutex<HashMap<ChannelId, Arc<dyn Receiver>>>,
    /// Lowest id `add_downstream` will try next; wider than `ChannelId` so
    /// exhaustion is visible instead of wrapping.
    next_id: AtomicU64,
}

impl MuxConnection {
    /// Attach `handler` on the next free channel.
    pub fn add_downstream<H: Handler>(&self, handler: H) -> HarnessResult<Arc<H::Connection>> {
        let id = self.next_free_id()?;
        self.add_downstream_at(id, handler).map_err(|e| {
            // Hand the id back so a failed attach does not use it up.
            self.next_id.fetch_min(u64::from(id), Ordering::SeqCst);
            e
        })
    }

    /// Attach `handler` on a specific channel.
    pub fn add_downstream_at<H: Handler>(
        &self,
        id: ChannelId,
        handler: H,
    ) -> HarnessResult<Arc<H::Connection>> {
        if self.channels.lock().contains_key(&id) {
            return Err(HarnessError::AttachRejected(format!(
                "channel {} already has a handler",
                id
            )));
        }

        let connection = Arc::new(handler.attach(self.channel_sender(id))?);
        let downstream = Downstream {
            handler,
            connection: connection.clone(),
        };

        let mut channels = self.channels.lock();
        if channels.contains_key(&id) {
            // The attach itself opened this channel through a re-entrant reply.
            return Err(HarnessError::AttachRejected(format!(
                "channel {} was claimed during attach",
                id
            )));
        }
        channels.insert(id, Arc::new(downstream));
        Ok(connection)
    }

    /// Detach and drop the handler on `id`.
    pub fn remove_downstream(&self, id: ChannelId) -> bool {
        self.channels.lock().remove(&id).is_some()
    }

    /// Currently attached channel ids, sorted.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.channels.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn next_free_id(&self) -> HarnessResult<ChannelId> {
        let channels = self.channels.lock();
        let mut candidate = self.next_id.load(Ordering::SeqCst);
        while let Ok(id) = ChannelId::try_from(candidate) {
            if !channels.contains_key(&id) {
                self.next_id.store(candidate + 1, Ordering::SeqCst);
                return Ok(id);
            }
            candidate += 1;
        }
        Err(HarnessError::AttachRejected("no free mux channel ids left".into()))
    }

    fn channel_sender(&self, id: ChannelId) -> Arc<dyn Sender> {
        Arc::new(ChannelSender {
            id,
            upstream: self.upstream.clone(),
        })
    }

    fn receiver_for(&self, id: ChannelId) -> HarnessResult<Arc<dyn Receiver>> {
        if let Some(receiver) = self.channels.lock().get(&id) {
            return Ok(receiver.clone());
        }

        let Some(acceptor) = &self.acceptor else {
            warn!(channel = id, "Frame for channel with no handler");
            return Err(HarnessError::AttachRejected(format!(
                "no handler attached on channel {}",
                id
            )));
        };

        let receiver = acceptor(id, self.channel_sender(id))?;
        match self.channels.lock().entry(id) {
            Entry::Occupied(_) => Err(HarnessError::AttachRejected(format!(
                "channel {} was claimed while accepting it",
                id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(receiver.clone());
                debug!(channel = id, "Accepted channel opened by peer");
                Ok(receiver)
            }
        }
    }
}

struct Downstream<H: Handler> {
    handler: H,
    connection: Arc<H::Connection>,
}

impl<H: Handler> Receiver for Downstream<H> {
    fn on_receive(&self, message: Bytes) -> HarnessResult<()> {
        self.handler.on_receive(&self.connection, message)
    }
}

/// Prefixes every outgoing message with its channel id.
struct ChannelSender {
    id: ChannelId,
    upstream: Arc<dyn Sender>,
}

impl Sender for ChannelSender {
    fn send(&self, message: Bytes) -> HarnessResult<()> {
        let mut frame = BytesMut::with_capacity(HEADER_LEN + message.len());
        frame.put_u32(self.id);
        frame.put_slice(&message);
        self.upstream.send(frame.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sender that loops frames straight back into the given mux.
    fn loopback(mux: Arc<(MuxHandler, Mutex<Option<Arc<MuxConnection>>>)>) -> Arc<dyn Sender> {
        Arc::new(move |frame: Bytes| -> HarnessResult<()> {
            let connection = mux.1.lock().clone().ok_or(HarnessError::HandleClosed)?;
            mux.0.on_receive(&connection, frame)
        })
    }

    struct Recorder;

    impl Handler for Recorder {
        type Connection = (Arc<dyn Sender>, Mutex<Vec<Bytes>>);

        fn attach(&self, upstream: Arc<dyn Sender>) -> HarnessResult<Self::Connection> {
            Ok((upstream, Mutex::new(Vec::new())))
        }

        fn on_receive(&self, connection: &Self::Connection, message: Bytes) -> HarnessResult<()> {
            connection.1.lock().push(message);
            Ok(())
        }
    }

    #[test]
    fn test_frames_route_by_channel() {
        let state = Arc::new((MuxHandler::new(), Mutex::new(None)));
        let connection = Arc::new(state.0.attach(loopback(state.clone())).unwrap());
        *state.1.lock() = Some(connection.clone());

        let first = connection.add_downstream(Recorder).unwrap();
        let second = connection.add_downstream(Recorder).unwrap();
        assert_eq!(connection.channel_ids(), vec![0, 1]);

        first.0.send(Bytes::from_static(b"one")).unwrap();
        second.0.send(Bytes::from_static(b"two")).unwrap();

        assert_eq!(first.1.lock().as_slice(), &[Bytes::from_static(b"one")]);
        assert_eq!(second.1.lock().as_slice(), &[Bytes::from_static(b"two")]);
    }

    #[test]
    fn test_unknown_channel_is_rejected() {
        let mux = MuxHandler::new();
        let connection = mux.attach(Arc::new(|_: Bytes| -> HarnessResult<()> { Ok(()) })).unwrap();

        let mut frame = BytesMut::new();
        frame.put_u32(7);
        frame.put_slice(b"hi");
        let result = mux.on_receive(&connection, frame.freeze());
        assert!(matches!(result, Err(HarnessError::AttachRejected(_))));
    }

    #[test]
    fn test_short_frame_is_malformed() {
        let mux = MuxHandler::new();
        let connection = mux.attach(Arc::new(|_: Bytes| -> HarnessResult<()> { Ok(()) })).unwrap();

        let result = mux.on_receive(&connection, Bytes::from_static(&[0, 1]));
        assert!(matches!(result, Err(HarnessError::MalformedMessage(_))));
    }

    #[test]
    fn test_acceptor_attaches_on_first_frame() {
        let mux = MuxHandler::accepting(accept_each(|_| Recorder));
        let connection = mux.attach(Arc::new(|_: Bytes| -> HarnessResult<()> { Ok(()) })).unwrap();

        let mut frame = BytesMut::new();
        frame.put_u32(3);
        frame.put_slice(b"x");
        mux.on_receive(&connection, frame.freeze()).unwrap();

        assert_eq!(connection.channel_ids(), vec![3]);
        assert!(connection.remove_downstream(3));
        assert!(connection.channel_ids().is_empty());
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let mux = MuxHandler::new();
        let connection = mux.attach(Arc::new(|_: Bytes| -> HarnessResult<()> { Ok(()) })).unwrap();

        connection.add_downstream_at(5, Recorder).unwrap();
        let result = connection.add_downstream_at(5, Recorder);
        assert!(matches!(result, Err(HarnessError::AttachRejected(_))));
    }

    #[test]
    fn test_next_free_channel_skips_claimed_ids() {
        let mux = MuxHandler::new();
        let connection = mux.attach(Arc::new(|_: Bytes| -> HarnessResult<()> { Ok(()) })).unwrap();

        connection.add_downstream_at(0, Recorder).unwrap();
        connection.add_downstream_at(2, Recorder).unwrap();
        connection.add_downstream(Recorder).unwrap();
        connection.add_downstream(Recorder).unwrap();

        assert_eq!(connection.channel_ids(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_failed_attach_keeps_channel_id() {
        struct Refusing;

        impl Handler for Refusing {
            type Connection = ();

            fn attach(&self, _upstream: Arc<dyn Sender>) -> HarnessResult<()> {
                Err(HarnessError::AttachRejected("refused".into()))
            }

            fn on_receive(&self, _connection: &(), _message: Bytes) -> HarnessResult<()> {
                Ok(())
            }
        }

        let mux = MuxHandler::new();
        let connection = mux.attach(Arc::new(|_: Bytes| -> HarnessResult<()> { Ok(()) })).unwrap();

        assert!(connection.add_downstream(Refusing).is_err());
        connection.add_downstream(Recorder).unwrap();
        assert_eq!(connection.channel_ids(), vec![0]);
    }

    #[test]
    fn test_channel_ids_exhausted() {
        let mux = MuxHandler::new();
        let connection = mux.attach(Arc::new(|_: Bytes| -> HarnessResult<()> { Ok(()) })).unwrap();

        connection.add_downstream_at(ChannelId::MAX, Recorder).unwrap();
        connection
            .next_id
            .store(u64::from(ChannelId::MAX), Ordering::SeqCst);

        let result = connection.add_downstream(Recorder);
        assert!(matches!(result, Err(HarnessError::AttachRejected(_))));
        assert_eq!(connection.channel_ids(), vec![ChannelId::MAX]);
    }

    #[test]
    fn test_reentrant_accept_keeps_first_receiver() {
        // The acceptor for channel 9 feeds a second frame for channel 9 back
        // into the mux before the first accept has registered its receiver.
        let state: Arc<(MuxHandler, Mutex<Option<Arc<MuxConnection>>>)> = Arc::new((
            MuxHandler::accepting(Arc::new({
                let accepted = Arc::new(Mutex::new(0u32));
                move |_id: ChannelId, upstream: Arc<dyn Sender>| -> HarnessResult<Arc<dyn Receiver>> {
                    let first = {
                        let mut accepted = accepted.lock();
                        *accepted += 1;
                        *accepted == 1
                    };
                    if first {
                        upstream.send(Bytes::from_static(b"inner"))?;
                    }
                    Ok(Arc::new(Connected::attach(Recorder, upstream)?) as Arc<dyn Receiver>)
                }
            })),
            Mutex::new(None),
        ));
        let connection = Arc::new(state.0.attach(loopback(state.clone())).unwrap());
        *state.1.lock() = Some(connection.clone());

        let mut frame = BytesMut::new();
        frame.put_u32(9);
        frame.put_slice(b"outer");
        let result = state.0.on_receive(&connection, frame.freeze());

        assert!(matches!(result, Err(HarnessError::AttachRejected(_))));
        assert_eq!(connection.channel_ids(), vec![9]);
    }
}
