//! Awaitable socket operations.
//!
//! A socket call may complete through two paths: synchronously, when the OS
//! has the datagram (or the buffer space) ready right away, or asynchronously,
//! once the reactor reports readiness. Cancellation races the asynchronous
//! path. Whichever path claims the [`Signal`] first delivers its result; every
//! later claim is a no-op.
use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU8, Ordering},
    },
};

use bytes::Bytes;
use event_listener::Event;
use tokio::{net::UdpSocket, select};
use tokio_util::sync::CancellationToken;

use crate::{datagram::Datagram, error::OperationError};

/// Signal is armed and waiting for a result.
const PENDING: u8 = 0;
/// A completion path won the race and is storing its result.
const CLAIMED: u8 = 1;
/// The result is available.
const COMPLETED: u8 = 2;

/// Bytes transferred by a completed socket call and the remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transferred {
    pub(crate) len: usize,
    pub(crate) remote: Option<SocketAddr>,
}

pub(crate) type OperationResult = Result<Transferred, OperationError>;

/// One-shot completion signal of a socket operation.
///
/// The signal transitions `PENDING -> CLAIMED -> COMPLETED` exactly once per
/// arming. [`Signal::rearm`] brings a consumed signal back to `PENDING`.
pub(crate) struct Signal {
    state: AtomicU8,
    slot: Mutex<Option<OperationResult>>,
    event: Event,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            slot: Mutex::new(None),
            event: Event::new(),
        }
    }

    /// Tries to deliver `result`. Returns `false` if another path already
    /// claimed the signal, in which case `result` is discarded.
    pub(crate) fn claim(&self, result: OperationResult) -> bool {
        if self
            .state
            .compare_exchange(PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!("Socket operation already completed, discarding late result");
            return false;
        }
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
        self.state.store(COMPLETED, Ordering::Release);
        self.event.notify(usize::MAX);
        true
    }

    fn take(&self) -> Option<OperationResult> {
        if self.state.load(Ordering::Acquire) != COMPLETED {
            return None;
        }
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Waits for the winning result.
    ///
    /// The result can be taken once; a second wait on the same arming reports
    /// the operation as cancelled.
    pub(crate) async fn wait(&self) -> OperationResult {
        loop {
            if self.state.load(Ordering::Acquire) == COMPLETED {
                return self.take().unwrap_or(Err(OperationError::Cancelled));
            }

            let listener = self.event.listen();

            if self.state.load(Ordering::Acquire) == COMPLETED {
                return self.take().unwrap_or(Err(OperationError::Cancelled));
            }

            listener.await;
        }
    }

    /// Brings the signal back to its pristine state.
    pub(crate) fn rearm(&self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.state.store(PENDING, Ordering::Release);
    }
}

/// Reusable state of one in-flight socket call.
///
/// A context owns a fixed-size receive buffer allocated once, a view into the
/// payload being sent, the remote endpoint and a [`Signal`]. Contexts are
/// recycled through the [`OperationPool`](super::OperationPool).
pub(crate) struct OperationContext {
    id: usize,
    /// Fixed-size receive buffer.
    buffer: Box<[u8]>,
    /// Number of bytes received into `buffer`.
    len: usize,
    /// Payload of the datagram being sent.
    payload: Bytes,
    remote: Option<SocketAddr>,
    signal: Arc<Signal>,
    disposed: bool,
}

impl OperationContext {
    pub(crate) fn new(id: usize, buffer_size: usize) -> Self {
        Self {
            id,
            buffer: vec![0u8; buffer_size].into_boxed_slice(),
            len: 0,
            payload: Bytes::new(),
            remote: None,
            signal: Arc::new(Signal::new()),
            disposed: false,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Writes an outgoing datagram into the context.
    pub(crate) fn prepare_send(&mut self, payload: Bytes, remote: Option<SocketAddr>) {
        self.payload = payload;
        self.remote = remote;
    }

    /// Issues a `send_to` (or `send` when no remote is set) and waits for its
    /// completion.
    pub(crate) async fn send(&mut self, socket: &UdpSocket, token: &CancellationToken) -> OperationResult {
        let signal = self.signal.clone();
        let payload = &self.payload;
        let remote = self.remote;

        let sync = match remote {
            Some(addr) => socket.try_send_to(payload, addr),
            None => socket.try_send(payload),
        };
        match sync {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let res = select! {
                    biased;
                    res = async {
                        match remote {
                            Some(addr) => socket.send_to(payload, addr).await,
                            None => socket.send(payload).await,
                        }
                    } => res.map_err(OperationError::Socket),
                    _ = token.cancelled() => Err(OperationError::Cancelled),
                };
                signal.claim(res.map(|len| Transferred { len, remote }));
            }
            res => {
                signal.claim(res.map(|len| Transferred { len, remote }).map_err(OperationError::Socket));
            }
        }

        signal.wait().await
    }

    /// Issues a `recv_from` into the fixed receive buffer and waits for its
    /// completion.
    pub(crate) async fn receive(&mut self, socket: &UdpSocket, token: &CancellationToken) -> OperationResult {
        let signal = self.signal.clone();
        let buffer = &mut self.buffer[..];

        let to_transferred = |(len, remote): (usize, SocketAddr)| Transferred {
            len,
            remote: Some(remote),
        };

        match socket.try_recv_from(buffer) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let res = select! {
                    biased;
                    res = socket.recv_from(buffer) => res.map_err(OperationError::Socket),
                    _ = token.cancelled() => Err(OperationError::Cancelled),
                };
                signal.claim(res.map(to_transferred));
            }
            res => {
                signal.claim(res.map(to_transferred).map_err(OperationError::Socket));
            }
        }

        let res = signal.wait().await;
        if let Ok(t) = &res {
            self.len = t.len;
            self.remote = t.remote;
        }
        res
    }

    /// Converts the received bytes into a [`Datagram`].
    ///
    /// The payload is copied out so the receive buffer can be reused.
    pub(crate) fn datagram(&self) -> Datagram {
        let payload = Bytes::copy_from_slice(&self.buffer[..self.len]);
        match self.remote {
            Some(remote) => Datagram::new(payload, remote),
            None => Datagram::unaddressed(payload),
        }
    }

    /// Resets the context to a pristine, reusable state without reallocating.
    pub(crate) fn reset(&mut self) {
        self.len = 0;
        self.payload = Bytes::new();
        self.remote = None;
        self.signal.rearm();
    }

    /// Releases the receive buffer. Disposing twice is a no-op.
    pub(crate) fn dispose(&mut self) -> bool {
        if self.disposed {
            return false;
        }
        self.disposed = true;
        self.buffer = Box::default();
        self.payload = Bytes::new();
        true
    }
}
