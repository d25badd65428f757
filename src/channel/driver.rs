//! Background loops of a duplex channel.
//!
//! A started channel runs three tasks:
//!
//! - the **send loop** pulls datagrams from the outgoing buffer and hands
//!   them to the socket, one pooled operation at a time;
//! - the **receive loop** pulls datagrams from the socket and pushes them to
//!   the incoming buffer;
//! - the **reader watch** stops the channel when the reader closes the
//!   incoming side, even if no datagram arrives afterwards.
//!
//! [`run`] waits for the three tasks, closes both buffers with the channel
//! outcome, releases the pool and the socket, then resolves the channel
//! completion.
//!
//! Every task stops on the `halt` token. The first terminal fault is recorded
//! in [`Core::raise`], which also cancels `halt`.
use std::{
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, OnceLock, PoisonError, Weak,
        atomic::{AtomicU8, Ordering},
    },
};

use async_mutex::Mutex as AsyncMutex;
use futures::FutureExt;
use tokio::{net::UdpSocket, runtime::Handle, select};
use tokio_util::sync::CancellationToken;

use super::{ChannelState, SocketSource};
use crate::{
    datagram::{Datagram, Received},
    error::{Direction, Fault, OperationError, PacketError, RecvError, is_terminal},
    queue::Buffer,
    socket::OperationPool,
    sync::{Completion, spawn},
};

pub(super) type ErrorHandler = Arc<dyn Fn(&PacketError) + Send + Sync>;

/// State shared by a channel handle and its loops.
pub(super) struct Core {
    pub(super) outgoing: Buffer<Datagram>,
    pub(super) incoming: Buffer<Received>,
    pub(super) pool: Arc<OperationPool>,
    /// The socket, `None` until started and once disposed.
    pub(super) socket: AsyncMutex<Option<Arc<UdpSocket>>>,
    /// Taken when the channel starts.
    pub(super) source: Mutex<Option<SocketSource>>,
    pub(super) local_addr: OnceLock<SocketAddr>,
    pub(super) state: AtomicU8,
    fault: OnceLock<Fault>,
    /// Caller supplied token.
    pub(super) token: CancellationToken,
    /// Stops the loops. Child of `token`.
    pub(super) halt: CancellationToken,
    pub(super) completion: Completion,
    pub(super) on_error: Option<ErrorHandler>,
    pub(super) dispose_socket: bool,
    pub(super) runtime: Option<Handle>,
}

impl Core {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        source: SocketSource,
        outgoing: Buffer<Datagram>,
        incoming: Buffer<Received>,
        receive_buffer_size: usize,
        token: CancellationToken,
        on_error: Option<ErrorHandler>,
        dispose_socket: bool,
        runtime: Option<Handle>,
    ) -> Self {
        Self {
            outgoing,
            incoming,
            pool: OperationPool::new(receive_buffer_size),
            socket: AsyncMutex::new(None),
            source: Mutex::new(Some(source)),
            local_addr: OnceLock::new(),
            state: AtomicU8::new(ChannelState::Created as u8),
            fault: OnceLock::new(),
            halt: token.child_token(),
            token,
            completion: Completion::new(),
            on_error,
            dispose_socket,
            runtime,
        }
    }

    pub(super) fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Records a terminal fault and stops both loops.
    ///
    /// Only the first fault is retained. The outgoing buffer is aborted with
    /// it so that blocked writers observe the fault right away.
    pub(super) fn raise(&self, fault: Fault) -> bool {
        let first = self.fault.set(fault.clone()).is_ok();
        if first {
            if fault.is_cancelled() {
                tracing::debug!("Channel cancelled");
            } else {
                tracing::warn!(%fault, "Channel faulted");
            }
            self.outgoing.abort(fault.clone());
            self.close_unstarted(Err(fault));
        }
        self.halt.cancel();
        first
    }

    /// Stops both loops without fault.
    pub(super) fn stop(&self) {
        self.outgoing.complete();
        self.close_unstarted(Ok(()));
        self.halt.cancel();
    }

    /// Resolves a channel that was never started with `outcome`.
    ///
    /// Returns `false` if the channel had already left the created state, in
    /// which case [`run`] or [`Core::abandon`] settle it.
    fn close_unstarted(&self, outcome: Result<(), Fault>) -> bool {
        let state = match &outcome {
            Ok(()) => ChannelState::Completed,
            Err(_) => ChannelState::Faulted,
        };
        if self
            .state
            .compare_exchange(ChannelState::Created as u8, state as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        match &outcome {
            Ok(()) => self.incoming.complete(),
            Err(fault) => self.incoming.fault(fault.clone()),
        };
        if self.dispose_socket {
            drop(self.source.lock().unwrap_or_else(PoisonError::into_inner).take());
        }
        self.pool.shutdown();
        tracing::debug!(?state, "Channel closed before start");
        self.completion.resolve(outcome);
        true
    }

    /// Closes the channel without ever running its loops.
    pub(super) fn abandon(&self, fault: Fault) {
        self.raise(fault.clone());
        self.incoming.fault(fault.clone());
        self.set_state(ChannelState::Faulted);
        self.completion.fault(fault);
    }

    /// Reports a per-datagram failure without stopping the loops.
    async fn report(&self, err: PacketError) {
        tracing::debug!(error = %err, "Datagram failed");
        match &self.on_error {
            Some(handler) => handler(&err),
            None => {
                select! {
                    biased;
                    _ = self.halt.cancelled() => {}
                    _ = self.incoming.send(Err(err)) => {}
                }
            }
        }
    }

    /// Records cancellation if the loops stopped because of the caller token.
    fn observe_cancellation(&self) {
        if self.token.is_cancelled() {
            self.raise(Fault::Cancelled);
        }
    }
}

async fn send_loop(core: Arc<Core>, socket: Arc<UdpSocket>) {
    tracing::debug!("Send loop started");
    loop {
        let res = select! {
            biased;
            _ = core.halt.cancelled() => break,
            res = core.outgoing.recv() => res,
        };
        let datagram = match res {
            Ok(datagram) => datagram,
            Err(RecvError::Faulted(fault)) => {
                core.raise(fault);
                break;
            }
            Err(_) => {
                tracing::debug!("Outgoing side completed");
                core.halt.cancel();
                break;
            }
        };

        let remote = match datagram.remote() {
            Ok(remote) => remote,
            Err(e) => {
                core.report(PacketError::new(Direction::Send, None, e.into())).await;
                continue;
            }
        };

        let mut lease = core.pool.acquire();
        lease.prepare_send(datagram.into_payload(), remote);
        match lease.send(&socket, &core.halt).await {
            Ok(t) => tracing::trace!(len = t.len, ?remote, "Datagram sent"),
            Err(OperationError::Cancelled) => break,
            Err(OperationError::Socket(e)) if is_terminal(&e) => {
                core.raise(Fault::socket(e));
                break;
            }
            Err(OperationError::Socket(e)) => {
                drop(lease);
                core.report(PacketError::new(Direction::Send, remote, e)).await;
            }
        }
    }
    core.observe_cancellation();
    tracing::debug!("Send loop stopped");
}

async fn receive_loop(core: Arc<Core>, socket: Arc<UdpSocket>) {
    tracing::debug!("Receive loop started");
    while !core.halt.is_cancelled() {
        let mut lease = core.pool.acquire();
        let received = match lease.receive(&socket, &core.halt).await {
            Ok(t) => {
                tracing::trace!(len = t.len, remote = ?t.remote, "Datagram received");
                Ok(lease.datagram())
            }
            Err(OperationError::Cancelled) => break,
            Err(OperationError::Socket(e)) if is_terminal(&e) => {
                core.raise(Fault::socket(e));
                break;
            }
            Err(OperationError::Socket(e)) => Err(PacketError::new(Direction::Receive, None, e)),
        };
        drop(lease);

        let datagram = match received {
            Ok(datagram) => datagram,
            Err(err) => {
                core.report(err).await;
                continue;
            }
        };

        let res = select! {
            biased;
            _ = core.halt.cancelled() => break,
            res = core.incoming.send(Ok(datagram)) => res,
        };
        if let Err(err) = res {
            match err.fault {
                Some(fault) => {
                    core.raise(fault);
                }
                None => {
                    tracing::debug!("Incoming side closed by the reader");
                    core.stop();
                }
            }
            break;
        }
    }
    core.observe_cancellation();
    tracing::debug!("Receive loop stopped");
}

/// Stops the channel once the reader closes the incoming side.
async fn watch_reader(core: Arc<Core>) {
    let closed = select! {
        biased;
        _ = core.halt.cancelled() => return,
        closed = core.incoming.closed() => closed,
    };
    match closed {
        Some(fault) => {
            core.raise(fault);
        }
        None => {
            tracing::debug!("Incoming side completed by the reader");
            core.stop();
        }
    }
}

/// Faults the channel as soon as its token is cancelled, started or not.
///
/// Holds the channel weakly so an unstarted channel can still be dropped.
pub(super) async fn watch_token(core: Weak<Core>, token: CancellationToken, completion: Completion) {
    select! {
        biased;
        _ = completion.wait() => {}
        _ = token.cancelled() => {
            if let Some(core) = core.upgrade() {
                core.raise(Fault::Cancelled);
            }
        }
    }
}

/// Runs `future`, turning a panic into a channel fault.
async fn guarded<F>(core: Arc<Core>, name: &'static str, future: F)
where
    F: Future<Output = ()>,
{
    if AssertUnwindSafe(future).catch_unwind().await.is_err() {
        tracing::error!(name, "Loop panicked");
        core.raise(Fault::Panicked(name));
    }
}

/// Installs the socket, runs the channel tasks and finalizes the channel.
pub(super) async fn run(core: Arc<Core>, socket: Arc<UdpSocket>) {
    *core.socket.lock().await = Some(socket.clone());

    let runtime = core.runtime.clone();
    let tx = spawn(
        runtime.as_ref(),
        guarded(core.clone(), "send", send_loop(core.clone(), socket.clone())),
    );
    let rx = spawn(
        runtime.as_ref(),
        guarded(core.clone(), "receive", receive_loop(core.clone(), socket)),
    );
    let reader = spawn(runtime.as_ref(), guarded(core.clone(), "reader", watch_reader(core.clone())));

    for (name, handle) in [("send", tx), ("receive", rx), ("reader", reader)] {
        if handle.await.is_err() {
            core.raise(Fault::Panicked(name));
        }
    }
    core.set_state(ChannelState::Completing);

    let outcome = core.fault.get().cloned().map_or(Ok(()), Err);
    match &outcome {
        Ok(()) => {
            core.outgoing.complete();
            core.incoming.complete();
        }
        Err(fault) => {
            core.outgoing.abort(fault.clone());
            core.incoming.fault(fault.clone());
        }
    }

    let disposed = core.pool.shutdown();
    if core.dispose_socket {
        core.socket.lock().await.take();
    }
    tracing::debug!(disposed, stats = ?core.pool.stats(), "Channel resources released");

    core.set_state(match &outcome {
        Ok(()) => ChannelState::Completed,
        Err(_) => ChannelState::Faulted,
    });
    core.completion.resolve(outcome);
}
