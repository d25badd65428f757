//! Duplex datagram channel.
//!
//! A [`DuplexChannel`] owns one UDP socket and exposes two bounded buffers:
//! the **outgoing** side the caller writes datagrams to, and the **incoming**
//! side the caller reads datagrams (or per-datagram errors) from.
//!
//! ```text
//!            ┌──────────────── DuplexChannel ───────────────┐
//!  send ───► │ [outgoing] ──► send loop ──────────┐         │
//!            │                                    ▼         │
//!            │                                  socket ◄──► │ network
//!            │                                    │         │
//!  recv ◄─── │ [incoming] ◄── receive loop ◄──────┘         │
//!            └──────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! A channel is [`Created`](ChannelState::Created) by [`ChannelBuilder::build`]
//! and begins [`Running`](ChannelState::Running) on [`DuplexChannel::start`].
//! It then ends in one of two ways:
//!
//! - **Gracefully**, when the caller [completes](DuplexChannel::complete) the
//!   outgoing side: the send loop drains it, the receive loop is stopped, the
//!   incoming side is closed and the completion resolves with `Ok(())`.
//! - **With a fault**, on cancellation, on a terminal socket error or on an
//!   explicit [`DuplexChannel::fault`]: both loops stop, both sides are closed
//!   with the first fault and the completion resolves with it.
//!
//! Closing the incoming side from the reader end stops the channel as well:
//! gracefully when [completed](Buffer::complete), with the fault otherwise.
//! A channel faulted or stopped before it was started is closed at once.
//!
//! Errors affecting a single datagram never end the channel. They are given
//! to the [`on_error`](ChannelBuilder::on_error) callback if one is set, and
//! delivered as `Err` items on the incoming side otherwise.
mod driver;
mod pipelined;

use std::{
    fmt, io,
    net::{SocketAddr, UdpSocket as StdUdpSocket},
    sync::{Arc, PoisonError, atomic::Ordering},
};

pub use pipelined::PipelinedChannel;
use tokio::{net::UdpSocket, runtime::Handle};
use tokio_util::sync::CancellationToken;

use self::driver::{Core, ErrorHandler};
use crate::{
    datagram::{Datagram, Received},
    error::{Fault, PacketError, RecvError, SendError},
    queue::{Buffer, FullMode, TrySendError},
    socket::PoolStats,
    sync::{Completion, spawn},
};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_527;

/// Where a channel gets its socket from.
pub enum SocketSource {
    /// A socket bound by the caller.
    Socket(Arc<UdpSocket>),
    /// A socket bound by the channel when it starts, optionally connected to
    /// a default remote endpoint.
    Bind {
        /// Local endpoint to bind to.
        local: SocketAddr,
        /// Default remote endpoint of unaddressed datagrams.
        remote: Option<SocketAddr>,
    },
}

impl SocketSource {
    /// A socket bound to `local` when the channel starts.
    pub fn bind(local: SocketAddr) -> Self {
        SocketSource::Bind { local, remote: None }
    }

    /// A socket bound to `local` and connected to `remote` when the channel
    /// starts.
    pub fn connect(local: SocketAddr, remote: SocketAddr) -> Self {
        SocketSource::Bind {
            local,
            remote: Some(remote),
        }
    }

    fn open(self) -> io::Result<Arc<UdpSocket>> {
        match self {
            SocketSource::Socket(socket) => Ok(socket),
            SocketSource::Bind { local, remote } => {
                let socket = StdUdpSocket::bind(local)?;
                if let Some(remote) = remote {
                    socket.connect(remote)?;
                }
                socket.set_nonblocking(true)?;
                Ok(Arc::new(UdpSocket::from_std(socket)?))
            }
        }
    }
}

impl From<UdpSocket> for SocketSource {
    fn from(socket: UdpSocket) -> Self {
        SocketSource::Socket(Arc::new(socket))
    }
}

impl From<Arc<UdpSocket>> for SocketSource {
    fn from(socket: Arc<UdpSocket>) -> Self {
        SocketSource::Socket(socket)
    }
}

impl From<SocketAddr> for SocketSource {
    fn from(local: SocketAddr) -> Self {
        SocketSource::bind(local)
    }
}

impl fmt::Debug for SocketSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketSource::Socket(socket) => f.debug_tuple("Socket").field(&socket.local_addr().ok()).finish(),
            SocketSource::Bind { local, remote } => f
                .debug_struct("Bind")
                .field("local", local)
                .field("remote", remote)
                .finish(),
        }
    }
}

/// Lifecycle state of a [`DuplexChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Built but not started.
    Created = 0,
    /// Both loops are running.
    Running = 1,
    /// Both loops have stopped; resources are being released.
    Completing = 2,
    /// Stopped gracefully.
    Completed = 3,
    /// Stopped with a fault.
    Faulted = 4,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChannelState::Created,
            1 => ChannelState::Running,
            2 => ChannelState::Completing,
            3 => ChannelState::Completed,
            _ => ChannelState::Faulted,
        }
    }

    /// Returns `true` once the channel has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Completed | ChannelState::Faulted)
    }
}

/// A UDP socket driven by a send loop and a receive loop.
///
/// [`DuplexChannel`] is cheaply cloneable: clones share the same socket and
/// buffers.
///
/// # Examples
///
/// ```
/// use udpipe::Datagram;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = udpipe::channel("127.0.0.1:0".parse::<std::net::SocketAddr>()?).build();
/// channel.start()?;
///
/// // Send a datagram to ourselves
/// let local = channel.local_addr().unwrap();
/// channel.send(Datagram::new(&b"ping"[..], local)).await?;
///
/// let datagram = channel.recv().await??;
/// assert_eq!(datagram.payload().as_ref(), b"ping");
///
/// channel.complete();
/// channel.completion().wait().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DuplexChannel {
    core: Arc<Core>,
}

impl DuplexChannel {
    /// Starts the channel: binds the socket if needed and spawns both loops.
    ///
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Fails if the socket could not be bound. The channel is faulted with
    /// the same error.
    ///
    /// # Panics
    ///
    /// Panics if no runtime was given to the builder and the caller is not
    /// running inside a Tokio runtime.
    pub fn start(&self) -> Result<(), Fault> {
        if self
            .core
            .state
            .compare_exchange(
                ChannelState::Created as u8,
                ChannelState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }

        let _enter = self.core.runtime.as_ref().map(Handle::enter);
        let source = self.core.source.lock().unwrap_or_else(PoisonError::into_inner).take();
        let opened = match source {
            Some(source) => source.open(),
            None => Err(io::Error::other("socket source already consumed")),
        };
        let socket = match opened {
            Ok(socket) => socket,
            Err(e) => {
                let fault = Fault::socket(e);
                tracing::warn!(%fault, "Failed to open socket");
                self.core.abandon(fault.clone());
                return Err(fault);
            }
        };

        if let Ok(addr) = socket.local_addr() {
            let _ = self.core.local_addr.set(addr);
            tracing::debug!(local = %addr, "Starting channel");
        }
        spawn(self.core.runtime.as_ref(), driver::run(self.core.clone(), socket));
        Ok(())
    }

    /// Enqueues an outgoing datagram, suspending while the outgoing side is
    /// full.
    ///
    /// # Errors
    ///
    /// Fails if the outgoing side is closed; the datagram is handed back.
    pub async fn send(&self, datagram: Datagram) -> Result<(), SendError<Datagram>> {
        self.core.outgoing.send(datagram).await
    }

    /// Enqueues an outgoing datagram without waiting.
    pub fn try_send(&self, datagram: Datagram) -> Result<(), TrySendError<Datagram>> {
        self.core.outgoing.try_send(datagram)
    }

    /// Receives the next incoming datagram or per-datagram error.
    ///
    /// # Errors
    ///
    /// Fails once the channel has stopped and the incoming side is drained.
    pub async fn recv(&self) -> Result<Received, RecvError> {
        self.core.incoming.recv().await
    }

    /// The outgoing buffer.
    pub fn writer(&self) -> &Buffer<Datagram> {
        &self.core.outgoing
    }

    /// The incoming buffer.
    pub fn reader(&self) -> &Buffer<Received> {
        &self.core.incoming
    }

    /// Signals that no more datagrams will be sent.
    ///
    /// Already enqueued datagrams are still sent, then the channel stops
    /// gracefully.
    pub fn complete(&self) -> bool {
        self.core.outgoing.complete()
    }

    /// Faults the channel. Pending outgoing datagrams are discarded.
    ///
    /// A channel that was never started is closed on the spot and
    /// [`start`](Self::start) becomes a no-op. Returns `false` if the channel
    /// had already faulted.
    pub fn fault(&self, fault: Fault) -> bool {
        self.core.raise(fault)
    }

    /// Stops the channel right away and gracefully. Pending outgoing
    /// datagrams are not sent.
    ///
    /// A channel that was never started is closed on the spot.
    pub fn stop(&self) {
        tracing::debug!("Stopping channel");
        self.core.stop();
    }

    /// Terminal signal of the channel.
    pub fn completion(&self) -> Completion {
        self.core.completion.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.core.state.load(Ordering::Acquire))
    }

    /// Local endpoint of the socket, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr.get().copied()
    }

    /// The socket, `None` before start and once disposed.
    pub async fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.core.socket.lock().await.clone()
    }

    /// Counters of the operation pool.
    pub fn pool_stats(&self) -> PoolStats {
        self.core.pool.stats()
    }

    /// The cancellation token of the channel.
    pub fn token(&self) -> &CancellationToken {
        &self.core.token
    }
}

impl fmt::Debug for DuplexChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexChannel")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("outgoing", &self.core.outgoing)
            .field("incoming", &self.core.incoming)
            .finish()
    }
}

impl crate::pipeline::Target<Datagram> for DuplexChannel {
    fn offer(&self, item: Datagram) -> impl Future<Output = Result<(), SendError<Datagram>>> + Send {
        self.core.outgoing.send(item)
    }

    fn complete(&self) -> bool {
        DuplexChannel::complete(self)
    }

    fn fault(&self, fault: Fault) -> bool {
        DuplexChannel::fault(self, fault)
    }

    fn completion(&self) -> Completion {
        DuplexChannel::completion(self)
    }
}

impl crate::pipeline::Source<Received> for DuplexChannel {
    fn recv(&self) -> impl Future<Output = Result<Received, RecvError>> + Send {
        self.core.incoming.recv()
    }

    fn fault(&self, fault: Fault) -> bool {
        DuplexChannel::fault(self, fault)
    }

    fn completion(&self) -> Completion {
        DuplexChannel::completion(self)
    }
}

/// Builder for configuring and creating a [`DuplexChannel`].
pub struct ChannelBuilder {
    source: SocketSource,
    outgoing_capacity: usize,
    incoming_capacity: usize,
    full_mode: FullMode,
    dispose_socket: bool,
    on_error: Option<ErrorHandler>,
    runtime: Option<Handle>,
    token: CancellationToken,
    receive_buffer_size: usize,
}

impl ChannelBuilder {
    /// Sets the capacity of the outgoing side.
    ///
    /// Default: 64 datagrams
    #[must_use]
    pub fn outgoing_capacity(mut self, capacity: usize) -> Self {
        self.outgoing_capacity = capacity;
        self
    }

    /// Sets the capacity of the incoming side.
    ///
    /// Default: 64 datagrams
    #[must_use]
    pub fn incoming_capacity(mut self, capacity: usize) -> Self {
        self.incoming_capacity = capacity;
        self
    }

    /// Sets the policy applied by both sides when full.
    ///
    /// With anything but [`FullMode::Wait`], a slow reader makes the channel
    /// drop datagrams instead of slowing down the receive loop.
    ///
    /// Default: [`FullMode::Wait`]
    #[must_use]
    pub fn full_mode(mut self, mode: FullMode) -> Self {
        self.full_mode = mode;
        self
    }

    /// Sets whether the channel releases its socket once stopped.
    ///
    /// When `false`, [`DuplexChannel::socket`] keeps returning the socket
    /// after the channel has stopped.
    ///
    /// Default: `true`
    #[must_use]
    pub fn dispose_socket(mut self, dispose: bool) -> Self {
        self.dispose_socket = dispose;
        self
    }

    /// Sets the callback invoked for every per-datagram error.
    ///
    /// Without a callback, per-datagram errors are delivered as `Err` items on
    /// the incoming side.
    #[must_use]
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&PacketError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Sets the runtime the loops are spawned on.
    ///
    /// Default: the current runtime
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Sets the cancellation token. Cancelling it faults the channel with
    /// [`Fault::Cancelled`], even before it is started.
    #[must_use]
    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Sets the size of the buffer datagrams are received into. Longer
    /// datagrams are truncated.
    ///
    /// Default: 65_527 bytes ([`MAX_DATAGRAM_SIZE`])
    #[must_use]
    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    /// Builds the channel. No datagram moves until [`DuplexChannel::start`].
    ///
    /// Inside a runtime, a task watching the cancellation token is spawned
    /// right away so that cancelling an unstarted channel closes it.
    ///
    /// # Panics
    ///
    /// Panics if a capacity is zero.
    pub fn build(self) -> DuplexChannel {
        let Self {
            source,
            outgoing_capacity,
            incoming_capacity,
            full_mode,
            dispose_socket,
            on_error,
            runtime,
            token,
            receive_buffer_size,
        } = self;

        let core = Core::new(
            source,
            Buffer::with_mode(outgoing_capacity, full_mode),
            Buffer::with_mode(incoming_capacity, full_mode),
            receive_buffer_size,
            token,
            on_error,
            dispose_socket,
            runtime,
        );
        let core = Arc::new(core);

        // Observe the token before start when a runtime is at hand; start
        // observes it otherwise
        if let Some(handle) = core.runtime.clone().or_else(|| Handle::try_current().ok()) {
            handle.spawn(driver::watch_token(
                Arc::downgrade(&core),
                core.token.clone(),
                core.completion.clone(),
            ));
        }
        DuplexChannel { core }
    }
}

/// Creates a new duplex channel over `source`.
///
/// `source` is either a socket the caller already bound, or the local
/// endpoint the channel binds when started.
pub fn channel(source: impl Into<SocketSource>) -> ChannelBuilder {
    ChannelBuilder {
        source: source.into(),
        outgoing_capacity: 64,
        incoming_capacity: 64,
        full_mode: FullMode::Wait,
        dispose_socket: true,
        on_error: None,
        runtime: None,
        token: CancellationToken::new(),
        receive_buffer_size: MAX_DATAGRAM_SIZE,
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use tokio::time::timeout;

    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let channel = channel(loopback()).build();
        assert_eq!(channel.state(), ChannelState::Created);
        assert_eq!(channel.local_addr(), None);

        channel.start().unwrap();
        let local = channel.local_addr().unwrap();
        channel.start().unwrap();
        assert_eq!(channel.local_addr(), Some(local));
        assert_eq!(channel.state(), ChannelState::Running);

        channel.stop();
        timeout(Duration::from_secs(1), channel.completion().wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel.state(), ChannelState::Completed);
        assert!(channel.socket().await.is_none());
    }

    #[tokio::test]
    async fn test_bind_failure_faults() {
        let taken = UdpSocket::bind(loopback()).await.unwrap();
        let channel = channel(taken.local_addr().unwrap()).build();

        let err = channel.start().unwrap_err();
        assert!(matches!(err, Fault::Socket(_)));
        assert_eq!(channel.state(), ChannelState::Faulted);
        assert!(matches!(channel.completion().outcome(), Some(Err(Fault::Socket(_)))));
        assert!(channel.send(Datagram::unaddressed(&b"x"[..])).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_socket_outlives_channel() {
        let socket = Arc::new(UdpSocket::bind(loopback()).await.unwrap());
        let channel = channel(socket.clone()).dispose_socket(false).build();
        channel.start().unwrap();
        channel.complete();

        timeout(Duration::from_secs(1), channel.completion().wait())
            .await
            .unwrap()
            .unwrap();
        let kept = channel.socket().await.unwrap();
        assert!(Arc::ptr_eq(&kept, &socket));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_callback() {
        let errors = Arc::new(AtomicUsize::new(0));
        let c_errors = errors.clone();
        let channel = channel(loopback())
            .on_error(move |_| {
                c_errors.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        channel.start().unwrap();
        let local = channel.local_addr().unwrap();

        // No default remote: the datagram cannot be sent
        channel.send(Datagram::unaddressed(&b"lost"[..])).await.unwrap();
        channel.send(Datagram::new(&b"ok"[..], local)).await.unwrap();

        let received = timeout(Duration::from_secs(1), channel.recv()).await.unwrap().unwrap();
        assert_eq!(received.unwrap().payload().as_ref(), b"ok");
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ChannelState::Running);

        channel.complete();
        timeout(Duration::from_secs(1), channel.completion().wait())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_fault_before_start_closes_both_sides() {
        let channel = channel(loopback()).build();
        let reader = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(channel.fault(Fault::Cancelled));
        let res = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(matches!(res, Err(RecvError::Faulted(Fault::Cancelled))));
        assert!(channel.completion().outcome().unwrap().unwrap_err().is_cancelled());
        assert_eq!(channel.state(), ChannelState::Faulted);

        // Starting afterwards does nothing
        channel.start().unwrap();
        assert_eq!(channel.state(), ChannelState::Faulted);
        assert_eq!(channel.local_addr(), None);
    }

    #[tokio::test]
    async fn test_stop_before_start_completes() {
        let channel = channel(loopback()).build();
        channel.stop();

        assert_eq!(channel.state(), ChannelState::Completed);
        assert!(matches!(channel.completion().outcome(), Some(Ok(()))));
        assert!(matches!(channel.recv().await, Err(RecvError::Closed)));
        assert!(channel.send(Datagram::unaddressed(&b"x"[..])).await.is_err());
    }

    #[tokio::test]
    async fn test_token_closes_unstarted_channel() {
        let token = CancellationToken::new();
        let channel = channel(loopback()).token(token.clone()).build();
        let reader = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.recv().await })
        };

        token.cancel();
        let res = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(matches!(res, Err(RecvError::Faulted(Fault::Cancelled))));
        assert_eq!(channel.state(), ChannelState::Faulted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fault_closes_both_sides() {
        let channel = channel(loopback()).build();
        channel.start().unwrap();

        // A reader blocked on the empty incoming side
        let reader = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(channel.fault(Fault::Cancelled));
        assert!(!channel.fault(Fault::Timeout(Duration::from_secs(1))));

        let res = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(matches!(res, Err(RecvError::Faulted(Fault::Cancelled))));
        let res = timeout(Duration::from_secs(1), channel.completion().wait()).await.unwrap();
        assert!(res.unwrap_err().is_cancelled());
        assert_eq!(channel.state(), ChannelState::Faulted);
        assert!(channel.send(Datagram::unaddressed(&b"x"[..])).await.is_err());
    }
}
