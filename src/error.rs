//! Error types shared by buffers, channels, stages and timeouts.
//!
//! Errors fall in two families:
//!
//! - **Terminal** errors are carried by a [`Fault`]. A fault closes the entity
//!   it is raised on exactly once (first fault wins) and is observed by every
//!   caller awaiting its [`Completion`](crate::Completion).
//! - **Recoverable** errors are carried by a [`PacketError`]. They concern a
//!   single datagram and never tear down the channel that reported them.
use std::{error::Error as StdError, fmt, io, net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;

/// Boxed error returned by user supplied transforms.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Terminal error of a channel, buffer or stage.
///
/// [`Fault`] is cheaply cloneable so that the same error can be delivered to
/// every party observing the closed entity.
#[derive(Debug, Clone, Error)]
pub enum Fault {
    /// The entity was cancelled through its cancellation token.
    ///
    /// Cancellation propagates exactly like any other terminal error but can be
    /// told apart by callers who want to treat "I asked it to stop" differently
    /// from "it broke".
    #[error("The operation was cancelled")]
    Cancelled,

    /// No item flowed through an idle-timeout decorator within its window.
    #[error("No activity within {0:?}")]
    Timeout(Duration),

    /// A terminal socket failure, e.g. the socket became unusable while an
    /// operation was outstanding.
    #[error("Socket failure: {0}")]
    Socket(Arc<io::Error>),

    /// A user transform returned an error.
    #[error("Transform failed: {0}")]
    Transform(Arc<dyn StdError + Send + Sync + 'static>),

    /// A background loop terminated abnormally.
    #[error("The {0} loop terminated abnormally")]
    Panicked(&'static str),
}

impl Fault {
    pub(crate) fn socket(err: io::Error) -> Self {
        Fault::Socket(Arc::new(err))
    }

    pub(crate) fn transform(err: BoxError) -> Self {
        Fault::Transform(Arc::from(err))
    }

    /// Returns `true` if this fault was caused by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Fault::Cancelled)
    }

    /// Returns `true` if this fault was raised by an idle timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Fault::Timeout(_))
    }
}

/// Direction of the socket call that produced a [`PacketError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// An outgoing `send_to` call.
    Send,
    /// An incoming `recv_from` call.
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

/// A recoverable failure affecting a single datagram.
///
/// Typical causes are an unreachable destination, a payload too large for the
/// socket, an address family mismatch or an invalid destination address.
#[derive(Debug, Clone, Error)]
#[error("Failed to {direction} datagram (remote: {remote:?}): {source}")]
pub struct PacketError {
    direction: Direction,
    remote: Option<SocketAddr>,
    #[source]
    source: Arc<io::Error>,
}

impl PacketError {
    pub(crate) fn new(direction: Direction, remote: Option<SocketAddr>, source: io::Error) -> Self {
        Self {
            direction,
            remote,
            source: Arc::new(source),
        }
    }

    /// Direction of the failed socket call.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Remote endpoint involved in the failed call, if known.
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Kind of the underlying io error.
    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

/// Error returned when raw address bytes do not describe an IP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid address length {0}: expected 4 (IPv4) or 16 (IPv6) bytes")]
pub struct AddressError(pub usize);

impl From<AddressError> for io::Error {
    fn from(err: AddressError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, err)
    }
}

/// Error returned when offering an item to a closed buffer, stage or channel.
///
/// The rejected item is handed back to the caller.
pub struct SendError<T> {
    /// The item that could not be delivered.
    pub item: T,
    /// The fault the target was closed with, if any.
    pub fault: Option<Fault>,
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError").field("fault", &self.fault).finish_non_exhaustive()
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fault {
            Some(fault) => write!(f, "The target is closed: {fault}"),
            None => f.write_str("The target is closed"),
        }
    }
}

impl<T> StdError for SendError<T> {}

impl<T> SendError<T> {
    /// Consumes the error, returning the rejected item.
    pub fn into_inner(self) -> T {
        self.item
    }
}

/// Error returned when receiving from a closed, drained source.
#[derive(Debug, Clone, Error)]
pub enum RecvError {
    /// The source was closed gracefully and every buffered item was consumed.
    #[error("The source has been closed and no more items can be received")]
    Closed,

    /// The source was closed with a fault.
    #[error("The source has faulted: {0}")]
    Faulted(Fault),

    /// No item arrived within the requested time.
    ///
    /// This is **not** a terminal error: the source remains open.
    #[error("Timed out while waiting for new data")]
    Timeout,
}

impl RecvError {
    pub(crate) fn from_close(fault: Option<Fault>) -> Self {
        match fault {
            Some(f) => RecvError::Faulted(f),
            None => RecvError::Closed,
        }
    }
}

/// Outcome of one socket operation.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The OS reported a failure.
    #[error(transparent)]
    Socket(#[from] io::Error),
    /// Cancellation won the race against the OS completion.
    #[error("The socket operation was cancelled")]
    Cancelled,
}

/// Classifies socket errors that leave the socket unusable.
///
/// Any other error is considered to affect a single datagram only. In
/// particular `NotConnected`, which UDP reports for an unaddressed datagram on
/// an unconnected socket, is per-packet.
pub fn is_terminal(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    matches!(err.kind(), BrokenPipe | ConnectionAborted)
        || err.raw_os_error().is_some_and(|code| DEAD_SOCKET_CODES.contains(&code))
}

/// OS error codes for a closed descriptor and a descriptor that is not a
/// socket (`EBADF`, `ENOTSOCK`).
#[cfg(any(target_os = "linux", target_os = "android"))]
const DEAD_SOCKET_CODES: &[i32] = &[9, 88];
#[cfg(any(
    target_vendor = "apple",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
const DEAD_SOCKET_CODES: &[i32] = &[9, 38];
#[cfg(windows)]
const DEAD_SOCKET_CODES: &[i32] = &[10009, 10038];
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    windows
)))]
const DEAD_SOCKET_CODES: &[i32] = &[];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(is_terminal(&io::Error::from(io::ErrorKind::BrokenPipe)));
        for &code in DEAD_SOCKET_CODES {
            assert!(is_terminal(&io::Error::from_raw_os_error(code)));
        }
        assert!(!is_terminal(&io::Error::from(io::ErrorKind::NotConnected)));

        assert!(!is_terminal(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!is_terminal(&io::Error::from(io::ErrorKind::InvalidInput)));
        assert!(!is_terminal(&AddressError(5).into()));
    }

    #[test]
    fn test_fault_kinds() {
        assert!(Fault::Cancelled.is_cancelled());
        assert!(!Fault::Cancelled.is_timeout());
        assert!(Fault::Timeout(Duration::from_secs(1)).is_timeout());

        let fault = Fault::socket(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(fault.to_string().starts_with("Socket failure"));
    }

    #[test]
    fn test_send_error_returns_item() {
        let err = SendError {
            item: 42,
            fault: Some(Fault::Cancelled),
        };
        assert_eq!(err.to_string(), "The target is closed: The operation was cancelled");
        assert_eq!(err.into_inner(), 42);

        let err = SendError { item: 1, fault: None };
        assert_eq!(err.to_string(), "The target is closed");
    }
}
