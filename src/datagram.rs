use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use bytes::Bytes;

use crate::error::{AddressError, PacketError};

/// Item delivered on the incoming side of a duplex channel.
///
/// A per-datagram socket failure flows through the channel as data, so that
/// one bad packet does not terminate the transport.
pub type Received = Result<Datagram, PacketError>;

/// One UDP payload together with its remote address and port.
///
/// [`Datagram`] is an immutable value: cloning it only bumps the reference
/// count of the underlying payload buffer.
///
/// For outgoing datagrams the remote address is the destination, for incoming
/// ones it is the source. A datagram without address is sent to the peer the
/// socket is connected to.
///
/// # Examples
///
/// ```
/// use std::net::SocketAddr;
///
/// use udpipe::Datagram;
///
/// let remote: SocketAddr = "127.0.0.1:4242".parse().unwrap();
/// let datagram = Datagram::new(&b"hello"[..], remote);
///
/// assert_eq!(datagram.payload().as_ref(), b"hello");
/// assert_eq!(datagram.address(), &[127, 0, 0, 1]);
/// assert_eq!(datagram.port(), 4242);
/// assert_eq!(datagram.remote(), Ok(Some(remote)));
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Datagram {
    payload: Bytes,
    /// Raw address bytes, empty when absent.
    address: Bytes,
    port: u16,
}

impl Datagram {
    /// Creates a datagram addressed to (or received from) `remote`.
    pub fn new(payload: impl Into<Bytes>, remote: SocketAddr) -> Self {
        let address = match remote.ip() {
            IpAddr::V4(ip) => Bytes::copy_from_slice(&ip.octets()),
            IpAddr::V6(ip) => Bytes::copy_from_slice(&ip.octets()),
        };
        Self {
            payload: payload.into(),
            address,
            port: remote.port(),
        }
    }

    /// Creates a datagram without remote address.
    ///
    /// Such a datagram can only be sent on a connected socket.
    pub fn unaddressed(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            address: Bytes::new(),
            port: 0,
        }
    }

    /// Creates a datagram from raw address bytes without validating them.
    ///
    /// An address whose length is neither 4 (IPv4) nor 16 (IPv6) bytes is
    /// rejected when the datagram is sent, as a per-datagram error.
    pub fn from_raw_parts(payload: impl Into<Bytes>, address: impl Into<Bytes>, port: u16) -> Self {
        Self {
            payload: payload.into(),
            address: address.into(),
            port,
        }
    }

    /// Payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Raw remote address bytes, empty when absent.
    pub fn address(&self) -> &[u8] {
        &self.address
    }

    /// Remote port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the remote endpoint, `None` if the datagram has no address.
    ///
    /// # Errors
    ///
    /// Fails if the raw address is neither 4 nor 16 bytes long.
    pub fn remote(&self) -> Result<Option<SocketAddr>, AddressError> {
        let ip: IpAddr = match self.address.len() {
            0 => return Ok(None),
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.address);
                Ipv4Addr::from(octets).into()
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.address);
                Ipv6Addr::from(octets).into()
            }
            len => return Err(AddressError(len)),
        };
        Ok(Some(SocketAddr::new(ip, self.port)))
    }

    /// Returns a datagram with the same address and a different payload.
    #[must_use]
    pub fn with_payload(&self, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            address: self.address.clone(),
            port: self.port,
        }
    }

    /// Consumes the datagram, returning its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl fmt::Debug for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Datagram");
        match self.remote() {
            Ok(remote) => s.field("remote", &remote),
            Err(_) => s.field("address", &self.address).field("port", &self.port),
        };
        s.field("len", &self.payload.len()).finish()
    }
}
