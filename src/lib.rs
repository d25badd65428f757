//! Udpipe: an asynchronous UDP channel with back-pressured buffers,
//! composable processing stages and datagram middleware.
//!
//! Udpipe wraps a UDP socket into a [`DuplexChannel`]: the application
//! writes datagrams to a bounded outgoing buffer and reads datagrams from a
//! bounded incoming buffer, while two background loops move them between the
//! buffers and the socket. Socket operations are driven through a pool of
//! reusable operation contexts, so a running channel does not allocate
//! receive buffers per datagram.
//!
//! # Overview
//!
//! ```text
//!  APPLICATION SEND                                    User code   :
//!  ┌────┐ ┌────┐ ┌────┐                                            :
//!  │ D1 │ │ D2 │ │ D3 │                                            :
//!  └─┬──┘ └─┬──┘ └─┬──┘                                            :
//!    ▼      ▼      ▼                                               :
//! ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ :
//!  OUTBOUND MIDDLEWARE   [compress] → [encrypt] → ...   Udpipe code :
//!  ┌──────────────────────────────────────────────────────────────┐:
//!  │ outgoing: [D1][D2][D3]  ── send loop ──►  socket ──► Network │:
//!  │ incoming: [D1][D2][D3]  ◄─ receive loop ◄ socket ◄── Network │:
//!  └──────────────────────────────────────────────────────────────┘:
//!  INBOUND MIDDLEWARE    ... → [decrypt] → [decompress]            :
//! ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ :
//!    ▼      ▼      ▼                                               :
//!  APPLICATION RECEIVE                                 User code   :
//! ```
//!
//! # Features
//!
//! - **Back-pressure**: every hand-off goes through a bounded [`Buffer`];
//!   choose between waiting ([`FullMode::Wait`]) or dropping
//!   ([`FullMode::DropWrite`], [`FullMode::DropOldest`]) under load
//! - **Failure isolation**: errors affecting a single datagram are reported
//!   as [`PacketError`]s and never end the channel; terminal socket errors,
//!   cancellation and explicit faults close it with a [`Fault`]
//! - **Completion propagation**: every building block exposes a
//!   [`Completion`] and closing one end of an assembly closes the rest
//! - **Stages**: [`stage`] turns an async function into a processing step
//!   with configurable parallelism
//! - **Middleware**: a [`Pipeline`] of [`Middleware`] wraps a channel into a
//!   [`PipelinedChannel`], outbound in registration order and inbound in
//!   reverse order
//! - **Idle timeout**: [`idle_timeout`] faults a target that sees no traffic
//!   within a window
//!
//! # Quick Start
//!
//! ```no_run
//! use std::net::SocketAddr;
//!
//! use udpipe::Datagram;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let local: SocketAddr = "127.0.0.1:9000".parse()?;
//!     let peer: SocketAddr = "127.0.0.1:9001".parse()?;
//!
//!     let channel = udpipe::channel(local).outgoing_capacity(128).build();
//!     channel.start()?;
//!
//!     channel.send(Datagram::new(&b"hello"[..], peer)).await?;
//!     match channel.recv().await? {
//!         Ok(datagram) => println!("{:?} from {:?}", datagram.payload(), datagram.remote()?),
//!         Err(e) => println!("Datagram failed: {e}"),
//!     }
//!
//!     channel.complete();
//!     channel.completion().wait().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Buffers
//!
//! [`Buffer`] is a bounded FIFO that can be closed gracefully or with a
//! fault. Buffered items stay drainable after a graceful close:
//!
//! ```
//! use udpipe::{Buffer, RecvError};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let buffer = Buffer::bounded(4);
//! buffer.send(1).await.unwrap();
//! buffer.send(2).await.unwrap();
//! buffer.complete();
//!
//! assert_eq!(buffer.recv().await.unwrap(), 1);
//! assert_eq!(buffer.recv().await.unwrap(), 2);
//! assert!(matches!(buffer.recv().await, Err(RecvError::Closed)));
//! assert!(buffer.completion().wait().await.is_ok());
//! # }
//! ```
//!
//! # Middleware
//!
//! A [`Middleware`] sees each datagram once per direction and hands the
//! result to [`Next`]. It may transform, drop or multiply datagrams:
//!
//! ```
//! use futures::future::BoxFuture;
//! use udpipe::{BoxError, Datagram, Middleware, Next, Pipeline};
//!
//! /// Drops empty datagrams on the way out.
//! struct SkipEmpty;
//!
//! impl Middleware for SkipEmpty {
//!     fn send(&self, datagram: Datagram, next: Next<Datagram>) -> BoxFuture<'_, Result<(), BoxError>> {
//!         Box::pin(async move {
//!             if !datagram.is_empty() {
//!                 next.send(datagram).await?;
//!             }
//!             Ok::<_, BoxError>(())
//!         })
//!     }
//! }
//!
//! let pipeline = Pipeline::new().use_after(SkipEmpty);
//! assert_eq!(pipeline.len(), 1);
//! ```
//!
//! # Performance Considerations
//!
//! ## Buffer capacities
//!
//! Configure via [`ChannelBuilder::outgoing_capacity()`] and
//! [`ChannelBuilder::incoming_capacity()`]. Larger buffers absorb bursts at
//! the cost of memory and latency; smaller buffers push back on the
//! application sooner.
//!
//! ## Receive buffer size
//!
//! Configure via [`ChannelBuilder::receive_buffer_size()`]. Every pooled
//! operation context owns one buffer of this size. Datagrams larger than the
//! buffer are truncated by the operating system. The default is
//! [`MAX_DATAGRAM_SIZE`].
//!
//! ## Stage parallelism
//!
//! A [`Stage`] with a parallelism greater than one runs its transform
//! concurrently and does not preserve ordering between items.
mod channel;
mod datagram;
mod error;
mod pipeline;
mod queue;
mod socket;
mod sync;

pub use channel::{
    ChannelBuilder, ChannelState, DuplexChannel, MAX_DATAGRAM_SIZE, PipelinedChannel, SocketSource, channel,
};
pub use datagram::{Datagram, Received};
pub use error::{
    AddressError, BoxError, Direction, Fault, OperationError, PacketError, RecvError, SendError, is_terminal,
};
pub use pipeline::{
    Chain, IdleTimeout, IdleTimeoutBuilder, LinkOptions, Middleware, Next, Pipeline, Source, Stage, StageBuilder,
    Target, idle_timeout, link, stage,
};
pub use queue::{Buffer, FullMode, TrySendError};
pub use socket::PoolStats;
pub use sync::Completion;
