use std::fmt;

use super::DuplexChannel;
use crate::{
    datagram::{Datagram, Received},
    error::{Fault, RecvError, SendError},
    pipeline::{Chain, LinkOptions, Pipeline, link},
    sync::{Completion, all, spawn},
};

/// A [`DuplexChannel`] with middleware on both sides.
///
/// Outgoing datagrams go through the outbound chain of the [`Pipeline`]
/// before reaching the channel; incoming datagrams go through the inbound
/// chain before reaching the caller. Completion and faults propagate across
/// the whole assembly in both directions.
///
/// # Examples
///
/// ```
/// use udpipe::{Datagram, Pipeline, PipelinedChannel};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = udpipe::channel("127.0.0.1:0".parse::<std::net::SocketAddr>()?).build();
/// let channel = PipelinedChannel::new(channel, &Pipeline::new());
/// channel.start()?;
///
/// let local = channel.channel().local_addr().unwrap();
/// channel.send(Datagram::new(&b"ping"[..], local)).await?;
/// assert_eq!(channel.recv().await??.payload().as_ref(), b"ping");
///
/// channel.complete();
/// channel.completion().wait().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PipelinedChannel {
    channel: DuplexChannel,
    outbound: Chain<Datagram>,
    inbound: Chain<Received>,
    completion: Completion,
}

impl PipelinedChannel {
    /// Attaches the chains of `pipeline` to `channel`.
    ///
    /// # Panics
    ///
    /// Panics if the channel has no runtime and the caller is not running
    /// inside a Tokio runtime.
    pub fn new(channel: DuplexChannel, pipeline: &Pipeline) -> Self {
        let outbound = pipeline.outbound();
        let inbound = pipeline.inbound();
        let runtime = channel.core.runtime.as_ref();

        link(outbound.clone(), channel.clone(), LinkOptions::BIDIRECTIONAL, runtime);
        link(channel.clone(), inbound.clone(), LinkOptions::BIDIRECTIONAL, runtime);

        let completion = Completion::new();
        let done = all(vec![outbound.completion(), channel.completion()]);
        let c_completion = completion.clone();
        spawn(runtime, async move {
            c_completion.resolve(done.await);
        });

        Self {
            channel,
            outbound,
            inbound,
            completion,
        }
    }

    /// Starts the underlying channel.
    pub fn start(&self) -> Result<(), Fault> {
        self.channel.start()
    }

    /// Enqueues a datagram on the outbound chain.
    pub async fn send(&self, datagram: Datagram) -> Result<(), SendError<Datagram>> {
        self.outbound.offer(datagram).await
    }

    /// Receives the next item from the inbound chain.
    pub async fn recv(&self) -> Result<Received, RecvError> {
        self.inbound.recv().await
    }

    /// Signals that no more datagrams will be sent. Completion cascades
    /// through the outbound chain to the channel, then to the inbound chain.
    pub fn complete(&self) -> bool {
        self.outbound.complete()
    }

    /// Faults the channel and both chains.
    pub fn fault(&self, fault: Fault) -> bool {
        let outbound = self.outbound.fault(fault.clone());
        let channel = self.channel.fault(fault.clone());
        let inbound = self.inbound.fault(fault);
        outbound || channel || inbound
    }

    /// Stops the underlying channel right away.
    pub fn stop(&self) {
        self.channel.stop();
    }

    /// Resolves once both the outbound chain and the channel are done, or on
    /// the first fault.
    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// The underlying channel.
    pub fn channel(&self) -> &DuplexChannel {
        &self.channel
    }
}

impl fmt::Debug for PipelinedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelinedChannel")
            .field("channel", &self.channel)
            .field("outbound", &self.outbound)
            .field("inbound", &self.inbound)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use futures::future::BoxFuture;
    use tokio::time::timeout;

    use super::*;
    use crate::{BoxError, Middleware, Next};

    /// XORs every payload byte with a key, in both directions.
    struct Xor(u8);

    impl Xor {
        fn apply(&self, datagram: &Datagram) -> Datagram {
            let payload: Vec<u8> = datagram.payload().iter().map(|b| b ^ self.0).collect();
            datagram.with_payload(payload)
        }
    }

    impl Middleware for Xor {
        fn send(&self, datagram: Datagram, next: Next<Datagram>) -> BoxFuture<'_, Result<(), BoxError>> {
            Box::pin(async move { next.send(self.apply(&datagram)).await.map_err(BoxError::from) })
        }

        fn receive(&self, received: Received, next: Next<Received>) -> BoxFuture<'_, Result<(), BoxError>> {
            Box::pin(async move { next.send(received.map(|d| self.apply(&d))).await.map_err(BoxError::from) })
        }
    }

    /// Fails on any incoming datagram.
    struct Reject;

    impl Middleware for Reject {
        fn receive(&self, _: Received, _: Next<Received>) -> BoxFuture<'_, Result<(), BoxError>> {
            Box::pin(async { Err::<(), _>(BoxError::from("rejected")) })
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_round_trip_through_middleware() {
        let pipeline = Pipeline::new().use_after(Xor(0x5a)).use_after(Xor(0xff));
        let channel = PipelinedChannel::new(crate::channel(loopback()).build(), &pipeline);
        channel.start().unwrap();
        let local = channel.channel().local_addr().unwrap();

        channel.send(Datagram::new(&b"hello"[..], local)).await.unwrap();
        let received = timeout(Duration::from_secs(1), channel.recv()).await.unwrap().unwrap();
        assert_eq!(received.unwrap().payload().as_ref(), b"hello");

        channel.complete();
        timeout(Duration::from_secs(1), channel.completion().wait())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            timeout(Duration::from_secs(1), channel.recv()).await.unwrap(),
            Err(RecvError::Closed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inbound_failure_faults_channel() {
        let pipeline = Pipeline::new().use_after(Reject);
        let channel = PipelinedChannel::new(crate::channel(loopback()).build(), &pipeline);
        channel.start().unwrap();
        let local = channel.channel().local_addr().unwrap();

        channel.send(Datagram::new(&b"boom"[..], local)).await.unwrap();
        let res = timeout(Duration::from_secs(1), channel.completion().wait()).await.unwrap();
        assert!(matches!(res, Err(Fault::Transform(_))));
        let res = timeout(Duration::from_secs(1), channel.channel().completion().wait()).await.unwrap();
        assert!(matches!(res, Err(Fault::Transform(_))));
    }
}
