//! Datagram middleware composed into outbound and inbound chains.
//!
//! A [`Pipeline`] is an ordered list of [`Middleware`]. Each middleware runs
//! in its own [`Stage`]. The outbound chain applies them in registration
//! order on the way to the socket, the inbound chain applies them in reverse
//! order on the way back:
//!
//! ```text
//!  send ──► [A] ──► [B] ──► [C] ──► socket
//!  recv ◄── [A] ◄── [B] ◄── [C] ◄── socket
//! ```
use std::{collections::VecDeque, fmt, sync::Arc};

use futures::future::BoxFuture;
use tokio::runtime::Handle;

use super::{LinkOptions, Next, Source, Stage, Target, stage};
use crate::{
    datagram::{Datagram, Received},
    error::{BoxError, Fault, RecvError, SendError},
    sync::Completion,
};

/// A processing step applied to outgoing and incoming datagrams.
///
/// Both methods forward their input unchanged by default. An implementation
/// drops a datagram by not calling `next`, and expands it by calling `next`
/// several times.
///
/// # Examples
///
/// ```
/// use futures::future::BoxFuture;
/// use udpipe::{BoxError, Datagram, Middleware, Next};
///
/// /// Drops empty datagrams before they reach the socket.
/// struct SkipEmpty;
///
/// impl Middleware for SkipEmpty {
///     fn send(&self, datagram: Datagram, next: Next<Datagram>) -> BoxFuture<'_, Result<(), BoxError>> {
///         Box::pin(async move {
///             if !datagram.is_empty() {
///                 next.send(datagram).await?;
///             }
///             Ok::<_, BoxError>(())
///         })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync + 'static {
    /// Processes an outgoing datagram.
    fn send(&self, datagram: Datagram, next: Next<Datagram>) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move { next.send(datagram).await.map_err(BoxError::from) })
    }

    /// Processes an incoming datagram or per-packet error.
    fn receive(&self, received: Received, next: Next<Received>) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move { next.send(received).await.map_err(BoxError::from) })
    }
}

/// Middleware forwarding everything unchanged.
struct Passthrough;

impl Middleware for Passthrough {}

/// An ordered list of [`Middleware`].
#[derive(Clone)]
pub struct Pipeline {
    layers: VecDeque<Arc<dyn Middleware>>,
    capacity: usize,
    parallelism: usize,
    runtime: Option<Handle>,
}

impl Pipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self {
            layers: VecDeque::new(),
            capacity: 16,
            parallelism: 1,
            runtime: None,
        }
    }

    /// Registers a middleware ahead of every middleware registered so far.
    #[must_use]
    pub fn use_before(mut self, middleware: impl Middleware) -> Self {
        self.layers.push_front(Arc::new(middleware));
        self
    }

    /// Registers a middleware after every middleware registered so far.
    #[must_use]
    pub fn use_after(mut self, middleware: impl Middleware) -> Self {
        self.layers.push_back(Arc::new(middleware));
        self
    }

    /// Sets the buffer capacity of every stage.
    ///
    /// Default: 16
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the parallelism of every stage.
    ///
    /// Default: 1
    #[must_use]
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Sets the runtime the stages are spawned on.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Number of registered middleware.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns `true` if no middleware is registered.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn layers(&self) -> Vec<Arc<dyn Middleware>> {
        if self.layers.is_empty() {
            return vec![Arc::new(Passthrough)];
        }
        self.layers.iter().cloned().collect()
    }

    fn stage<T, F>(&self, middleware: Arc<dyn Middleware>, apply: F) -> Stage<T, T>
    where
        T: Send + 'static,
        F: for<'a> Fn(&'a dyn Middleware, T, Next<T>) -> BoxFuture<'a, Result<(), BoxError>> + Copy + Send + Sync + 'static,
    {
        let builder = stage(move |item: T, next: Next<T>| {
            let middleware = middleware.clone();
            async move { apply(middleware.as_ref(), item, next).await }
        })
        .input_capacity(self.capacity)
        .output_capacity(self.capacity)
        .parallelism(self.parallelism);
        match &self.runtime {
            Some(runtime) => builder.runtime(runtime.clone()).build(),
            None => builder.build(),
        }
    }

    fn chain<T, F>(&self, layers: impl Iterator<Item = Arc<dyn Middleware>>, apply: F) -> Chain<T>
    where
        T: Send + 'static,
        F: for<'a> Fn(&'a dyn Middleware, T, Next<T>) -> BoxFuture<'a, Result<(), BoxError>> + Copy + Send + Sync + 'static,
    {
        let stages: Vec<_> = layers.map(|m| self.stage(m, apply)).collect();
        for pair in stages.windows(2) {
            pair[0].link_to(pair[1].clone(), LinkOptions::BIDIRECTIONAL);
        }
        Chain { stages }
    }

    /// Builds the chain applied to outgoing datagrams, in registration order.
    pub fn outbound(&self) -> Chain<Datagram> {
        self.chain(self.layers().into_iter(), |m, d, next| m.send(d, next))
    }

    /// Builds the chain applied to incoming datagrams, in reverse
    /// registration order.
    pub fn inbound(&self) -> Chain<Received> {
        self.chain(self.layers().into_iter().rev(), |m, r, next| m.receive(r, next))
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("layers", &self.layers.len())
            .field("capacity", &self.capacity)
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

/// A running sequence of linked stages.
///
/// Items are offered to the first stage and received from the last one.
/// Completion and faults propagate along the whole chain in both directions.
pub struct Chain<T> {
    stages: Vec<Stage<T, T>>,
}

impl<T> Clone for Chain<T> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
        }
    }
}

impl<T: Send + 'static> Chain<T> {
    // A chain always holds at least one stage
    fn head(&self) -> &Stage<T, T> {
        &self.stages[0]
    }

    fn tail(&self) -> &Stage<T, T> {
        &self.stages[self.stages.len() - 1]
    }

    /// Offers an item to the first stage.
    pub async fn offer(&self, item: T) -> Result<(), SendError<T>> {
        self.head().offer(item).await
    }

    /// Receives an item from the last stage.
    pub async fn recv(&self) -> Result<T, RecvError> {
        self.tail().recv().await
    }

    /// Completes the first stage; completion then cascades to the last one.
    pub fn complete(&self) -> bool {
        self.head().complete()
    }

    /// Faults every stage of the chain.
    pub fn fault(&self, fault: Fault) -> bool {
        self.stages.iter().fold(false, |acc, s| s.fault(fault.clone()) || acc)
    }

    /// Terminal signal of the last stage.
    pub fn completion(&self) -> Completion {
        self.tail().completion()
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always `false`: a chain built from an empty pipeline holds a
    /// pass-through stage.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl<T> fmt::Debug for Chain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.stages).finish()
    }
}

impl<T: Send + 'static> Target<T> for Chain<T> {
    fn offer(&self, item: T) -> impl Future<Output = Result<(), SendError<T>>> + Send {
        self.head().input().send(item)
    }

    fn complete(&self) -> bool {
        Chain::complete(self)
    }

    fn fault(&self, fault: Fault) -> bool {
        Chain::fault(self, fault)
    }

    fn completion(&self) -> Completion {
        Chain::completion(self)
    }
}

impl<T: Send + 'static> Source<T> for Chain<T> {
    fn recv(&self) -> impl Future<Output = Result<T, RecvError>> + Send {
        self.tail().output().recv()
    }

    fn fault(&self, fault: Fault) -> bool {
        Chain::fault(self, fault)
    }

    fn completion(&self) -> Completion {
        Chain::completion(self)
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Mutex, time::Duration};

    use bytes::Bytes;
    use tokio::time::timeout;

    use super::*;

    /// Appends a tag to the payload on send and strips it on receive, while
    /// recording the order it was invoked in.
    struct Tag {
        tag: u8,
        log: Arc<Mutex<Vec<(char, u8)>>>,
    }

    impl Middleware for Tag {
        fn send(&self, datagram: Datagram, next: Next<Datagram>) -> BoxFuture<'_, Result<(), BoxError>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(('>', self.tag));
                let mut payload = datagram.payload().to_vec();
                payload.push(self.tag);
                next.send(datagram.with_payload(payload)).await?;
                Ok::<_, BoxError>(())
            })
        }

        fn receive(&self, received: Received, next: Next<Received>) -> BoxFuture<'_, Result<(), BoxError>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(('<', self.tag));
                let received = received.map(|d| {
                    let payload = d.payload();
                    d.with_payload(payload.slice(..payload.len() - 1))
                });
                next.send(received).await?;
                Ok::<_, BoxError>(())
            })
        }
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn test_outbound_inbound_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tag = |tag| Tag { tag, log: log.clone() };
        // Resulting order: 1, 2, 3
        let pipeline = Pipeline::new().use_after(tag(2)).use_before(tag(1)).use_after(tag(3));
        assert_eq!(pipeline.len(), 3);

        let outbound = pipeline.outbound();
        let inbound = pipeline.inbound();
        assert_eq!(outbound.len(), 3);

        outbound.offer(Datagram::new(Bytes::new(), remote())).await.unwrap();
        let out = timeout(Duration::from_secs(1), outbound.recv()).await.unwrap().unwrap();
        assert_eq!(out.payload().as_ref(), &[1, 2, 3]);

        inbound.offer(Ok(out)).await.unwrap();
        let back = timeout(Duration::from_secs(1), inbound.recv()).await.unwrap().unwrap();
        assert!(back.unwrap().is_empty());

        assert_eq!(
            *log.lock().unwrap(),
            vec![('>', 1), ('>', 2), ('>', 3), ('<', 3), ('<', 2), ('<', 1)]
        );
    }

    #[tokio::test]
    async fn test_empty_pipeline_passes_through() {
        let pipeline = Pipeline::default();
        assert!(pipeline.is_empty());

        let outbound = pipeline.outbound();
        assert_eq!(outbound.len(), 1);
        let datagram = Datagram::new(&b"as is"[..], remote());
        outbound.offer(datagram.clone()).await.unwrap();
        outbound.complete();

        assert_eq!(outbound.recv().await.unwrap(), datagram);
        assert!(matches!(outbound.recv().await, Err(RecvError::Closed)));
        assert!(outbound.completion().wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_fault_reaches_both_ends() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .use_after(Tag { tag: 1, log: log.clone() })
            .use_after(Tag { tag: 2, log });
        let outbound = pipeline.outbound();

        // Faulting the last stage reaches the first one upstream
        outbound.stages[1].fault(Fault::Cancelled);
        let res = timeout(Duration::from_secs(1), outbound.stages[0].completion().wait()).await.unwrap();
        assert!(res.unwrap_err().is_cancelled());
        assert!(outbound.offer(Datagram::unaddressed(Bytes::new())).await.is_err());
    }
}
