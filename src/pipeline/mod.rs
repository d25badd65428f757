//! Composable processing stages.
//!
//! Every element of a pipeline is either a [`Target`] (something items can be
//! offered to), a [`Source`] (something items can be received from), or both.
//! [`Buffer`](crate::Buffer), [`Stage`], [`IdleTimeout`] and
//! [`DuplexChannel`](crate::DuplexChannel) all implement one or both traits.
//!
//! Elements are connected with [`link`]: a forwarder task receives from the
//! source and offers to the target. Completion and faults cross a link only if
//! the link was established with [`LinkOptions::propagate_completion`] (and
//! [`LinkOptions::propagate_upstream`] for the reverse direction).
pub(crate) mod middleware;
pub(crate) mod stage;
pub(crate) mod timeout;

pub use middleware::{Chain, Middleware, Pipeline};
pub use stage::{Next, Stage, StageBuilder, stage};
pub use timeout::{IdleTimeout, IdleTimeoutBuilder, idle_timeout};
use tokio::{runtime::Handle, select, task::JoinHandle};

use crate::{
    error::{Fault, RecvError, SendError},
    sync::{Completion, spawn},
};

/// An element items can be offered to.
pub trait Target<T>: Send + Sync + 'static {
    /// Offers an item, suspending while the target is full.
    fn offer(&self, item: T) -> impl Future<Output = Result<(), SendError<T>>> + Send;

    /// Signals that no more items will be offered.
    fn complete(&self) -> bool;

    /// Closes the target with a fault.
    fn fault(&self, fault: Fault) -> bool;

    /// Terminal signal of the target.
    fn completion(&self) -> Completion;
}

/// An element items can be received from.
pub trait Source<T>: Send + Sync + 'static {
    /// Receives the next item, suspending while none is available.
    fn recv(&self) -> impl Future<Output = Result<T, RecvError>> + Send;

    /// Tears the source down from the consuming side.
    fn fault(&self, fault: Fault) -> bool;

    /// Terminal signal of the source.
    fn completion(&self) -> Completion;
}

/// Options of a link between a [`Source`] and a [`Target`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOptions {
    /// Forward the source's completion (graceful or faulted) to the target.
    ///
    /// Default: `true`
    pub propagate_completion: bool,
    /// Forward a fault of the target back to the source.
    ///
    /// A target that completes gracefully only stops the forwarder.
    ///
    /// Default: `false`
    pub propagate_upstream: bool,
}

impl LinkOptions {
    /// Propagates completion in both directions.
    pub const BIDIRECTIONAL: Self = Self {
        propagate_completion: true,
        propagate_upstream: true,
    };
    /// Propagates nothing: the link only forwards items.
    pub const DETACHED: Self = Self {
        propagate_completion: false,
        propagate_upstream: false,
    };
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            propagate_completion: true,
            propagate_upstream: false,
        }
    }
}

/// Spawns a forwarder moving every item of `source` into `target`.
///
/// The forwarder stops when the source is closed and drained, or when the
/// target stops accepting items. The returned handle resolves at that point.
pub fn link<T, S, G>(source: S, target: G, options: LinkOptions, runtime: Option<&Handle>) -> JoinHandle<()>
where
    T: Send + 'static,
    S: Source<T>,
    G: Target<T>,
{
    spawn(runtime, forward(source, target, options))
}

async fn forward<T, S, G>(source: S, target: G, options: LinkOptions)
where
    T: Send + 'static,
    S: Source<T>,
    G: Target<T>,
{
    let downstream = target.completion();
    loop {
        let res = select! {
            biased;
            outcome = downstream.wait() => {
                tracing::trace!("Link target terminated, stopping forwarder");
                if let (Err(fault), true) = (outcome, options.propagate_upstream) {
                    source.fault(fault);
                }
                return;
            }
            res = source.recv() => res,
        };

        match res {
            Ok(item) => {
                if let Err(err) = target.offer(item).await {
                    tracing::trace!("Link target closed, dropping item");
                    if let (Some(fault), true) = (err.fault, options.propagate_upstream) {
                        source.fault(fault);
                    }
                    return;
                }
            }
            Err(RecvError::Closed) => {
                if options.propagate_completion {
                    target.complete();
                }
                return;
            }
            Err(RecvError::Faulted(fault)) => {
                tracing::debug!(%fault, "Link source faulted");
                if options.propagate_completion {
                    target.fault(fault);
                }
                return;
            }
            Err(RecvError::Timeout) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::Buffer;

    #[tokio::test]
    async fn test_link_propagates_completion() {
        let a = Buffer::bounded(4);
        let b = Buffer::bounded(4);
        let handle = link(a.clone(), b.clone(), LinkOptions::default(), None);

        a.send(1).await.unwrap();
        a.send(2).await.unwrap();
        a.complete();

        assert_eq!(b.recv().await.unwrap(), 1);
        assert_eq!(b.recv().await.unwrap(), 2);
        assert!(matches!(b.recv().await, Err(RecvError::Closed)));
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_detached_link_keeps_target_open() {
        let a = Buffer::bounded(4);
        let b = Buffer::<u8>::bounded(4);
        let handle = link(a.clone(), b.clone(), LinkOptions::DETACHED, None);

        a.fault(Fault::Cancelled);
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn test_upstream_fault() {
        let a = Buffer::<u8>::bounded(4);
        let b = Buffer::<u8>::bounded(4);
        let handle = link(a.clone(), b.clone(), LinkOptions::BIDIRECTIONAL, None);

        b.abort(Fault::Cancelled);
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(a.completion().wait().await.unwrap_err().is_cancelled());
    }
}
