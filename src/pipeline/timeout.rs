use std::{
    fmt,
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use tokio::{runtime::Handle, select};

use super::Target;
use crate::{
    error::{Fault, RecvError, SendError},
    queue::Buffer,
    sync::{AtomicDuration, Completion, spawn},
};

struct IdleTimeoutInner<T, G> {
    front: Buffer<T>,
    target: G,
    window: AtomicDuration,
    completion: Completion,
}

/// Faults a wrapped target when no item flows through within a window.
///
/// Items offered to an [`IdleTimeout`] are buffered and forwarded to the
/// target by a background loop. Every forwarded item restarts the window. If
/// the window elapses with no item, both the decorator and the target are
/// faulted with [`Fault::Timeout`].
///
/// Completing the decorator completes the target once the buffered items have
/// been forwarded. A target that terminates on its own closes the decorator
/// with the target's outcome.
///
/// A window of `None` disables the timeout.
pub struct IdleTimeout<T, G> {
    inner: Arc<IdleTimeoutInner<T, G>>,
}

impl<T, G> Clone for IdleTimeout<T, G> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, G> IdleTimeout<T, G>
where
    T: Send + 'static,
    G: Target<T>,
{
    /// Offers an item, suspending while the internal buffer is full.
    pub async fn offer(&self, item: T) -> Result<(), SendError<T>> {
        self.inner.front.send(item).await
    }

    /// Completes the decorator and, once drained, the target.
    pub fn complete(&self) -> bool {
        self.inner.front.complete()
    }

    /// Faults the decorator and the target.
    pub fn fault(&self, fault: Fault) -> bool {
        self.inner.front.abort(fault)
    }

    /// Terminal signal of the decorator.
    pub fn completion(&self) -> Completion {
        self.inner.completion.clone()
    }

    /// Current window, `None` if the timeout is disabled.
    pub fn window(&self) -> Option<Duration> {
        self.inner.window.load(Ordering::Relaxed)
    }

    /// Changes the window. Takes effect from the next wait on.
    pub fn set_window(&self, window: Option<Duration>) {
        self.inner.window.store(window, Ordering::Relaxed);
    }

    /// The wrapped target.
    pub fn target(&self) -> &G {
        &self.inner.target
    }
}

impl<T, G> fmt::Debug for IdleTimeout<T, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleTimeout")
            .field("window", &self.inner.window.load(Ordering::Relaxed))
            .field("front", &self.inner.front)
            .finish_non_exhaustive()
    }
}

impl<T, G> Target<T> for IdleTimeout<T, G>
where
    T: Send + 'static,
    G: Target<T>,
{
    fn offer(&self, item: T) -> impl Future<Output = Result<(), SendError<T>>> + Send {
        self.inner.front.send(item)
    }

    fn complete(&self) -> bool {
        IdleTimeout::complete(self)
    }

    fn fault(&self, fault: Fault) -> bool {
        IdleTimeout::fault(self, fault)
    }

    fn completion(&self) -> Completion {
        IdleTimeout::completion(self)
    }
}

async fn watch<T, G>(inner: Arc<IdleTimeoutInner<T, G>>)
where
    T: Send + 'static,
    G: Target<T>,
{
    let downstream = inner.target.completion();
    let outcome = loop {
        let window = inner.window.load(Ordering::Relaxed);
        let res = select! {
            biased;
            outcome = downstream.wait() => {
                tracing::debug!("Idle timeout target terminated");
                match outcome.clone() {
                    Ok(()) => inner.front.complete(),
                    Err(fault) => inner.front.abort(fault),
                };
                break outcome;
            }
            res = inner.front.recv_timeout(window) => res,
        };

        match res {
            Ok(item) => {
                if let Err(err) = inner.target.offer(item).await {
                    let fault = err.fault.unwrap_or(Fault::Cancelled);
                    inner.front.abort(fault.clone());
                    break Err(fault);
                }
            }
            Err(RecvError::Timeout) => {
                let fault = Fault::Timeout(window.unwrap_or_default());
                tracing::warn!(?window, "No activity within the idle window");
                inner.front.abort(fault.clone());
                inner.target.fault(fault.clone());
                break Err(fault);
            }
            Err(RecvError::Closed) => {
                inner.target.complete();
                break Ok(());
            }
            Err(RecvError::Faulted(fault)) => {
                inner.target.fault(fault.clone());
                break Err(fault);
            }
        }
    };
    inner.completion.resolve(outcome);
}

/// Builder for configuring and creating an [`IdleTimeout`].
pub struct IdleTimeoutBuilder<T, G> {
    target: G,
    window: Option<Duration>,
    capacity: usize,
    runtime: Option<Handle>,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, G> IdleTimeoutBuilder<T, G>
where
    T: Send + 'static,
    G: Target<T>,
{
    /// Sets the idle window. `None` disables the timeout.
    ///
    /// Default: `None`
    #[must_use]
    pub fn window(mut self, window: impl Into<Option<Duration>>) -> Self {
        self.window = window.into();
        self
    }

    /// Sets the capacity of the internal buffer.
    ///
    /// Default: 16
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the runtime the forwarding loop is spawned on.
    ///
    /// Default: the current runtime
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Builds the decorator and spawns its forwarding loop.
    ///
    /// # Panics
    ///
    /// Panics if the capacity is zero, or if no runtime was given and the
    /// caller is not running inside a Tokio runtime.
    pub fn build(self) -> IdleTimeout<T, G> {
        let inner = Arc::new(IdleTimeoutInner {
            front: Buffer::bounded(self.capacity),
            target: self.target,
            window: AtomicDuration::new(self.window),
            completion: Completion::new(),
        });
        spawn(self.runtime.as_ref(), watch(inner.clone()));
        IdleTimeout { inner }
    }
}

/// Wraps `target` with an idle timeout.
pub fn idle_timeout<T, G>(target: G) -> IdleTimeoutBuilder<T, G>
where
    T: Send + 'static,
    G: Target<T>,
{
    IdleTimeoutBuilder {
        target,
        window: None,
        capacity: 16,
        runtime: None,
        _marker: std::marker::PhantomData,
    }
}
