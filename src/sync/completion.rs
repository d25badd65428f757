use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use event_listener::Event;

use crate::error::Fault;

/// Shared state of a [`Completion`].
struct CompletionInner {
    /// The underlying event listener for async notifications.
    event: Event,
    /// Terminal outcome, set exactly once.
    outcome: OnceLock<Result<(), Fault>>,
}

/// Cloneable, awaitable terminal signal of a channel, buffer or stage.
///
/// A [`Completion`] resolves exactly once, either gracefully (`Ok(())`) or with
/// the first [`Fault`] it was given. Later attempts to resolve it are ignored
/// and reported back to the caller, so that "first fault wins" can be observed.
///
/// # Examples
///
/// ```
/// use udpipe::{Completion, Fault};
///
/// # #[tokio::main]
/// # async fn main() {
/// let completion = Completion::new();
/// let observer = completion.clone();
///
/// assert!(completion.fault(Fault::Cancelled));
/// // Only the first outcome is retained
/// assert!(!completion.complete());
///
/// assert!(observer.wait().await.unwrap_err().is_cancelled());
/// # }
/// ```
#[derive(Clone)]
pub struct Completion(Arc<CompletionInner>);

impl Completion {
    /// Creates a new unresolved completion.
    pub fn new() -> Self {
        Self(Arc::new(CompletionInner {
            event: Event::new(),
            outcome: OnceLock::new(),
        }))
    }

    /// Resolves the completion with the given outcome.
    ///
    /// Returns `true` if this call resolved the completion, `false` if it had
    /// already been resolved.
    pub fn resolve(&self, outcome: Result<(), Fault>) -> bool {
        let won = self.0.outcome.set(outcome).is_ok();
        if won {
            self.0.event.notify(usize::MAX);
        }
        won
    }

    /// Resolves the completion gracefully.
    pub fn complete(&self) -> bool {
        self.resolve(Ok(()))
    }

    /// Resolves the completion with a fault.
    pub fn fault(&self, fault: Fault) -> bool {
        self.resolve(Err(fault))
    }

    /// Returns `true` once the completion has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.0.outcome.get().is_some()
    }

    /// Returns the outcome if the completion has been resolved.
    pub fn outcome(&self) -> Option<Result<(), Fault>> {
        self.0.outcome.get().cloned()
    }

    /// Waits until the completion is resolved and returns its outcome.
    pub async fn wait(&self) -> Result<(), Fault> {
        loop {
            if let Some(outcome) = self.outcome() {
                return outcome;
            }

            // Register before re-checking so a concurrent resolve is not missed
            let listener = self.0.event.listen();

            if let Some(outcome) = self.outcome() {
                return outcome;
            }

            listener.await;
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Completion").field(&self.0.outcome.get()).finish()
    }
}

/// Resolves to the first outcome among several completions, or to `Ok(())`
/// once all of them completed gracefully.
pub(crate) async fn all(completions: Vec<Completion>) -> Result<(), Fault> {
    let mut pending: Vec<_> = completions.into_iter().map(|c| Box::pin(async move { c.wait().await })).collect();
    while !pending.is_empty() {
        let (res, _, rest) = futures::future::select_all(pending).await;
        res?;
        pending = rest;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_basic_complete_wait() {
        let completion = Completion::new();
        let c_completion = completion.clone();

        let wait_task = tokio::spawn(async move { c_completion.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(completion.complete());

        assert!(wait_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_resolve_before_wait() {
        let completion = Completion::new();
        completion.fault(Fault::Timeout(Duration::from_secs(1)));

        let result = timeout(Duration::from_millis(100), completion.wait()).await;
        assert!(result.unwrap().unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_first_fault_wins() {
        let completion = Completion::new();
        assert!(completion.fault(Fault::Cancelled));
        assert!(!completion.fault(Fault::Timeout(Duration::from_secs(1))));
        assert!(!completion.complete());

        assert!(completion.outcome().unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_many_waiters() {
        let completion = Completion::new();
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let c = completion.clone();
                tokio::spawn(async move { c.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        completion.complete();

        for w in waiters {
            assert!(timeout(Duration::from_secs(1), w).await.unwrap().unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_all() {
        let a = Completion::new();
        let b = Completion::new();
        a.complete();
        b.complete();
        assert!(all(vec![a, b]).await.is_ok());

        let a = Completion::new();
        let b = Completion::new();
        b.fault(Fault::Cancelled);
        // The fault surfaces without waiting for `a`
        let res = timeout(Duration::from_millis(100), all(vec![a, b])).await.unwrap();
        assert!(res.unwrap_err().is_cancelled());
    }
}
