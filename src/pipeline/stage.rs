//! Bounded processing stage with a worker pool.
//!
//! A [`Stage`] moves items from a bounded input buffer through `parallelism`
//! concurrent invocations of a user transform into a bounded output buffer:
//!
//! ```text
//!            ┌─────────────── Stage ───────────────┐
//!  offer ──► │ [input] ──► worker × P ──► [output] │ ──► recv
//!            └─────────────────────────────────────┘
//! ```
//!
//! The transform receives a [`Next`] handle. Calling [`Next::send`] forwards
//! an output, not calling it drops the input (filtering), calling it several
//! times expands one input into several outputs.
use std::{fmt, marker::PhantomData, sync::Arc};

use futures::future::join_all;
use tokio::{runtime::Handle, select, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{LinkOptions, Source, Target, link};
use crate::{
    error::{BoxError, Fault, RecvError, SendError},
    queue::{Buffer, TrySendError},
    sync::{Completion, spawn},
};

/// Handle given to a transform to forward its outputs.
pub struct Next<O> {
    output: Buffer<O>,
}

impl<O> Clone for Next<O> {
    fn clone(&self) -> Self {
        Self {
            output: self.output.clone(),
        }
    }
}

impl<O> Next<O> {
    pub(crate) fn new(output: Buffer<O>) -> Self {
        Self { output }
    }

    /// Forwards an output, suspending while the downstream buffer is full.
    ///
    /// # Errors
    ///
    /// Fails if the stage has been faulted; the output is handed back.
    pub async fn send(&self, item: O) -> Result<(), SendError<O>> {
        self.output.send(item).await
    }
}

impl<O> fmt::Debug for Next<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("output", &self.output).finish()
    }
}

struct StageCore<I, O> {
    input: Buffer<I>,
    output: Buffer<O>,
    parallelism: usize,
    runtime: Option<Handle>,
}

impl<I, O> StageCore<I, O> {
    fn fault(&self, fault: Fault) -> bool {
        let aborted = self.input.abort(fault.clone());
        // First fault wins: a stage already faulted keeps its original error
        self.output.abort(fault) || aborted
    }
}

/// A processing unit with a bounded input, a worker pool and a bounded output.
///
/// Stages are created with [`stage`]. A stage is terminal once its input has
/// been completed and drained, every worker has returned and its output has
/// been drained; [`Stage::completion`] resolves at that point, or as soon as
/// the stage faults.
///
/// Any error returned by the transform faults the whole stage.
///
/// # Examples
///
/// ```
/// use udpipe::{BoxError, Next, RecvError};
///
/// # #[tokio::main]
/// # async fn main() {
/// // Keep even numbers only, doubled
/// let stage = udpipe::stage(|n: u32, next: Next<u32>| async move {
///     if n % 2 == 0 {
///         next.send(n * 2).await?;
///     }
///     Ok::<_, BoxError>(())
/// })
/// .build();
///
/// for n in 0..4 {
///     stage.offer(n).await.unwrap();
/// }
/// stage.complete();
///
/// assert_eq!(stage.recv().await.unwrap(), 0);
/// assert_eq!(stage.recv().await.unwrap(), 4);
/// assert!(matches!(stage.recv().await, Err(RecvError::Closed)));
/// # }
/// ```
pub struct Stage<I, O> {
    core: Arc<StageCore<I, O>>,
}

impl<I, O> Clone for Stage<I, O> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<I, O> Stage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Offers an input, suspending while the input buffer is full.
    pub async fn offer(&self, item: I) -> Result<(), SendError<I>> {
        self.core.input.send(item).await
    }

    /// Offers an input without waiting.
    pub fn try_offer(&self, item: I) -> Result<(), TrySendError<I>> {
        self.core.input.try_send(item)
    }

    /// Receives the next output.
    pub async fn recv(&self) -> Result<O, RecvError> {
        self.core.output.recv().await
    }

    /// Signals that no more input will be offered.
    ///
    /// Buffered inputs are still processed; the output is closed once every
    /// worker is done.
    pub fn complete(&self) -> bool {
        self.core.input.complete()
    }

    /// Faults the stage: buffered inputs and outputs are discarded and every
    /// party waiting on the stage observes `fault`.
    pub fn fault(&self, fault: Fault) -> bool {
        tracing::debug!(%fault, "Faulting stage");
        self.core.fault(fault)
    }

    /// Terminal signal of the stage.
    pub fn completion(&self) -> Completion {
        self.core.output.completion()
    }

    /// Input buffer of the stage.
    pub fn input(&self) -> &Buffer<I> {
        &self.core.input
    }

    /// Output buffer of the stage.
    pub fn output(&self) -> &Buffer<O> {
        &self.core.output
    }

    /// Number of concurrent transform invocations.
    pub fn parallelism(&self) -> usize {
        self.core.parallelism
    }

    /// Forwards every output of this stage to `target`.
    ///
    /// Completion crosses the link according to `options`.
    pub fn link_to<G>(&self, target: G, options: LinkOptions) -> JoinHandle<()>
    where
        G: Target<O>,
    {
        link(self.clone(), target, options, self.core.runtime.as_ref())
    }
}

impl<I, O> fmt::Debug for Stage<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("input", &self.core.input)
            .field("output", &self.core.output)
            .field("parallelism", &self.core.parallelism)
            .finish()
    }
}

impl<I: Send + 'static, O: Send + 'static> Target<I> for Stage<I, O> {
    fn offer(&self, item: I) -> impl Future<Output = Result<(), SendError<I>>> + Send {
        self.core.input.send(item)
    }

    fn complete(&self) -> bool {
        Stage::complete(self)
    }

    fn fault(&self, fault: Fault) -> bool {
        Stage::fault(self, fault)
    }

    fn completion(&self) -> Completion {
        Stage::completion(self)
    }
}

impl<I: Send + 'static, O: Send + 'static> Source<O> for Stage<I, O> {
    fn recv(&self) -> impl Future<Output = Result<O, RecvError>> + Send {
        self.core.output.recv()
    }

    fn fault(&self, fault: Fault) -> bool {
        Stage::fault(self, fault)
    }

    fn completion(&self) -> Completion {
        Stage::completion(self)
    }
}

async fn work<I, O, F, Fut>(core: Arc<StageCore<I, O>>, transform: Arc<F>) -> Result<(), Fault>
where
    F: Fn(I, Next<O>) -> Fut,
    Fut: Future<Output = Result<(), BoxError>>,
{
    let next = Next::new(core.output.clone());
    loop {
        match core.input.recv().await {
            Ok(item) => {
                if let Err(e) = transform(item, next.clone()).await {
                    let fault = Fault::transform(e);
                    tracing::warn!(%fault, "Stage transform failed");
                    core.fault(fault.clone());
                    return Err(fault);
                }
            }
            Err(RecvError::Closed) => return Ok(()),
            Err(RecvError::Faulted(fault)) => return Err(fault),
            Err(RecvError::Timeout) => {}
        }
    }
}

async fn supervise<I, O>(
    core: Arc<StageCore<I, O>>,
    workers: Vec<JoinHandle<Result<(), Fault>>>,
    token: CancellationToken,
) {
    let results = select! {
        biased;
        _ = token.cancelled() => {
            core.fault(Fault::Cancelled);
            return;
        }
        results = join_all(workers) => results,
    };

    let mut outcome = Ok(());
    for res in results {
        let res = res.unwrap_or(Err(Fault::Panicked("stage worker")));
        if let (Err(fault), Ok(())) = (res, &outcome) {
            outcome = Err(fault);
        }
    }

    match outcome {
        Ok(()) => {
            tracing::trace!("Stage workers done, completing output");
            core.output.complete();
        }
        Err(fault) => {
            core.fault(fault);
        }
    }
}

/// Builder for configuring and creating a [`Stage`].
pub struct StageBuilder<I, O, F> {
    transform: F,
    input_capacity: usize,
    output_capacity: usize,
    parallelism: usize,
    runtime: Option<Handle>,
    token: CancellationToken,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F, Fut> StageBuilder<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I, Next<O>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    /// Sets the capacity of the input buffer.
    ///
    /// Default: 16
    #[must_use]
    pub fn input_capacity(mut self, capacity: usize) -> Self {
        self.input_capacity = capacity;
        self
    }

    /// Sets the capacity of the output buffer.
    ///
    /// Default: 16
    #[must_use]
    pub fn output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity;
        self
    }

    /// Sets the number of concurrent transform invocations.
    ///
    /// With a parallelism of 1 outputs keep the input order; above 1 the
    /// relative order of outputs is unspecified.
    ///
    /// Default: 1
    #[must_use]
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Sets the runtime the workers are spawned on.
    ///
    /// Default: the current runtime
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Sets the cancellation token. Cancelling it faults the stage with
    /// [`Fault::Cancelled`].
    #[must_use]
    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Builds the stage and spawns its workers.
    ///
    /// # Panics
    ///
    /// Panics if a capacity or the parallelism is zero, or if no runtime was
    /// given and the caller is not running inside a Tokio runtime.
    pub fn build(self) -> Stage<I, O> {
        let Self {
            transform,
            input_capacity,
            output_capacity,
            parallelism,
            runtime,
            token,
            _marker,
        } = self;
        assert!(parallelism > 0, "Parallelism must be greater than zero");

        let core = Arc::new(StageCore {
            input: Buffer::bounded(input_capacity),
            output: Buffer::bounded(output_capacity),
            parallelism,
            runtime,
        });

        let transform = Arc::new(transform);
        let workers = (0..parallelism)
            .map(|_| spawn(core.runtime.as_ref(), work(core.clone(), transform.clone())))
            .collect();
        spawn(core.runtime.as_ref(), supervise(core.clone(), workers, token));

        Stage { core }
    }
}

/// Creates a new stage running `transform` on every input.
///
/// The transform is an async function of the input and a [`Next`] handle.
/// Returning an error faults the stage.
pub fn stage<I, O, F, Fut>(transform: F) -> StageBuilder<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I, Next<O>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    StageBuilder {
        transform,
        input_capacity: 16,
        output_capacity: 16,
        parallelism: 1,
        runtime: None,
        token: CancellationToken::new(),
        _marker: PhantomData,
    }
}

#[cfg(test)]
mod tests {
    use std::{io, time::Duration};

    use tokio::time::timeout;

    use super::*;

    async fn doubler(n: u32, next: Next<u32>) -> Result<(), BoxError> {
        next.send(n * 2).await?;
        Ok(())
    }

    async fn fail_on_three(n: u32, next: Next<u32>) -> Result<(), BoxError> {
        if n == 3 {
            return Err(io::Error::other("boom").into());
        }
        next.send(n).await?;
        Ok(())
    }

    async fn drain<T>(source: &Stage<T, u32>) -> Vec<u32>
    where
        T: Send + 'static,
    {
        let mut out = Vec::new();
        while let Ok(v) = timeout(Duration::from_secs(5), source.recv()).await.unwrap() {
            out.push(v);
        }
        out
    }

    #[tokio::test]
    async fn test_sequential_preserves_order() {
        let stage = stage(doubler).build();
        let producer = {
            let stage = stage.clone();
            tokio::spawn(async move {
                for n in 0..100 {
                    stage.offer(n).await.unwrap();
                }
                stage.complete();
            })
        };

        let out = drain(&stage).await;
        producer.await.unwrap();
        assert_eq!(out, (0..100).map(|n| n * 2).collect::<Vec<_>>());
        assert!(stage.completion().wait().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_same_set() {
        let stage = stage(doubler).parallelism(4).input_capacity(4).output_capacity(4).build();
        assert_eq!(stage.parallelism(), 4);

        let producer = {
            let stage = stage.clone();
            tokio::spawn(async move {
                for n in 0..1_000 {
                    stage.offer(n).await.unwrap();
                }
                stage.complete();
            })
        };

        let mut out = drain(&stage).await;
        producer.await.unwrap();
        out.sort_unstable();
        assert_eq!(out, (0..1_000).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_filter_and_expand() {
        // Drops odd numbers, emits even numbers twice
        let stage = stage(|n: u32, next: Next<u32>| async move {
            if n % 2 == 0 {
                next.send(n).await?;
                next.send(n).await?;
            }
            Ok::<_, BoxError>(())
        })
        .output_capacity(64)
        .build();

        for n in 0..10 {
            stage.offer(n).await.unwrap();
        }
        stage.complete();
        assert_eq!(drain(&stage).await, vec![0, 0, 2, 2, 4, 4, 6, 6, 8, 8]);
    }

    #[tokio::test]
    async fn test_transform_error_faults_stage() {
        let stage = stage(fail_on_three).output_capacity(64).build();

        for n in 0..5 {
            stage.offer(n).await.unwrap();
        }

        let res = timeout(Duration::from_secs(1), stage.completion().wait()).await.unwrap();
        assert!(matches!(res, Err(Fault::Transform(_))));
        // A faulted stage rejects further input
        assert!(stage.offer(42).await.is_err());
        assert!(matches!(stage.recv().await, Err(RecvError::Faulted(Fault::Transform(_)))));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let token = CancellationToken::new();
        let stage = stage(doubler).token(token.clone()).build();
        stage.offer(1).await.unwrap();

        token.cancel();
        let res = timeout(Duration::from_secs(1), stage.completion().wait()).await.unwrap();
        assert!(res.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_link_fault_propagation() {
        let first = stage(doubler).build();
        let second = stage(doubler).build();
        let third = stage(doubler).build();
        first.link_to(second.clone(), LinkOptions::default());
        second.link_to(third.clone(), LinkOptions::DETACHED);

        first.offer(1).await.unwrap();
        assert_eq!(timeout(Duration::from_secs(1), third.recv()).await.unwrap().unwrap(), 8);

        first.fault(Fault::Cancelled);
        let res = timeout(Duration::from_secs(1), second.completion().wait()).await.unwrap();
        assert!(res.unwrap_err().is_cancelled());

        // The second link does not propagate completion
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!third.completion().is_resolved());
    }

    #[tokio::test]
    async fn test_link_graceful_completion() {
        let first = stage(doubler).build();
        let second = stage(doubler).build();
        first.link_to(second.clone(), LinkOptions::default());

        for n in 1..=3 {
            first.offer(n).await.unwrap();
        }
        first.complete();

        assert_eq!(drain(&second).await, vec![4, 8, 12]);
        assert!(second.completion().wait().await.is_ok());
        assert!(first.completion().wait().await.is_ok());
    }
}
