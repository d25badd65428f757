//! Bounded, closable FIFO buffer.
//!
//! [`Buffer`] is the single hand-off primitive of the crate: the duplex
//! channel uses two of them (outgoing and incoming), every pipeline stage owns
//! an input and an output buffer, and the idle-timeout decorator fronts its
//! target with one.
//!
//! # Closing
//!
//! A buffer is closed either gracefully ([`Buffer::complete`]) or with a
//! [`Fault`] ([`Buffer::fault`]). Once closed no further offer succeeds, but
//! already buffered items remain drainable. After the last buffered item has
//! been observed, receivers get [`RecvError::Closed`] or
//! [`RecvError::Faulted`] and the buffer's [`Completion`] resolves.
//!
//! [`Buffer::abort`] closes the buffer and discards buffered items at once.
mod full_mode;

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use event_listener::{Event, IntoNotification};
pub use full_mode::FullMode;

use crate::{
    error::{Fault, RecvError, SendError},
    pipeline::{Source, Target},
    sync::Completion,
};

/// Error returned by [`Buffer::try_send`].
pub enum TrySendError<T> {
    /// The buffer is full; the item is handed back.
    Full(T),
    /// The buffer is closed.
    Closed(SendError<T>),
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(e) => f.debug_tuple("Closed").field(e).finish(),
        }
    }
}

struct State<T> {
    queue: VecDeque<T>,
    /// `None` while open, `Some(fault)` once closed.
    closed: Option<Option<Fault>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Notified when an item is pushed or the buffer is closed.
    can_recv: Event,
    /// Notified when a slot is freed or the buffer is closed.
    can_send: Event,
    /// Notified when the buffer is closed.
    on_close: Event,
    capacity: usize,
    mode: FullMode,
    completion: Completion,
}

enum Push<T> {
    Done,
    Full(T),
    Closed(SendError<T>),
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, state: &mut State<T>, item: T) -> Push<T> {
        if let Some(fault) = &state.closed {
            return Push::Closed(SendError {
                item,
                fault: fault.clone(),
            });
        }

        if state.queue.len() < self.capacity {
            state.queue.push_back(item);
            self.can_recv.notify(1.additional());
            return Push::Done;
        }

        match self.mode {
            FullMode::Wait => Push::Full(item),
            FullMode::DropWrite => {
                tracing::trace!(capacity = self.capacity, "Buffer full, dropping offered item");
                Push::Done
            }
            FullMode::DropOldest => {
                tracing::trace!(capacity = self.capacity, "Buffer full, evicting oldest item");
                let _ = state.queue.pop_front();
                state.queue.push_back(item);
                self.can_recv.notify(1.additional());
                Push::Done
            }
        }
    }

    fn pop(&self, state: &mut State<T>) -> Option<Result<T, RecvError>> {
        if let Some(item) = state.queue.pop_front() {
            self.can_send.notify(1.additional());
            if state.queue.is_empty() {
                self.drained(state);
            }
            return Some(Ok(item));
        }

        let fault = state.closed.as_ref()?;
        let err = RecvError::from_close(fault.clone());
        self.drained(state);
        Some(Err(err))
    }

    /// Resolves the completion if the buffer is closed and empty.
    fn drained(&self, state: &State<T>) {
        if let Some(fault) = &state.closed {
            if state.queue.is_empty() {
                self.completion.resolve(fault.clone().map_or(Ok(()), Err));
            }
        }
    }

    fn close(&self, fault: Option<Fault>) -> bool {
        let mut state = self.lock();
        if state.closed.is_some() {
            return false;
        }
        state.closed = Some(fault);
        self.drained(&state);
        drop(state);

        self.can_recv.notify(usize::MAX);
        self.can_send.notify(usize::MAX);
        self.on_close.notify(usize::MAX);
        true
    }
}

/// A bounded multi-producer, multi-consumer FIFO buffer.
///
/// [`Buffer`] is cheaply cloneable: clones share the same queue. Producers
/// offering to a full buffer are handled according to its [`FullMode`];
/// consumers receiving from an empty buffer are suspended until an item is
/// pushed or the buffer is closed. Suspension never blocks the worker thread.
///
/// # Examples
///
/// ```
/// use udpipe::{Buffer, RecvError};
///
/// # #[tokio::main]
/// # async fn main() {
/// let buffer = Buffer::bounded(2);
/// buffer.send(1).await.unwrap();
/// buffer.send(2).await.unwrap();
/// buffer.complete();
///
/// // Buffered items survive the close
/// assert_eq!(buffer.recv().await.unwrap(), 1);
/// assert_eq!(buffer.recv().await.unwrap(), 2);
/// assert!(matches!(buffer.recv().await, Err(RecvError::Closed)));
/// # }
/// ```
pub struct Buffer<T>(Arc<Shared<T>>);

impl<T> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Buffer<T> {
    /// Creates a buffer holding at most `capacity` items, waiting when full.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_mode(capacity, FullMode::Wait)
    }

    /// Creates a buffer holding at most `capacity` items with the given
    /// full-buffer policy.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_mode(capacity: usize, mode: FullMode) -> Self {
        assert!(capacity > 0, "Capacity must be greater than zero");
        Self(Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity),
                closed: None,
            }),
            can_recv: Event::new(),
            can_send: Event::new(),
            on_close: Event::new(),
            capacity,
            mode,
            completion: Completion::new(),
        }))
    }

    /// Offers an item, suspending while the buffer is full.
    ///
    /// # Errors
    ///
    /// Returns the item back if the buffer is closed, together with the
    /// fault it was closed with.
    pub async fn send(&self, mut item: T) -> Result<(), SendError<T>> {
        loop {
            let listener = {
                let mut state = self.0.lock();
                match self.0.push(&mut state, item) {
                    Push::Done => return Ok(()),
                    Push::Closed(e) => return Err(e),
                    Push::Full(back) => item = back,
                }
                self.0.can_send.listen()
            };
            listener.await;
        }
    }

    /// Offers an item without waiting.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        let mut state = self.0.lock();
        match self.0.push(&mut state, item) {
            Push::Done => Ok(()),
            Push::Full(item) => Err(TrySendError::Full(item)),
            Push::Closed(e) => Err(TrySendError::Closed(e)),
        }
    }

    /// Receives the next item, suspending while the buffer is empty.
    ///
    /// # Errors
    ///
    /// Once the buffer is closed and drained, returns [`RecvError::Closed`] or
    /// [`RecvError::Faulted`] depending on how it was closed.
    pub async fn recv(&self) -> Result<T, RecvError> {
        loop {
            let listener = {
                let mut state = self.0.lock();
                if let Some(res) = self.0.pop(&mut state) {
                    return res;
                }
                self.0.can_recv.listen()
            };
            listener.await;
        }
    }

    /// Receives the next item, giving up after `window`.
    ///
    /// A `window` of `None` waits indefinitely. Returns [`RecvError::Timeout`]
    /// if nothing arrived in time; the buffer stays open in that case.
    pub async fn recv_timeout(&self, window: Option<Duration>) -> Result<T, RecvError> {
        match window {
            None => self.recv().await,
            Some(window) => tokio::time::timeout(window, self.recv())
                .await
                .unwrap_or(Err(RecvError::Timeout)),
        }
    }

    /// Receives an item if one is immediately available.
    ///
    /// Returns `Ok(None)` when the buffer is open and empty.
    pub fn try_recv(&self) -> Result<Option<T>, RecvError> {
        let mut state = self.0.lock();
        self.0.pop(&mut state).transpose()
    }

    /// Closes the buffer gracefully. Returns `false` if it was already closed.
    pub fn complete(&self) -> bool {
        self.0.close(None)
    }

    /// Closes the buffer with a fault. Returns `false` if it was already
    /// closed.
    pub fn fault(&self, fault: Fault) -> bool {
        self.0.close(Some(fault))
    }

    /// Closes the buffer with a fault and discards every buffered item.
    ///
    /// The completion resolves immediately with `fault` unless it had already
    /// resolved. Returns `false` in that case.
    pub fn abort(&self, fault: Fault) -> bool {
        let mut state = self.0.lock();
        if self.0.completion.is_resolved() {
            return false;
        }
        let discarded = std::mem::take(&mut state.queue);
        state.closed = Some(Some(fault.clone()));
        self.0.completion.fault(fault);
        drop(state);

        self.0.can_recv.notify(usize::MAX);
        self.0.can_send.notify(usize::MAX);
        self.0.on_close.notify(usize::MAX);
        // Items are dropped outside of the lock
        drop(discarded);
        true
    }

    /// Returns the completion resolving once the buffer is closed and drained.
    pub fn completion(&self) -> Completion {
        self.0.completion.clone()
    }

    /// Waits until the buffer is closed and returns the fault it was closed
    /// with, if any.
    ///
    /// Unlike [`Buffer::completion`], buffered items are not waited for.
    pub async fn closed(&self) -> Option<Fault> {
        loop {
            let listener = {
                let state = self.0.lock();
                if let Some(fault) = &state.closed {
                    return fault.clone();
                }
                self.0.on_close.listen()
            };
            listener.await;
        }
    }

    /// Returns `true` once the buffer has been closed.
    pub fn is_closed(&self) -> bool {
        self.0.lock().closed.is_some()
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.0.lock().queue.len()
    }

    /// Returns `true` if no item is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered items.
    pub fn capacity(&self) -> usize {
        self.0.capacity
    }

    /// Full-buffer policy of this buffer.
    pub fn mode(&self) -> FullMode {
        self.0.mode
    }
}

impl<T> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.lock();
        f.debug_struct("Buffer")
            .field("len", &state.queue.len())
            .field("capacity", &self.0.capacity)
            .field("mode", &self.0.mode)
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T: Send + 'static> Target<T> for Buffer<T> {
    fn offer(&self, item: T) -> impl Future<Output = Result<(), SendError<T>>> + Send {
        self.send(item)
    }

    fn complete(&self) -> bool {
        Buffer::complete(self)
    }

    fn fault(&self, fault: Fault) -> bool {
        Buffer::fault(self, fault)
    }

    fn completion(&self) -> Completion {
        Buffer::completion(self)
    }
}

impl<T: Send + 'static> Source<T> for Buffer<T> {
    fn recv(&self) -> impl Future<Output = Result<T, RecvError>> + Send {
        Buffer::recv(self)
    }

    fn fault(&self, fault: Fault) -> bool {
        Buffer::fault(self, fault)
    }

    fn completion(&self) -> Completion {
        Buffer::completion(self)
    }
}
