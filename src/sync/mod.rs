mod completion;
mod time;

pub use completion::Completion;
pub(crate) use completion::all;
pub(crate) use time::AtomicDuration;
use tokio::{runtime::Handle, task::JoinHandle};

/// Spawns `future` on `runtime`, or on the current runtime if none is given.
///
/// # Panics
///
/// Panics if no runtime is given and the caller is not running inside a Tokio
/// runtime.
pub(crate) fn spawn<F>(runtime: Option<&Handle>, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match runtime {
        Some(handle) => handle.spawn(future),
        None => tokio::spawn(future),
    }
}
