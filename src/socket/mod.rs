//! Socket operation bridge and context pool.
mod operation;
mod pool;

pub use pool::PoolStats;
pub(crate) use pool::OperationPool;
