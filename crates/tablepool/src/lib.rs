//! tablepool: non-blocking pools of table readers and writers.
//!
//! Opening a table is expensive, so handles are kept warm and recycled:
//! - [`ReaderPool`]: many concurrent readers per table, slots grouped into growable segments
//! - [`WriterPool`]: exactly one writer per table, plus a cross-process advisory lock for maintenance
//!
//! Every operation runs on the calling thread and reports contention as a typed
//! [`PoolError`] instead of waiting.

mod cell;
mod clock;
mod config;
mod error;
mod event;
mod factory;
mod token;

pub mod pool;
pub mod reaper;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, MonotonicClock, Timestamp};
pub use config::PoolConfig;
pub use error::{ConstructionError, PoolError};
pub use event::{CloseReason, EventKind, PoolEvent, PoolListener, Source};
pub use factory::ResourceFactory;
pub use pool::{ENTRY_SIZE, PoolHooks, PooledReader, PooledWriter, ReaderPool, WriterPool};
pub use reaper::{IdleSweep, spawn_idle_reaper};
pub use token::Token;
