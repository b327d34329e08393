//! Reader and writer pools.
//!
//! Both pools hand out wrappers that return their handle to the pool when closed
//! or dropped:
//! - `PooledReader` → back to its slot, or closed for real if the pool is closed
//! - `PooledWriter` → back to its entry once the last re-entrant handle closes
//!
//! Slot and entry ownership moves only through compare-and-swap on owner tokens,
//! so no call ever waits on another.

mod lock_file;
mod reader;
mod writer;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock, Timestamp, duration_micros};
use crate::error::PoolError;
use crate::event::{EventKind, PoolEvent, PoolListener, Source};
use crate::token::Token;

pub use reader::{ENTRY_SIZE, PooledReader, ReaderPool};
pub use writer::{PooledWriter, WriterPool};

/// Collaborators injected into a pool at construction.
#[derive(Clone, Default)]
pub struct PoolHooks {
    listener: Option<Arc<dyn PoolListener>>,
    clock: Option<Arc<dyn Clock>>,
}

impl PoolHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(mut self, listener: Arc<dyn PoolListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Defaults to a [`MonotonicClock`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }
}

/// State shared by both pool flavors: closed flag, listener, clock and idle TTL.
pub(crate) struct PoolCore {
    source: Source,
    closed: AtomicBool,
    listener: Option<Arc<dyn PoolListener>>,
    clock: Arc<dyn Clock>,
    inactive_ttl: u64,
}

impl PoolCore {
    pub(crate) fn new(source: Source, inactive_ttl: Duration, hooks: PoolHooks) -> Self {
        Self {
            source,
            closed: AtomicBool::new(false),
            listener: hooks.listener,
            clock: hooks
                .clock
                .unwrap_or_else(|| Arc::new(MonotonicClock::new())),
            inactive_ttl: duration_micros(inactive_ttl),
        }
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Release times older than this are idle past the TTL.
    pub(crate) fn inactive_deadline(&self) -> Timestamp {
        self.now().saturating_sub(self.inactive_ttl)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn check_closed(&self) -> Result<(), PoolError> {
        if self.is_closed() {
            tracing::info!(source = ?self.source, "Pool is closed");
            return Err(PoolError::PoolClosed);
        }
        Ok(())
    }

    /// Flip to closed. Returns false if another caller got there first.
    pub(crate) fn mark_closed(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn notify(&self, token: Token, name: Option<&str>, kind: EventKind) {
        self.notify_at(token, name, kind, None, None);
    }

    pub(crate) fn notify_at(
        &self,
        token: Token,
        name: Option<&str>,
        kind: EventKind,
        segment: Option<u32>,
        slot: Option<u32>,
    ) {
        if let Some(listener) = &self.listener {
            listener.on_event(&PoolEvent {
                source: self.source,
                token,
                name,
                kind,
                segment,
                slot,
            });
        }
    }
}
