//! Caller identity used as the owner of slots and locks.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Raw value stored in owner atomics when nobody holds the slot or lock.
pub(crate) const UNALLOCATED: u64 = 0;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Token = Token::mint();
}

/// Identity of the logical caller that claims slots and locks.
///
/// Minted from a process-wide counter, so a value is never handed out twice,
/// unlike OS thread ids which may be recycled. One token must be used by one
/// sequential caller at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Token(NonZeroU64);

impl Token {
    /// Mint a fresh identity, e.g. one per task on a work-stealing scheduler.
    pub fn mint() -> Self {
        let id = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }

    /// Identity bound to the current OS thread.
    pub fn current() -> Self {
        CURRENT.with(|token| *token)
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
