//! Lifecycle events emitted to an injected listener.
//!
//! Events are a side channel for observability and tests: they never affect
//! control flow, and a pool without a listener skips them entirely.

use serde::Serialize;

use crate::token::Token;

/// Which pool emitted the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    Reader,
    Writer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A new handle was opened for a slot.
    Create,
    /// A warm handle was handed out again.
    Get,
    /// A handle went back to its slot.
    Return,
    /// An idle handle was closed by a sweep.
    Expire,
    /// Every slot of every segment is taken.
    Full,
    LockSuccess,
    LockBusy,
    NotLocked,
    Unlocked,
    /// A handle was closed for real because the pool is closed.
    OutOfPoolClose,
    /// An idle handle was closed to make way for an exclusive lock.
    LockClose,
    PoolOpen,
    PoolClose,
    /// A cached construction failure was re-raised to the caller that caused it.
    ExResend,
    /// Construction failed and the failure was cached.
    CreateEx,
    /// A handle was closed while its entry had no owner.
    UnexpectedClose,
}

/// Why the pool closed a handle for real.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Idle,
    PoolClose,
    NameLock,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::PoolClose => "POOL_CLOSE",
            Self::NameLock => "NAME_LOCK",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state transition. `segment` and `slot` are set for reader slot events only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolEvent<'a> {
    pub source: Source,
    pub token: Token,
    pub name: Option<&'a str>,
    pub kind: EventKind,
    pub segment: Option<u32>,
    pub slot: Option<u32>,
}

pub trait PoolListener: Send + Sync {
    fn on_event(&self, event: &PoolEvent<'_>);
}
