use thiserror::Error;

/// Failure reported by a [`ResourceFactory`](crate::ResourceFactory) while opening a table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ConstructionError {
    message: String,
}

impl ConstructionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for ConstructionError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The table is under an exclusive lock.
    #[error("table '{name}' is locked")]
    EntryLocked { name: String },

    /// No free slot, or the slot is held by another caller. Safe to retry.
    #[error("table '{name}' is busy")]
    EntryUnavailable { name: String },

    #[error("pool is closed")]
    PoolClosed,

    #[error("failed to open table '{name}': {source}")]
    ConstructionFailed {
        name: String,
        #[source]
        source: ConstructionError,
    },

    #[error("cannot acquire lock file for table '{name}': {message}")]
    ExternalLockFailed { name: String, message: String },

    /// The caller must close its own handle before locking the table.
    #[error("cannot lock table '{name}' while holding an active handle")]
    LockSelfHeld { name: String },

    #[error("table '{name}' is not locked by this caller")]
    NotLocked { name: String },
}

impl PoolError {
    pub(crate) fn locked(name: &str) -> Self {
        Self::EntryLocked {
            name: name.to_string(),
        }
    }

    pub(crate) fn unavailable(name: &str) -> Self {
        Self::EntryUnavailable {
            name: name.to_string(),
        }
    }

    pub(crate) fn construction(name: &str, source: ConstructionError) -> Self {
        Self::ConstructionFailed {
            name: name.to_string(),
            source,
        }
    }

    pub(crate) fn self_held(name: &str) -> Self {
        Self::LockSelfHeld {
            name: name.to_string(),
        }
    }

    pub(crate) fn not_locked(name: &str) -> Self {
        Self::NotLocked {
            name: name.to_string(),
        }
    }

    /// Whether retrying the same call later may succeed without any other action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::EntryUnavailable { .. })
    }
}
