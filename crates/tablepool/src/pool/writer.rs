//! Single-slot pool: at most one live writer per table.
//!
//! An entry leaves the map when its writer is closed, when the table is unlocked
//! and when a failed open is purged. A removed entry keeps its last owner, so a
//! caller still holding a stale reference to it loses the claim CAS and retries
//! against the fresh entry.

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use dashmap::DashMap;

use super::lock_file::{self, LockFile};
use super::{PoolCore, PoolHooks};
use crate::cell::SlotCell;
use crate::clock::Timestamp;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::event::{CloseReason, EventKind, Source};
use crate::factory::ResourceFactory;
use crate::reaper::IdleSweep;
use crate::token::{Token, UNALLOCATED};

struct Entry<R> {
    name: Arc<str>,
    owner: AtomicU64,
    resource: SlotCell<Arc<R>>,
    resident: AtomicBool,
    last_release: AtomicU64,
    /// Open wrappers handed to the owner; the entry is released when the last closes.
    holds: AtomicU32,
    locked: AtomicBool,
    lock_file: SlotCell<LockFile>,
    pending_error: SlotCell<PoolError>,
    failed: AtomicBool,
    severed: AtomicBool,
}

impl<R> Entry<R> {
    fn new(name: &str, owner: u64, now: Timestamp) -> Self {
        Self {
            name: Arc::from(name),
            owner: AtomicU64::new(owner),
            resource: SlotCell::empty(),
            resident: AtomicBool::new(false),
            last_release: AtomicU64::new(now),
            holds: AtomicU32::new(0),
            locked: AtomicBool::new(false),
            lock_file: SlotCell::empty(),
            pending_error: SlotCell::empty(),
            failed: AtomicBool::new(false),
            severed: AtomicBool::new(false),
        }
    }

    fn owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }
}

struct Shared<F: ResourceFactory> {
    core: PoolCore,
    factory: F,
    entries: DashMap<String, Arc<Entry<F::Resource>>>,
    lock_dir: Option<PathBuf>,
}

/// Pool of table writers. Dropping the pool closes it.
pub struct WriterPool<F: ResourceFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: ResourceFactory> WriterPool<F> {
    pub fn new(factory: F, config: &PoolConfig) -> Self {
        Self::with_hooks(factory, config, PoolHooks::default())
    }

    pub fn with_hooks(factory: F, config: &PoolConfig, hooks: PoolHooks) -> Self {
        let shared = Arc::new(Shared {
            core: PoolCore::new(Source::Writer, config.inactive_writer_ttl, hooks),
            factory,
            entries: DashMap::new(),
            lock_dir: config.lock_dir.clone(),
        });
        shared.core.notify(Token::current(), None, EventKind::PoolOpen);
        tracing::info!(lock_dir = ?shared.lock_dir, "Writer pool open");
        Self { shared }
    }

    /// The writer for `name`, on behalf of the current thread.
    ///
    /// A second call by the owner hands back the writer it already holds.
    pub fn get(&self, name: &str) -> Result<PooledWriter<F>, PoolError> {
        self.get_as(Token::current(), name)
    }

    pub fn get_as(&self, token: Token, name: &str) -> Result<PooledWriter<F>, PoolError> {
        Shared::acquire(&self.shared, token, name)
    }

    /// Close the idle writer of `name`, take the cross-process lock file if a
    /// lock directory is configured and refuse writers until [`unlock`](Self::unlock).
    pub fn lock(&self, name: &str) -> Result<(), PoolError> {
        self.lock_as(Token::current(), name)
    }

    pub fn lock_as(&self, token: Token, name: &str) -> Result<(), PoolError> {
        self.shared.lock(token, name)
    }

    pub fn unlock(&self, name: &str) -> Result<(), PoolError> {
        self.unlock_as(Token::current(), name)
    }

    pub fn unlock_as(&self, token: Token, name: &str) -> Result<(), PoolError> {
        self.shared.unlock(token, name)
    }

    /// Close writers released before `deadline` and purge failed opens.
    /// Returns whether anything was removed.
    pub fn release_idle(&self, deadline: Timestamp) -> bool {
        self.shared.sweep(deadline, CloseReason::Idle).removed
    }

    pub fn release_inactive(&self) -> bool {
        self.release_idle(self.shared.core.inactive_deadline())
    }

    /// Close idle writers and release lock files. Returns whether none are checked out.
    ///
    /// Once the pool is closed, checked-out writers are also severed.
    pub fn drain(&self) -> bool {
        self.shared.sweep(Timestamp::MAX, CloseReason::PoolClose).busy == 0
    }

    pub fn close(&self) -> bool {
        if !self.shared.core.mark_closed() {
            return self.drain();
        }
        let drained = self.drain();
        self.shared
            .core
            .notify(Token::current(), None, EventKind::PoolClose);
        tracing::info!(drained, "Writer pool closed");
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.shared.core.is_closed()
    }

    /// Tables known to the pool, including locked and failed ones.
    pub fn size(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn free_count(&self) -> usize {
        self.count(|entry| entry.owner() == UNALLOCATED)
    }

    /// Writers currently checked out.
    pub fn busy_count(&self) -> usize {
        self.count(|entry| {
            entry.owner() != UNALLOCATED
                && entry.resident.load(Ordering::Acquire)
                && !entry.locked.load(Ordering::Acquire)
        })
    }

    fn count(&self, predicate: impl Fn(&Entry<F::Resource>) -> bool) -> usize {
        self.shared
            .entries
            .iter()
            .filter(|kv| predicate(kv.value().as_ref()))
            .count()
    }
}

impl<F: ResourceFactory> Drop for WriterPool<F> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<F: ResourceFactory> IdleSweep for WriterPool<F> {
    fn release_inactive(&self) -> bool {
        WriterPool::release_inactive(self)
    }
}

struct SweepOutcome {
    removed: bool,
    busy: usize,
}

impl<F: ResourceFactory> Shared<F> {
    /// Find the entry for `name`, inserting one owned by `raw` if absent.
    /// The flag is true when this call inserted it.
    fn entry(&self, name: &str, raw: u64) -> (Arc<Entry<F::Resource>>, bool) {
        if let Some(entry) = self.entries.get(name).map(|e| Arc::clone(e.value())) {
            return (entry, false);
        }
        let mut inserted = false;
        let entry = Arc::clone(
            self.entries
                .entry(name.to_string())
                .or_insert_with(|| {
                    inserted = true;
                    Arc::new(Entry::new(name, raw, self.core.now()))
                })
                .value(),
        );
        (entry, inserted)
    }

    fn remove(&self, entry: &Arc<Entry<F::Resource>>) -> bool {
        self.entries
            .remove_if(&*entry.name, |_, current| Arc::ptr_eq(current, entry))
            .is_some()
    }

    fn acquire(self: &Arc<Self>, token: Token, name: &str) -> Result<PooledWriter<F>, PoolError> {
        self.core.check_closed()?;

        let raw = token.as_u64();
        let (entry, inserted) = self.entry(name, raw);
        if inserted {
            return self.create(token, &entry);
        }

        match entry
            .owner
            .compare_exchange(UNALLOCATED, raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => match entry.resource.cloned() {
                Some(resource) => {
                    entry.holds.store(1, Ordering::Release);
                    self.check_out(token, &entry, resource, EventKind::Get)
                }
                None => self.create(token, &entry),
            },
            Err(owner) if owner == raw => {
                if entry.locked.load(Ordering::Acquire) {
                    tracing::info!(table = %name, token = %token, "Caller holds the table lock");
                    return Err(PoolError::locked(name));
                }
                if let Some(err) = entry.pending_error.cloned() {
                    self.core.notify(token, Some(name), EventKind::ExResend);
                    tracing::info!(table = %name, token = %token, "Resending cached open failure");
                    return Err(err);
                }
                let Some(resource) = entry.resource.cloned() else {
                    tracing::info!(table = %name, token = %token, "Writer is being opened");
                    return Err(PoolError::unavailable(name));
                };
                entry.holds.fetch_add(1, Ordering::AcqRel);
                self.check_out(token, &entry, resource, EventKind::Get)
            }
            Err(owner) => {
                if entry.locked.load(Ordering::Acquire) {
                    tracing::info!(table = %name, owner, "Table is locked");
                    return Err(PoolError::locked(name));
                }
                tracing::error!(table = %name, owner, token = %token, "Writer is busy");
                Err(PoolError::unavailable(name))
            }
        }
    }

    fn create(
        self: &Arc<Self>,
        token: Token,
        entry: &Arc<Entry<F::Resource>>,
    ) -> Result<PooledWriter<F>, PoolError> {
        let name = &*entry.name;

        if self.core.is_closed() {
            self.remove(entry);
            tracing::info!(table = %name, "Pool closed, not opening writer");
            return Err(PoolError::PoolClosed);
        }

        tracing::info!(table = %name, token = %token, "Opening writer");
        match self.factory.open(name) {
            Ok(resource) => {
                let resource = Arc::new(resource);
                let _ = entry.resource.put(Arc::clone(&resource));
                entry.resident.store(true, Ordering::Release);
                entry.holds.store(1, Ordering::Release);
                self.check_out(token, entry, resource, EventKind::Create)
            }
            Err(e) => {
                let err = PoolError::construction(name, e);
                tracing::error!(table = %name, error = %err, "Failed to open writer");
                let _ = entry.pending_error.put(err.clone());
                entry.failed.store(true, Ordering::Release);
                self.core.notify(token, Some(name), EventKind::CreateEx);
                Err(err)
            }
        }
    }

    fn check_out(
        self: &Arc<Self>,
        token: Token,
        entry: &Arc<Entry<F::Resource>>,
        resource: Arc<F::Resource>,
        kind: EventKind,
    ) -> Result<PooledWriter<F>, PoolError> {
        let name = &*entry.name;

        if self.core.is_closed() {
            // The pool will not see this writer again; the caller closes it.
            drop(entry.resource.take());
            entry.resident.store(false, Ordering::Release);
            self.remove(entry);
            tracing::info!(table = %name, "Pool closed during claim, writer born free");
            return Ok(PooledWriter {
                name: Arc::clone(&entry.name),
                resource: Some(resource),
                lease: None,
            });
        }

        self.core.notify(token, Some(name), kind);
        tracing::debug!(table = %name, token = %token, "Writer assigned");
        Ok(PooledWriter {
            name: Arc::clone(&entry.name),
            resource: Some(resource),
            lease: Some(Lease {
                pool: Arc::clone(self),
                entry: Arc::clone(entry),
                token,
            }),
        })
    }

    /// Called after the wrapper dropped its reference. Returns true while the writer stays pooled.
    fn return_to_pool(&self, lease: &Lease<F>) -> bool {
        let entry = &lease.entry;
        let name = &*entry.name;

        if entry.owner() == UNALLOCATED {
            tracing::error!(table = %name, token = %lease.token, "Writer returned to an entry nobody owns");
            self.core
                .notify(lease.token, Some(name), EventKind::UnexpectedClose);
            return true;
        }

        if entry.holds.fetch_sub(1, Ordering::AcqRel) > 1 {
            return true;
        }

        if self.core.is_closed() || entry.severed.load(Ordering::Acquire) {
            let resource = entry.resource.take();
            entry.resident.store(false, Ordering::Release);
            self.remove(entry);
            self.core
                .notify(lease.token, Some(name), EventKind::OutOfPoolClose);
            tracing::info!(table = %name, token = %lease.token, "Pool closed, allowing writer to close");
            drop(resource);
            return false;
        }

        entry
            .last_release
            .store(self.core.now(), Ordering::Release);
        entry.owner.store(UNALLOCATED, Ordering::Release);

        self.core.notify(lease.token, Some(name), EventKind::Return);
        tracing::debug!(table = %name, token = %lease.token, "Writer is back");
        true
    }

    /// Close the pooled writer of an entry the caller has claimed.
    fn close_writer(
        &self,
        token: Token,
        entry: &Entry<F::Resource>,
        kind: EventKind,
        reason: CloseReason,
    ) -> bool {
        let Some(resource) = entry.resource.take() else {
            return false;
        };
        entry.resident.store(false, Ordering::Release);
        drop(resource);
        tracing::info!(table = %entry.name, reason = %reason, "Closed writer");
        self.core.notify(token, Some(&entry.name), kind);
        true
    }

    fn lock(&self, token: Token, name: &str) -> Result<(), PoolError> {
        self.core.check_closed()?;

        let raw = token.as_u64();
        let (entry, inserted) = self.entry(name, raw);
        if inserted {
            return self.lock_entry(token, &entry);
        }

        match entry
            .owner
            .compare_exchange(UNALLOCATED, raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.close_writer(token, &entry, EventKind::LockClose, CloseReason::NameLock);
                self.lock_entry(token, &entry)
            }
            Err(owner) if owner == raw => {
                if entry.locked.load(Ordering::Acquire) {
                    self.core.notify(token, Some(name), EventKind::LockSuccess);
                    return Ok(());
                }
                if !entry.resident.load(Ordering::Acquire) {
                    // Owner of a failed open: the lock supersedes the cached error.
                    entry.pending_error.take();
                    entry.failed.store(false, Ordering::Release);
                    return self.lock_entry(token, &entry);
                }
                tracing::warn!(table = %name, token = %token, "Caller holds the writer, it must close it before locking");
                self.core.notify(token, Some(name), EventKind::LockBusy);
                Err(PoolError::self_held(name))
            }
            Err(owner) => {
                self.core.notify(token, Some(name), EventKind::LockBusy);
                if entry.locked.load(Ordering::Acquire) {
                    tracing::error!(table = %name, owner, "Table already locked");
                    return Err(PoolError::locked(name));
                }
                tracing::info!(table = %name, owner, token = %token, "Writer is busy, cannot lock");
                Err(PoolError::unavailable(name))
            }
        }
    }

    /// Take the lock file, if any, for an entry this caller already owns.
    fn lock_entry(&self, token: Token, entry: &Entry<F::Resource>) -> Result<(), PoolError> {
        let name = &*entry.name;

        if let Some(dir) = &self.lock_dir {
            match lock_file::acquire(dir, name) {
                Ok(file) => {
                    tracing::debug!(table = %name, path = %file.path().display(), "Holding lock file");
                    let _ = entry.lock_file.put(file);
                }
                Err(err) => {
                    tracing::error!(table = %name, error = %err, "Could not lock table");
                    entry.owner.store(UNALLOCATED, Ordering::Release);
                    self.core.notify(token, Some(name), EventKind::LockBusy);
                    return Err(err);
                }
            }
        }

        entry.locked.store(true, Ordering::Release);
        self.core.notify(token, Some(name), EventKind::LockSuccess);
        tracing::info!(table = %name, token = %token, "Table locked");
        Ok(())
    }

    fn unlock(&self, token: Token, name: &str) -> Result<(), PoolError> {
        let raw = token.as_u64();
        let entry = self
            .entries
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .filter(|e| e.owner() == raw && e.locked.load(Ordering::Acquire));

        let Some(entry) = entry else {
            tracing::info!(table = %name, token = %token, "Table not locked by caller, cannot unlock");
            self.core.notify(token, Some(name), EventKind::NotLocked);
            return Err(PoolError::not_locked(name));
        };

        let file = entry.lock_file.take();
        self.remove(&entry);
        drop(file);

        self.core.notify(token, Some(name), EventKind::Unlocked);
        tracing::info!(table = %name, token = %token, "Table unlocked");
        Ok(())
    }

    fn sweep(&self, deadline: Timestamp, reason: CloseReason) -> SweepOutcome {
        let token = Token::current();
        let shutdown = reason == CloseReason::PoolClose;
        let entries: Vec<_> = self
            .entries
            .iter()
            .map(|kv| Arc::clone(kv.value()))
            .collect();

        let mut outcome = SweepOutcome {
            removed: false,
            busy: 0,
        };

        for entry in &entries {
            let name = &*entry.name;

            if entry.failed.load(Ordering::Acquire) {
                if self.remove(entry) {
                    entry.pending_error.take();
                    tracing::info!(table = %name, "Purged failed writer");
                    outcome.removed = true;
                }
                continue;
            }

            if entry.locked.load(Ordering::Acquire) {
                if shutdown && self.remove(entry) {
                    drop(entry.lock_file.take());
                    tracing::info!(table = %name, "Released table lock");
                    outcome.removed = true;
                }
                continue;
            }

            if deadline <= entry.last_release.load(Ordering::Acquire) {
                continue;
            }

            match entry.owner.compare_exchange(
                UNALLOCATED,
                token.as_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // Reused and returned between the check and the claim.
                    if deadline <= entry.last_release.load(Ordering::Acquire) {
                        entry.owner.store(UNALLOCATED, Ordering::Release);
                        continue;
                    }
                    self.close_writer(token, entry, EventKind::Expire, reason);
                    self.remove(entry);
                    outcome.removed = true;
                }
                Err(_) if shutdown && entry.resident.load(Ordering::Acquire) => {
                    if self.core.is_closed() {
                        entry.severed.store(true, Ordering::Release);
                    }
                    outcome.busy += 1;
                    tracing::info!(table = %name, "Shutting down, writer is left behind");
                }
                Err(_) => {}
            }
        }

        outcome
    }
}

struct Lease<F: ResourceFactory> {
    pool: Arc<Shared<F>>,
    entry: Arc<Entry<F::Resource>>,
    token: Token,
}

/// The writer of a table, checked out of a [`WriterPool`].
///
/// Re-entrant `get` calls by the owner share the same writer; the table returns
/// to the pool when the last of those wrappers is closed or dropped.
pub struct PooledWriter<F: ResourceFactory> {
    name: Arc<str>,
    resource: Option<Arc<F::Resource>>,
    lease: Option<Lease<F>>,
}

impl<F: ResourceFactory> PooledWriter<F> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }

    /// Returns true if the writer stays with the pool, false if it was closed for real.
    pub fn close(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        let Some(resource) = self.resource.take() else {
            return false;
        };
        // Let go of this reference before the entry can be claimed by anyone else.
        drop(resource);
        match self.lease.take() {
            Some(lease) => lease.pool.return_to_pool(&lease),
            None => false,
        }
    }
}

impl<F: ResourceFactory> Deref for PooledWriter<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource.as_deref().expect("writer used after close")
    }
}

impl<F: ResourceFactory> Drop for PooledWriter<F> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<F: ResourceFactory> std::fmt::Debug for PooledWriter<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledWriter")
            .field("name", &self.name)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
