//! Multi-slot pool: many concurrent readers per table.
//!
//! Each table owns a chain of segments of [`ENTRY_SIZE`] slots. A slot is claimed
//! by CAS-ing its owner from `UNALLOCATED` to the caller's token; when a segment is
//! full the caller that wins the `OPEN → ALLOCATED` CAS on its `next_status`
//! publishes the next segment. Segments are never freed, only their slots reused.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use super::{PoolCore, PoolHooks};
use crate::cell::SlotCell;
use crate::clock::Timestamp;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::event::{CloseReason, EventKind, Source};
use crate::factory::ResourceFactory;
use crate::reaper::IdleSweep;
use crate::token::{Token, UNALLOCATED};

/// Slots per segment.
pub const ENTRY_SIZE: usize = 32;

const UNLOCKED: u64 = UNALLOCATED;

const NEXT_OPEN: u8 = 0;
const NEXT_ALLOCATED: u8 = 1;
const NEXT_LOCKED: u8 = 2;

struct Slot<R> {
    owner: AtomicU64,
    release_time: AtomicU64,
    /// A live handle belongs to this slot, parked in `idle` or checked out.
    resident: AtomicBool,
    /// Set by the shutdown sweep on a checked-out handle so its return closes it for real.
    severed: AtomicBool,
    idle: SlotCell<R>,
}

impl<R> Slot<R> {
    fn new(now: Timestamp) -> Self {
        Self {
            owner: AtomicU64::new(UNALLOCATED),
            release_time: AtomicU64::new(now),
            resident: AtomicBool::new(false),
            severed: AtomicBool::new(false),
            idle: SlotCell::empty(),
        }
    }

    fn try_claim(&self, raw: u64) -> Result<u64, u64> {
        self.owner
            .compare_exchange(UNALLOCATED, raw, Ordering::AcqRel, Ordering::Acquire)
    }

    fn release(&self) {
        self.owner.store(UNALLOCATED, Ordering::Release);
    }

    fn is_busy(&self) -> bool {
        self.owner.load(Ordering::Acquire) != UNALLOCATED && self.resident.load(Ordering::Acquire)
    }
}

struct Segment<R> {
    index: u32,
    slots: Box<[Slot<R>]>,
    next_status: AtomicU8,
}

impl<R> Segment<R> {
    fn new(index: u32, now: Timestamp) -> Self {
        Self {
            index,
            slots: (0..ENTRY_SIZE).map(|_| Slot::new(now)).collect(),
            next_status: AtomicU8::new(NEXT_OPEN),
        }
    }
}

struct Entry<R> {
    name: Arc<str>,
    lock_owner: AtomicU64,
    /// Append-only arena; segment `i + 1` is published only after segment `i`.
    segments: Box<[OnceLock<Arc<Segment<R>>>]>,
}

impl<R> Entry<R> {
    fn new(name: &str, max_segments: u32, now: Timestamp) -> Self {
        let segments: Box<[OnceLock<Arc<Segment<R>>>]> =
            (0..max_segments).map(|_| OnceLock::new()).collect();
        if let Some(head) = segments.first() {
            let _ = head.set(Arc::new(Segment::new(0, now)));
        }
        Self {
            name: Arc::from(name),
            lock_owner: AtomicU64::new(UNLOCKED),
            segments,
        }
    }

    fn segment(&self, index: u32) -> Option<&Arc<Segment<R>>> {
        self.segments.get(index as usize)?.get()
    }

    fn chain(&self) -> impl Iterator<Item = &Arc<Segment<R>>> {
        self.segments.iter().map_while(OnceLock::get)
    }

    /// Publish the segment after `segment` if this caller wins the right to build it.
    fn grow(&self, segment: &Segment<R>, now: Timestamp) -> bool {
        let next = segment.index + 1;
        let Some(cell) = self.segments.get(next as usize) else {
            return false;
        };
        if segment
            .next_status
            .compare_exchange(NEXT_OPEN, NEXT_ALLOCATED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        cell.set(Arc::new(Segment::new(next, now))).is_ok()
    }
}

struct Shared<F: ResourceFactory> {
    core: PoolCore,
    factory: F,
    entries: DashMap<String, Arc<Entry<F::Resource>>>,
    max_segments: u32,
}

/// Pool of table readers. Dropping the pool closes it.
pub struct ReaderPool<F: ResourceFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: ResourceFactory> ReaderPool<F> {
    pub fn new(factory: F, config: &PoolConfig) -> Self {
        Self::with_hooks(factory, config, PoolHooks::default())
    }

    pub fn with_hooks(factory: F, config: &PoolConfig, hooks: PoolHooks) -> Self {
        let shared = Arc::new(Shared {
            core: PoolCore::new(Source::Reader, config.inactive_reader_ttl, hooks),
            factory,
            entries: DashMap::new(),
            max_segments: config.max_segments(),
        });
        shared.core.notify(Token::current(), None, EventKind::PoolOpen);
        tracing::info!(max_segments = shared.max_segments, "Reader pool open");
        Self { shared }
    }

    /// Reader for `name` on behalf of the current thread.
    pub fn get(&self, name: &str) -> Result<PooledReader<F>, PoolError> {
        self.get_as(Token::current(), name)
    }

    pub fn get_as(&self, token: Token, name: &str) -> Result<PooledReader<F>, PoolError> {
        Shared::acquire(&self.shared, token, name)
    }

    /// Close every idle reader of `name` and refuse new ones until [`unlock`](Self::unlock).
    ///
    /// Fails without waiting if any reader of `name` is checked out, including one
    /// held by the caller.
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

    /// Close idle readers released before `deadline`. Returns whether any were closed.
    pub fn release_idle(&self, deadline: Timestamp) -> bool {
        self.shared.sweep(deadline, CloseReason::Idle).removed
    }

    /// Close readers idle for longer than the configured TTL.
    pub fn release_inactive(&self) -> bool {
        self.release_idle(self.shared.core.inactive_deadline())
    }

    /// Close every idle reader. Returns whether none are checked out.
    ///
    /// Once the pool is closed, checked-out readers are also severed so that
    /// their holders close them for real.
    pub fn drain(&self) -> bool {
        self.shared.sweep(Timestamp::MAX, CloseReason::PoolClose).busy == 0
    }

    /// Stop handing out readers and drain. Returns whether the pool is fully drained.
    pub fn close(&self) -> bool {
        if !self.shared.core.mark_closed() {
            return self.drain();
        }
        let drained = self.drain();
        self.shared
            .core
            .notify(Token::current(), None, EventKind::PoolClose);
        tracing::info!(drained, "Reader pool closed");
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.shared.core.is_closed()
    }

    /// Readers currently checked out.
    pub fn busy_count(&self) -> usize {
        self.shared
            .entries
            .iter()
            .map(|kv| {
                kv.value()
                    .chain()
                    .flat_map(|segment| segment.slots.iter())
                    .filter(|slot| slot.is_busy())
                    .count()
            })
            .sum()
    }

    pub fn max_entries(&self) -> usize {
        self.shared.max_segments as usize * ENTRY_SIZE
    }
}

impl<F: ResourceFactory> Drop for ReaderPool<F> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<F: ResourceFactory> IdleSweep for ReaderPool<F> {
    fn release_inactive(&self) -> bool {
        ReaderPool::release_inactive(self)
    }
}

struct SweepOutcome {
    removed: bool,
    busy: usize,
}

impl<F: ResourceFactory> Shared<F> {
    fn entry(&self, name: &str) -> Arc<Entry<F::Resource>> {
        if let Some(entry) = self.entries.get(name).map(|e| Arc::clone(e.value())) {
            return entry;
        }
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Entry::new(name, self.max_segments, self.core.now())));
        Arc::clone(entry.value())
    }

    fn acquire(self: &Arc<Self>, token: Token, name: &str) -> Result<PooledReader<F>, PoolError> {
        self.core.check_closed()?;

        let entry = self.entry(name);

        let lock_owner = entry.lock_owner.load(Ordering::Acquire);
        if lock_owner != UNLOCKED {
            tracing::info!(table = %name, owner = lock_owner, "Table is locked");
            return Err(PoolError::locked(name));
        }

        let mut index = 0;
        while let Some(segment) = entry.segment(index) {
            for (i, slot) in segment.slots.iter().enumerate() {
                if slot.try_claim(token.as_u64()).is_ok() {
                    return self.assign(token, &entry, segment, i);
                }
            }

            tracing::debug!(table = %name, token = %token, segment = index + 1, "Moving to next segment");
            if entry.grow(segment, self.core.now()) {
                tracing::debug!(table = %name, token = %token, segment = index + 1, "Allocated segment");
            }
            index += 1;
        }

        self.core.notify(token, Some(name), EventKind::Full);
        tracing::info!(
            table = %name,
            token = %token,
            segments = self.max_segments,
            "Table is busy, every reader slot is taken"
        );
        Err(PoolError::unavailable(name))
    }

    /// Hand out the slot this caller just claimed, opening or refreshing its reader.
    fn assign(
        self: &Arc<Self>,
        token: Token,
        entry: &Entry<F::Resource>,
        segment: &Arc<Segment<F::Resource>>,
        index: usize,
    ) -> Result<PooledReader<F>, PoolError> {
        let slot = &segment.slots[index];
        let name = &*entry.name;
        let position = Some(index as u32);

        slot.severed.store(false, Ordering::Release);

        let resource = match slot.idle.take() {
            Some(mut resource) => {
                self.factory.refresh(name, &mut resource);
                self.core.notify_at(token, Some(name), EventKind::Get, Some(segment.index), position);
                resource
            }
            None => {
                tracing::info!(table = %name, segment = segment.index, slot = index, "Opening reader");
                match self.factory.open(name) {
                    Ok(resource) => {
                        slot.resident.store(true, Ordering::Release);
                        self.core.notify_at(
                            token,
                            Some(name),
                            EventKind::Create,
                            Some(segment.index),
                            position,
                        );
                        resource
                    }
                    Err(e) => {
                        slot.release();
                        tracing::error!(table = %name, error = %e, "Failed to open reader");
                        return Err(PoolError::construction(name, e));
                    }
                }
            }
        };

        if self.core.is_closed() {
            slot.resident.store(false, Ordering::Release);
            slot.release();
            tracing::info!(table = %name, "Pool closed during claim, reader born free");
            return Ok(PooledReader {
                name: Arc::clone(&entry.name),
                resource: Some(resource),
                lease: None,
            });
        }

        tracing::debug!(
            table = %name,
            segment = segment.index,
            slot = index,
            token = %token,
            "Reader assigned"
        );
        Ok(PooledReader {
            name: Arc::clone(&entry.name),
            resource: Some(resource),
            lease: Some(Lease {
                pool: Arc::clone(self),
                segment: Arc::clone(segment),
                slot: index,
                token,
            }),
        })
    }

    /// Returns true if the reader stays warm in its slot, false if it was closed for real.
    fn return_to_pool(&self, lease: &Lease<F>, name: &str, resource: F::Resource) -> bool {
        let slot = lease.slot();
        let segment = Some(lease.segment.index);
        let position = Some(lease.slot as u32);

        if slot.severed.load(Ordering::Acquire) {
            slot.resident.store(false, Ordering::Release);
            slot.release();
            drop(resource);
            tracing::info!(table = %name, "Closed reader left behind by pool shutdown");
            return false;
        }

        if slot.owner.load(Ordering::Acquire) == UNALLOCATED {
            tracing::error!(table = %name, segment = lease.segment.index, slot = lease.slot, "Reader returned to a free slot");
            self.core
                .notify_at(lease.token, Some(name), EventKind::UnexpectedClose, segment, position);
            drop(resource);
            return false;
        }

        if self.core.is_closed() {
            slot.resident.store(false, Ordering::Release);
            self.core
                .notify_at(lease.token, Some(name), EventKind::OutOfPoolClose, segment, position);
            tracing::info!(table = %name, token = %lease.token, "Pool closed, allowing reader to close");
            drop(resource);
            return false;
        }

        if let Err(resource) = slot.idle.put(resource) {
            slot.resident.store(false, Ordering::Release);
            drop(resource);
        }
        slot.release_time.store(self.core.now(), Ordering::Release);
        slot.release();

        self.core
            .notify_at(lease.token, Some(name), EventKind::Return, segment, position);
        tracing::debug!(
            table = %name,
            segment = lease.segment.index,
            slot = lease.slot,
            token = %lease.token,
            "Reader is back"
        );
        true
    }

    /// Close the idle reader of a slot the caller has claimed.
    fn close_slot(
        &self,
        token: Token,
        name: &str,
        segment: &Segment<F::Resource>,
        index: usize,
        kind: EventKind,
        reason: CloseReason,
    ) -> bool {
        let slot = &segment.slots[index];
        let Some(resource) = slot.idle.take() else {
            return false;
        };
        slot.resident.store(false, Ordering::Release);
        drop(resource);
        tracing::info!(
            table = %name,
            segment = segment.index,
            slot = index,
            reason = %reason,
            "Closed reader"
        );
        self.core
            .notify_at(token, Some(name), kind, Some(segment.index), Some(index as u32));
        true
    }

    fn lock(&self, token: Token, name: &str) -> Result<(), PoolError> {
        self.core.check_closed()?;

        let entry = self.entry(name);
        let raw = token.as_u64();

        if let Err(owner) =
            entry
                .lock_owner
                .compare_exchange(UNLOCKED, raw, Ordering::AcqRel, Ordering::Acquire)
            && owner != raw
        {
            tracing::error!(table = %name, owner, "Table already locked");
            self.core.notify(token, Some(name), EventKind::LockBusy);
            return Err(PoolError::locked(name));
        }

        let mut index = 0;
        while let Some(segment) = entry.segment(index) {
            for (i, slot) in segment.slots.iter().enumerate() {
                match slot.try_claim(raw) {
                    Ok(_) => {
                        self.close_slot(token, name, segment, i, EventKind::LockClose, CloseReason::NameLock);
                    }
                    Err(owner) if owner == raw => {
                        if slot.resident.load(Ordering::Acquire) {
                            tracing::warn!(
                                table = %name,
                                segment = index,
                                slot = i,
                                "Caller holds an active reader, it must close it before locking"
                            );
                            self.abandon_lock(token, &entry);
                            return Err(PoolError::self_held(name));
                        }
                    }
                    Err(owner) => {
                        tracing::info!(
                            table = %name,
                            segment = index,
                            slot = i,
                            owner,
                            token = %token,
                            "Table is busy"
                        );
                        self.abandon_lock(token, &entry);
                        return Err(PoolError::unavailable(name));
                    }
                }
            }

            if entry.segment(index + 1).is_none() {
                // Freeze growth. If another caller won the race to build the next
                // segment it has to be visible here, or it cannot be drained.
                match segment.next_status.compare_exchange(
                    NEXT_OPEN,
                    NEXT_LOCKED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) | Err(NEXT_LOCKED) => break,
                    Err(_) if entry.segment(index + 1).is_none() => {
                        tracing::info!(
                            table = %name,
                            segment = index + 1,
                            token = %token,
                            "Table is busy, lost race to a new segment"
                        );
                        self.abandon_lock(token, &entry);
                        return Err(PoolError::unavailable(name));
                    }
                    Err(_) => {}
                }
            }
            index += 1;
        }

        self.core.notify(token, Some(name), EventKind::LockSuccess);
        tracing::info!(table = %name, token = %token, "Table locked");
        Ok(())
    }

    /// Undo a failed lock: free the slots it drained and clear the lock owner.
    fn abandon_lock(&self, token: Token, entry: &Entry<F::Resource>) {
        let raw = token.as_u64();
        for slot in entry.chain().flat_map(|segment| segment.slots.iter()) {
            if !slot.resident.load(Ordering::Acquire) {
                let _ = slot.owner.compare_exchange(
                    raw,
                    UNALLOCATED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
        entry.lock_owner.store(UNLOCKED, Ordering::Release);
        self.core.notify(token, Some(&entry.name), EventKind::LockBusy);
    }

    fn unlock(&self, token: Token, name: &str) -> Result<(), PoolError> {
        let raw = token.as_u64();
        let entry = self
            .entries
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .filter(|e| e.lock_owner.load(Ordering::Acquire) == raw);

        let Some(entry) = entry else {
            tracing::info!(table = %name, token = %token, "Table not locked by caller, cannot unlock");
            self.core.notify(token, Some(name), EventKind::NotLocked);
            return Err(PoolError::not_locked(name));
        };

        for segment in entry.chain() {
            for slot in segment.slots.iter() {
                let _ = slot.owner.compare_exchange(
                    raw,
                    UNALLOCATED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            let _ = segment.next_status.compare_exchange(
                NEXT_LOCKED,
                NEXT_OPEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        entry.lock_owner.store(UNLOCKED, Ordering::Release);

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
            for segment in entry.chain() {
                for (i, slot) in segment.slots.iter().enumerate() {
                    if !slot.resident.load(Ordering::Acquire)
                        || deadline <= slot.release_time.load(Ordering::Acquire)
                    {
                        continue;
                    }

                    match slot.try_claim(token.as_u64()) {
                        Ok(_) => {
                            // The slot may have been reused and returned between the check and the claim.
                            if deadline > slot.release_time.load(Ordering::Acquire)
                                && self.close_slot(token, &entry.name, segment, i, EventKind::Expire, reason)
                            {
                                outcome.removed = true;
                            }
                            slot.release();
                        }
                        Err(_) if shutdown => {
                            // Only a closed pool gives up on its checked-out readers.
                            if self.core.is_closed() {
                                slot.severed.store(true, Ordering::Release);
                            }
                            outcome.busy += 1;
                            tracing::info!(
                                table = %entry.name,
                                segment = segment.index,
                                slot = i,
                                "Shutting down, reader is left behind"
                            );
                        }
                        Err(_) => {}
                    }
                }
            }
        }

        outcome
    }
}

struct Lease<F: ResourceFactory> {
    pool: Arc<Shared<F>>,
    segment: Arc<Segment<F::Resource>>,
    slot: usize,
    token: Token,
}

impl<F: ResourceFactory> Lease<F> {
    fn slot(&self) -> &Slot<F::Resource> {
        &self.segment.slots[self.slot]
    }
}

/// A reader checked out of a [`ReaderPool`].
///
/// Closing or dropping it returns the reader to its slot; if the pool has been
/// closed in the meantime the reader is closed for real instead.
pub struct PooledReader<F: ResourceFactory> {
    name: Arc<str>,
    resource: Option<F::Resource>,
    lease: Option<Lease<F>>,
}

impl<F: ResourceFactory> PooledReader<F> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn segment(&self) -> Option<u32> {
        self.lease.as_ref().map(|lease| lease.segment.index)
    }

    pub fn slot(&self) -> Option<u32> {
        self.lease.as_ref().map(|lease| lease.slot as u32)
    }

    /// False once the reader has been severed from the pool (born free after close).
    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }

    /// Returns true if the reader went back to the pool, false if it was closed for real.
    pub fn close(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        let Some(resource) = self.resource.take() else {
            return false;
        };
        match self.lease.take() {
            Some(lease) => lease.pool.return_to_pool(&lease, &self.name, resource),
            None => {
                drop(resource);
                false
            }
        }
    }
}

impl<F: ResourceFactory> Deref for PooledReader<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().expect("reader used after close")
    }
}

impl<F: ResourceFactory> DerefMut for PooledReader<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().expect("reader used after close")
    }
}

impl<F: ResourceFactory> Drop for PooledReader<F> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<F: ResourceFactory> std::fmt::Debug for PooledReader<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledReader")
            .field("name", &self.name)
            .field("segment", &self.segment())
            .field("slot", &self.slot())
            .finish()
    }
}
