//! Region locks
//!
//! Multi-leaf operations take a lock over a box of the world before touching
//! data. Read locks share with other reads; ReadWrite locks exclude everything
//! they intersect. Per-leaf `RwLock`s keep individual accesses memory safe;
//! region locks make a whole multi-leaf operation atomic against others.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::math::Aabb;

/// Deadlines further away than this wait without polling.
const BLOCKING_THRESHOLD: Duration = Duration::from_secs(3600);

/// Upper bound on a single back-off interval.
const MAX_INTERVAL: Duration = Duration::from_millis(1);

/// Access mode of a region lock
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockKind {
    Read,
    ReadWrite,
}

impl LockKind {
    pub fn name(self) -> &'static str {
        match self {
            LockKind::Read => "read",
            LockKind::ReadWrite => "read-write",
        }
    }

    fn conflicts_with(self, other: LockKind) -> bool {
        self == LockKind::ReadWrite || other == LockKind::ReadWrite
    }
}

/// Proof that a region lock is held. Give it back with [`RegionLocks::release`].
#[must_use = "a region lock is held until the handle is released"]
#[derive(Debug)]
pub struct LockHandle {
    serial: u64,
    kind: LockKind,
    bounds: Aabb,
    label: String,
}

impl LockHandle {
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[derive(Debug)]
struct ActiveLock {
    serial: u64,
    kind: LockKind,
    bounds: Aabb,
    label: String,
}

/// Registry of held region locks
#[derive(Debug, Default)]
pub struct RegionLocks {
    active: Mutex<Vec<ActiveLock>>,
    released: Condvar,
    next_serial: AtomicU64,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RegionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, Vec<ActiveLock>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn conflict<'a>(active: &'a [ActiveLock], kind: LockKind, bounds: &Aabb) -> Option<&'a ActiveLock> {
        active
            .iter()
            .find(|held| held.kind.conflicts_with(kind) && held.bounds.intersects(bounds))
    }

    fn grant(&self, active: &mut Vec<ActiveLock>, kind: LockKind, bounds: Aabb, label: &str) -> LockHandle {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        active.push(ActiveLock {
            serial,
            kind,
            bounds,
            label: label.to_string(),
        });
        match kind {
            LockKind::Read => self.reads.fetch_add(1, Ordering::Relaxed),
            LockKind::ReadWrite => self.writes.fetch_add(1, Ordering::Relaxed),
        };
        log::debug!("Locked {} {:?} ({})", kind.name(), bounds, label);
        LockHandle {
            serial,
            kind,
            bounds,
            label: label.to_string(),
        }
    }

    /// Take the lock if nothing conflicting is held right now.
    pub fn try_acquire(&self, kind: LockKind, bounds: Aabb, label: &str) -> Option<LockHandle> {
        let mut active = self.active();
        if Self::conflict(&active, kind, &bounds).is_some() {
            return None;
        }
        Some(self.grant(&mut active, kind, bounds, label))
    }

    /// Take the lock, waiting until `deadline` at most.
    ///
    /// With no deadline, or one more than an hour away, this blocks until the
    /// lock is granted. Otherwise it polls [`RegionLocks::try_acquire`] with a
    /// spin/yield back-off of `min(1ms, remaining / 32)` per attempt, and fails
    /// with [`Error::LockTimeout`] once the deadline has passed.
    pub fn acquire(&self, kind: LockKind, bounds: Aabb, label: &str, deadline: Option<Instant>) -> Result<LockHandle> {
        let now = Instant::now();
        let deadline = match deadline {
            Some(d) if d.saturating_duration_since(now) <= BLOCKING_THRESHOLD => d,
            _ => return Ok(self.acquire_blocking(kind, bounds, label)),
        };

        loop {
            if let Some(handle) = self.try_acquire(kind, bounds, label) {
                return Ok(handle);
            }

            let now = Instant::now();
            if now >= deadline {
                let holder = Self::conflict(&self.active(), kind, &bounds)
                    .map(|held| held.label.clone())
                    .unwrap_or_default();
                log::warn!(
                    "Timed out taking {} lock on {:?} ({}), held by {}",
                    kind.name(),
                    bounds,
                    label,
                    holder
                );
                return Err(Error::LockTimeout {
                    kind: kind.name(),
                    label: label.to_string(),
                    holder,
                });
            }

            let interval = ((deadline - now) / 32).min(MAX_INTERVAL);
            let until = now + interval;
            while Instant::now() < until {
                std::hint::spin_loop();
                std::thread::yield_now();
            }
        }
    }

    fn acquire_blocking(&self, kind: LockKind, bounds: Aabb, label: &str) -> LockHandle {
        let mut active = self.active();
        while Self::conflict(&active, kind, &bounds).is_some() {
            active = self.released.wait(active).unwrap_or_else(PoisonError::into_inner);
        }
        self.grant(&mut active, kind, bounds, label)
    }

    /// Release a lock taken from this registry.
    pub fn release(&self, handle: LockHandle) {
        let mut active = self.active();
        match active.iter().position(|held| held.serial == handle.serial) {
            Some(index) => {
                active.swap_remove(index);
                match handle.kind {
                    LockKind::Read => self.reads.fetch_sub(1, Ordering::Relaxed),
                    LockKind::ReadWrite => self.writes.fetch_sub(1, Ordering::Relaxed),
                };
                log::debug!("Unlocked {} {:?} ({})", handle.kind.name(), handle.bounds, handle.label);
            }
            None => {
                debug_assert!(false, "released a lock this registry does not hold: {}", handle.label);
                log::warn!("Released unknown lock {}", handle.label);
            }
        }
        drop(active);
        self.released.notify_all();
    }

    /// True if held locks of a sufficient kind cover every voxel of `bounds`.
    /// Any held lock satisfies a Read requirement; ReadWrite needs ReadWrite.
    pub fn is_locked(&self, kind: LockKind, bounds: &Aabb) -> bool {
        let active = self.active();
        let mut uncovered = vec![*bounds];
        for held in active.iter() {
            if kind == LockKind::ReadWrite && held.kind != LockKind::ReadWrite {
                continue;
            }
            uncovered = uncovered
                .iter()
                .flat_map(|part| part.subtract(&held.bounds))
                .filter(|part| !part.is_empty())
                .collect();
            if uncovered.is_empty() {
                return true;
            }
        }
        uncovered.iter().all(Aabb::is_empty)
    }

    /// Outstanding (read, read-write) lock counts.
    pub fn outstanding(&self) -> (usize, usize) {
        (self.reads.load(Ordering::Relaxed), self.writes.load(Ordering::Relaxed))
    }
}
