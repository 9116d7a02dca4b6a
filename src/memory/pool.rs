//! 4.F Arena pool: a two-slot generational buffer over bump allocators,
//! recycled through a [`Freelist`].
//!
//! `bumps[0]` is the active arena; `bumps[1]` is the previous one, kept
//! alive only long enough for in-flight readers to finish with it. The
//! spec's "double-word CAS of `(bumps[0], bumps[1])`" is approximated
//! the same way as the bump allocator's own word: a short-held
//! `swap_lock` serializes the rare full-arena swap, while the hot
//! `alloc` path takes no lock at all, just two atomic pointer loads.

use super::bump::{max_inline_allocation, BumpShared};
use crate::concurrent::freelist::Freelist;
use crate::concurrent::rtbr;
use parking_lot::Mutex;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// `2 + allocation_limit / bump_size`: enough slots that every
/// generation a pool could possibly be shelving has somewhere to go.
pub fn freelist_capacity(allocation_limit: u64, bump_size: u64) -> u32 {
    (2 + allocation_limit / bump_size) as u32
}

/// Ceiling on `PoolShared::alloc`'s generation-bump retry: a few failed
/// attempts means every arena swap in flight lost the race, which only
/// happens under adversarial concurrent resets. Matches the original's
/// `an_bump_shared_alloc_slow` giving up rather than spinning forever.
const MAX_ALLOC_ATTEMPTS: u32 = 8;

/// Shared (lock-free hot path) arena pool, used by worker threads that
/// allocate response buffers concurrently.
pub struct PoolShared {
    bump_size: u64,
    active: AtomicPtr<BumpShared>,
    previous: AtomicPtr<BumpShared>,
    freelist: Freelist,
    swap_lock: Mutex<()>,
}

impl PoolShared {
    pub fn new(bump_size: u64, allocation_limit: u64) -> Option<Self> {
        let first = Box::into_raw(Box::new(BumpShared::create(bump_size)?));
        Some(PoolShared {
            bump_size,
            active: AtomicPtr::new(first),
            previous: AtomicPtr::new(ptr::null_mut()),
            freelist: Freelist::new(freelist_capacity(allocation_limit, bump_size)),
            swap_lock: Mutex::new(()),
        })
    }

    /// Allocates `size` bytes at `align`-byte alignment, zeroing the
    /// region first if `zero` is set. Allocations above `bump_size / 2`
    /// are always rejected -- they belong to the out-of-band large
    /// allocation path, not the arena.
    pub fn alloc(&self, size: u64, align: u64, zero: bool) -> Option<u64> {
        let limit = max_inline_allocation(self.bump_size);
        if size > limit || size.saturating_add(align) > limit {
            return None;
        }

        for _ in 0..MAX_ALLOC_ATTEMPTS {
            let prev = self.previous.load(Ordering::Acquire);
            if !prev.is_null() {
                if let Some(addr) = unsafe { &*prev }.alloc(size, align) {
                    self.maybe_zero(addr, size, zero);
                    return Some(addr);
                }
            }

            let active = self.active.load(Ordering::Acquire);
            if let Some(addr) = unsafe { &*active }.alloc(size, align) {
                self.maybe_zero(addr, size, zero);
                return Some(addr);
            }

            self.swap();
        }

        log::warn!("pool: giving up after {} failed alloc attempts", MAX_ALLOC_ATTEMPTS);
        None
    }

    fn maybe_zero(&self, addr: u64, size: u64, zero: bool) {
        if zero {
            unsafe {
                ptr::write_bytes(addr as *mut u8, 0, size as usize);
            }
        }
    }

    /// Retires the active arena and installs a fresh one, shelving the
    /// old `bumps[1]` (now fully evicted) onto the freelist behind an
    /// RTBR grace period.
    fn swap(&self) {
        let _guard = self.swap_lock.lock();

        let snapshot_active = self.active.load(Ordering::Acquire);
        let snapshot_previous = self.previous.load(Ordering::Acquire);

        let (new_arena, recycled_entry) = match self.freelist.pop() {
            Some((idx, raw)) => {
                let arena = unsafe { Box::from_raw(raw as *mut BumpShared) };
                arena.reset();
                (arena, Some(idx))
            }
            None => {
                let arena = Box::new(
                    BumpShared::create(self.bump_size).expect("arena creation must not fail"),
                );
                let entry = if !snapshot_previous.is_null() {
                    self.freelist.register()
                } else {
                    None
                };
                (arena, entry)
            }
        };

        let evicted = snapshot_previous;
        self.previous.store(snapshot_active, Ordering::Release);
        self.active.store(Box::into_raw(new_arena), Ordering::Release);

        if evicted.is_null() {
            return;
        }

        let quiesced = unsafe { &*evicted }.quiesce();
        assert!(
            quiesced,
            "concurrent reset of an arena pending eviction indicates a protocol break"
        );

        match recycled_entry {
            Some(idx) => self.freelist.shelve(idx, evicted as u64),
            None => {
                // Freelist is saturated: fall back to RTBR directly
                // instead of leaking the arena. This trades a reuse
                // opportunity for a guarantee we never leak.
                let evicted_addr = evicted as usize;
                rtbr::call(move || unsafe {
                    drop(Box::from_raw(evicted_addr as *mut BumpShared));
                });
            }
        }
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let active = self.active.swap(ptr::null_mut(), Ordering::AcqRel);
        if !active.is_null() {
            unsafe {
                drop(Box::from_raw(active));
            }
        }
        let previous = self.previous.swap(ptr::null_mut(), Ordering::AcqRel);
        if !previous.is_null() {
            unsafe {
                drop(Box::from_raw(previous));
            }
        }
    }
}

unsafe impl Send for PoolShared {}
unsafe impl Sync for PoolShared {}

/// Thread-exclusive arena pool: a single active
/// [`BumpPrivate`](super::bump::BumpPrivate), reset in place on
/// exhaustion. Unlike the shared pool, a private arena has no
/// concurrent readers by construction, so there is nothing to shelve
/// behind an RTBR grace period -- swapping is just `reset`.
pub struct PoolPrivate {
    bump_size: u64,
    active: super::bump::BumpPrivate,
}

impl PoolPrivate {
    pub fn new(bump_size: u64) -> Option<Self> {
        Some(PoolPrivate {
            bump_size,
            active: super::bump::BumpPrivate::create(bump_size)?,
        })
    }

    pub fn alloc(&self, size: u64, align: u64, zero: bool) -> Option<u64> {
        let limit = max_inline_allocation(self.bump_size);
        if size > limit || size.saturating_add(align) > limit {
            return None;
        }

        if let Some(addr) = self.active.alloc(size, align) {
            if zero {
                unsafe {
                    ptr::write_bytes(addr as *mut u8, 0, size as usize);
                }
            }
            return Some(addr);
        }

        self.active.reset();
        self.active.alloc(size, align).map(|addr| {
            if zero {
                unsafe {
                    ptr::write_bytes(addr as *mut u8, 0, size as usize);
                }
            }
            addr
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_pool_rejects_oversize_allocations() {
        let pool = PoolShared::new(64 * 1024, 1 << 30).unwrap();
        assert!(pool.alloc(64 * 1024, 8, false).is_none());
        assert!(pool.alloc(1024, 8, false).is_some());
    }

    #[test]
    fn shared_pool_swaps_when_active_arena_is_exhausted() {
        let bump_size = 64 * 1024u64;
        let pool = PoolShared::new(bump_size, 8 * bump_size).unwrap();
        let chunk = bump_size / 8;
        let mut allocations = Vec::new();
        for _ in 0..40 {
            allocations.push(pool.alloc(chunk, 8, false).expect("alloc should succeed"));
        }
        // 40 * bump_size/8 = 5 * bump_size, guaranteeing at least one swap.
        let mut sorted = allocations.clone();
        sorted.sort_unstable();
        for pair in sorted.windows(2) {
            assert!(pair[1] >= pair[0] + chunk, "allocations must not overlap");
        }
    }

    #[test]
    fn shared_pool_zeroes_on_request() {
        let pool = PoolShared::new(64 * 1024, 1 << 30).unwrap();
        let addr = pool.alloc(256, 8, true).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 256) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
