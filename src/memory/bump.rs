//! 4.C Bump allocator: private (single-owner) and shared (lock-free) flavors.
//!
//! Both variants carve their header out of the first page of a reservation
//! and bump-allocate from `header_end` onward. The spec's 16-byte
//! `{allocated, capacity, generation}` word is meant to be updated with a
//! single double-word CAS (`cmpxchg16b`); stable Rust has no portable
//! intrinsic for that, so it is approximated here with an `allocated`
//! `AtomicU64` CASed on its own, plus a short-held spinlock serializing the
//! rarer `capacity`/`generation` transitions (growth, quiesce, reset) --
//! the same trade the original makes explicit for the *growth* path
//! (`grow_lock`) but not for quiesce/reset, which really do rely on
//! `cmpxchg16b`. The externally observable contract (§8 property 2 and 3)
//! is preserved: allocations are monotonic and never succeed between a
//! successful `quiesce` and the matching `reset`.

use super::commit;
use super::reserve;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Allocations above `bump_size / 2` are rejected; callers fall back to the
/// pool's freelist/heap path.
pub fn max_inline_allocation(bump_size: u64) -> u64 {
    bump_size / 2
}

fn align_mask(align: u64) -> u64 {
    if align == 0 {
        0
    } else {
        (align ^ (align - 1)) >> 1
    }
}

fn rounded_capacity(capacity: u64) -> u64 {
    let page = reserve::page_size();
    let min = page * 2;
    let capacity = capacity.max(min);
    if capacity % page == 0 {
        capacity
    } else {
        (1 + capacity / page) * page
    }
}

/// Single-owner bump allocator. Not `Sync`; intended to live behind a
/// thread-local handle.
pub struct BumpPrivate {
    base: u64,
    header_end: u64,
    reserved: u64,
    mapped: Cell<u64>,
    allocated: Cell<u64>,
}

impl BumpPrivate {
    pub fn create(capacity: u64) -> Option<Self> {
        let capacity = rounded_capacity(capacity);
        let page = reserve::page_size();
        let base = reserve::reserve(capacity, page)?;
        let mapped = commit::commit(base, page, capacity);
        if mapped < page {
            return None;
        }

        Some(Self {
            base,
            header_end: base + page,
            reserved: capacity,
            mapped: Cell::new(mapped),
            allocated: Cell::new(base + page),
        })
    }

    pub fn reset(&self) {
        self.allocated.set(self.header_end);
    }

    fn grow(&self, goal: u64) -> bool {
        let mapped = self.mapped.get();
        if goal <= mapped {
            return true;
        }
        if mapped == self.reserved || goal > self.reserved {
            return false;
        }

        let page = reserve::page_size();
        let goal = if goal % page == 0 {
            goal
        } else {
            (1 + goal / page) * page
        };

        let growth = commit::commit(self.base + mapped, goal - mapped, self.reserved - mapped);
        if growth < goal - mapped {
            return false;
        }
        self.mapped.set(mapped + growth);
        true
    }

    pub fn alloc(&self, size: u64, align: u64) -> Option<u64> {
        let size = size.max(1);
        if size > self.reserved {
            return None;
        }
        let mask = align_mask(align);

        let ret = (self.allocated.get() + mask) & !mask;
        let next = ret + size;
        if next - self.base > self.mapped.get() && !self.grow(next - self.base) {
            return None;
        }
        if next - self.base > self.mapped.get() {
            return None;
        }

        self.allocated.set(next);
        Some(ret)
    }
}

/// The spec's 16-byte word, approximated as described in the module
/// doc-comment: `allocated` CASes alone on the fast path, `capacity` and
/// `generation` only change under `grow_lock`.
struct SharedWord {
    allocated: AtomicU64,
    capacity_pages: AtomicU32,
    generation: AtomicU32,
}

/// Lock-free (modulo the growth/quiesce/reset spinlock) bump allocator
/// shared by any number of concurrent allocators.
pub struct BumpShared {
    base: u64,
    header_end: u64,
    reserved: u64,
    mapped: AtomicU64,
    word: SharedWord,
    grow_lock: AtomicBool,
}

impl BumpShared {
    pub fn create(capacity: u64) -> Option<Self> {
        let capacity = rounded_capacity(capacity);
        let page = reserve::page_size();
        let base = reserve::reserve(capacity, page.max(16))?;
        let mapped = commit::commit(base, page, capacity);
        if mapped < page {
            return None;
        }

        Some(Self {
            base,
            header_end: base + page,
            reserved: capacity,
            mapped: AtomicU64::new(mapped),
            word: SharedWord {
                allocated: AtomicU64::new(base + page),
                capacity_pages: AtomicU32::new((mapped / page) as u32),
                generation: AtomicU32::new(0),
            },
            grow_lock: AtomicBool::new(false),
        })
    }

    pub fn generation(&self) -> u32 {
        self.word.generation.load(Ordering::Acquire)
    }

    fn lock_growth(&self) {
        while self
            .grow_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock_growth(&self) {
        self.grow_lock.store(false, Ordering::Release);
    }

    fn grow(&self, goal: u64) -> bool {
        let mapped = self.mapped.load(Ordering::Acquire);
        if goal <= mapped {
            return true;
        }
        if mapped == self.reserved || goal > self.reserved {
            return false;
        }

        let page = reserve::page_size();
        let goal = if goal % page == 0 {
            goal
        } else {
            (1 + goal / page) * page
        };

        let growth = commit::commit(self.base + mapped, goal - mapped, self.reserved - mapped);
        if growth < goal - mapped {
            return false;
        }
        let new_mapped = mapped + growth;
        self.mapped.store(new_mapped, Ordering::Release);
        self.word
            .capacity_pages
            .store((new_mapped / page) as u32, Ordering::Release);
        true
    }

    /// Allocates `size` bytes at `align`-byte alignment, or `None` if the
    /// arena is full, the request is oversized, or a concurrent `reset`
    /// changed the generation mid-attempt (per the bounded-retry decision
    /// in SPEC_FULL.md §14.3 -- callers that need a fresh arena should
    /// retry against the pool, not loop here).
    pub fn alloc(&self, size: u64, align: u64) -> Option<u64> {
        let size = size.max(1);
        if size > self.reserved {
            return None;
        }
        let mask = align_mask(align);
        let generation = self.generation();

        loop {
            if self.generation() != generation {
                return None;
            }

            let allocated = self.word.allocated.load(Ordering::Acquire);
            let ret = (allocated + mask) & !mask;
            let next = ret + size;
            let wilderness = next - self.base;

            if wilderness > self.reserved {
                return None;
            }

            if wilderness > self.mapped.load(Ordering::Acquire) {
                self.lock_growth();
                let ok = self.grow(wilderness);
                self.unlock_growth();
                if !ok {
                    return None;
                }
                continue;
            }

            if self
                .word
                .allocated
                .compare_exchange_weak(allocated, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(ret);
            }
        }
    }

    /// Advances the allocation pointer to the end of the reservation,
    /// refusing further allocations. Returns `false` if a concurrent
    /// `reset` already bumped the generation.
    pub fn quiesce(&self) -> bool {
        let end = self.base + self.reserved;
        loop {
            let allocated = self.word.allocated.load(Ordering::Acquire);
            if allocated == end {
                return true;
            }
            let generation_before = self.generation();
            if self
                .word
                .allocated
                .compare_exchange_weak(allocated, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
            if self.generation() != generation_before {
                return false;
            }
        }
    }

    /// Rewinds the allocation pointer to `header_end` and bumps the
    /// generation. Returns `false` if another thread already reset it.
    pub fn reset(&self) -> bool {
        let old_generation = self.generation();
        loop {
            let allocated = self.word.allocated.load(Ordering::Acquire);
            self.lock_growth();
            let current_generation = self.generation();
            if current_generation != old_generation {
                self.unlock_growth();
                return false;
            }
            let reallocated = self
                .word
                .allocated
                .compare_exchange(allocated, self.header_end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if reallocated {
                self.word
                    .generation
                    .store(old_generation.wrapping_add(1), Ordering::Release);
            }
            self.unlock_growth();
            if reallocated {
                return true;
            }
        }
    }
}

unsafe impl Send for BumpShared {}
unsafe impl Sync for BumpShared {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_alloc_is_monotonic_and_aligned() {
        let bump = BumpPrivate::create(4 * 1024 * 1024).expect("create bump");
        let mut last = 0;
        for _ in 0..64 {
            let addr = bump.alloc(37, 16).expect("alloc should succeed");
            assert_eq!(addr % 16, 0);
            assert!(addr > last);
            last = addr;
        }
    }

    #[test]
    fn private_reset_allows_reuse() {
        let bump = BumpPrivate::create(1024 * 1024).expect("create bump");
        let first = bump.alloc(64, 8).unwrap();
        bump.reset();
        let second = bump.alloc(64, 8).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn shared_alloc_is_lock_free_across_threads() {
        use std::sync::Arc;
        let bump = Arc::new(BumpShared::create(8 * 1024 * 1024).expect("create bump"));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let bump = bump.clone();
            handles.push(std::thread::spawn(move || {
                let mut addrs = Vec::new();
                for _ in 0..256 {
                    addrs.push(bump.alloc(32, 8).expect("alloc should succeed"));
                }
                addrs
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        all.sort_unstable();
        for pair in all.windows(2) {
            assert!(pair[1] >= pair[0] + 32, "allocations must not overlap");
        }
    }

    #[test]
    fn quiesce_then_reset_blocks_allocation_in_between() {
        let bump = BumpShared::create(1024 * 1024).expect("create bump");
        assert!(bump.quiesce());
        assert!(bump.alloc(8, 8).is_none());
        assert!(bump.reset());
        assert!(bump.alloc(8, 8).is_some());
    }
}
