//! Bounded SPMC request ring (spec §3, §5): one producer (the I/O thread
//! that owns the connections) hands requests to any number of worker
//! threads that race to pop them.
//!
//! Adapted from the teacher's general-purpose MPMC ring: since there is
//! exactly one producer, `push` needs no CAS on `tail` -- a plain
//! load/store by the sole writer is enough, matching the lock-free
//! request ring's actual access pattern instead of the fully-general
//! MPMC case.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

/// A bounded, power-of-two-sized ring of `T: Copy` values with a single
/// producer and any number of consumers.
#[repr(C, align(64))]
pub struct SpmcRing<T> {
    head: AtomicU64,
    tail: AtomicU64,
    mask: u64,
    size: usize,
    entries: *mut T,
    layout: Layout,
}

impl<T: Copy> SpmcRing<T> {
    /// `size` must be a power of two. Returns `None` otherwise or if the
    /// backing allocation fails.
    pub fn new(size: usize) -> Option<Self> {
        if !size.is_power_of_two() || size == 0 {
            return None;
        }

        let layout = Layout::array::<T>(size).ok()?.align_to(64).ok()?;
        let entries = unsafe { alloc(layout) as *mut T };
        if entries.is_null() {
            return None;
        }

        Some(SpmcRing {
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            mask: (size - 1) as u64,
            size,
            entries,
            layout,
        })
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Called by the single producer only. Returns `false` if the ring
    /// is full.
    pub fn push(&self, entry: T) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.size as u64 {
            return false;
        }

        let index = (tail & self.mask) as usize;
        unsafe {
            ptr::write(self.entries.add(index), entry);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Called by any number of concurrent consumers. Returns `None` if
    /// the ring is empty.
    pub fn pop(&self) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }

            let index = (head & self.mask) as usize;
            let entry = unsafe { ptr::read(self.entries.add(index)) };

            if self
                .head
                .compare_exchange_weak(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(entry);
            }
        }
    }
}

impl<T> Drop for SpmcRing<T> {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.entries as *mut u8, self.layout);
        }
    }
}

unsafe impl<T: Send> Send for SpmcRing<T> {}
unsafe impl<T: Send> Sync for SpmcRing<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_preserves_fifo_order() {
        let ring: SpmcRing<u64> = SpmcRing::new(8).unwrap();
        for i in 0..8 {
            assert!(ring.push(i));
        }
        assert!(!ring.push(99), "full ring should reject pushes");

        for i in 0..8 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn concurrent_consumers_each_see_distinct_entries() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let ring = Arc::new(SpmcRing::<u64>::new(1024).unwrap());
        for i in 0..1024 {
            assert!(ring.push(i));
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                let mut popped = Vec::new();
                while let Some(v) = ring.pop() {
                    popped.push(v);
                }
                popped
            }));
        }

        let mut all = HashSet::new();
        let mut total = 0;
        for h in handles {
            for v in h.join().unwrap() {
                assert!(all.insert(v), "no value should be delivered twice");
                total += 1;
            }
        }
        assert_eq!(total, 1024);
    }
}
