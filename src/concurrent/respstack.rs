//! Intrusive MPSC response stack (spec §3, §5): any worker thread can
//! push a finished response; only the owning I/O thread ever drains.
//!
//! Because there is exactly one consumer, draining needs no per-node
//! CAS: one atomic swap of the head to null detaches the whole LIFO
//! chain, and reversing that chain locally (still the sole consumer,
//! no contention) restores the order responses were produced in.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// A multi-producer, single-consumer stack that drains in FIFO order.
pub struct RespStack<T> {
    head: AtomicPtr<Node<T>>,
}

impl<T> RespStack<T> {
    pub fn new() -> Self {
        RespStack {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Called by any worker thread.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            unsafe {
                (*node).next = head;
            }
            match self.head.compare_exchange_weak(
                head,
                node,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Called by the sole consumer thread. Detaches the whole chain
    /// with one atomic swap, then walks it once to restore
    /// producer-order (oldest push first).
    pub fn drain_all(&self) -> Vec<T> {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        let mut reversed: *mut Node<T> = ptr::null_mut();

        while !head.is_null() {
            let next = unsafe { (*head).next };
            unsafe {
                (*head).next = reversed;
            }
            reversed = head;
            head = next;
        }

        let mut out = Vec::new();
        let mut cur = reversed;
        while !cur.is_null() {
            let boxed = unsafe { Box::from_raw(cur) };
            cur = boxed.next;
            out.push(boxed.value);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for RespStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for RespStack<T> {
    fn drop(&mut self) {
        self.drain_all();
    }
}

unsafe impl<T: Send> Send for RespStack<T> {}
unsafe impl<T: Send> Sync for RespStack<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_restores_push_order() {
        let stack = RespStack::new();
        for i in 0..5u64 {
            stack.push(i);
        }
        assert_eq!(stack.drain_all(), vec![0, 1, 2, 3, 4]);
        assert!(stack.is_empty());
    }

    #[test]
    fn concurrent_pushes_are_all_observed_on_drain() {
        use std::sync::Arc;

        let stack = Arc::new(RespStack::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let stack = stack.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100u64 {
                    stack.push(t * 100 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut drained = stack.drain_all();
        drained.sort_unstable();
        assert_eq!(drained.len(), 400);
    }
}
