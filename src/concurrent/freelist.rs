//! 4.D Bounded lock-free freelist: a Michael-Scott limbo FIFO feeding a
//! Treiber reuse stack.
//!
//! Values pass through three states: freshly [`register`](Freelist::register)ed
//! (owned by whoever registered it, not yet anywhere in the freelist),
//! [`shelve`](Freelist::shelve)d (enqueued on the limbo FIFO, stamped with
//! an RTBR timestamp, ineligible for reuse until every reader's epoch has
//! passed that stamp), and finally aged onto the reuse stack by
//! [`pop`](Freelist::pop) (which also does the aging, incrementally,
//! capped at three FIFO entries per call so no single caller pays for
//! an unbounded backlog). [`push`](Freelist::push) skips the grace
//! period entirely, for values a caller already knows are safe to reuse
//! immediately (e.g. an arena slot freed by its sole owner).
//!
//! Slots are identified by index into a fixed-capacity array rather than
//! by pointer, which sidesteps the double-word CAS the original
//! Michael-Scott/Treiber structures need for ABA safety: a `(tag, index)`
//! pair packs into a single `u64` and CASes as one word.

use super::rtbr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const NIL: u32 = u32::MAX;

fn pack(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

fn unpack(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

struct Entry {
    value: AtomicU64,
    deletion_timestamp: AtomicU64,
    stack_next: AtomicU64,
    fifo_next: AtomicU64,
}

impl Entry {
    fn new() -> Self {
        Entry {
            value: AtomicU64::new(0),
            deletion_timestamp: AtomicU64::new(0),
            stack_next: AtomicU64::new(pack(NIL, 0)),
            fifo_next: AtomicU64::new(pack(NIL, 0)),
        }
    }
}

/// A bounded freelist of `u64` values (typically addresses), sized for
/// exactly `n_elem` registrable slots plus one internal FIFO dummy node.
pub struct Freelist {
    entries: Vec<Entry>,
    n_elem: u32,
    used_elem: AtomicU32,
    stack_head: AtomicU64,
    fifo_head: AtomicU64,
    fifo_tail: AtomicU64,
}

impl Freelist {
    /// `2 + allocation_limit / bump_size` is the capacity an arena pool
    /// needs so every shelved generation always has a slot (spec §4.D,
    /// §4.F); this constructor takes `n_elem` directly so callers can
    /// apply that formula, or any other sizing, themselves.
    pub fn new(n_elem: u32) -> Self {
        let mut entries = Vec::with_capacity(n_elem as usize + 1);
        entries.push(Entry::new());
        for _ in 0..n_elem {
            entries.push(Entry::new());
        }

        Freelist {
            entries,
            n_elem,
            used_elem: AtomicU32::new(0),
            stack_head: AtomicU64::new(pack(NIL, 0)),
            fifo_head: AtomicU64::new(pack(0, 0)),
            fifo_tail: AtomicU64::new(pack(0, 0)),
        }
    }

    /// Hands out a previously-unused slot index, or `None` once all
    /// `n_elem` slots are claimed.
    pub fn register(&self) -> Option<u32> {
        let used = self.used_elem.fetch_add(1, Ordering::Relaxed);
        if used >= self.n_elem {
            return None;
        }
        Some(used + 1)
    }

    fn push_stack(&self, index: u32) {
        let mut head = self.stack_head.load(Ordering::Acquire);
        loop {
            self.entries[index as usize]
                .stack_next
                .store(head, Ordering::Release);
            let (_, tag) = unpack(head);
            let desired = pack(index, tag.wrapping_add(1));
            match self.stack_head.compare_exchange_weak(
                head,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    fn pop_stack(&self) -> Option<u32> {
        loop {
            let head = self.stack_head.load(Ordering::Acquire);
            let (index, tag) = unpack(head);
            if index == NIL {
                return None;
            }
            let next = self.entries[index as usize].stack_next.load(Ordering::Acquire);
            let desired = {
                let (next_index, _) = unpack(next);
                pack(next_index, tag.wrapping_add(1))
            };
            if self
                .stack_head
                .compare_exchange_weak(head, desired, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(index);
            }
        }
    }

    fn enqueue(&self, index: u32, value: u64) {
        self.entries[index as usize].value.store(value, Ordering::Release);
        self.entries[index as usize]
            .fifo_next
            .store(pack(NIL, 0), Ordering::Release);

        loop {
            let tail = self.fifo_tail.load(Ordering::Acquire);
            let (tail_idx, tail_tag) = unpack(tail);
            let next = self.entries[tail_idx as usize].fifo_next.load(Ordering::Acquire);
            let (next_idx, next_tag) = unpack(next);

            if tail != self.fifo_tail.load(Ordering::Acquire) {
                continue;
            }

            if next_idx == NIL {
                let desired = pack(index, next_tag.wrapping_add(1));
                if self.entries[tail_idx as usize]
                    .fifo_next
                    .compare_exchange(next, desired, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let _ = self.fifo_tail.compare_exchange(
                        tail,
                        pack(index, tail_tag.wrapping_add(1)),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    return;
                }
            } else {
                let _ = self.fifo_tail.compare_exchange(
                    tail,
                    pack(next_idx, tail_tag.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
    }

    /// Dequeues at most one entry whose deletion timestamp has already
    /// passed the calling thread's epoch. Returns the (now-reusable)
    /// slot index together with the value it held, or `None` if the
    /// queue is empty or its head is not yet old enough.
    fn maybe_dequeue(&self) -> Option<(u32, u64)> {
        let head = self.fifo_head.load(Ordering::Acquire);
        let (head_idx, head_tag) = unpack(head);
        let tail = self.fifo_tail.load(Ordering::Acquire);
        let (tail_idx, tail_tag) = unpack(tail);
        let next = self.entries[head_idx as usize].fifo_next.load(Ordering::Acquire);
        let (next_idx, _) = unpack(next);

        if head_idx == tail_idx {
            if next_idx == NIL {
                return None;
            }
            let _ = self.fifo_tail.compare_exchange(
                tail,
                pack(next_idx, tail_tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return None;
        }

        if next_idx == NIL {
            return None;
        }

        let value = self.entries[next_idx as usize].value.load(Ordering::Acquire);
        let deletion_timestamp = self.entries[next_idx as usize]
            .deletion_timestamp
            .load(Ordering::Acquire);
        if deletion_timestamp > rtbr::epoch() {
            return None;
        }

        let desired = pack(next_idx, head_tag.wrapping_add(1));
        if self
            .fifo_head
            .compare_exchange(head, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some((head_idx, value))
        } else {
            None
        }
    }

    /// Ages up to three limbo entries onto the reuse stack. Three bounds
    /// the pause this can impose on a caller while staying well above
    /// the one entry `shelve` ever adds per call, so the FIFO never
    /// falls permanently behind.
    fn manage(&self, want_entry: bool) -> Option<(u32, u64)> {
        let mut carried: Option<(u32, u64)> = None;

        for _ in 0..3 {
            let Some((recycled_idx, value)) = self.maybe_dequeue() else {
                break;
            };

            if let Some((prev_idx, _)) = carried {
                self.push_stack(prev_idx);
            }
            carried = Some((recycled_idx, value));
        }

        match carried {
            None => None,
            Some((idx, value)) if want_entry => Some((idx, value)),
            Some((idx, _)) => {
                self.push_stack(idx);
                None
            }
        }
    }

    /// Pops a reusable value: from the reuse stack if non-empty,
    /// otherwise by aging the limbo FIFO.
    pub fn pop(&self) -> Option<(u32, u64)> {
        if let Some(idx) = self.pop_stack() {
            let value = self.entries[idx as usize].value.load(Ordering::Acquire);
            return Some((idx, value));
        }

        self.manage(true)
    }

    /// Retires `value` (held in slot `index`) behind an RTBR grace
    /// period: it becomes reusable only once every thread's epoch has
    /// passed the timestamp taken here.
    pub fn shelve(&self, index: u32, value: u64) {
        self.entries[index as usize].value.store(value, Ordering::Release);
        self.entries[index as usize]
            .deletion_timestamp
            .store(rtbr::prepare().timestamp, Ordering::Release);

        self.manage(false);
        self.enqueue(index, value);
    }

    /// Returns `value` (held in slot `index`) to the reuse stack
    /// immediately, with no grace period. Only safe when the caller
    /// already knows no other thread can still observe the old value.
    pub fn push(&self, index: u32, value: u64) {
        self.entries[index as usize].value.store(value, Ordering::Release);
        self.push_stack(index);
    }
}

unsafe impl Send for Freelist {}
unsafe impl Sync for Freelist {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_hands_out_distinct_slots_up_to_capacity() {
        let fl = Freelist::new(4);
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(fl.register().expect("slot should be available"));
        }
        assert!(fl.register().is_none());
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn push_then_pop_round_trips_without_grace_period() {
        let fl = Freelist::new(4);
        let idx = fl.register().unwrap();
        fl.push(idx, 0xABCD);
        let (popped_idx, value) = fl.pop().expect("immediate reuse should be visible");
        assert_eq!(popped_idx, idx);
        assert_eq!(value, 0xABCD);
    }

    #[test]
    fn shelve_defers_reuse_until_epoch_passes() {
        let fl = Freelist::new(4);
        let idx = fl.register().unwrap();
        fl.shelve(idx, 0x1234);

        rtbr::force_progress(0);
        let mut result = None;
        for _ in 0..20 {
            rtbr::poll(true);
            if let Some(popped) = fl.pop() {
                result = Some(popped);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let (_, value) = result.expect("shelved value should eventually become reusable");
        assert_eq!(value, 0x1234);
    }
}
