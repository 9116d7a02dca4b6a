//! 4.E Real-time barrier reclamation.
//!
//! An epoch scheme where "is it safe to reclaim object X, retired at
//! epoch E" is answered not by a simple global minimum (as in classic
//! epoch-based reclamation) but by also consulting each thread's actual
//! OS scheduling state through `/proc/<tid>/stat`: a thread that is
//! asleep, context-switched, or dead cannot be holding a stale section
//! open no matter what its last-published epoch says. This lets readers
//! publish their epoch only when entering/leaving a section (`begin`/
//! `end`), with no periodic heartbeat required, while writers still make
//! bounded-latency progress even against a stalled reader thread.
//!
//! Every field a record exposes cross-thread (`self_epoch`, `last_safe`,
//! `active_count`, the cached `global_epoch`) is an atomic. The active
//! section stack and the limbo (deferred-reclamation) queue are touched
//! by their owning thread alone -- exactly as in the source this is
//! ported from, which relies on single-writer discipline rather than a
//! lock for those fields. `unsafe impl Sync` below documents that
//! invariant; nothing outside this module hands out a `&Record` to any
//! thread but its owner.

use once_cell::sync::{Lazy, OnceCell};
use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Guard band subtracted from the easy-poll minimum so a thread that is
/// *about* to start a section, but hasn't published its timestamp yet,
/// can't be raced past.
pub const DELAY_TICKS: u64 = 1 << 20;
/// Minimum spacing between hard polls (which read `/proc`).
pub const HARD_POLL_PERIOD_MS: u64 = 10;

fn process_epoch() -> &'static Instant {
    static START: OnceCell<Instant> = OnceCell::new();
    START.get_or_init(Instant::now)
}

/// Monotonic tick counter, nanoseconds since this process's first call
/// into the module. Plays the role of `rdtsc` in the source this is
/// ported from; there is no separate cheap/expensive clock read on top
/// of `Instant`, so `tick()` serves for both `an_md_rdtsc` and
/// `an_md_rdtsc_fast`.
fn tick() -> u64 {
    process_epoch().elapsed().as_nanos() as u64
}

fn ms_to_ticks(ms: u64) -> u64 {
    ms.saturating_mul(1_000_000)
}

struct Section {
    seq: u64,
    timestamp: u64,
}

struct LimboEntry {
    run: Box<dyn FnOnce() + Send>,
    timestamp: u64,
}

/// A single thread's reclamation record. Lives as long as any `Arc`
/// reference to it, including the one held in the global table, so a
/// dead thread's record can still be drained by someone else's hard
/// poll.
pub struct Record {
    id: u64,
    /// The slot this record occupies in `Global::slots`, fixed for the
    /// record's lifetime even across reuse.
    slot_idx: u32,
    tid: AtomicI32,
    start_time: AtomicU64,
    self_epoch: AtomicU64,
    last_safe: AtomicU64,
    last_self_epoch: AtomicU64,
    total_time: AtomicU64,
    as_of: AtomicU64,
    active_count: AtomicU64,
    dead: AtomicBool,
    active: UnsafeCell<VecDeque<Section>>,
    limbo: UnsafeCell<VecDeque<LimboEntry>>,
    limbo_count: AtomicU64,
    global_epoch: Cell<u64>,
    next_seq: Cell<u64>,
    /// Next entry in the reusable-slot free stack (an index into
    /// `Global::slots`, or `EMPTY_SLOT` for "none"). Only touched
    /// through `free_push`/`free_pop`, which serialize access via the
    /// free stack's own CAS.
    free_next: AtomicU64,
}

// Safety: `active`, `limbo`, `global_epoch`, and `next_seq` are mutated
// only by the thread that owns this record (the one `ensure()` created
// it for); every other field is a plain atomic. See the module doc.
unsafe impl Sync for Record {}
unsafe impl Send for Record {}

impl Record {
    fn active(&self) -> &mut VecDeque<Section> {
        unsafe { &mut *self.active.get() }
    }

    fn limbo(&self) -> &mut VecDeque<LimboEntry> {
        unsafe { &mut *self.limbo.get() }
    }

    /// Re-initializes a dead, freelisted record for a new owning thread.
    /// Safe to mutate `active`/`limbo` here even though they're normally
    /// owner-thread-only: a record only reaches the free stack after
    /// `poll_hard` has confirmed its previous owner's tid is dead, so
    /// there is no concurrent owner left to race with.
    fn reset_for_reuse(&self, tid: i32, start_time: u64) {
        self.tid.store(tid, Ordering::Relaxed);
        self.start_time.store(start_time, Ordering::Relaxed);
        self.self_epoch.store(0, Ordering::Relaxed);
        self.last_safe.store(0, Ordering::Relaxed);
        self.last_self_epoch.store(0, Ordering::Relaxed);
        self.total_time.store(0, Ordering::Relaxed);
        self.as_of.store(0, Ordering::Relaxed);
        self.active_count.store(0, Ordering::Relaxed);
        self.active().clear();
        self.limbo().clear();
        self.limbo_count.store(0, Ordering::Relaxed);
        self.global_epoch.set(0);
        self.next_seq.set(0);
        self.dead.store(false, Ordering::Release);
    }
}

/// Sentinel "no slot" value for the free stack's packed index field.
const EMPTY_SLOT: u32 = u32::MAX;

/// Hard ceiling on distinct live thread records. Generous relative to
/// any realistic thread count for this server; exceeding it indicates a
/// thread-per-request leak rather than a legitimate need for more slots.
const MAX_RECORDS: usize = 1 << 16;

fn pack_free(idx: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | idx as u64
}

fn unpack_free(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

struct Global {
    /// Append-only, fixed-capacity slot table. Once `slots[i]` is set to
    /// `Some`, it is never set back to `None` -- records are recycled in
    /// place via the free stack instead. Reading `slots[..len]` without
    /// any lock is sound: the write to a slot happens-before the
    /// `Release` store that publishes the new `len`, which
    /// happens-before any `Acquire` load of `len` that observes it.
    slots: Box<[UnsafeCell<Option<Arc<Record>>>]>,
    len: AtomicUsize,
    /// Short-held spinlock guarding the rare "append a new slot" path;
    /// never taken on the hot read path (`poll_easy`/`poll_hard`).
    append_lock: AtomicBool,
    /// Treiber stack (by slot index) of dead, reusable records.
    free_stack: AtomicU64,
    next_id: AtomicU64,
    global_epoch: AtomicU64,
    minimal_epoch: AtomicU64,
    last_hard_poll: AtomicU64,
    hard_poll_lock: AtomicBool,
}

unsafe impl Sync for Global {}

static GLOBAL: Lazy<Global> = Lazy::new(|| Global {
    slots: (0..MAX_RECORDS)
        .map(|_| UnsafeCell::new(None))
        .collect::<Vec<_>>()
        .into_boxed_slice(),
    len: AtomicUsize::new(0),
    append_lock: AtomicBool::new(false),
    free_stack: AtomicU64::new(pack_free(EMPTY_SLOT, 0)),
    next_id: AtomicU64::new(0),
    global_epoch: AtomicU64::new(0),
    minimal_epoch: AtomicU64::new(0),
    last_hard_poll: AtomicU64::new(0),
    hard_poll_lock: AtomicBool::new(false),
});

impl Global {
    fn record_at(&self, idx: usize) -> &Arc<Record> {
        unsafe { (&*self.slots[idx].get()).as_ref().expect("slot index in-bounds must be set") }
    }

    fn free_push(&self, idx: u32) {
        loop {
            let head = self.free_stack.load(Ordering::Acquire);
            let (head_idx, tag) = unpack_free(head);
            self.record_at(idx as usize)
                .free_next
                .store(head_idx as u64, Ordering::Relaxed);
            let new_head = pack_free(idx, tag.wrapping_add(1));
            if self
                .free_stack
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    fn free_pop(&self) -> Option<u32> {
        loop {
            let head = self.free_stack.load(Ordering::Acquire);
            let (head_idx, tag) = unpack_free(head);
            if head_idx == EMPTY_SLOT {
                return None;
            }
            let next = self.record_at(head_idx as usize).free_next.load(Ordering::Relaxed) as u32;
            let new_head = pack_free(next, tag.wrapping_add(1));
            if self
                .free_stack
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(head_idx);
            }
        }
    }

    /// Appends a brand-new record slot, returning it. Serialized by a
    /// short spinlock since it only runs when the free stack is empty
    /// (first-ever use of a given thread count). `build` receives the
    /// slot index so the record can be constructed with it already set,
    /// rather than mutating a published `Arc` afterwards.
    fn push_new(&self, build: impl FnOnce(u32) -> Arc<Record>) -> Arc<Record> {
        while self
            .append_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        let idx = self.len.load(Ordering::Relaxed);
        assert!(
            idx < MAX_RECORDS,
            "rtbr: exceeded the maximum of {} live thread records",
            MAX_RECORDS
        );
        let record = build(idx as u32);
        unsafe {
            *self.slots[idx].get() = Some(record.clone());
        }
        self.len.store(idx + 1, Ordering::Release);
        self.append_lock.store(false, Ordering::Release);
        record
    }
}

thread_local! {
    static SELF: RefCell<Option<Arc<Record>>> = RefCell::new(None);
}

struct TidInfo {
    dead: bool,
    running: bool,
    start_time: u64,
    total_time: u64,
}

fn gettid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Parses `/proc/<tid>/stat` for liveness, run state, start time, and
/// accumulated CPU ticks. A missing `/proc` entry means the thread is
/// dead.
fn read_tid_info(tid: i32) -> TidInfo {
    let path = format!("/proc/{}/stat", tid);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return TidInfo {
                dead: true,
                running: false,
                start_time: 0,
                total_time: 0,
            }
        }
        Err(_) => {
            return TidInfo {
                dead: true,
                running: false,
                start_time: 0,
                total_time: 0,
            }
        }
    };

    let after_comm = match contents.rfind(')') {
        Some(idx) => &contents[idx + 1..],
        None => {
            return TidInfo {
                dead: true,
                running: false,
                start_time: 0,
                total_time: 0,
            }
        }
    };
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let state = fields.first().copied().unwrap_or("?");
    let utime: u64 = fields.get(11).and_then(|s| s.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.get(12).and_then(|s| s.parse().ok()).unwrap_or(0);
    let start_time: u64 = fields.get(19).and_then(|s| s.parse().ok()).unwrap_or(0);

    TidInfo {
        dead: false,
        running: state == "R",
        start_time,
        total_time: utime + stime,
    }
}

fn ensure() -> Arc<Record> {
    if let Some(rec) = SELF.with(|cell| cell.borrow().clone()) {
        return rec;
    }

    let tid = gettid();
    let info = read_tid_info(tid);

    if let Some(idx) = GLOBAL.free_pop() {
        let record = GLOBAL.record_at(idx as usize).clone();
        record.reset_for_reuse(tid, info.start_time);
        SELF.with(|cell| *cell.borrow_mut() = Some(record.clone()));
        return record;
    }

    let record = GLOBAL.push_new(|idx| {
        let id = GLOBAL.next_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Record {
            id,
            slot_idx: idx,
            tid: AtomicI32::new(tid),
            start_time: AtomicU64::new(info.start_time),
            self_epoch: AtomicU64::new(0),
            last_safe: AtomicU64::new(0),
            last_self_epoch: AtomicU64::new(0),
            total_time: AtomicU64::new(0),
            as_of: AtomicU64::new(0),
            active_count: AtomicU64::new(0),
            dead: AtomicBool::new(false),
            active: UnsafeCell::new(VecDeque::new()),
            limbo: UnsafeCell::new(VecDeque::new()),
            limbo_count: AtomicU64::new(0),
            global_epoch: Cell::new(0),
            next_seq: Cell::new(0),
            free_next: AtomicU64::new(EMPTY_SLOT as u64),
        })
    });

    SELF.with(|cell| *cell.borrow_mut() = Some(record.clone()));
    record
}

fn update(self_rec: &Record, poll: bool) {
    let min_epoch = GLOBAL.minimal_epoch.load(Ordering::Acquire);
    if let Some(front) = self_rec.active().front() {
        if front.timestamp < min_epoch {
            log::warn!(
                "rtbr: record {} (tid {}) forcibly dropped a stale section for min_epoch",
                self_rec.id,
                self_rec.tid.load(Ordering::Relaxed)
            );
            while let Some(front) = self_rec.active().front() {
                if front.timestamp >= min_epoch {
                    break;
                }
                self_rec.active().pop_front();
                let count = self_rec.active_count.load(Ordering::Relaxed);
                if count > 0 {
                    self_rec.active_count.store(count - 1, Ordering::Relaxed);
                }
            }
        }
    }

    let self_epoch = self_rec.self_epoch.load(Ordering::Relaxed);
    let update = if let Some(front) = self_rec.active().front() {
        front.timestamp | 1
    } else if poll {
        self_epoch.max(tick()) & !1
    } else if self_epoch & 1 != 0 {
        self_epoch + 1
    } else {
        self_epoch
    };

    if update != self_epoch {
        self_rec.self_epoch.store(update, Ordering::Release);
    }
}

/// A timestamp captured before entering a critical section, via
/// [`prepare`]. Exists separately from [`begin`] so callers can
/// timestamp a value (e.g. for [`Freelist::shelve`](super::freelist))
/// without necessarily opening a section themselves.
#[derive(Clone, Copy)]
pub struct Timestamp {
    pub(crate) timestamp: u64,
}

pub fn prepare() -> Timestamp {
    Timestamp { timestamp: tick() }
}

/// An open reclamation section. Dropping it (or calling [`Section::end`]
/// explicitly) closes the section.
pub struct SectionGuard {
    seq: u64,
    record: Arc<Record>,
    open: bool,
}

impl SectionGuard {
    pub fn end(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let record = &self.record;
        let active = record.active();
        let oldest = active.front().map(|s| s.seq) == Some(self.seq);
        if let Some(pos) = active.iter().position(|s| s.seq == self.seq) {
            active.remove(pos);
        }
        let _ = oldest;
        if active.is_empty() {
            record.active_count.store(0, Ordering::Relaxed);
        } else {
            let count = record.active_count.load(Ordering::Relaxed);
            if count != 0 {
                record.active_count.store(count - 1, Ordering::Relaxed);
            }
        }
        update(record, false);
    }
}

impl Drop for SectionGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens a reclamation section at `timestamp` (from [`prepare`]). The
/// calling thread must not block indefinitely while holding the
/// returned guard: other threads' reclamation progress is bounded by
/// this thread's epoch until the guard is dropped.
pub fn begin(timestamp: Timestamp) -> SectionGuard {
    let record = ensure();
    let seq = record.next_seq.get();
    record.next_seq.set(seq + 1);
    record.active().push_back(Section {
        seq,
        timestamp: timestamp.timestamp,
    });
    record
        .active_count
        .store(record.active().len() as u64, Ordering::Relaxed);
    update(&record, false);

    SectionGuard {
        seq,
        record,
        open: true,
    }
}

/// Defers `run` until every thread's epoch has advanced past the
/// current moment -- i.e. until no section open right now could still
/// observe whatever `run` is about to reclaim.
pub fn call(run: impl FnOnce() + Send + 'static) {
    let record = ensure();
    record.limbo().push_back(LimboEntry {
        run: Box::new(run),
        timestamp: tick(),
    });
    record
        .limbo_count
        .store(record.limbo().len() as u64, Ordering::Relaxed);
}

/// Number of sections this thread (or `record`, if given) currently has
/// open.
pub fn active(record: Option<&Record>) -> u64 {
    match record {
        Some(r) => r.active_count.load(Ordering::Relaxed),
        None => SELF.with(|cell| {
            cell.borrow()
                .as_ref()
                .map(|r| r.active_count.load(Ordering::Relaxed))
                .unwrap_or(0)
        }),
    }
}

/// The calling thread's own record's most recent `global_epoch` view.
pub fn local_epoch() -> u64 {
    let record = ensure();
    update(&record, true);
    record.self_epoch.load(Ordering::Relaxed).max(record.last_safe.load(Ordering::Relaxed))
}

fn poll_easy() -> u64 {
    let mut latest = tick();
    let len = GLOBAL.len.load(Ordering::Acquire);
    for i in 0..len {
        let record = GLOBAL.record_at(i);
        if record.dead.load(Ordering::Acquire) {
            continue;
        }
        let epoch = record.self_epoch.load(Ordering::Acquire);
        let last_safe = record.last_safe.load(Ordering::Acquire);
        let candidate = epoch.max(last_safe);
        if candidate < latest {
            latest = candidate;
        }
    }

    let candidate = latest.saturating_sub(DELAY_TICKS);
    let mut last = GLOBAL.global_epoch.load(Ordering::Acquire);
    loop {
        if candidate < last {
            return last;
        }
        match GLOBAL.global_epoch.compare_exchange_weak(
            last,
            candidate,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return candidate,
            Err(observed) => last = observed,
        }
    }
}

/// Reads each record's actual OS scheduling state to push `last_safe`
/// forward even for threads whose `self_epoch` hasn't moved -- a sleeping,
/// context-switched, or dead thread cannot have a section in flight.
/// Throttled to at most once per [`HARD_POLL_PERIOD_MS`]; returns `false`
/// if skipped because another thread polled too recently.
fn poll_hard(self_rec: &Record) -> bool {
    let now = tick();
    let period = ms_to_ticks(HARD_POLL_PERIOD_MS);
    if GLOBAL.last_hard_poll.load(Ordering::Relaxed) + period > now {
        return false;
    }
    if GLOBAL
        .hard_poll_lock
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        return false;
    }

    let len = GLOBAL.len.load(Ordering::Acquire);
    for i in 0..len {
        let record = GLOBAL.record_at(i);
        if record.dead.load(Ordering::Acquire) {
            continue;
        }

        let epoch = record.self_epoch.load(Ordering::Acquire);
        let last_epoch = record.last_self_epoch.load(Ordering::Relaxed);
        if epoch != last_epoch {
            record.last_self_epoch.store(epoch, Ordering::Relaxed);
            continue;
        }

        let tid = record.tid.load(Ordering::Relaxed);
        let start_time = record.start_time.load(Ordering::Relaxed);
        let info = read_tid_info(tid);
        if info.dead || info.start_time != start_time {
            if !std::ptr::eq(record.as_ref(), self_rec) {
                log::info!(
                    "rtbr: record {} (tid {}) reclaimed record {} from dead tid {}",
                    self_rec.id,
                    self_rec.tid.load(Ordering::Relaxed),
                    record.id,
                    tid
                );
            }
            record.last_safe.store(now, Ordering::Release);
            record.active().clear();
            record.active_count.store(0, Ordering::Relaxed);
            let orphaned: Vec<LimboEntry> = record.limbo().drain(..).collect();
            record.limbo_count.store(0, Ordering::Relaxed);
            record.dead.store(true, Ordering::Release);
            for entry in orphaned {
                self_rec.limbo().push_back(entry);
            }
            self_rec
                .limbo_count
                .store(self_rec.limbo().len() as u64, Ordering::Relaxed);
            if !std::ptr::eq(record.as_ref(), self_rec) {
                GLOBAL.free_push(record.slot_idx);
            }
            continue;
        }

        if epoch & 1 != 0 {
            continue;
        }

        let last_safe = record.last_safe.load(Ordering::Relaxed);
        if !info.running && now > last_safe {
            record.last_safe.store(now, Ordering::Release);
        } else if info.total_time != record.total_time.load(Ordering::Relaxed) {
            let as_of = record.as_of.load(Ordering::Relaxed);
            if as_of > last_safe {
                record.last_safe.store(as_of, Ordering::Release);
            }
        }

        record.total_time.store(info.total_time, Ordering::Relaxed);
        record.as_of.store(now, Ordering::Relaxed);
    }

    GLOBAL.last_hard_poll.store(now, Ordering::Relaxed);
    GLOBAL.hard_poll_lock.store(false, Ordering::Release);
    true
}

/// Advances this thread's view of the global epoch and runs any limbo
/// entries that are now provably unreachable. `hard` additionally reads
/// `/proc` for every other record; reserve it for the cases where the
/// easy poll alone isn't making progress (spec §4.E).
pub fn poll(hard: bool) -> bool {
    let record = ensure();
    update(&record, true);

    if hard {
        let old_epoch = record.global_epoch.get();
        let advanced = poll_hard(&record);
        record.global_epoch.set(poll_easy());
        if advanced && record.global_epoch.get() > old_epoch {
            log::debug!(
                "rtbr: record {} (tid {}) polled epoch to {}",
                record.id,
                record.tid.load(Ordering::Relaxed),
                record.global_epoch.get()
            );
        }
    } else {
        let mut global_epoch = GLOBAL.global_epoch.load(Ordering::Acquire);
        if global_epoch == record.global_epoch.get() {
            global_epoch = poll_easy();
        }

        if global_epoch == record.global_epoch.get() {
            let self_epoch = record.self_epoch.load(Ordering::Relaxed);
            if global_epoch < self_epoch
                && self_epoch - global_epoch > ms_to_ticks(HARD_POLL_PERIOD_MS)
            {
                return poll(true);
            }
        }
        record.global_epoch.set(global_epoch);
    }

    let mut ran = false;
    while let Some(front) = record.limbo().front() {
        if (front.timestamp.wrapping_sub(record.global_epoch.get()) as i64) >= 0 {
            break;
        }
        let entry = record.limbo().pop_front().unwrap();
        let count = record.limbo_count.load(Ordering::Relaxed);
        if count > 0 {
            record.limbo_count.store(count - 1, Ordering::Relaxed);
        }
        (entry.run)();
        ran = true;
    }

    ran
}

/// Blocks (via short sleeps, polling hard each time) until every limbo
/// entry queued by this thread so far has run.
pub fn synchronize() {
    let record = ensure();
    poll(true);
    let mut iterations = 0usize;
    while !record.limbo().is_empty() {
        if !record.active().is_empty() {
            if let Some(front) = record.limbo().front() {
                if (front.timestamp.wrapping_sub(record.self_epoch.load(Ordering::Relaxed)) as i64)
                    >= 0
                {
                    break;
                }
            }
        }

        iterations += 1;
        if iterations % 1000 == 0 {
            log::warn!(
                "rtbr: record {} (tid {}) failed to synchronize after {} iterations",
                record.id,
                record.tid.load(Ordering::Relaxed),
                iterations
            );
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
        poll(true);
    }
}

/// Forces the global epoch to advance to at least `now - latency_ms`,
/// trading correctness risk (a too-eager reclaim) for a bound on memory
/// growth when some thread is stuck. Matches the "risk a crash rather
/// than definitely OOM" escape hatch in the source this is ported from.
pub fn force_progress(latency_ms: u64) {
    let delay = ms_to_ticks(latency_ms);
    let now = tick();
    if delay >= now {
        return;
    }

    let min_epoch = now - delay;
    let mut current = GLOBAL.minimal_epoch.load(Ordering::Acquire);
    loop {
        if min_epoch <= current {
            break;
        }
        match GLOBAL.minimal_epoch.compare_exchange_weak(
            current,
            min_epoch,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                log::warn!("rtbr: forced progress to min_epoch = {}", min_epoch);
                break;
            }
            Err(observed) => current = observed,
        }
    }

    if let Some(record) = SELF.with(|cell| cell.borrow().clone()) {
        update(&record, false);
    }
}

/// Number of currently-live (non-dead, non-freelisted) records.
pub fn record_count() -> u64 {
    let len = GLOBAL.len.load(Ordering::Acquire);
    (0..len)
        .filter(|&i| !GLOBAL.record_at(i).dead.load(Ordering::Acquire))
        .count() as u64
}

pub fn epoch() -> u64 {
    ensure().global_epoch.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn section_defers_reclamation_until_closed() {
        let ts = prepare();
        let guard = begin(ts);
        let reclaimed = Arc::new(AtomicBool::new(false));
        let flag = reclaimed.clone();
        call(move || flag.store(true, Ordering::SeqCst));

        poll(true);
        assert!(
            !reclaimed.load(Ordering::SeqCst),
            "must not reclaim while the section is open"
        );

        guard.end();
        force_progress(0);
        for _ in 0..5 {
            poll(true);
            if reclaimed.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert!(reclaimed.load(Ordering::SeqCst));
    }

    #[test]
    fn poll_without_any_section_still_reclaims() {
        let reclaimed = Arc::new(AtomicBool::new(false));
        let flag = reclaimed.clone();
        call(move || flag.store(true, Ordering::SeqCst));
        force_progress(0);
        for _ in 0..5 {
            poll(true);
            if reclaimed.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert!(reclaimed.load(Ordering::SeqCst));
    }
}
