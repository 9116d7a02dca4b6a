//! 4.A Address-space reserver.
//!
//! A process-wide, lazily-initialized virtual memory reservation. The
//! reservation is made once with `PROT_NONE | MAP_NORESERVE` so it costs no
//! physical memory until [`crate::memory::commit`] maps pages inside it, and
//! is advised `MADV_DONTDUMP` so core dumps stay a tractable size.
//!
//! Sub-allocation of ranges inside the VMA is a CAS bump pointer; it never
//! shrinks and the reservation is never unmapped.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default VMA size: 1 TiB, matching the original's `1ULL << 40`.
pub const DEFAULT_VMA_SIZE: u64 = 1 << 40;
/// Default VMA alignment: 1 GiB.
pub const DEFAULT_VMA_ALIGNMENT: u64 = 1 << 30;

struct Vma {
    base: u64,
    size: u64,
}

static VMA: OnceCell<Vma> = OnceCell::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());
static ALLOC_POINTER: AtomicU64 = AtomicU64::new(0);

/// Returns the OS page size, queried once via `sysconf(_SC_PAGESIZE)`.
pub fn page_size() -> u64 {
    static PAGE_SIZE: OnceCell<u64> = OnceCell::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 })
}

/// Explicitly initializes the VMA reservation with a chosen size. First
/// caller wins; later calls (including the implicit one from [`reserve`])
/// are no-ops. Aborts the process if the underlying `mmap` cannot be made
/// to satisfy the alignment -- this is a one-time startup invariant, not a
/// recoverable runtime condition.
pub fn init(vma_size: u64) {
    if VMA.get().is_some() {
        return;
    }

    let _guard = INIT_LOCK.lock();
    if VMA.get().is_some() {
        return;
    }

    let (base, size) = map_reservation(vma_size, DEFAULT_VMA_ALIGNMENT);
    ALLOC_POINTER.store(base, Ordering::Relaxed);
    let _ = VMA.set(Vma { base, size });
}

fn ensure_init() {
    if VMA.get().is_none() {
        init(DEFAULT_VMA_SIZE);
    }
}

/// Attempts to reserve `size` bytes at `alignment`-byte alignment inside the
/// process-wide VMA. Returns `None` (not an address) once the bump pointer
/// would overflow the reservation.
pub fn reserve(size: u64, alignment: u64) -> Option<u64> {
    ensure_init();
    let vma = VMA.get().expect("VMA initialized above");

    let page = page_size();
    let mut mask = page - 1;
    if alignment > page {
        mask |= (alignment ^ (alignment - 1)) >> 1;
    }

    let mut current = ALLOC_POINTER.load(Ordering::Acquire);
    loop {
        let ret = (current + mask) & !mask;
        if ret < current {
            return None;
        }
        let next = ret.checked_add(size)?;
        if next < ret || (next - vma.base) > vma.size {
            return None;
        }

        match ALLOC_POINTER.compare_exchange_weak(
            current,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return Some(ret),
            Err(observed) => current = observed,
        }
    }
}

/// True iff `address` falls strictly inside the reserved VMA.
pub fn is_reserved(address: u64) -> bool {
    match VMA.get() {
        Some(vma) => address.wrapping_sub(vma.base) < vma.size,
        None => false,
    }
}

fn map_reservation(size: u64, alignment: u64) -> (u64, u64) {
    let mask = alignment - 1;
    let round_size = (size + mask) & !mask;
    let bumped_size = round_size + alignment;
    let alloc_size = (bumped_size + mask) & !mask;

    unsafe {
        let first = libc::mmap(
            std::ptr::null_mut(),
            round_size as usize,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        );

        let ret: *mut libc::c_void;
        if first != libc::MAP_FAILED && (first as u64 & mask) == 0 {
            ret = first;
        } else {
            if first != libc::MAP_FAILED {
                libc::munmap(first, round_size as usize);
            }

            let mapped = libc::mmap(
                std::ptr::null_mut(),
                alloc_size as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            );
            assert!(mapped != libc::MAP_FAILED, "failed to reserve address space");

            let mapped_addr = mapped as u64;
            let mapped_end = mapped_addr + alloc_size;
            let ret_addr = (mapped_addr + mask) & !mask;

            if ret_addr != mapped_addr {
                libc::munmap(mapped, (ret_addr - mapped_addr) as usize);
            }

            let ret_end = ret_addr + round_size;
            if ret_end != mapped_end {
                libc::munmap(ret_end as *mut libc::c_void, (mapped_end - ret_end) as usize);
            }

            ret = ret_addr as *mut libc::c_void;
        }

        libc::madvise(ret, round_size as usize, libc::MADV_DONTDUMP);
        (ret as u64, round_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_are_disjoint_and_aligned() {
        init(64 * 1024 * 1024);
        let a = reserve(4096, 64).expect("first reservation should succeed");
        let b = reserve(4096, 64).expect("second reservation should succeed");
        assert_ne!(a, b);
        assert_eq!(a % 64, 0);
        assert_eq!(b % 64, 0);
        assert!(is_reserved(a));
        assert!(is_reserved(b));
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        assert!(lo + 4096 <= hi, "allocations must not overlap");
    }

    #[test]
    fn overflow_returns_none() {
        init(64 * 1024 * 1024);
        assert!(reserve(u64::MAX, 1).is_none());
    }
}
