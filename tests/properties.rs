//! Property tests for the codec and allocator invariants that the unit
//! tests alongside each module only sample a handful of cases for.

use emberhttp::concurrent::freelist::Freelist;
use emberhttp::memory::bump::BumpPrivate;
use emberhttp::net::request_id::{RequestId, RequestIdFields};
use proptest::prelude::*;

proptest! {
    /// Every valid field triple round-trips through encode/decode
    /// exactly, regardless of bit pattern.
    #[test]
    fn request_id_round_trips(
        iotd_idx in 0u8..64,
        conn_idx in 0u32..(1 << 28),
        generation in 0u32..(1 << 28),
    ) {
        let fields = RequestIdFields { iotd_idx, conn_idx, generation };
        let id = RequestId::encode(fields);
        let decoded = id.decode(63).expect("in-range iotd_idx must decode");
        prop_assert_eq!(decoded, fields);
    }

    /// A private bump arena never hands out overlapping allocations
    /// between a `reset()` and the next one, for any sequence of sizes
    /// that individually fit.
    #[test]
    fn bump_private_allocations_never_overlap(sizes in prop::collection::vec(8u64..2048, 1..64)) {
        let bump = BumpPrivate::create(1024 * 1024).unwrap();
        let mut regions: Vec<(u64, u64)> = Vec::new();
        for size in sizes {
            match bump.alloc(size, 8) {
                Some(addr) => regions.push((addr, size)),
                None => {
                    bump.reset();
                    regions.clear();
                }
            }
        }
        regions.sort_unstable();
        for pair in regions.windows(2) {
            prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
    }

    /// A freelist never hands the same slot index to two live holders
    /// at once, for any interleaving of pop (acquire) and push (release
    /// with no grace period).
    #[test]
    fn freelist_slots_are_never_double_issued(ops in prop::collection::vec(0u8..2, 1..200)) {
        let fl = Freelist::new(32);
        for _ in 0..32 {
            let idx = fl.register().unwrap();
            fl.push(idx, 0);
        }

        let mut live = std::collections::HashSet::new();
        let mut held = Vec::new();
        for op in ops {
            if op == 0 {
                if let Some((idx, _value)) = fl.pop() {
                    prop_assert!(live.insert(idx), "pop handed out a live slot");
                    held.push(idx);
                }
            } else if let Some(idx) = held.pop() {
                live.remove(&idx);
                fl.push(idx, 0);
            }
        }
    }
}
