//! Property-based tests for the safec runtime.
//!
//! Uses proptest to generate random inputs and verify invariants hold.

use proptest::prelude::*;
use safec_runtime::checks::split_bitmap;
use safec_runtime::os::PAGE_SIZE;
use safec_runtime::{bounds_check_with_size, ExplicitRoots, Heap, MemoryConfig};

fn isolated_heap() -> Heap {
    let config = MemoryConfig {
        segment_size: 1 << 22,
        gc_threshold: usize::MAX,
        gc_enabled: false,
    };
    Heap::with_roots(config, Box::new(ExplicitRoots::new())).unwrap()
}

/// Request sizes on both sides of the big-object cutoff.
fn request_size() -> impl Strategy<Value = usize> {
    prop_oneof![
        4 => 0usize..256,
        2 => 256usize..PAGE_SIZE,
        1 => PAGE_SIZE..4 * PAGE_SIZE,
    ]
}

proptest! {
    /// GetSize reports exactly the requested size.
    #[test]
    fn size_is_exact(sizes in prop::collection::vec(request_size(), 1..24)) {
        let mut heap = isolated_heap();
        let objs: Vec<(usize, usize)> = sizes
            .iter()
            .map(|&size| (heap.allocate(size).unwrap().as_ptr() as usize, size))
            .collect();
        for (obj, size) in objs {
            prop_assert_eq!(heap.size_of(obj).unwrap(), size);
            prop_assert_eq!(obj % 8, 0);
        }
    }

    /// Objects never overlap and every interior byte resolves to its own object.
    #[test]
    fn objects_are_disjoint(sizes in prop::collection::vec(1usize..512, 2..16)) {
        let mut heap = isolated_heap();
        let objs: Vec<(usize, usize)> = sizes
            .iter()
            .map(|&size| (heap.allocate(size).unwrap().as_ptr() as usize, size))
            .collect();
        for &(obj, size) in &objs {
            prop_assert_eq!(heap.object_bounds(obj + size - 1), Some((obj, size)));
        }
        let mut sorted = objs.clone();
        sorted.sort_unstable();
        for pair in sorted.windows(2) {
            prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
    }

    /// A bounds check passes exactly when the access is inside the object.
    #[test]
    fn bounds_check_matches_interval(size in 1usize..600, offset in 0usize..700, access in 1usize..16) {
        let mut heap = isolated_heap();
        let base = heap.allocate(size).unwrap().as_ptr() as usize;
        let expected = offset + access <= size;
        prop_assert_eq!(heap.bounds_check(base, base + offset, access).is_ok(), expected);
        prop_assert_eq!(
            bounds_check_with_size(base, base + offset, size, access).is_ok(),
            expected
        );
    }

    /// Accesses starting below the base always fail.
    #[test]
    fn bounds_check_rejects_underflow(base in 0x1000usize..0x10_0000, below in 1usize..64, size in 1usize..256) {
        prop_assert!(bounds_check_with_size(base, base - below, size, 1).is_err());
    }

    /// The sentinel is the highest set bit and is stripped from the field mask.
    #[test]
    fn split_bitmap_strips_sentinel(fields in 1u32..63, mask in any::<u64>()) {
        let pointers = mask & ((1u64 << fields) - 1);
        let bitmap = pointers | (1u64 << fields);
        prop_assert_eq!(split_bitmap(bitmap), Some((fields, pointers)));
    }

    /// Freeing every object returns all of its footprint to the statistics.
    #[test]
    fn free_accounts_every_byte(sizes in prop::collection::vec(request_size(), 1..16)) {
        let mut heap = isolated_heap();
        let objs: Vec<usize> = sizes
            .iter()
            .map(|&size| heap.allocate(size).unwrap().as_ptr() as usize)
            .collect();
        let allocated = heap.stats().bytes_allocated;
        for obj in objs {
            heap.free(obj).unwrap();
        }
        prop_assert_eq!(heap.stats().bytes_freed, allocated);
    }
}
