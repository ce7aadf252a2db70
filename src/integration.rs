//! Cross-module scenarios driving the full allocator surface.

#[cfg(test)]
mod tests {
    use crate::MemoryAllocator;
    use crate::header::{HEADER_SIZE, Header};
    use std::ptr::NonNull;

    /// Deterministic xorshift64* for randomized workloads; no seeding from
    /// the environment so failures reproduce.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x.wrapping_mul(0x2545_F491_4F6C_DD1D)
        }

        fn below(&mut self, bound: usize) -> usize {
            (self.next() % bound as u64) as usize
        }
    }

    fn header_of(ptr: NonNull<u8>) -> Header {
        // Safety: Test code; every returned pointer has a header before it.
        unsafe { Header::read(ptr.as_ptr().sub(HEADER_SIZE)) }
    }

    #[test]
    fn test_small_block_roundtrip() {
        // E1: alloc, write the full payload, free, tear down clean.
        let mut alloc = MemoryAllocator::new().unwrap();
        let ptr = alloc.alloc(32).unwrap();

        let header = header_of(ptr);
        assert!(header.is_valid());
        assert_eq!(header.size_raw(), 32);

        // Safety: Test code; 32 writable bytes were promised.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xEE, 32);
            alloc.free(Some(ptr));
        }

        #[cfg(debug_assertions)]
        assert!(alloc.blocks().is_empty());
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_split_then_coalesce_restores_chunk() {
        // E2: three coalescing-pool blocks freed out of order leave one
        // free record spanning the whole chunk payload.
        let mut alloc = MemoryAllocator::new().unwrap();
        let a = alloc.alloc(600).unwrap();
        let b = alloc.alloc(600).unwrap();
        let c = alloc.alloc(600).unwrap();

        // Safety: Test code.
        unsafe {
            alloc.free(Some(b));
            alloc.free(Some(a));
            alloc.free(Some(c));
        }

        let stats = alloc.stats().coalescing;
        assert_eq!(stats.chunks.len(), 1);
        assert_eq!(stats.chunks[0].free_records, 1);
        assert_eq!(
            stats.chunks[0].free_bytes,
            stats.chunks[0].reserved - 16,
            "chunk did not coalesce back to a single whole record",
        );
        assert!(alloc.blocks().is_empty());
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_non_adjacent_release_leaves_two_records_and_a_leak() {
        // E3: free A and C around a live B; two free records, B reported live.
        let mut alloc = MemoryAllocator::new().unwrap();
        let a = alloc.alloc(1000).unwrap();
        let b = alloc.alloc(1000).unwrap();
        let c = alloc.alloc(1000).unwrap();

        // Safety: Test code.
        unsafe {
            alloc.free(Some(a));
            alloc.free(Some(c));
        }

        let stats = alloc.stats().coalescing;
        assert_eq!(stats.chunks[0].free_records, 2);

        let blocks = alloc.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks.medium[0].address, b.as_ptr() as usize);
        assert_eq!(blocks.medium[0].size, 1000);
        // The allocator now drops with B live; the debug leak scan reports it.
    }

    #[test]
    fn test_oversize_roundtrip_through_router() {
        // E4: a 20 MiB request bypasses both pools.
        let mut alloc = MemoryAllocator::new().unwrap();
        let size = 20 * 1024 * 1024;
        let ptr = alloc.alloc(size).unwrap();

        let header = header_of(ptr);
        assert!(header.is_valid());
        assert_eq!(header.size_raw(), size);

        #[cfg(debug_assertions)]
        assert_eq!(alloc.stats().coalescing.chunks.len(), 1, "coalescing pool grew for an oversize block");

        // Safety: Test code; both ends must be writable.
        unsafe {
            *ptr.as_ptr() = 0xAB;
            *ptr.as_ptr().add(size - 1) = 0xCD;
            assert_eq!(*ptr.as_ptr(), 0xAB);
            alloc.free(Some(ptr));
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_outstanding_blocks_reported_per_pool() {
        // E5: one small and one medium block left live; both show up, each
        // in its own pool's report.
        let mut alloc = MemoryAllocator::new().unwrap();
        let _small = alloc.alloc(128).unwrap();
        let _medium = alloc.alloc(1024).unwrap();

        let blocks = alloc.blocks();
        assert_eq!(blocks.small.len(), 1);
        assert_eq!(blocks.small[0].block_size, 128);
        assert_eq!(blocks.medium.len(), 1);
        assert_eq!(blocks.medium[0].size, 1024);

        let stats = alloc.stats();
        assert_eq!(stats.binned.classes[3].used_cells, 1);
        assert_eq!(stats.coalescing.total_used_records(), 1);
        // Dropping now exercises both pools' leak reports.
    }

    #[test]
    fn test_mixed_workload_parity() {
        // E6: thousands of random-size blocks, freed in a random
        // permutation, leave no live blocks and fully coalesced chunks.
        let mut alloc = MemoryAllocator::new().unwrap();
        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);

        let count = 10_000;
        let mut live = Vec::with_capacity(count);
        for _ in 0..count {
            let size = 1 + rng.below(8192);
            let ptr = alloc.alloc(size).unwrap();
            // Safety: Test code; stamp both ends of the payload (they
            // coincide for 1-byte blocks, so the end stamp wins there).
            unsafe {
                *ptr.as_ptr() = size as u8;
                *ptr.as_ptr().add(size - 1) = (size >> 8) as u8;
            }
            live.push((ptr, size));
        }

        // Fisher-Yates shuffle of the free order.
        for i in (1..live.len()).rev() {
            let j = rng.below(i + 1);
            live.swap(i, j);
        }

        for (ptr, size) in live {
            // Safety: Test code; verify the stamps survived neighbours.
            unsafe {
                if size > 1 {
                    assert_eq!(*ptr.as_ptr(), size as u8);
                }
                assert_eq!(*ptr.as_ptr().add(size - 1), (size >> 8) as u8);
                alloc.free(Some(ptr));
            }
        }

        #[cfg(debug_assertions)]
        {
            let stats = alloc.stats();
            assert_eq!(stats.binned.total_used_cells(), 0);
            assert_eq!(stats.coalescing.total_used_records(), 0);
            for chunk in &stats.coalescing.chunks {
                assert_eq!(chunk.free_records, 1, "chunk left fragmented after full free");
                assert_eq!(chunk.free_bytes, chunk.reserved - 16);
            }
            assert!(alloc.blocks().is_empty());
        }
    }

    #[test]
    fn test_live_allocations_are_disjoint() {
        // P1: every live block's payload is disjoint from every other's.
        let mut alloc = MemoryAllocator::new().unwrap();
        let mut rng = XorShift(0xDEAD_BEEF_CAFE_F00D);

        let mut live: Vec<(usize, usize)> = Vec::new();
        let mut ptrs = Vec::new();
        for _ in 0..500 {
            let size = 1 + rng.below(2048);
            let ptr = alloc.alloc(size).unwrap();
            let start = ptr.as_ptr() as usize;
            assert_eq!(start % 8, 0);
            for &(other_start, other_size) in &live {
                assert!(
                    start + size <= other_start || other_start + other_size <= start,
                    "allocation [{start:#x}; {size}] overlaps [{other_start:#x}; {other_size}]",
                );
            }
            live.push((start, size));
            ptrs.push(ptr);
        }
        for ptr in ptrs {
            // Safety: Test code.
            unsafe { alloc.free(Some(ptr)) };
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_alloc_free_cycles_reach_steady_state() {
        // L2: repeating the same alloc/free sequence leaves the same
        // abstract state (no chunk growth, full coalescing) every cycle.
        let mut alloc = MemoryAllocator::new().unwrap();
        let sizes = [24, 500, 600, 4096, 512, 513, 8000, 64];

        let mut chunk_counts = None;
        for _ in 0..8 {
            let ptrs: Vec<_> = sizes.iter().map(|&s| alloc.alloc(s).unwrap()).collect();
            for ptr in ptrs {
                // Safety: Test code.
                unsafe { alloc.free(Some(ptr)) };
            }

            let stats = alloc.stats();
            assert_eq!(stats.binned.total_used_cells(), 0);
            assert_eq!(stats.coalescing.total_used_records(), 0);
            for chunk in &stats.coalescing.chunks {
                assert_eq!(chunk.free_records, 1);
            }

            let counts = (stats.binned.total_chunks(), stats.coalescing.chunks.len());
            match chunk_counts {
                None => chunk_counts = Some(counts),
                Some(expected) => assert_eq!(counts, expected, "state drifted across cycles"),
            }
        }
    }

    #[test]
    fn test_empty_allocator_teardown_is_clean() {
        // L1: construct and drop without any traffic.
        let alloc = MemoryAllocator::new().unwrap();
        drop(alloc);
    }

    #[test]
    fn test_free_null_at_any_point() {
        // L3: None is a no-op before, between and after real traffic.
        let mut alloc = MemoryAllocator::new().unwrap();
        // Safety: Test code.
        unsafe {
            alloc.free(None);
            let ptr = alloc.alloc(100).unwrap();
            alloc.free(None);
            alloc.free(Some(ptr));
            alloc.free(None);
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_interleaved_pools_route_independently() {
        // Alternating small and medium traffic never cross-contaminates
        // the pools' accounting.
        let mut alloc = MemoryAllocator::new().unwrap();
        let mut small = Vec::new();
        let mut medium = Vec::new();
        for i in 0..100 {
            small.push(alloc.alloc(1 + i % 512).unwrap());
            medium.push(alloc.alloc(513 + i * 13).unwrap());
        }

        let stats = alloc.stats();
        assert_eq!(stats.binned.total_used_cells(), 100);
        assert_eq!(stats.coalescing.total_used_records(), 100);

        for ptr in small.drain(..).chain(medium.drain(..)) {
            // Safety: Test code.
            unsafe { alloc.free(Some(ptr)) };
        }
        let stats = alloc.stats();
        assert_eq!(stats.binned.total_used_cells(), 0);
        assert_eq!(stats.coalescing.total_used_records(), 0);
    }
}
