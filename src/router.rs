//! The allocator façade: routes requests between the two pools and the OS.
//!
//! `alloc` dispatches on the requested size; `free` dispatches on the size
//! field recovered from the header preceding the user pointer, never on a
//! side channel. Destruction drops the small pool first, then the
//! coalescing pool, running each pool's debug leak scan on the way out.

use crate::binned::{BinnedPool, MAX_SMALL};
use crate::coalescing::CoalescingPool;
use crate::header::{HEADER_SIZE, Header};
use crate::vm::VmError;
use std::ptr::NonNull;

/// Two-strategy memory allocator.
///
/// Owns all of its chunks; dropping the allocator invalidates every pointer
/// it ever returned. All operations take `&mut self` - the allocator is a
/// single-threaded resource and performs no atomic operations.
pub struct MemoryAllocator {
    binned: BinnedPool,
    coalescing: CoalescingPool,
}

impl MemoryAllocator {
    /// Build an allocator. The coalescing pool reserves its first chunk up
    /// front; on failure nothing is left mapped.
    ///
    /// # Errors
    ///
    /// Returns `VmError` when the initial reservation fails.
    pub fn new() -> Result<Self, VmError> {
        Ok(Self {
            binned: BinnedPool::new(),
            coalescing: CoalescingPool::new()?,
        })
    }

    /// Allocate `size` usable bytes, 8-byte aligned.
    ///
    /// Returns `None` for `size == 0` (defined behaviour, not an error) and
    /// when the OS refuses to provide backing memory; the allocator state
    /// is unchanged in the latter case.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let result = if size <= MAX_SMALL {
            self.binned.alloc(size)
        } else {
            self.coalescing.alloc(size)
        };
        match result {
            Ok(ptr) => Some(ptr),
            Err(_e) => {
                #[cfg(debug_assertions)]
                eprintln!("[twinpool] allocation of {size} bytes failed: {_e}");
                None
            }
        }
    }

    /// Release a block previously returned by [`alloc`](Self::alloc).
    /// `None` is tolerated and does nothing. Never calls into the OS except
    /// to release an oversize block.
    ///
    /// # Safety
    /// A `Some` pointer must have been returned by `alloc` on this
    /// allocator and not freed since.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else { return };
        // Safety: every pointer we hand out sits 8 bytes past its header word.
        let header = unsafe { Header::read(ptr.as_ptr().sub(HEADER_SIZE)) };
        if header.size_raw() > MAX_SMALL {
            // Safety: forwarded caller contract.
            unsafe { self.coalescing.free(ptr) }
        } else {
            // Safety: forwarded caller contract.
            unsafe { self.binned.free(ptr) }
        }
    }
}

#[cfg(debug_assertions)]
pub use diagnostics::{AllocatorBlocks, AllocatorStats};

#[cfg(debug_assertions)]
mod diagnostics {
    use super::MemoryAllocator;
    use crate::binned::{BinnedStats, SmallBlock};
    use crate::coalescing::{CoalescingStats, MediumBlock};
    use std::fmt;

    /// Combined usage counters of both pools. Read-only snapshot.
    #[derive(Clone, Debug)]
    pub struct AllocatorStats {
        pub binned: BinnedStats,
        pub coalescing: CoalescingStats,
    }

    impl fmt::Display for AllocatorStats {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            writeln!(f, "==========================================================")?;
            write!(f, "{}", self.binned)?;
            write!(f, "{}", self.coalescing)?;
            writeln!(f, "==========================================================")
        }
    }

    /// Every currently-busy block of both pools.
    #[derive(Clone, Debug)]
    pub struct AllocatorBlocks {
        pub small: Vec<SmallBlock>,
        pub medium: Vec<MediumBlock>,
    }

    impl AllocatorBlocks {
        pub fn is_empty(&self) -> bool {
            self.small.is_empty() && self.medium.is_empty()
        }

        pub fn len(&self) -> usize {
            self.small.len() + self.medium.len()
        }
    }

    impl fmt::Display for AllocatorBlocks {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            writeln!(f, "==========================================================")?;
            writeln!(f, "User allocated blocks:")?;
            for block in &self.small {
                writeln!(
                    f,
                    "  {:#018x} block_size={:<6} requested={}",
                    block.address, block.block_size, block.requested_size,
                )?;
            }
            for block in &self.medium {
                writeln!(f, "  {:#018x} size={}", block.address, block.size)?;
            }
            writeln!(f, "==========================================================")
        }
    }

    impl MemoryAllocator {
        /// Usage counters of both pools, computed by walking the chunks.
        /// Read-only; debug builds only.
        pub fn stats(&self) -> AllocatorStats {
            AllocatorStats {
                binned: self.binned.stats(),
                coalescing: self.coalescing.stats(),
            }
        }

        /// Print the stats report to stdout. Read-only; debug builds only.
        pub fn dump_stat(&self) {
            print!("{}", self.stats());
        }

        /// Every currently-busy block of both pools. Read-only; debug
        /// builds only.
        pub fn blocks(&self) -> AllocatorBlocks {
            AllocatorBlocks {
                small: self.binned.blocks(),
                medium: self.coalescing.blocks(),
            }
        }

        /// Print the live-block table to stdout. Read-only; debug builds only.
        pub fn dump_blocks(&self) {
            print!("{}", self.blocks());
        }
    }
}
