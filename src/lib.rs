//! twinpool is a user-space memory allocator that switches between two
//! strategies on request size, trading a fixed 8-byte header per block for
//! O(1) routing of every `free` back to the pool that produced the block.
//!
//! ```text
//!               alloc(n)
//!                  |
//!        +---------+----------------+----------------------+
//!        | 1..=512                  | 513..=10 MiB         | > 10 MiB
//!        v                          v                      v
//!  +-----------------+    +--------------------+    +-------------+
//!  |   binned pool   |    |  coalescing pool   |    |  direct OS  |
//!  | 6 size classes, |    | first-fit records, |    | reservation |
//!  | per-class free  |    | address-sorted     |    | per block   |
//!  | cell lists      |    | free lists, merge  |    +-------------+
//!  +-----------------+    | on release         |
//!                         +--------------------+
//! ```
//!
//! Every block is preceded by a self-describing header word carrying a
//! magic tag and the block size, so `free` recovers its routing decision
//! from the pointer alone. The allocator is a single-threaded owned
//! resource: all operations take `&mut self`, and dropping it returns every
//! chunk to the OS (debug builds report still-live blocks as leaks first).
//!
//! The main type is [`MemoryAllocator`]; start there.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("twinpool supports only 64-bit targets.");

mod binned;
mod coalescing;
mod header;
mod router;
mod vm;

#[cfg(test)]
mod integration;

pub use router::MemoryAllocator;
pub use vm::VmError;

#[cfg(debug_assertions)]
pub use binned::{BinnedStats, ClassStats, SmallBlock};
#[cfg(debug_assertions)]
pub use coalescing::{ChunkStats, CoalescingStats, MediumBlock};
#[cfg(debug_assertions)]
pub use router::{AllocatorBlocks, AllocatorStats};
