//! Small-block pool: segregated free lists over six fixed size classes.
//!
//! Requests of 1..=512 bytes land here. Each size class (16, 32, 64, 128,
//! 256, 512) owns a bucket: a LIFO free list of cells threaded through the
//! cells themselves, plus the chunks backing them. A chunk is a single OS
//! reservation tiled into equal cells of `class_size + 8` bytes; every cell
//! is threaded onto the free list the moment the chunk is carved, so there
//! are no virgin cells to track.
//!
//! Cell layout: `[word0][payload]`. While the cell is owned by the caller,
//! `word0` is the block header (magic + requested size). While it sits on
//! the free list, `word0` is the address of the next free cell. The header
//! is zeroed on free before the link is written, so the teardown leak scan
//! can never mistake a stale header for a live block.

use crate::header::{HEADER_SIZE, Header};
use crate::vm::{PlatformVmOps, VmError, VmOps};
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Smallest size class.
const MIN_CLASS: usize = 16;

/// Largest request the binned pool accepts; also the router threshold.
pub(crate) const MAX_SMALL: usize = 512;

/// Number of size classes (16 << 5 == 512).
const CLASS_COUNT: usize = 6;

/// Chunk reservation size: a page minus room for four words of out-of-band
/// bookkeeping.
const CHUNK_SIZE: usize = 4096 - 4 * size_of::<usize>();

/// O(1) request-size-to-class lookup table, indexed directly by the
/// requested byte count. 513 bytes of rodata buys a branchless class
/// selection on the hot path.
static CLASS_LUT: [u8; MAX_SMALL + 1] = build_class_lut();

const fn build_class_lut() -> [u8; MAX_SMALL + 1] {
    let mut table = [0u8; MAX_SMALL + 1];
    // table[0] unused (zero-size requests never reach the pool)
    let mut class: u8 = 0;
    let mut class_max: usize = MIN_CLASS;
    let mut n: usize = 1;
    while n <= MAX_SMALL {
        if n > class_max {
            class_max <<= 1;
            class += 1;
        }
        table[n] = class;
        n += 1;
    }
    table
}

const fn class_size(class: usize) -> usize {
    MIN_CLASS << class
}

const fn cell_stride(class: usize) -> usize {
    class_size(class) + HEADER_SIZE
}

const fn cells_per_chunk(class: usize) -> usize {
    CHUNK_SIZE / cell_stride(class)
}

struct Chunk {
    base: NonNull<u8>,
    /// Debug-only map of free cells; a set bit means the cell is on the
    /// free list. Gives precise double-free diagnostics beyond what the
    /// header magic alone can catch.
    #[cfg(debug_assertions)]
    free_map: FixedBitSet,
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // Safety: base was reserved with CHUNK_SIZE and is released exactly once.
        unsafe {
            drop(PlatformVmOps::release(self.base, CHUNK_SIZE));
        }
    }
}

struct Bucket {
    /// Head of the intrusive free-cell list; null when empty.
    free_head: *mut u8,
    chunks: Vec<Chunk>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            free_head: std::ptr::null_mut(),
            chunks: Vec::new(),
        }
    }
}

pub(crate) struct BinnedPool {
    buckets: [Bucket; CLASS_COUNT],
}

// Safety: BinnedPool owns its chunks outright; the raw pointers never alias
// another owner, so moving the pool to another thread is sound.
unsafe impl Send for BinnedPool {}

impl Default for BinnedPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BinnedPool {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Bucket::new()),
        }
    }

    /// Allocate `size` bytes from the matching size class.
    ///
    /// The router guarantees `1 ≤ size ≤ 512`; anything else is a dispatch
    /// bug, not caller input.
    ///
    /// # Errors
    ///
    /// Returns `VmError` when a needed chunk reservation fails. The pool
    /// state is unchanged in that case.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, VmError> {
        debug_assert!(
            size >= 1 && size <= MAX_SMALL,
            "binned alloc of {size} bytes is outside 1..=512",
        );
        let class = CLASS_LUT[size] as usize;
        if self.buckets[class].free_head.is_null() {
            self.grow(class)?;
        }

        let cell = self.buckets[class].free_head;
        // Safety: cell heads the free list, so its first word holds the next link.
        let next = unsafe { cell.cast::<usize>().read() as *mut u8 };
        self.buckets[class].free_head = next;

        #[cfg(debug_assertions)]
        Self::mark_allocated(&mut self.buckets[class], class, cell);

        // Safety: cell starts a `class`-sized slot inside a live chunk.
        unsafe {
            Header::new(size).write(cell);
            Ok(NonNull::new_unchecked(cell.add(HEADER_SIZE)))
        }
    }

    /// Reserve a fresh chunk for `class` and thread every cell onto the
    /// bucket's free list in one pass.
    fn grow(&mut self, class: usize) -> Result<(), VmError> {
        let stride = cell_stride(class);
        let count = cells_per_chunk(class);

        // Safety: FFI call to reserve memory.
        let base = unsafe { PlatformVmOps::reserve(CHUNK_SIZE)? };

        let bucket = &mut self.buckets[class];
        let mut link = bucket.free_head;
        for i in (0..count).rev() {
            // Safety: i * stride + stride <= CHUNK_SIZE.
            let cell = unsafe { base.as_ptr().add(i * stride) };
            // Safety: the cell's first word is ours until the cell is handed out.
            unsafe { cell.cast::<usize>().write(link as usize) };
            link = cell;
        }
        bucket.free_head = link;

        bucket.chunks.push(Chunk {
            base,
            #[cfg(debug_assertions)]
            free_map: {
                let mut map = FixedBitSet::with_capacity(count);
                map.insert_range(..);
                map
            },
        });
        Ok(())
    }

    /// Return a cell to its bucket's free list. No coalescing.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`alloc`](Self::alloc) on this pool
    /// and not freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        // Safety: the header word sits immediately before the user pointer.
        let cell = unsafe { ptr.as_ptr().sub(HEADER_SIZE) };
        let header = unsafe { Header::read(cell) };
        if !header.is_valid() {
            debug_assert!(
                false,
                "free of {ptr:p}: word {:#018x} lacks the allocator magic (double free or foreign pointer)",
                header.raw(),
            );
            // Safety: contract violation; the caller promised a live pointer.
            unsafe { std::hint::unreachable_unchecked() }
        }
        let size = header.size_raw();
        if size == 0 || size > MAX_SMALL {
            debug_assert!(
                false,
                "free of {ptr:p}: header size {size} is not a small block",
            );
            // Safety: contract violation; the router sent a non-small block here.
            unsafe { std::hint::unreachable_unchecked() }
        }
        let class = CLASS_LUT[size] as usize;

        #[cfg(debug_assertions)]
        Self::mark_freed(&mut self.buckets[class], class, cell, ptr);

        // Zero the header so the leak scan can never see a stale magic,
        // then thread the cell back onto its bucket's free list.
        let bucket = &mut self.buckets[class];
        // Safety: cell is a live cell of `bucket`; its first word is ours again.
        unsafe {
            Header::cleared().write(cell);
            cell.cast::<usize>().write(bucket.free_head as usize);
        }
        bucket.free_head = cell;
    }

    /// Find the chunk containing `cell` and the cell's index within it.
    #[cfg(debug_assertions)]
    fn locate(bucket: &mut Bucket, class: usize, cell: *mut u8) -> Option<(&mut Chunk, usize)> {
        let stride = cell_stride(class);
        let span = cells_per_chunk(class) * stride;
        let addr = cell as usize;
        for chunk in &mut bucket.chunks {
            let base = chunk.base.as_ptr() as usize;
            if addr >= base && addr < base + span {
                let offset = addr - base;
                assert!(
                    offset.is_multiple_of(stride),
                    "pointer {cell:p} is not aligned to the {}-byte cell stride",
                    stride,
                );
                return Some((chunk, offset / stride));
            }
        }
        None
    }

    #[cfg(debug_assertions)]
    fn mark_allocated(bucket: &mut Bucket, class: usize, cell: *mut u8) {
        let (chunk, index) = Self::locate(bucket, class, cell)
            .expect("free-list cell escaped its bucket's chunks");
        assert!(
            chunk.free_map.contains(index),
            "free-list corruption: cell {cell:p} was not marked free",
        );
        chunk.free_map.set(index, false);
    }

    #[cfg(debug_assertions)]
    fn mark_freed(bucket: &mut Bucket, class: usize, cell: *mut u8, ptr: NonNull<u8>) {
        let Some((chunk, index)) = Self::locate(bucket, class, cell) else {
            panic!("pointer {ptr:p} does not belong to this pool");
        };
        assert!(
            !chunk.free_map.contains(index),
            "double free detected in binned pool: pointer {ptr:p}",
        );
        chunk.free_map.insert(index);
    }
}

impl Drop for BinnedPool {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        for block in self.blocks() {
            eprintln!(
                "LEAK: at Addr={:#x} BinSz={} UserReqSz={}",
                block.address, block.block_size, block.requested_size,
            );
        }
        // The chunks release their reservations as the buckets drop.
    }
}

/// A live small block, as reported by [`BinnedPool::blocks`].
#[cfg(debug_assertions)]
#[derive(Clone, Copy, Debug)]
pub struct SmallBlock {
    /// User pointer address.
    pub address: usize,
    /// Size class the cell belongs to.
    pub block_size: usize,
    /// Byte count the caller originally requested.
    pub requested_size: usize,
}

#[cfg(debug_assertions)]
#[derive(Clone, Debug, Default)]
pub struct ClassStats {
    pub class_size: usize,
    pub chunks: usize,
    pub used_cells: usize,
    pub used_bytes: usize,
}

#[cfg(debug_assertions)]
#[derive(Clone, Debug)]
pub struct BinnedStats {
    pub classes: [ClassStats; CLASS_COUNT],
}

#[cfg(debug_assertions)]
impl BinnedStats {
    pub fn total_used_cells(&self) -> usize {
        self.classes.iter().map(|c| c.used_cells).sum()
    }

    pub fn total_used_bytes(&self) -> usize {
        self.classes.iter().map(|c| c.used_bytes).sum()
    }

    pub fn total_chunks(&self) -> usize {
        self.classes.iter().map(|c| c.chunks).sum()
    }
}

#[cfg(debug_assertions)]
impl std::fmt::Display for BinnedStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Binned pool:")?;
        for class in &self.classes {
            if class.chunks == 0 {
                continue;
            }
            writeln!(
                f,
                "  {}-byte class: chunks={} allocated={} bytes={}",
                class.class_size, class.chunks, class.used_cells, class.used_bytes,
            )?;
        }
        writeln!(
            f,
            "  total: chunks={} allocated={} blocks in {} bytes",
            self.total_chunks(),
            self.total_used_cells(),
            self.total_used_bytes(),
        )
    }
}

#[cfg(debug_assertions)]
impl BinnedPool {
    /// Per-class usage counters, computed by scanning the chunks. Read-only.
    pub fn stats(&self) -> BinnedStats {
        let mut classes: [ClassStats; CLASS_COUNT] = std::array::from_fn(|_| ClassStats::default());
        for (class, stats) in classes.iter_mut().enumerate() {
            stats.class_size = class_size(class);
            stats.chunks = self.buckets[class].chunks.len();
            self.scan_class(class, |_, header| {
                stats.used_cells += 1;
                stats.used_bytes += header.size_raw();
            });
        }
        BinnedStats { classes }
    }

    /// Every currently-busy cell across all classes. Read-only.
    pub fn blocks(&self) -> Vec<SmallBlock> {
        let mut blocks = Vec::new();
        for class in 0..CLASS_COUNT {
            self.scan_class(class, |cell, header| {
                blocks.push(SmallBlock {
                    address: cell as usize + HEADER_SIZE,
                    block_size: class_size(class),
                    requested_size: header.size_raw(),
                });
            });
        }
        blocks
    }

    /// Walk every cell of every chunk of `class`, invoking `f` on the ones
    /// whose word reads back as a live header.
    fn scan_class(&self, class: usize, mut f: impl FnMut(*mut u8, Header)) {
        let stride = cell_stride(class);
        for chunk in &self.buckets[class].chunks {
            for i in 0..cells_per_chunk(class) {
                // Safety: the cell lies within the chunk reservation; free
                // cells hold a link word there, which never carries the magic.
                let cell = unsafe { chunk.base.as_ptr().add(i * stride) };
                let header = unsafe { Header::read(cell) };
                if header.is_valid() {
                    f(cell, header);
                }
            }
        }
    }
}
