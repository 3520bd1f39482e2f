//! Heap occupancy reporting.

/// A snapshot of the allocator's bookkeeping, computed by traversal.
///
/// Obtained from [`Marl::stats`](crate::Marl::stats). Byte counts cover the
/// arena only; page-mapped regions appear solely in `mapped_regions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeapStats {
    /// Total bytes obtained from the core.
    pub arena: usize,
    /// High-water mark of `arena`.
    pub max_arena: usize,

    /// Ordinary free chunks, the top chunk included.
    pub free_chunks: usize,
    /// Chunks parked on the recycle list.
    pub recycle_chunks: usize,
    /// Bytes parked on the recycle list.
    pub recycle_bytes: usize,

    /// Bytes handed out or consumed by bookkeeping.
    pub allocated: usize,
    /// Free bytes outside the recycle list, the top chunk included.
    pub free: usize,
    /// Bytes in the top chunk, the most `trim` could ever release.
    pub top_releasable: usize,

    /// Live page-mapped regions.
    pub mapped_regions: usize,
}
