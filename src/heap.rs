//! The allocator core.
//!
//! [`Marl`] owns every data structure: the bin sentinels and last-remainder
//! cell (carved from the front of the first core segment), the bin-block
//! bitvector, the top chunk, the recycle list head, and the tunables. The
//! public operations are the classic seven: `malloc`, `free`, `realloc`,
//! `memalign` (with `valloc` and `calloc` derivatives), `trim` and
//! `usable_size`.

use core::ptr::{null_mut, NonNull};

use crate::bins::{
    bin_index, binblock_bit, is_small_request, pad_request, smallbin_index, MAX_SMALLBIN_SIZE,
};
use crate::chunk::{Chunk, IS_MMAPPED, PREV_INUSE};
use crate::llist::LlistNode;
use crate::source::MemorySource;
use crate::stats::HeapStats;
use crate::{
    AllocError, ALIGN, ALIGN_MASK, BINBLOCK_WIDTH, BIN_COUNT, DEFAULT_MAP_MAX,
    DEFAULT_MAP_THRESHOLD, DEFAULT_RECYCLE_SIZE, DEFAULT_TOP_PAD, DEFAULT_TRIM_THRESHOLD,
    MIN_CHUNK_SIZE, WORD_SIZE,
};

const NODE_SIZE: usize = core::mem::size_of::<LlistNode>();

/// Bin sentinels plus the last-remainder cell.
const META_SIZE: usize = (BIN_COUNT + 1) * NODE_SIZE;

/// Aligns `ptr` up to the next `align_mask + 1`.
///
/// `align_mask` must be a power of two minus one.
#[inline]
fn align_up_by(ptr: *mut u8, align_mask: usize) -> *mut u8 {
    debug_assert!((align_mask + 1).is_power_of_two());

    // this incantation maintains provenance of ptr
    // while allowing the compiler to see through the wrapping_add and optimize it
    ptr.wrapping_add(((ptr as usize + align_mask) & !align_mask) - ptr as usize)
}

/// A parameter adjustable at any time via [`Marl::set_tunable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tunable {
    /// Largest chunk size eligible for the recycle list (default 72).
    /// Zero disables recycling.
    MaxRecycleSize,
    /// Merged-top size that triggers an automatic [`trim`](Marl::trim) on
    /// free (default 256 KiB). `usize::MAX` disables.
    TrimThreshold,
    /// Extra bytes tacked onto every core extension, and the pad used by
    /// automatic trimming (default 2 KiB).
    TopPad,
    /// Smallest request routed to the page-map facility (default 512 KiB).
    MapThreshold,
    /// Cap on concurrently mapped regions (default 16).
    MaxMapCount,
}

/// The Marl allocator.
///
/// A best-fit, boundary-tagged heap over a [`MemorySource`]. Construct with
/// [`new`](Marl::new); the first allocation extends the core and plants the
/// allocator's metadata at its base. Wrap in a [`Marlck`](crate::Marlck)
/// via [`lock`](Marl::lock) for `GlobalAlloc` use.
///
/// All pointer-handling operations are `unsafe` in the usual way of raw
/// allocators: the caller vouches that freed/queried pointers were returned
/// by this instance and are not used afterwards.
pub struct Marl<S: MemorySource> {
    /// Where the core and page mappings come from. State is the source's own.
    pub source: S,

    /// The bin sentinel array, null until the first core extension.
    bins: *mut LlistNode,
    /// The last-remainder cell, adjacent to the bins.
    last_remainder: *mut LlistNode,
    /// The request size whose split produced the current last remainder.
    lr_size: usize,
    /// One bit per block of four bins: set iff some bin in the block is
    /// believed non-empty. Set eagerly, cleared lazily.
    binblocks: u32,

    /// The chunk abutting the arena's high end. Null until initialized,
    /// which forces the first allocation through `extend_top`.
    top: *mut u8,
    /// LIFO of small freed chunks, linked through their first payload word.
    recycle_list: *mut u8,

    /// The first break returned by the core.
    core_base: *mut u8,
    /// Total bytes obtained from the core (foreign gap bytes included).
    core_size: usize,
    max_core_size: usize,

    /// Live page mappings.
    n_maps: usize,

    max_recycle_size: usize,
    trim_threshold: usize,
    top_pad: usize,
    map_threshold: usize,
    max_map_count: usize,
}

unsafe impl<S: MemorySource + Send> Send for Marl<S> {}

impl<S: MemorySource> core::fmt::Debug for Marl<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Marl")
            .field("top", &self.top)
            .field("binblocks", &format_args!("{:#b}", self.binblocks))
            .field("core_base", &self.core_base)
            .field("core_size", &format_args!("{:#x}", self.core_size))
            .field("n_maps", &self.n_maps)
            .finish()
    }
}

impl<S: MemorySource> Marl<S> {
    /// Returns a new allocator over `source`.
    ///
    /// No memory is touched until the first allocation.
    pub const fn new(source: S) -> Self {
        Self {
            source,
            bins: null_mut(),
            last_remainder: null_mut(),
            lr_size: 0,
            binblocks: 0,
            top: null_mut(),
            recycle_list: null_mut(),
            core_base: null_mut(),
            core_size: 0,
            max_core_size: 0,
            n_maps: 0,
            max_recycle_size: DEFAULT_RECYCLE_SIZE,
            trim_threshold: DEFAULT_TRIM_THRESHOLD,
            top_pad: DEFAULT_TOP_PAD,
            map_threshold: DEFAULT_MAP_THRESHOLD,
            max_map_count: DEFAULT_MAP_MAX,
        }
    }

    /// Adjust a [`Tunable`]. Takes effect immediately; returns `true`.
    pub fn set_tunable(&mut self, param: Tunable, value: usize) -> bool {
        match param {
            Tunable::MaxRecycleSize => self.max_recycle_size = value,
            Tunable::TrimThreshold => self.trim_threshold = value,
            Tunable::TopPad => self.top_pad = value,
            Tunable::MapThreshold => self.map_threshold = value,
            Tunable::MaxMapCount => self.max_map_count = value,
        }
        true
    }

    #[inline]
    unsafe fn bin_at(&self, idx: usize) -> *mut LlistNode {
        debug_assert!(idx < BIN_COUNT);
        self.bins.add(idx)
    }

    #[inline]
    fn mark_binblock(&mut self, idx: usize) {
        self.binblocks |= binblock_bit(idx);
    }

    #[inline]
    unsafe fn top_size(&self) -> usize {
        if self.top.is_null() {
            0
        } else {
            Chunk(self.top).size()
        }
    }

    /// Whether `p` currently occupies the last-remainder cell.
    #[inline]
    unsafe fn is_last_remainder(&self, p: Chunk) -> bool {
        (*p.node()).next == self.last_remainder
    }

    #[inline]
    unsafe fn link_last_remainder(&mut self, p: Chunk) {
        let lr = self.last_remainder;
        (*lr).next = p.node();
        (*lr).prev = p.node();
        (*p.node()).next = lr;
        (*p.node()).prev = lr;
    }

    #[inline]
    unsafe fn clear_last_remainder(&mut self) {
        LlistNode::new(self.last_remainder);
    }

    /// Place `p` in its bin, ahead of others of the same size.
    unsafe fn frontlink(&mut self, p: Chunk, size: usize) {
        if size < MAX_SMALLBIN_SIZE {
            self.small_frontlink(p, size);
        } else {
            let idx = bin_index(size);
            let bin = self.bin_at(idx);
            let mut fd = (*bin).next;

            if fd == bin {
                self.mark_binblock(idx);
            } else {
                // large bins are kept sorted by descending size
                while fd != bin && size < Chunk::of_node(fd).size() {
                    fd = (*fd).next;
                }
            }

            LlistNode::insert(p.node(), (*fd).prev, fd);
        }
    }

    /// Simplified version for known small chunks.
    unsafe fn small_frontlink(&mut self, p: Chunk, size: usize) {
        let idx = smallbin_index(size);
        self.mark_binblock(idx);
        let bin = self.bin_at(idx);
        LlistNode::insert(p.node(), bin, (*bin).next);
    }

    /// Same, except start at the back -- used for known old chunks.
    unsafe fn backlink(&mut self, p: Chunk, size: usize) {
        let idx = bin_index(size);
        let bin = self.bin_at(idx);
        let mut bk = (*bin).prev;

        if bk == bin {
            self.mark_binblock(idx);
        } else {
            while bk != bin && size > Chunk::of_node(bk).size() {
                bk = (*bk).prev;
            }
        }

        LlistNode::insert(p.node(), bk, (*bk).next);
    }

    /// Plant the bin sentinels and last-remainder cell at `base`.
    /// Returns the first byte past the metadata.
    unsafe fn init_metadata(&mut self, base: *mut u8) -> *mut u8 {
        let meta = align_up_by(base, WORD_SIZE - 1);
        let bins = meta.cast::<LlistNode>();

        for i in 0..BIN_COUNT + 1 {
            LlistNode::new(bins.add(i));
        }

        self.bins = bins;
        self.last_remainder = bins.add(BIN_COUNT);

        meta.add(META_SIZE)
    }

    /// Extend the top chunk so it can hold at least `nb` more bytes.
    ///
    /// On return the top may or may not have grown; the caller re-checks.
    /// Handles first-time initialization (metadata placement) and foreign
    /// parties moving the break between our calls (fencepost insertion).
    unsafe fn extend_top(&mut self, nb: usize) {
        let page = self.source.page_size();
        let have_top = !self.top.is_null();
        let old_top = Chunk(self.top);
        let old_top_size = if have_top { old_top.size() } else { 0 };
        let old_end = if have_top { old_top.0.add(old_top_size) } else { null_mut() };

        // pad the request with top_pad plus minimal overhead, and room for
        // the metadata on the very first call
        let mut sbrk_size = nb + self.top_pad + MIN_CHUNK_SIZE;
        if self.bins.is_null() {
            sbrk_size += META_SIZE + ALIGN;
        }
        // if not the first time through, round to preserve page boundaries
        if !self.core_base.is_null() {
            sbrk_size = (sbrk_size + page - 1) / page * page;
        }

        let brk = match self.source.extend_core(sbrk_size as isize) {
            Some(brk) => brk.as_ptr(),
            None => return,
        };

        // a foreign shrink below our old end kills the arena; give up
        if have_top && (brk as usize) < (old_end as usize) {
            return;
        }
        self.core_size += sbrk_size;

        if have_top && brk == old_end {
            // the segment abuts: just add bytes to the current top
            old_top.set_head((old_top_size + sbrk_size) | PREV_INUSE);
        } else {
            if self.core_base.is_null() {
                self.core_base = brk;
            } else if have_top {
                // someone else moved the break; count those bytes as arena
                self.core_size += brk as usize - old_end as usize;
            }

            let mut base = brk;
            if self.bins.is_null() {
                base = self.init_metadata(base);
            }

            // guarantee alignment of the first chunk made from this space
            let front_misalign = (base as usize + WORD_SIZE) & ALIGN_MASK;
            if front_misalign > 0 {
                base = base.add(ALIGN - front_misalign);
            }

            // second call rounds the break up to a page boundary
            let end = brk.add(sbrk_size);
            let correction = page - (end as usize & (page - 1));
            let new_brk = match self.source.extend_core(correction as isize) {
                Some(p) => p.as_ptr(),
                None => return,
            };
            self.core_size += correction;

            let top_size = new_brk as usize + correction - base as usize;
            self.top = base;
            Chunk(base).set_head(top_size | PREV_INUSE);

            if have_top {
                // terminate the old top with a double fencepost so no
                // future coalesce walks across the foreign gap
                let fenced = (old_top_size - 2 * ALIGN) & !ALIGN_MASK;
                let fence = Chunk(old_top.0.add(fenced));
                fence.set_head(ALIGN | PREV_INUSE);
                Chunk(fence.0.add(ALIGN)).set_head(ALIGN | PREV_INUSE);

                // release what remains of the old top, if anything usable
                if fenced >= MIN_CHUNK_SIZE {
                    old_top.set_head_size(fenced);
                    self.free(old_top.to_mem());
                }
            }
        }

        if self.core_size > self.max_core_size {
            self.max_core_size = self.core_size;
        }

        // we always land on a page boundary
        debug_assert!((self.top as usize + self.top_size()) & (page - 1) == 0);
    }

    /// Obtain an isolated page mapping holding a chunk of at least `nb`.
    unsafe fn map_chunk(&mut self, nb: usize) -> Option<Chunk> {
        if self.n_maps >= self.max_map_count {
            return None;
        }

        // the offset to the start of the mapped region is stored
        // in the word immediately before the chunk
        let offset = ALIGN - WORD_SIZE;
        let page_mask = self.source.page_size() - 1;
        let size = (nb + offset + page_mask) & !page_mask;

        let cp = self.source.map_pages(size)?.as_ptr();
        self.n_maps += 1;

        let p = Chunk(cp.add(offset));
        p.set_map_offset(offset);
        p.set_head((size - offset) | IS_MMAPPED);
        debug_assert!(p.to_mem() as usize & ALIGN_MASK == 0);
        Some(p)
    }

    unsafe fn unmap_chunk(&mut self, p: Chunk) {
        let offset = p.map_offset();
        let size = p.size();

        debug_assert!(self.n_maps > 0 && p.is_mmapped());
        debug_assert!((size + offset) & (self.source.page_size() - 1) == 0);

        self.source.unmap_pages(p.0.sub(offset), size + offset);
        self.n_maps -= 1;
    }

    /// Allocate at least `bytes` bytes.
    ///
    /// The returned pointer is aligned to [`ALIGN`] and valid until passed
    /// to [`free`](Marl::free) or reshaped by [`realloc`](Marl::realloc).
    ///
    /// # Safety
    /// The memory supplied by the source must remain valid; see
    /// [`MemorySource`].
    pub unsafe fn malloc(&mut self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        self.scan_for_errors();

        let nb = pad_request(bytes);

        // peek at the recycle list: its head is handed straight back on an
        // exact enough fit
        let rl = self.recycle_list;
        if !rl.is_null() {
            let victim = Chunk(rl);
            if victim.prev_inuse() && victim.size().wrapping_sub(nb) < MIN_CHUNK_SIZE {
                self.recycle_list = victim.fd();
                self.check_malloced_chunk(victim, nb);
                return Ok(NonNull::new_unchecked(victim.to_mem()));
            }
        }

        let mut idx: usize;

        if is_small_request(nb) {
            idx = smallbin_index(nb);

            // no traversal or size check necessary for small bins; also
            // check the next one, whose fit would leave a sub-minimum
            // residue anyway
            if !self.bins.is_null() {
                let b0 = self.bin_at(idx);
                let b1 = self.bin_at(idx + 1);
                let mut node = (*b0).prev;
                if node == b0 {
                    node = (*b1).prev;
                    if node == b1 {
                        node = null_mut();
                    }
                }

                if !node.is_null() {
                    let victim = Chunk::of_node(node);
                    let victim_size = victim.size();
                    LlistNode::remove(node);
                    victim.set_inuse_at(victim_size);
                    self.check_malloced_chunk(victim, nb);
                    return Ok(NonNull::new_unchecked(victim.to_mem()));
                }
            }

            idx += 2; // the bin scan below starts past the two bins checked
        } else {
            if nb >= self.map_threshold {
                if let Some(victim) = self.map_chunk(nb) {
                    return Ok(NonNull::new_unchecked(victim.to_mem()));
                }
            }
            idx = bin_index(nb);
        }

        // use or consolidate freed chunks
        if !self.recycle_list.is_null() {
            let mut rl = self.recycle_list;
            loop {
                let mut victim = Chunk(rl);
                rl = victim.fd();
                let mut victim_size = victim.size();
                let next = victim.next();
                let nextsz = next.size();

                if victim.prev_inuse()
                    && next.0 != self.top
                    && victim_size.wrapping_sub(nb) < MIN_CHUNK_SIZE
                {
                    self.recycle_list = rl;
                    self.check_malloced_chunk(victim, nb);
                    return Ok(NonNull::new_unchecked(victim.to_mem()));
                } else if next.0 == self.top {
                    // merge with top
                    victim_size += nextsz;
                    if !victim.prev_inuse() {
                        let prevsz = victim.prev_size();
                        victim = Chunk(victim.0.sub(prevsz));
                        LlistNode::remove(victim.node());
                        victim_size += prevsz;
                    }
                    victim.set_head(victim_size | PREV_INUSE);
                    self.top = victim.0;
                } else {
                    next.set_head(nextsz); // clear inuse bit

                    if !victim.prev_inuse() {
                        let prevsz = victim.prev_size();
                        victim = Chunk(victim.0.sub(prevsz));
                        victim_size += prevsz;
                        if !self.is_last_remainder(victim) {
                            LlistNode::remove(victim.node());
                        }
                    }

                    if !next.inuse_at(nextsz) {
                        victim_size += nextsz;
                        if !self.is_last_remainder(next) {
                            LlistNode::remove(next.node());
                        } else {
                            // re-seat the merged chunk as last remainder
                            self.link_last_remainder(victim);
                        }
                    }

                    victim.set_head(victim_size | PREV_INUSE);
                    victim.set_foot(victim_size);
                    if !self.is_last_remainder(victim) {
                        self.frontlink(victim, victim_size);
                    }
                }

                if rl.is_null() {
                    break;
                }
            }
            self.recycle_list = null_mut();
        }

        // for non-small requests, check the request's own bin only after
        // processing the recycle list
        if !is_small_request(nb) && !self.bins.is_null() {
            let bin = self.bin_at(idx);
            let mut node = (*bin).prev;

            if node != bin {
                let mut remainder_size: isize = -1;
                loop {
                    let victim = Chunk::of_node(node);
                    let victim_size = victim.size();
                    remainder_size = victim_size as isize - nb as isize;

                    if remainder_size >= 0 {
                        if remainder_size < MIN_CHUNK_SIZE as isize {
                            LlistNode::remove(node);
                            victim.set_inuse_at(victim_size);
                            self.check_malloced_chunk(victim, nb);
                            return Ok(NonNull::new_unchecked(victim.to_mem()));
                        }
                        // a splittable fit exists; rescan below after the
                        // last remainder has had its chance
                        break;
                    }

                    node = (*node).prev;
                    if node == bin {
                        break;
                    }
                }
                if remainder_size < 0 {
                    idx += 1; // don't rescan below
                }
            } else {
                idx += 1;
            }
        }

        // try to use the last split-off remainder
        if !self.last_remainder.is_null() && !LlistNode::is_empty(self.last_remainder) {
            let victim = Chunk::of_node((*self.last_remainder).next);
            let victim_size = victim.size();
            let remainder_size = victim_size as isize - nb as isize;

            // take if an exact fit, a consecutive small request, or a
            // consecutive request of the size that caused the split
            if remainder_size >= 0 && remainder_size < MIN_CHUNK_SIZE as isize {
                self.clear_last_remainder();
                victim.set_inuse_at(victim_size);
                self.check_malloced_chunk(victim, nb);
                return Ok(NonNull::new_unchecked(victim.to_mem()));
            } else if remainder_size >= 0 && (is_small_request(nb) || nb == self.lr_size) {
                let remainder = Chunk(victim.0.add(nb));
                self.link_last_remainder(remainder);
                remainder.set_head(remainder_size as usize | PREV_INUSE);
                remainder.set_foot(remainder_size as usize);
                victim.set_head(nb | PREV_INUSE);
                self.check_malloced_chunk(victim, nb);
                return Ok(NonNull::new_unchecked(victim.to_mem()));
            } else {
                // demote into an ordinary bin: small ones in front so they
                // can get bigger, others toward the back to be found again
                self.clear_last_remainder();
                if victim_size < MAX_SMALLBIN_SIZE {
                    self.small_frontlink(victim, victim_size);
                } else {
                    self.backlink(victim, victim_size);
                }
            }
        }

        // if there are any possibly-nonempty big-enough blocks, search for a
        // best-fitting chunk by scanning bins in blockwidth units
        let mut block = binblock_bit(idx);
        if block <= self.binblocks {
            // get to the first marked block
            if block & self.binblocks == 0 {
                idx = (idx & !(BINBLOCK_WIDTH - 1)) + BINBLOCK_WIDTH;
                block <<= 1;
                while block & self.binblocks == 0 {
                    idx += BINBLOCK_WIDTH;
                    block <<= 1;
                }
            }

            'blocks: loop {
                let startidx = idx; // (track incomplete blocks)

                // for each bin in this block, take the first big enough chunk
                loop {
                    let bin = self.bin_at(idx);
                    let mut node = (*bin).prev;

                    while node != bin {
                        let victim = Chunk::of_node(node);
                        let victim_size = victim.size();
                        let remainder_size = victim_size as isize - nb as isize;

                        if remainder_size >= 0 {
                            LlistNode::remove(node);

                            if remainder_size < MIN_CHUNK_SIZE as isize {
                                // exact fit
                                victim.set_inuse_at(victim_size);
                            } else {
                                // the residue becomes the new last remainder
                                let remainder = Chunk(victim.0.add(nb));
                                self.lr_size = nb;
                                self.link_last_remainder(remainder);
                                remainder.set_head(remainder_size as usize | PREV_INUSE);
                                remainder.set_foot(remainder_size as usize);
                                victim.set_head(nb | PREV_INUSE);
                            }

                            self.check_malloced_chunk(victim, nb);
                            return Ok(NonNull::new_unchecked(victim.to_mem()));
                        }

                        node = (*node).prev;
                    }

                    idx += 1;
                    if idx & (BINBLOCK_WIDTH - 1) == 0 {
                        break;
                    }
                }

                // clear out the block bit, backtracking over the bins a
                // partial scan skipped; a non-empty one leaves the bit alone
                let mut start = startidx;
                loop {
                    if start & (BINBLOCK_WIDTH - 1) == 0 {
                        self.binblocks &= !block;
                        break;
                    }
                    start -= 1;
                    if !LlistNode::is_empty(self.bin_at(start)) {
                        break;
                    }
                }

                // get to the next possibly-nonempty block
                block <<= 1;
                if block <= self.binblocks && block != 0 {
                    while block & self.binblocks == 0 {
                        idx += BINBLOCK_WIDTH;
                        block <<= 1;
                    }
                } else {
                    break 'blocks;
                }
            }
        }

        // if all else fails, use the top chunk, extending it as needed;
        // require that a remainder be left over either way
        let mut remainder_size = self.top_size() as isize - nb as isize;
        if remainder_size < MIN_CHUNK_SIZE as isize {
            self.extend_top(nb);
            remainder_size = self.top_size() as isize - nb as isize;
            if remainder_size < MIN_CHUNK_SIZE as isize {
                return Err(AllocError);
            }
        }

        let victim = Chunk(self.top);
        let remainder = Chunk(victim.0.add(nb));
        self.top = remainder.0;
        remainder.set_head(remainder_size as usize | PREV_INUSE);
        victim.set_head(nb | PREV_INUSE);
        self.check_malloced_chunk(victim, nb);
        Ok(NonNull::new_unchecked(victim.to_mem()))
    }

    /// Free the allocation at `mem`. Null is ignored.
    ///
    /// # Safety
    /// `mem` must be null or a live pointer returned by this instance; it
    /// must not be used afterwards.
    pub unsafe fn free(&mut self, mem: *mut u8) {
        if mem.is_null() {
            return;
        }
        self.scan_for_errors();

        let mut p = Chunk::from_mem(mem);

        if p.is_mmapped() {
            self.unmap_chunk(p);
            return;
        }

        self.check_inuse_chunk(p);
        let mut sz = p.size();

        // small chunks go on the recycle list for later; their neighbors
        // keep seeing them as allocated
        if sz <= self.max_recycle_size {
            p.set_fd(self.recycle_list);
            self.recycle_list = p.0;
            return;
        }

        let next = p.next();
        let nextsz = next.size();

        if next.0 == self.top {
            // merge with top
            sz += nextsz;
            if !p.prev_inuse() {
                // consolidate backward
                let prevsz = p.prev_size();
                p = Chunk(p.0.sub(prevsz));
                LlistNode::remove(p.node());
                sz += prevsz;
            }

            p.set_head(sz | PREV_INUSE);
            self.top = p.0;

            if sz >= self.trim_threshold {
                self.trim(self.top_pad);
            }
        } else {
            next.set_head(nextsz); // clear inuse bit for p

            if !p.prev_inuse() {
                // consolidate backward
                let prevsz = p.prev_size();
                p = Chunk(p.0.sub(prevsz));
                sz += prevsz;

                if self.is_last_remainder(p) {
                    // leave intact as the last remainder
                    if !next.inuse_at(nextsz) {
                        LlistNode::remove(next.node());
                        sz += nextsz;
                    }
                    p.set_head(sz | PREV_INUSE);
                    p.set_foot(sz);
                    return;
                }
                LlistNode::remove(p.node());
            }

            if !next.inuse_at(nextsz) {
                // consolidate forward
                sz += nextsz;
                if self.is_last_remainder(next) {
                    // re-seat as the last remainder
                    self.link_last_remainder(p);
                    p.set_head(sz | PREV_INUSE);
                    p.set_foot(sz);
                    return;
                }
                LlistNode::remove(next.node());
            }

            p.set_head(sz | PREV_INUSE);
            p.set_foot(sz);
            self.frontlink(p, sz);
        }
    }

    /// Coalesce every recycle-list entry back into the heap, taking nothing.
    ///
    /// Realloc growth and trimming rely on accurate neighbor tags, which
    /// recycled chunks suspend.
    unsafe fn drain_recycle_list(&mut self) {
        while !self.recycle_list.is_null() {
            let mut p = Chunk(self.recycle_list);
            self.recycle_list = p.fd();
            let mut sz = p.size();

            let next = p.next();
            let nextsz = next.size();

            if next.0 == self.top {
                sz += nextsz;
                if !p.prev_inuse() {
                    let prevsz = p.prev_size();
                    p = Chunk(p.0.sub(prevsz));
                    LlistNode::remove(p.node());
                    sz += prevsz;
                }
                p.set_head(sz | PREV_INUSE);
                self.top = p.0;
            } else {
                next.set_head(nextsz);

                if !p.prev_inuse() {
                    let prevsz = p.prev_size();
                    p = Chunk(p.0.sub(prevsz));
                    sz += prevsz;
                    if !self.is_last_remainder(p) {
                        LlistNode::remove(p.node());
                    }
                }

                if !next.inuse_at(nextsz) {
                    sz += nextsz;
                    if !self.is_last_remainder(next) {
                        LlistNode::remove(next.node());
                    } else {
                        self.link_last_remainder(p);
                    }
                }

                p.set_head(sz | PREV_INUSE);
                p.set_foot(sz);
                if !self.is_last_remainder(p) {
                    self.frontlink(p, sz);
                }
            }
        }
    }

    /// Split off and free whatever extends past `nb` in `newp`, then return
    /// the user pointer. Common tail of the realloc strategies.
    unsafe fn realloc_split(&mut self, newp: Chunk, newsize: usize, nb: usize) -> NonNull<u8> {
        if newsize - nb >= MIN_CHUNK_SIZE {
            let remainder = Chunk(newp.0.add(nb));
            let remainder_size = newsize - nb;
            newp.set_head_size(nb);
            remainder.set_head(remainder_size | PREV_INUSE);
            remainder.set_inuse_at(remainder_size);
            self.free(remainder.to_mem()); // let free() deal with it
        } else {
            newp.set_head_size(newsize);
            newp.set_inuse_at(newsize);
        }

        self.check_inuse_chunk(newp);
        NonNull::new_unchecked(newp.to_mem())
    }

    /// Resize the allocation at `mem` to at least `bytes`, in place when the
    /// neighborhood allows, else by allocate-copy-free.
    ///
    /// `realloc(null, n)` allocates; on failure the original allocation is
    /// left untouched.
    ///
    /// # Safety
    /// As [`free`](Marl::free); a moved allocation invalidates `mem`.
    pub unsafe fn realloc(&mut self, mem: *mut u8, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        #[cfg(feature = "realloc_zero_frees")]
        if bytes == 0 {
            self.free(mem);
            return Err(AllocError);
        }

        // realloc of null is an allocation
        if mem.is_null() {
            return self.malloc(bytes);
        }
        self.scan_for_errors();

        let oldp = Chunk::from_mem(mem);
        let oldsize = oldp.size();
        let nb = pad_request(bytes);

        if oldp.is_mmapped() {
            if oldsize >= nb {
                return Ok(NonNull::new_unchecked(mem));
            }
            // must alloc, copy, release
            let newmem = self.malloc(bytes)?;
            newmem.as_ptr().copy_from_nonoverlapping(mem, oldsize - WORD_SIZE);
            self.unmap_chunk(oldp);
            return Ok(newmem);
        }

        self.check_inuse_chunk(oldp);

        let mut newp = oldp;
        let mut newsize = oldsize;

        if oldsize < nb {
            // make sure all chunks are consolidated first
            if !self.recycle_list.is_null() {
                self.drain_recycle_list();
            }

            // try expanding forward
            let mut next = Some(oldp.next());
            let mut nextsize = 0;
            if let Some(n) = next {
                if n.0 == self.top {
                    // forward into top, only if a remainder would be left
                    nextsize = n.size();
                    if nextsize + newsize >= nb + MIN_CHUNK_SIZE {
                        newsize += nextsize;
                        self.top = oldp.0.add(nb);
                        Chunk(self.top).set_head((newsize - nb) | PREV_INUSE);
                        oldp.set_head_size(nb);
                        return Ok(NonNull::new_unchecked(oldp.to_mem()));
                    }
                } else if !n.inuse() {
                    nextsize = n.size();
                    if nextsize + newsize >= nb {
                        LlistNode::remove(n.node());
                        newsize += nextsize;
                        return Ok(self.realloc_split(oldp, newsize, nb));
                    }
                } else {
                    next = None;
                }
            }

            // try shifting backward
            if !oldp.prev_inuse() {
                let prevsize = oldp.prev_size();
                let prev = Chunk(oldp.0.sub(prevsize));

                // forward + backward first, saving a later consolidation
                if let Some(n) = next {
                    if n.0 == self.top {
                        if nextsize + prevsize + newsize >= nb + MIN_CHUNK_SIZE {
                            LlistNode::remove(prev.node());
                            newp = prev;
                            newsize += prevsize + nextsize;
                            newp.to_mem().copy_from(mem, oldsize - WORD_SIZE);
                            self.top = newp.0.add(nb);
                            Chunk(self.top).set_head((newsize - nb) | PREV_INUSE);
                            newp.set_head_size(nb);
                            return Ok(NonNull::new_unchecked(newp.to_mem()));
                        }
                    } else if nextsize + prevsize + newsize >= nb {
                        LlistNode::remove(n.node());
                        LlistNode::remove(prev.node());
                        newp = prev;
                        newsize += nextsize + prevsize;
                        newp.to_mem().copy_from(mem, oldsize - WORD_SIZE);
                        return Ok(self.realloc_split(newp, newsize, nb));
                    }
                }

                // backward only
                if prevsize + newsize >= nb {
                    LlistNode::remove(prev.node());
                    newp = prev;
                    newsize += prevsize;
                    newp.to_mem().copy_from(mem, oldsize - WORD_SIZE);
                    return Ok(self.realloc_split(newp, newsize, nb));
                }
            }

            // must allocate
            let newmem = self.malloc(bytes)?;

            // avoid the copy if the new chunk landed immediately after the
            // old one (possible when the arena was just extended)
            newp = Chunk::from_mem(newmem.as_ptr());
            if newp.0 == oldp.next().0 {
                newsize += newp.size();
                return Ok(self.realloc_split(oldp, newsize, nb));
            }

            // otherwise copy, free, and exit
            newmem.as_ptr().copy_from_nonoverlapping(mem, oldsize - WORD_SIZE);
            self.free(mem);
            return Ok(newmem);
        }

        Ok(self.realloc_split(newp, newsize, nb))
    }

    /// Allocate at least `bytes` bytes aligned to `alignment`, a power of
    /// two. Alignments below [`MIN_CHUNK_SIZE`] are raised to it.
    ///
    /// # Safety
    /// As [`malloc`](Marl::malloc).
    pub unsafe fn memalign(
        &mut self,
        alignment: usize,
        bytes: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // use an alignment both we and the caller can live with
        let align = if alignment > MIN_CHUNK_SIZE { alignment } else { MIN_CHUNK_SIZE };
        debug_assert!(align.is_power_of_two());

        // over-allocate with worst-case padding to guarantee an aligned
        // spot with a linkable leader exists inside the chunk
        let nb = pad_request(bytes);
        let m = self.malloc(nb + align + MIN_CHUNK_SIZE)?.as_ptr();

        let mut p = Chunk::from_mem(m);

        if m as usize % align == 0 {
            // already aligned
            if p.is_mmapped() {
                return Ok(NonNull::new_unchecked(m)); // nothing more to do
            }
        } else {
            // find an aligned spot inside the chunk whose leading portion
            // is big enough to give back; the over-allocation guarantees
            // the next aligned spot fits if the first leaves too little
            let mut brk =
                (((m as usize + align - 1) & align.wrapping_neg()) - WORD_SIZE) as *mut u8;
            if (brk as usize - p.0 as usize) < MIN_CHUNK_SIZE {
                brk = brk.add(align);
            }

            let newp = Chunk(brk);
            let leadsize = brk as usize - p.0 as usize;
            let newsize = p.size() - leadsize;

            if p.is_mmapped() {
                // mapped chunks only shift their recorded front offset
                newp.set_map_offset(p.map_offset() + leadsize);
                newp.set_head(newsize | IS_MMAPPED);
                return Ok(NonNull::new_unchecked(newp.to_mem()));
            }

            // give back the leader, use the rest
            newp.set_head(newsize | PREV_INUSE);
            newp.set_inuse_at(newsize);
            p.set_head_size(leadsize);
            self.free(p.to_mem());
            p = newp;
        }

        // also give back spare room at the end
        let remainder_size = p.size() as isize - nb as isize;
        if remainder_size >= MIN_CHUNK_SIZE as isize {
            let remainder = Chunk(p.0.add(nb));
            remainder.set_head(remainder_size as usize | PREV_INUSE);
            p.set_head_size(nb);
            self.free(remainder.to_mem());
        }

        self.check_inuse_chunk(p);
        debug_assert!(p.to_mem() as usize % align == 0);
        Ok(NonNull::new_unchecked(p.to_mem()))
    }

    /// Allocate at least `bytes` bytes aligned to the source's page size.
    ///
    /// # Safety
    /// As [`malloc`](Marl::malloc).
    pub unsafe fn valloc(&mut self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        let page = self.source.page_size();
        self.memalign(page, bytes)
    }

    /// Allocate a zeroed region for `count` elements of `elem_size` bytes.
    ///
    /// # Safety
    /// As [`malloc`](Marl::malloc).
    pub unsafe fn calloc(
        &mut self,
        count: usize,
        elem_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let bytes = count.checked_mul(elem_size).ok_or(AllocError)?;
        let mem = self.malloc(bytes)?;

        let csz = Chunk::from_mem(mem.as_ptr()).size();
        mem.as_ptr().write_bytes(0, csz - WORD_SIZE);
        Ok(mem)
    }

    /// Give pages at the arena's high end back to the core, keeping at
    /// least `pad` spare bytes in the top chunk. Returns whether anything
    /// was released.
    pub fn trim(&mut self, pad: usize) -> bool {
        unsafe {
            self.scan_for_errors();

            // recycled chunks block coalescing into top; settle them first
            if !self.recycle_list.is_null() {
                self.drain_recycle_list();
            }

            if self.top.is_null() {
                return false;
            }

            let top = Chunk(self.top);
            let top_size = top.size();
            let page = self.source.page_size();

            let extra = ((top_size as isize - pad as isize - MIN_CHUNK_SIZE as isize
                + (page as isize - 1))
                / page as isize
                - 1)
                * page as isize;

            if extra < page as isize {
                return false; // not enough memory to release
            }

            // make sure no one else moved the break; if they did, the pages
            // up top aren't ours to give back
            let current_brk = match self.source.extend_core(0) {
                Some(brk) => brk.as_ptr(),
                None => return false,
            };
            if current_brk != top.0.add(top_size) {
                return false;
            }

            match self.source.extend_core(-extra) {
                Some(_) => {
                    top.set_head((top_size - extra as usize) | PREV_INUSE);
                    self.core_size -= extra as usize;
                    true
                }
                None => {
                    // failed partway; resync with whatever the break is now
                    if let Some(cur) = self.source.extend_core(0) {
                        let new_top_size = cur.as_ptr() as usize - top.0 as usize;
                        if new_top_size >= MIN_CHUNK_SIZE {
                            self.core_size = cur.as_ptr() as usize - self.core_base as usize;
                            top.set_head(new_top_size | PREV_INUSE);
                        }
                    }
                    false
                }
            }
        }
    }

    /// The bytes actually usable at `mem`: at least what was requested.
    /// Zero for null or a pointer that isn't a live allocation.
    ///
    /// # Safety
    /// `mem` must be null or a pointer returned by this instance.
    pub unsafe fn usable_size(&self, mem: *mut u8) -> usize {
        if mem.is_null() {
            return 0;
        }

        let p = Chunk::from_mem(mem);
        if !p.is_mmapped() && !p.inuse() {
            return 0;
        }
        p.size() - WORD_SIZE
    }

    /// Snapshot the heap's occupancy. Computed by walking the free lists.
    pub fn stats(&self) -> HeapStats {
        unsafe {
            let top_size = self.top_size();
            let mut free = top_size;
            let mut free_chunks = 0;
            if top_size >= MIN_CHUNK_SIZE {
                free_chunks += 1;
            }

            if !self.bins.is_null() {
                for idx in 0..BIN_COUNT {
                    for node in LlistNode::iter(self.bin_at(idx)) {
                        free += Chunk::of_node(node).size();
                        free_chunks += 1;
                    }
                }
                for node in LlistNode::iter(self.last_remainder) {
                    free += Chunk::of_node(node).size();
                    free_chunks += 1;
                }
            }

            let mut recycle_chunks = 0;
            let mut recycle_bytes = 0;
            let mut rl = self.recycle_list;
            while !rl.is_null() {
                recycle_bytes += Chunk(rl).size();
                recycle_chunks += 1;
                rl = Chunk(rl).fd();
            }

            HeapStats {
                arena: self.core_size,
                max_arena: self.max_core_size,
                free_chunks,
                recycle_chunks,
                recycle_bytes,
                allocated: self.core_size - free - recycle_bytes,
                free,
                top_releasable: top_size,
                mapped_regions: self.n_maps,
            }
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    fn scan_for_errors(&self) {}

    /// Debugging function checking the free-list structures wholesale.
    #[cfg(debug_assertions)]
    fn scan_for_errors(&self) {
        #[cfg(test)]
        let mut spans = std::vec::Vec::<crate::Span>::new();

        if self.bins.is_null() {
            assert!(self.binblocks == 0);
            return;
        }

        unsafe {
            for idx in 0..BIN_COUNT {
                let bin = self.bin_at(idx);

                for node in LlistNode::iter(bin) {
                    assert!((*(*node).next).prev == node);
                    assert!((*(*node).prev).next == node);

                    let p = Chunk::of_node(node);
                    self.check_free_chunk(p);
                    assert!(self.binblocks & binblock_bit(idx) != 0);

                    let size = p.size();
                    if size < MAX_SMALLBIN_SIZE {
                        assert!(smallbin_index(size) == idx);
                    } else {
                        assert!(bin_index(size) == idx);
                    }

                    #[cfg(test)]
                    {
                        let span = crate::Span::from_base_size(p.0, size);
                        for other in &spans {
                            assert!(!span.overlaps(*other), "{} intersects {}", span, other);
                        }
                        spans.push(span);
                    }
                }
                // stale set bits are legal; only non-empty bins must be marked
            }

            for node in LlistNode::iter(self.last_remainder) {
                let p = Chunk::of_node(node);
                self.check_free_chunk(p);
            }
        }
    }

    #[cfg(debug_assertions)]
    unsafe fn check_chunk(&self, p: Chunk) {
        let sz = p.size();
        assert!(p.0 >= self.core_base);
        if p.0 != self.top {
            assert!(p.0 as usize + sz <= self.top as usize);
        } else {
            assert!(p.0 as usize + sz <= self.core_base as usize + self.core_size);
        }
    }

    #[cfg(debug_assertions)]
    unsafe fn check_free_chunk(&self, p: Chunk) {
        let sz = p.size();
        let next = p.next();
        self.check_chunk(p);

        assert!(!p.inuse());
        assert!(sz >= MIN_CHUNK_SIZE);
        assert!(sz & ALIGN_MASK == 0);
        assert!(p.to_mem() as usize & ALIGN_MASK == 0);
        // matching footer
        assert!(p.0.add(sz - WORD_SIZE).cast::<usize>().read() == sz);
        // fully consolidated
        assert!(p.prev_inuse());
        assert!(next.0 == self.top || next.inuse());
    }

    #[cfg(debug_assertions)]
    unsafe fn check_inuse_chunk(&self, p: Chunk) {
        let next = p.next();
        self.check_chunk(p);

        assert!(p.inuse());

        // an inuse chunk borders free chunks worth checking
        if !p.prev_inuse() {
            let prev = Chunk(p.0.sub(p.prev_size()));
            assert!(prev.next().0 == p.0);
            self.check_free_chunk(prev);
        }
        if next.0 == self.top {
            assert!(next.prev_inuse());
        } else if !next.inuse() {
            self.check_free_chunk(next);
        }
    }

    #[cfg(debug_assertions)]
    unsafe fn check_malloced_chunk(&self, p: Chunk, nb: usize) {
        let sz = p.size();
        self.check_inuse_chunk(p);

        assert!(sz >= MIN_CHUNK_SIZE);
        assert!(sz & ALIGN_MASK == 0);
        assert!(sz >= nb);
        assert!(sz - nb < MIN_CHUNK_SIZE);
        assert!(p.to_mem() as usize & ALIGN_MASK == 0);
        // allocated at the front of an available chunk
        assert!(p.prev_inuse());
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    unsafe fn check_inuse_chunk(&self, _: Chunk) {}

    #[cfg(not(debug_assertions))]
    #[inline]
    unsafe fn check_malloced_chunk(&self, _: Chunk, _: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestSource;

    fn heap(capacity: usize) -> Marl<TestSource> {
        Marl::new(TestSource::new(capacity))
    }

    unsafe fn verify_fill(ptr: *mut u8, size: usize, fill: u8) {
        for off in 0..size {
            assert_eq!(*ptr.add(off), fill, "corruption at byte {} of {:p}", off, ptr);
        }
    }

    #[test]
    fn small_bin_exact_refit() {
        let mut m = heap(1 << 20);
        unsafe {
            let a = m.malloc(40).unwrap().as_ptr();
            let b = m.malloc(40).unwrap().as_ptr();
            m.free(a);
            let c = m.malloc(40).unwrap().as_ptr();
            assert_eq!(c, a);
            m.free(b);
            m.free(c);
        }
    }

    #[test]
    fn large_request_refit() {
        let mut m = heap(1 << 20);
        unsafe {
            // top-adjacent: freed memory folds into top and is re-carved
            let p = m.malloc(1000).unwrap().as_ptr();
            m.free(p);
            let q = m.malloc(1000).unwrap().as_ptr();
            assert_eq!(q, p);

            // not top-adjacent: the freed chunk is binned and found by the
            // own-bin best-fit scan
            let _sep = m.malloc(16).unwrap();
            m.free(q);
            let r = m.malloc(1000).unwrap().as_ptr();
            assert_eq!(r, q);
            m.free(r);
        }
    }

    #[test]
    fn best_fit_within_bin() {
        let mut m = heap(1 << 20);
        unsafe {
            // chunks of 528 and 560 bytes share a bin
            let s1 = m.malloc(520).unwrap().as_ptr();
            let _b1 = m.malloc(16).unwrap();
            let s2 = m.malloc(552).unwrap().as_ptr();
            let _b2 = m.malloc(16).unwrap();

            m.free(s1);
            m.free(s2);

            // the smaller of the two satisfies the request exactly
            let q = m.malloc(520).unwrap().as_ptr();
            assert_eq!(q, s1);
            let q2 = m.malloc(552).unwrap().as_ptr();
            assert_eq!(q2, s2);
        }
    }

    #[test]
    fn own_bin_undersized_chunk_survives() {
        let mut m = heap(1 << 20);
        unsafe {
            let s1 = m.malloc(520).unwrap().as_ptr();
            let _b = m.malloc(16).unwrap();
            m.free(s1);

            // too small for this request: the search moves on to top
            let q = m.malloc(552).unwrap().as_ptr();
            assert_ne!(q, s1);

            // but the chunk is still reachable afterwards
            let r = m.malloc(520).unwrap().as_ptr();
            assert_eq!(r, s1);
        }
    }

    #[test]
    fn last_remainder_carves_consecutively() {
        let mut m = heap(1 << 20);
        unsafe {
            let big = m.malloc(2000).unwrap().as_ptr();
            let _sep = m.malloc(16).unwrap();
            m.free(big);

            // the split residue is cached, so equal requests that follow
            // carve a contiguous run
            let s1 = m.malloc(100).unwrap().as_ptr();
            assert_eq!(s1, big);
            let s2 = m.malloc(100).unwrap().as_ptr();
            assert_eq!(s2 as usize, s1 as usize + pad_request(100));
            let s3 = m.malloc(100).unwrap().as_ptr();
            assert_eq!(s3 as usize, s2 as usize + pad_request(100));
        }
    }

    #[test]
    fn last_remainder_matches_repeat_large_requests() {
        let mut m = heap(1 << 20);
        unsafe {
            let big = m.malloc(4000).unwrap().as_ptr();
            let _sep = m.malloc(16).unwrap();
            m.free(big);

            let s1 = m.malloc(600).unwrap().as_ptr();
            assert_eq!(s1, big);
            // the residue recorded the producing request size; the repeat
            // splits it again rather than searching
            let s2 = m.malloc(600).unwrap().as_ptr();
            assert_eq!(s2 as usize, s1 as usize + pad_request(600));
        }
    }

    #[test]
    fn coalesce_and_reuse_without_growth() {
        let mut m = heap(1 << 20);
        unsafe {
            let a = m.malloc(100).unwrap().as_ptr();
            let b = m.malloc(100).unwrap().as_ptr();
            let c = m.malloc(100).unwrap().as_ptr();

            m.free(a);
            m.free(c);
            m.free(b);

            // all three coalesced into top; this fits without growing
            let brk = m.source.brk();
            let big = m.malloc(300).unwrap().as_ptr();
            assert_eq!(m.source.brk(), brk);
            assert_eq!(big, a);
            m.free(big);
        }
    }

    #[test]
    fn mapped_large_request() {
        let mut m = heap(1 << 20);
        unsafe {
            let arena_before = m.stats().arena;

            let p = m.malloc(600_000).unwrap().as_ptr();
            assert_eq!(p as usize % ALIGN, 0);
            assert!(m.usable_size(p) >= 600_000);
            assert_eq!(m.stats().mapped_regions, 1);
            // the arena is untouched by the mapped path
            assert_eq!(m.stats().arena, arena_before);

            p.write_bytes(0x5a, 600_000);
            m.free(p);
            assert_eq!(m.stats().mapped_regions, 0);
            assert!(m.source.maps.is_empty());
        }
    }

    #[test]
    fn mapped_cap_falls_back_to_arena() {
        let mut m = heap(2 << 20);
        m.set_tunable(Tunable::MaxMapCount, 0);
        unsafe {
            let p = m.malloc(600_000).unwrap().as_ptr();
            assert_eq!(m.stats().mapped_regions, 0);
            assert!(m.stats().arena >= 600_000);
            m.free(p);
        }
    }

    #[test]
    fn realloc_grows_into_top_in_place() {
        let mut m = heap(1 << 20);
        unsafe {
            let r = m.malloc(50).unwrap().as_ptr();
            r.write_bytes(0x11, 50);
            let s = m.realloc(r, 60).unwrap().as_ptr();
            assert_eq!(s, r);
            verify_fill(s, 50, 0x11);
        }
    }

    #[test]
    fn realloc_moves_and_preserves_contents() {
        let mut m = heap(1 << 20);
        unsafe {
            let r = m.malloc(50).unwrap().as_ptr();
            let _blocker = m.malloc(50).unwrap();
            r.write_bytes(0x22, 50);

            let s = m.realloc(r, 2000).unwrap().as_ptr();
            assert_ne!(s, r);
            verify_fill(s, 50, 0x22);
            m.free(s);
        }
    }

    #[test]
    fn realloc_grows_into_free_neighbor() {
        let mut m = heap(1 << 20);
        unsafe {
            let a = m.malloc(100).unwrap().as_ptr();
            let b = m.malloc(100).unwrap().as_ptr();
            let _blocker = m.malloc(16).unwrap();
            a.write_bytes(0x33, 100);
            m.free(b);

            // b's space is absorbed without moving a
            let s = m.realloc(a, 180).unwrap().as_ptr();
            assert_eq!(s, a);
            verify_fill(s, 100, 0x33);
        }
    }

    #[test]
    fn realloc_shifts_backward_into_free_neighbor() {
        let mut m = heap(1 << 20);
        unsafe {
            let a = m.malloc(100).unwrap().as_ptr();
            let b = m.malloc(100).unwrap().as_ptr();
            let _blocker = m.malloc(16).unwrap();
            m.free(a);
            b.write_bytes(0x44, 100);

            // a's space is absorbed; the payload shifts down
            let s = m.realloc(b, 180).unwrap().as_ptr();
            assert_eq!(s, a);
            verify_fill(s, 100, 0x44);
        }
    }

    #[test]
    fn realloc_laws() {
        let mut m = heap(1 << 20);
        unsafe {
            // realloc(null, n) is an allocation
            let p = m.realloc(null_mut(), 100).unwrap().as_ptr();
            assert!(m.usable_size(p) >= 100);

            // realloc to the current usable size is the identity
            let same = m.realloc(p, m.usable_size(p)).unwrap().as_ptr();
            assert_eq!(same, p);

            // shrink splits in place
            let big = m.malloc(1000).unwrap().as_ptr();
            let shrunk = m.realloc(big, 100).unwrap().as_ptr();
            assert_eq!(shrunk, big);

            // realloc(p, 0) yields a minimum-size allocation by default
            #[cfg(not(feature = "realloc_zero_frees"))]
            {
                let tiny = m.realloc(shrunk, 0).unwrap().as_ptr();
                assert_eq!(m.usable_size(tiny), MIN_CHUNK_SIZE - WORD_SIZE);
                m.free(tiny);
            }
        }
    }

    #[test]
    fn usable_size_bounds() {
        let mut m = heap(1 << 20);
        unsafe {
            for n in [0, 1, 7, 8, 24, 40, 100, 1000, 4096, 100_000] {
                let p = m.malloc(n).unwrap().as_ptr();
                let usable = m.usable_size(p);
                assert!(usable >= n);
                assert_eq!(usable, pad_request(n) - WORD_SIZE);
                assert!(usable <= n.max(MIN_CHUNK_SIZE) + ALIGN + WORD_SIZE);
                m.free(p);
            }
            assert_eq!(m.usable_size(null_mut()), 0);

            // overflowing requests clamp to a minimum chunk
            let p = m.malloc(usize::MAX).unwrap().as_ptr();
            assert_eq!(m.usable_size(p), MIN_CHUNK_SIZE - WORD_SIZE);
            m.free(p);
        }
    }

    #[test]
    fn calloc_zeroes_recycled_memory() {
        let mut m = heap(1 << 20);
        unsafe {
            // dirty some memory and free it back
            let p = m.malloc(100).unwrap().as_ptr();
            p.write_bytes(0xff, 100);
            m.free(p);

            let z = m.calloc(10, 10).unwrap().as_ptr();
            verify_fill(z, 100, 0);
            m.free(z);

            assert_eq!(m.calloc(usize::MAX, 2), Err(AllocError));
        }
    }

    #[test]
    fn valloc_is_page_aligned() {
        let mut m = heap(1 << 20);
        unsafe {
            let p = m.valloc(100).unwrap().as_ptr();
            assert_eq!(p as usize % m.source.page_size(), 0);
            m.free(p);
        }
    }

    #[test]
    fn memalign_alignments() {
        let mut m = heap(2 << 20);
        unsafe {
            for shift in 4..16 {
                let align = 1usize << shift;
                let p = m.memalign(align, 100).unwrap().as_ptr();
                assert_eq!(p as usize % align, 0);
                p.write_bytes(0x77, 100);
                verify_fill(p, 100, 0x77);
                m.free(p);
            }
        }
    }

    #[test]
    fn memalign_then_trim_releases_pages() {
        let mut m = heap(1 << 20);
        unsafe {
            let p = m.memalign(4096, 100).unwrap().as_ptr();
            assert_eq!(p as usize % 4096, 0);
            m.free(p);

            let brk_before = m.source.brk();
            assert!(m.trim(0));
            assert!((m.source.brk() as usize) < brk_before as usize);
            // the break stays page-aligned, and top keeps only the slack
            assert_eq!(m.source.brk() as usize % 4096, 0);
            assert!(m.stats().top_releasable <= 4096 + MIN_CHUNK_SIZE);

            // nothing more to give back
            assert!(!m.trim(0));
        }
    }

    #[test]
    fn recycle_list_is_lifo_and_drainable() {
        let mut m = heap(1 << 20);
        unsafe {
            let a = m.malloc(40).unwrap().as_ptr();
            let b = m.malloc(40).unwrap().as_ptr();
            let _tail = m.malloc(40).unwrap();

            m.free(a);
            m.free(b);
            let stats = m.stats();
            assert_eq!(stats.recycle_chunks, 2);
            assert_eq!(stats.recycle_bytes, 2 * pad_request(40));

            // LIFO: the most recently freed comes back first
            let x = m.malloc(40).unwrap().as_ptr();
            assert_eq!(x, b);
            let y = m.malloc(40).unwrap().as_ptr();
            assert_eq!(y, a);

            // trim settles any recycled chunks back into the heap
            m.free(x);
            m.free(y);
            m.trim(0);
            assert_eq!(m.stats().recycle_chunks, 0);
        }
    }

    #[test]
    fn recycling_can_be_disabled() {
        let mut m = heap(1 << 20);
        m.set_tunable(Tunable::MaxRecycleSize, 0);
        unsafe {
            let a = m.malloc(40).unwrap().as_ptr();
            let _tail = m.malloc(40).unwrap();
            m.free(a);
            let stats = m.stats();
            assert_eq!(stats.recycle_chunks, 0);
            // it went to an ordinary bin instead
            assert!(stats.free_chunks >= 2);
        }
    }

    #[test]
    fn auto_trim_on_free() {
        let mut m = heap(1 << 20);
        m.set_tunable(Tunable::TrimThreshold, 8 * 1024);
        m.set_tunable(Tunable::TopPad, 0);
        unsafe {
            let p = m.malloc(64 * 1024).unwrap().as_ptr();
            let brk_grown = m.source.brk();
            m.free(p);
            // the merged top crossed the threshold and was trimmed
            assert!((m.source.brk() as usize) < brk_grown as usize);
        }
    }

    #[test]
    fn foreign_break_fencepost() {
        let mut m = heap(1 << 20);
        unsafe {
            let a = m.malloc(100).unwrap().as_ptr();
            a.write_bytes(0x66, 100);
            let brk1 = m.source.brk();

            // someone else moves the break behind our back
            m.source.foreign_extend(4096);

            // the next extension detects the gap and fences the old top
            let big = m.malloc(100_000).unwrap().as_ptr();
            assert!(big as usize >= brk1 as usize + 4096);
            big.write_bytes(0x99, 100_000);

            // the gap bytes are accounted as arena
            assert!(m.stats().arena >= 100_000 + 4096);

            // frees on either side of the gap stay on their side
            verify_fill(a, 100, 0x66);
            m.free(a);
            m.free(big);

            let again = m.malloc(100).unwrap().as_ptr();
            assert!(!again.is_null());
            m.free(again);
        }
    }

    #[test]
    fn refused_core_growth_fails_cleanly() {
        let mut m = heap(1 << 20);
        unsafe {
            // refusal before any arena exists
            m.source.deny_core = true;
            assert_eq!(m.malloc(100), Err(AllocError));

            m.source.deny_core = false;
            let a = m.malloc(100).unwrap().as_ptr();

            // refusal with an established arena: requests the top can't
            // hold fail, requests it can hold still succeed
            m.source.deny_core = true;
            assert_eq!(m.malloc(100_000), Err(AllocError));
            let b = m.malloc(100).unwrap().as_ptr();

            m.free(a);
            m.free(b);
        }
    }

    #[test]
    fn refused_page_mapping_falls_back_to_arena() {
        let mut m = heap(2 << 20);
        m.source.deny_maps = true;
        unsafe {
            let p = m.malloc(600_000).unwrap().as_ptr();
            assert_eq!(m.stats().mapped_regions, 0);
            assert!(m.source.maps.is_empty());
            assert!(m.stats().arena >= 600_000);
            m.free(p);
        }
    }

    #[test]
    fn exhaustion_is_clean() {
        let mut m = heap(64 * 1024);
        unsafe {
            let a = m.malloc(100).unwrap().as_ptr();

            // too big for the core, too small for the mapped path
            assert_eq!(m.malloc(300_000), Err(AllocError));

            // the failure left the allocator consistent
            let b = m.malloc(100).unwrap().as_ptr();
            m.free(a);
            m.free(b);
        }
    }

    #[test]
    fn stats_track_allocation() {
        let mut m = heap(1 << 20);
        unsafe {
            let _a = m.malloc(100).unwrap();
            let before = m.stats();

            let b = m.malloc(1000).unwrap().as_ptr();
            let nb = pad_request(1000);
            let mid = m.stats();
            assert!(mid.allocated >= before.allocated + nb);

            m.free(b);
            let after = m.stats();
            assert!(after.allocated + nb <= mid.allocated);
            assert_eq!(after.arena, mid.arena);
        }
    }

    #[test]
    fn zero_size_malloc() {
        let mut m = heap(1 << 20);
        unsafe {
            let p = m.malloc(0).unwrap().as_ptr();
            assert_eq!(m.usable_size(p), MIN_CHUNK_SIZE - WORD_SIZE);
            m.free(p);
        }
    }

    #[test]
    fn random_actions() {
        let mut m = heap(8 << 20);
        // exercise the mapped path too
        m.set_tunable(Tunable::MapThreshold, 100_000);

        let mut allocations: Vec<(*mut u8, usize, u8)> = Vec::new();
        fastrand::seed(0xba5eba11);

        for step in 0..10_000 {
            let action = if allocations.len() > 300 { 5 } else { fastrand::usize(..10) };

            match action {
                0..=4 => {
                    let mut size = fastrand::usize(1..2000);
                    if fastrand::usize(..64) == 0 {
                        size *= 100;
                    }
                    if let Ok(mem) = unsafe { m.malloc(size) } {
                        assert!(unsafe { m.usable_size(mem.as_ptr()) } >= size);
                        let fill = fastrand::u8(..);
                        unsafe { mem.as_ptr().write_bytes(fill, size) };
                        allocations.push((mem.as_ptr(), size, fill));
                    }
                }
                5..=6 => {
                    if !allocations.is_empty() {
                        let at = fastrand::usize(..allocations.len());
                        let (ptr, size, fill) = allocations.swap_remove(at);
                        unsafe {
                            verify_fill(ptr, size, fill);
                            m.free(ptr);
                        }
                    }
                }
                7..=8 => {
                    if !allocations.is_empty() {
                        let at = fastrand::usize(..allocations.len());
                        let (ptr, size, fill) = allocations[at];
                        let new_size = fastrand::usize(1..4000);
                        if let Ok(mem) = unsafe { m.realloc(ptr, new_size) } {
                            unsafe {
                                verify_fill(mem.as_ptr(), size.min(new_size), fill);
                                let new_fill = fastrand::u8(..);
                                mem.as_ptr().write_bytes(new_fill, new_size);
                                allocations[at] = (mem.as_ptr(), new_size, new_fill);
                            }
                        }
                    }
                }
                _ => {
                    let align = 1usize << fastrand::usize(4..13);
                    let size = fastrand::usize(1..500);
                    if let Ok(mem) = unsafe { m.memalign(align, size) } {
                        assert_eq!(mem.as_ptr() as usize % align, 0);
                        let fill = fastrand::u8(..);
                        unsafe { mem.as_ptr().write_bytes(fill, size) };
                        allocations.push((mem.as_ptr(), size, fill));
                    }
                }
            }

            if step % 2048 == 0 {
                m.trim(0);
            }
        }

        for (ptr, size, fill) in allocations.drain(..) {
            unsafe {
                verify_fill(ptr, size, fill);
                m.free(ptr);
            }
        }

        m.trim(0);
        assert!(m.source.maps.is_empty());
        assert_eq!(m.stats().recycle_chunks, 0);
    }
}
