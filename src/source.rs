//! Where the allocator's memory comes from.
//!
//! The allocator is written against two OS-shaped contracts: a *core* that
//! can be contiguously extended (and shrunk) at its high end, `sbrk`-style,
//! and an optional facility for mapping and unmapping isolated page regions.
//! [`MemorySource`] captures both; the allocator only ever talks to its
//! source through this trait.

use core::ptr::NonNull;

use crate::Span;

/// Supplies core memory and page mappings to a [`Marl`](crate::Marl).
///
/// # Safety-relevant contracts
/// - `extend_core(delta)` moves the core's break by `delta` bytes and
///   returns the *previous* break, or `None` on failure. `extend_core(0)`
///   queries the current break without moving it. Memory between the base
///   and the break must remain valid for reads and writes while the
///   allocator is in use. The source may refuse any call. Other parties may
///   also move the break between calls; the allocator detects and tolerates
///   foreign growth.
/// - `page_size` must be a constant power of two for the source's lifetime.
/// - `map_pages(size)` returns a page-aligned region of `size` bytes
///   (`size` is always a page multiple) disjoint from the core and from all
///   live mappings, or `None`.
/// - `unmap_pages` is called exactly once per successful `map_pages`, with
///   the same base and size.
pub trait MemorySource {
    /// Move the break by `delta` bytes, returning the previous break.
    fn extend_core(&mut self, delta: isize) -> Option<NonNull<u8>>;

    /// The granularity the core grows and shrinks by. A power of two.
    fn page_size(&self) -> usize;

    /// Map an isolated region of `size` bytes. `size` is a page multiple.
    ///
    /// The default declines, routing every request through the core.
    fn map_pages(&mut self, size: usize) -> Option<NonNull<u8>> {
        let _ = size;
        None
    }

    /// Release a region obtained from [`map_pages`](MemorySource::map_pages).
    ///
    /// # Safety
    /// `base` and `size` must identify a live mapping from this source.
    unsafe fn unmap_pages(&mut self, base: *mut u8, size: usize) {
        let _ = (base, size);
        unreachable!("unmap_pages without a map_pages implementation");
    }
}

/// A [`MemorySource`] that carves its core out of a fixed region of memory.
///
/// No page mapping: large requests stay in the arena. Suitable for embedded
/// targets and tests.
#[derive(Debug)]
pub struct BufferSource {
    region: Span,
    brk: *mut u8,
}

unsafe impl Send for BufferSource {}

impl BufferSource {
    /// Use `size` bytes at `base` as the core. The region is aligned
    /// inward; any unaligned edge bytes go unused.
    ///
    /// # Safety
    /// The region must be valid for reads and writes for the source's
    /// lifetime and not used by anything else, and must not wrap the
    /// address space.
    pub unsafe fn new(base: *mut u8, size: usize) -> Self {
        let region = Span::from_base_size(base, size).align_inward();
        let brk = region.get_base_acme().map_or(base, |(base, _)| base);
        Self { region, brk }
    }
}

impl MemorySource for BufferSource {
    fn extend_core(&mut self, delta: isize) -> Option<NonNull<u8>> {
        let old = self.brk;
        let new = (old as isize).checked_add(delta)? as *mut u8;

        // the break may come to rest anywhere in the region, acme included
        let (_, acme) = self.region.get_base_acme()?;
        if !self.region.contains(new) && new != acme {
            return None;
        }

        self.brk = new;
        NonNull::new(old)
    }

    fn page_size(&self) -> usize {
        4096
    }
}

/// The process data segment as a [`MemorySource`]: `sbrk` for the core,
/// anonymous `mmap` for page mappings.
///
/// There is one data segment per process; create one of these and keep it.
#[cfg(all(feature = "libc", unix))]
#[derive(Debug)]
pub struct SbrkSource;

#[cfg(all(feature = "libc", unix))]
impl MemorySource for SbrkSource {
    fn extend_core(&mut self, delta: isize) -> Option<NonNull<u8>> {
        let brk = unsafe { libc::sbrk(delta as _) };

        if brk == usize::MAX as *mut libc::c_void {
            None
        } else {
            NonNull::new(brk.cast())
        }
    }

    fn page_size(&self) -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn map_pages(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return None;
        }

        NonNull::new(ptr.cast())
    }

    unsafe fn unmap_pages(&mut self, base: *mut u8, size: usize) {
        let result = libc::munmap(base.cast(), size);

        // an assert here could recursively allocate; abort instead
        #[cfg(debug_assertions)]
        if result != 0 {
            libc::abort();
        }
        #[cfg(not(debug_assertions))]
        let _ = result;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_source_brk_protocol() {
        let layout = std::alloc::Layout::from_size_align(0x4000, crate::ALIGN).unwrap();
        let base = unsafe { std::alloc::alloc(layout) };
        assert!(!base.is_null());
        let mut source = unsafe { BufferSource::new(base, 0x4000) };

        // zero-delta queries the break without moving it
        assert_eq!(source.extend_core(0).unwrap().as_ptr(), base);

        // growth returns the old break
        assert_eq!(source.extend_core(0x1000).unwrap().as_ptr(), base);
        assert_eq!(source.extend_core(0).unwrap().as_ptr(), unsafe { base.add(0x1000) });

        // shrink moves it back down
        assert!(source.extend_core(-0x800).is_some());
        assert_eq!(source.extend_core(0).unwrap().as_ptr(), unsafe { base.add(0x800) });

        // out-of-bounds requests fail without moving the break
        assert!(source.extend_core(0x4000).is_none());
        assert!(source.extend_core(-0x1000).is_none());
        assert_eq!(source.extend_core(0).unwrap().as_ptr(), unsafe { base.add(0x800) });

        // no page mapping on a buffer
        assert!(source.map_pages(0x1000).is_none());

        // unaligned regions are trimmed to alignment
        let mut skewed = unsafe { BufferSource::new(base.add(1), 0x100) };
        let brk = skewed.extend_core(0).unwrap().as_ptr();
        assert_eq!(brk as usize % crate::ALIGN, 0);
        assert!(skewed.extend_core(0x100).is_none());
        assert!(skewed.extend_core(0x100 - crate::ALIGN as isize).is_some());
    }
}
