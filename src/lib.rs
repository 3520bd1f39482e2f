//! # Marl
//!
//! A general-purpose heap allocator built around boundary-tagged chunks and
//! 128 size-binned free lists, in the classic best-fit / address-ordered /
//! quick-list hybrid style.
//!
//! ### Allocator design
//! * **boundary tags**: every chunk carries its size in a header word, and
//!   free chunks duplicate it in a footer, so physical neighbors can always
//!   be found and coalesced in O(1).
//! * **binned free lists** + **block bitvector**: free chunks live in
//!   circular doubly linked lists bucketed by size; a one-word bitvector
//!   summarizes groups of four bins so searches skip empty regions.
//! * **recycle list**: small freed chunks are deferred on a LIFO and handed
//!   straight back for exact refits, bypassing coalescing entirely.
//! * **growable top**: the chunk at the arena's high end grows and shrinks
//!   against a `sbrk`-style core, and oversized requests are routed to
//!   isolated page mappings instead.
//!
//! ### Usage
//!
//! Construct a [`Marl`] over a [`MemorySource`] and allocate away:
//!
//! ```rust
//! use marl::{Marl, BufferSource};
//!
//! static mut ARENA: [u8; 0x10000] = [0; 0x10000];
//!
//! let mut marl =
//!     Marl::new(unsafe { BufferSource::new(core::ptr::addr_of_mut!(ARENA).cast(), 0x10000) });
//!
//! unsafe {
//!     let mem = marl.malloc(1234).unwrap();
//!     marl.free(mem.as_ptr());
//! }
//! ```
//!
//! Call [`lock`](Marl::lock) on it to get a [`Marlck`] which supports the
//! [`GlobalAlloc`](core::alloc::GlobalAlloc) trait (feature `lock_api`,
//! default on).
//!
//! The allocator core is single-threaded; `Marlck` is the serialization
//! layer. `no_std` except under test.

#![cfg_attr(not(test), no_std)]

mod bins;
mod chunk;
mod heap;
mod llist;
#[cfg(feature = "lock_api")]
mod lock;
mod source;
mod span;
mod stats;

#[cfg(test)]
pub(crate) mod test_utils;

pub use heap::{Marl, Tunable};
#[cfg(feature = "lock_api")]
pub use lock::{AssumeUnlockable, Marlck};
#[cfg(all(feature = "libc", unix))]
pub use source::SbrkSource;
pub use source::{BufferSource, MemorySource};
pub use span::Span;
pub use stats::HeapStats;

pub(crate) const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Alignment of every user pointer this allocator returns: twice the word size.
pub const ALIGN: usize = 2 * WORD_SIZE;
pub(crate) const ALIGN_MASK: usize = ALIGN - 1;

/// The smallest chunk: header word, two link words, footer word.
pub const MIN_CHUNK_SIZE: usize = 4 * WORD_SIZE;

pub(crate) const BIN_COUNT: usize = 128;
pub(crate) const BINBLOCK_WIDTH: usize = 4;

pub(crate) const DEFAULT_RECYCLE_SIZE: usize = 72;
pub(crate) const DEFAULT_TRIM_THRESHOLD: usize = 256 * 1024;
pub(crate) const DEFAULT_TOP_PAD: usize = 2 * 1024;
pub(crate) const DEFAULT_MAP_THRESHOLD: usize = 512 * 1024;
pub(crate) const DEFAULT_MAP_MAX: usize = 16;

/// The allocator failed to satisfy a request.
///
/// Either the core refused to grow, or a tunable forbade the only viable
/// strategy. A failed operation leaves the allocator's state untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl core::fmt::Display for AllocError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("memory allocation failed")
    }
}
