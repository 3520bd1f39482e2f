//! Size-class bookkeeping: the bin index schedule, the bin-block bitvector
//! helpers, and request padding.

use crate::{ALIGN_MASK, BINBLOCK_WIDTH, MIN_CHUNK_SIZE, WORD_SIZE};

/// Bins below this size hold exactly one size class each.
pub(crate) const MAX_SMALLBIN_SIZE: usize = 512;
pub(crate) const SMALLBIN_WIDTH: usize = 8;

/// Returns the bin index for a chunk of `size` bytes.
///
/// The bins are log-spaced:
///
/// ```text
/// 64 bins of size       8
/// 32 bins of size      64
/// 16 bins of size     512
///  8 bins of size    4096
///  4 bins of size   32768
///  2 bins of size  262144
///  1 bin  of size what's left
/// ```
///
/// There is a little bit of slop in the numbers here for the sake of speed
/// (on 64-bit targets every other small bin goes unused, and the boundaries
/// between the log-spaced runs are approximate). This makes no difference
/// elsewhere.
#[inline]
pub(crate) fn bin_index(size: usize) -> usize {
    match size >> 9 {
        0 => size >> 3,
        1..=4 => 56 + (size >> 6),
        5..=20 => 91 + (size >> 9),
        21..=84 => 110 + (size >> 12),
        85..=340 => 119 + (size >> 15),
        341..=1364 => 124 + (size >> 18),
        _ => 126,
    }
}

/// Bins for chunks below [`MAX_SMALLBIN_SIZE`] are spaced 8 bytes apart and
/// hold identically sized chunks, so no search is ever needed within one.
#[inline]
pub(crate) fn smallbin_index(size: usize) -> usize {
    size >> 3
}

/// A request is "small" if both its own bin and the next are small bins.
#[inline]
pub(crate) fn is_small_request(nb: usize) -> bool {
    nb < MAX_SMALLBIN_SIZE - SMALLBIN_WIDTH
}

/// The bit in the bin-block bitvector summarizing `idx`'s block of four bins.
#[inline]
pub(crate) fn binblock_bit(idx: usize) -> u32 {
    1 << (idx / BINBLOCK_WIDTH)
}

/// Pad a request up to a usable chunk size: room for the header, rounded up
/// to the alignment unit, never below the minimum chunk.
///
/// Requests so large they are negative as `isize` (which covers overflow of
/// the padding arithmetic) yield a minimum-size chunk. Legacy behavior.
#[inline]
pub(crate) fn pad_request(bytes: usize) -> usize {
    if (bytes as isize) < (MIN_CHUNK_SIZE - WORD_SIZE) as isize {
        MIN_CHUNK_SIZE
    } else {
        (bytes + WORD_SIZE + ALIGN_MASK) & !ALIGN_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ALIGN;

    #[test]
    fn small_bins_are_exact() {
        for size in (MIN_CHUNK_SIZE..MAX_SMALLBIN_SIZE).step_by(SMALLBIN_WIDTH) {
            let idx = bin_index(size);
            assert_eq!(idx, smallbin_index(size));
            // every size in a small bin shares the index
            assert_eq!(bin_index(size), bin_index(size + SMALLBIN_WIDTH - 1));
        }
    }

    #[test]
    fn schedule_is_monotonic_and_bounded() {
        let mut prev = 0;
        let mut size = MIN_CHUNK_SIZE;
        while size < (1 << 30) {
            let idx = bin_index(size);
            assert!(idx >= prev, "bin_index({}) = {} < {}", size, idx, prev);
            assert!(idx <= 126);
            prev = idx;
            size += size / 3 + SMALLBIN_WIDTH;
        }
        assert_eq!(bin_index(usize::MAX >> 1), 126);
    }

    #[test]
    fn schedule_breakpoints() {
        assert_eq!(bin_index(16), 2);
        assert_eq!(bin_index(504), 63);
        assert_eq!(bin_index(512), 64);
        assert_eq!(bin_index(2048), 88);
        assert_eq!(bin_index(1 << 18), 125);
        assert_eq!(bin_index(1 << 20), 126);

        assert!(is_small_request(503));
        assert!(!is_small_request(504));
    }

    #[test]
    fn binblock_bits() {
        assert_eq!(binblock_bit(0), 1);
        assert_eq!(binblock_bit(3), 1);
        assert_eq!(binblock_bit(4), 2);
        assert_eq!(binblock_bit(127), 1 << 31);
    }

    #[test]
    fn request_padding() {
        assert_eq!(pad_request(0), MIN_CHUNK_SIZE);
        assert_eq!(pad_request(1), MIN_CHUNK_SIZE);
        assert_eq!(pad_request(MIN_CHUNK_SIZE), (MIN_CHUNK_SIZE + WORD_SIZE + ALIGN - 1) & !(ALIGN - 1));
        // padded sizes are aligned and cover the request plus header
        for bytes in [24, 40, 100, 1000, 123456] {
            let nb = pad_request(bytes);
            assert_eq!(nb & (ALIGN - 1), 0);
            assert!(nb >= bytes + WORD_SIZE);
        }
        // absurd requests clamp to the minimum chunk
        assert_eq!(pad_request(usize::MAX), MIN_CHUNK_SIZE);
        assert_eq!(pad_request(isize::MAX as usize + 1), MIN_CHUNK_SIZE);
    }
}
