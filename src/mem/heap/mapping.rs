//! Mapping of block sizes to their free list.
//!
//! Sizes below [`SMALL_BLOCK_SIZE`] all share first level `0` and are split
//! linearly into [`SL_INDEX_COUNT`] lists. Every other size gets the first
//! level of its highest set bit, and the next [`SL_INDEX_COUNT_LOG2`] bits
//! below that select the second level.

/// Block sizes and addresses are multiples of `1 << ALIGN_SHIFT`.
pub const ALIGN_SHIFT: usize = 4;

/// The alignment of every block and every returned pointer.
pub const BLOCK_ALIGN: usize = 1 << ALIGN_SHIFT;

/// Log2 of the number of second level lists per first level.
pub const SL_INDEX_COUNT_LOG2: usize = 4;

/// The number of second level lists per first level.
pub const SL_INDEX_COUNT: usize = 1 << SL_INDEX_COUNT_LOG2;

const FL_INDEX_SHIFT: usize = SL_INDEX_COUNT_LOG2 + ALIGN_SHIFT;

/// Sizes below this are all mapped to first level `0`.
pub const SMALL_BLOCK_SIZE: usize = 1 << FL_INDEX_SHIFT;

/// The highest bit a block size may have set.
pub const FL_INDEX_MAX: usize = 32;

/// The number of first level lists.
pub const FL_INDEX_COUNT: usize = FL_INDEX_MAX - FL_INDEX_SHIFT + 2;

/// The largest size a single block may have.
pub const MAX_BLOCK_SIZE: usize = 1 << FL_INDEX_MAX;

/// The total number of free lists.
pub const LIST_COUNT: usize = FL_INDEX_COUNT * SL_INDEX_COUNT;

const _: () = assert!(SL_INDEX_COUNT <= u32::BITS as usize);
const _: () = assert!(FL_INDEX_COUNT <= u32::BITS as usize);

/// Index of the highest set bit of `size`.
fn msb(size: usize) -> usize {
    debug_assert_ne!(size, 0);
    (usize::BITS - 1 - size.leading_zeros()) as usize
}

/// Return the `(fl, sl)` list a block with the given size belongs to.
pub fn mapping_insert(size: usize) -> (usize, usize) {
    if size < SMALL_BLOCK_SIZE {
        (0, size / (SMALL_BLOCK_SIZE / SL_INDEX_COUNT))
    } else {
        let fl = msb(size);
        // the xor removes the highest set bit, leaving the second level
        let sl = (size >> (fl - SL_INDEX_COUNT_LOG2)) ^ SL_INDEX_COUNT;
        (fl - FL_INDEX_SHIFT + 1, sl)
    }
}

/// Round `size` up to the next list boundary, so every block inside the
/// list of the result is at least `size` bytes large.
pub fn round_up(size: usize) -> usize {
    if size < SMALL_BLOCK_SIZE {
        // small lists are exactly one alignment step wide
        return (size + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1);
    }

    let round = (1 << (msb(size) - SL_INDEX_COUNT_LOG2)) - 1;
    (size + round) & !round
}

/// Return the first `(fl, sl)` list whose blocks are all large enough for `size`.
pub fn mapping_search(size: usize) -> (usize, usize) {
    mapping_insert(round_up(size))
}

/// Return the index of the list for `(fl, sl)` inside a flat array.
pub fn list_index(fl: usize, sl: usize) -> usize {
    fl * SL_INDEX_COUNT + sl
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_sizes_are_linear() {
        assert_eq!(mapping_insert(32), (0, 2));
        assert_eq!(mapping_insert(80), (0, 5));
        assert_eq!(mapping_insert(240), (0, 15));
        assert_eq!(round_up(80), 80);
    }

    #[test]
    fn large_sizes_are_exponential() {
        assert_eq!(mapping_insert(256), (1, 0));
        assert_eq!(mapping_insert(304), (1, 3));
        assert_eq!(mapping_insert(511), (1, 15));
        assert_eq!(mapping_insert(512), (2, 0));
        assert_eq!(mapping_insert(16 * 1024), (7, 0));
        assert_eq!(mapping_insert(MAX_BLOCK_SIZE), (FL_INDEX_COUNT - 1, 0));
        assert_eq!(
            mapping_insert(MAX_BLOCK_SIZE * 2 - 1),
            (FL_INDEX_COUNT - 1, SL_INDEX_COUNT - 1)
        );
    }

    #[test]
    fn search_rounds_to_list_boundary() {
        assert_eq!(round_up(300), 304);
        assert_eq!(mapping_search(300), (1, 3));
        assert_eq!(round_up(304), 304);
        assert_eq!(round_up(511), 512);
        assert_eq!(mapping_search(511), (2, 0));
        assert_eq!(round_up(4097), 4352);
        assert_eq!(round_up(MAX_BLOCK_SIZE), MAX_BLOCK_SIZE);
    }

    #[test]
    fn unaligned_small_sizes_round_to_next_list() {
        assert_eq!(round_up(40), 48);
        assert_eq!(mapping_search(40), (0, 3));
        assert_eq!(round_up(1), BLOCK_ALIGN);
        assert_eq!(round_up(250), SMALL_BLOCK_SIZE);
        assert_eq!(mapping_search(250), (1, 0));

        for size in 1..2 * SMALL_BLOCK_SIZE {
            let (fl, sl) = mapping_search(size);
            // the smallest block that is stored in the found list
            let smallest = (BLOCK_ALIGN..=2 * SMALL_BLOCK_SIZE)
                .step_by(BLOCK_ALIGN)
                .find(|&block| mapping_insert(block) == (fl, sl))
                .unwrap();
            assert!(smallest >= size, "list for {} holds {} byte blocks", size, smallest);
        }
    }

    #[test]
    fn rounded_sizes_start_their_list() {
        for size in (BLOCK_ALIGN..64 * 1024).step_by(BLOCK_ALIGN) {
            let rounded = round_up(size);
            assert!(rounded >= size);
            // the rounded size is the smallest size inside its list
            if rounded > SMALL_BLOCK_SIZE {
                assert_ne!(mapping_insert(rounded - BLOCK_ALIGN), mapping_insert(rounded));
            }
            assert_eq!(mapping_insert(rounded), mapping_search(size));
        }
    }
}
