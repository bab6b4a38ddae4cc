//! Canonical Huffman lookup tables
//!
//! Builds the two-level lookup arrays used by the VP8L entropy decoder. The
//! primary level is indexed by the low `HUFFMAN_TABLE_BITS` of the prefetched
//! bit window; codes longer than that chain into a second-level subtable.
//! All five tables of a tree group live in one contiguous block whose worst
//! case size is known up front, so building is a single bump-style fill.

use crate::bitreader::BitReader;

/// Width of the primary lookup level.
pub const HUFFMAN_TABLE_BITS: u32 = 8;
pub const HUFFMAN_TABLE_MASK: u32 = (1 << HUFFMAN_TABLE_BITS) - 1;

/// Width of the temporary table used for the code-length meta-code.
pub const LENGTHS_TABLE_BITS: u32 = 7;
pub const LENGTHS_TABLE_MASK: u32 = (1 << LENGTHS_TABLE_BITS) - 1;

/// No code may be longer than this.
pub const MAX_ALLOWED_CODE_LENGTH: usize = 15;

/// One lookup entry. For first-level hits `bits` is the code length and
/// `value` the symbol; for subtable pointers `bits` exceeds
/// `HUFFMAN_TABLE_BITS` and `value` is the relative offset of the subtable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HuffmanCode {
    pub bits: u8,
    pub value: u16,
}

/// The five Huffman trees used per meta code.
pub const GREEN: usize = 0;
pub const RED: usize = 1;
pub const BLUE: usize = 2;
pub const ALPHA: usize = 3;
pub const DIST: usize = 4;
pub const HUFFMAN_CODES_PER_META_CODE: usize = 5;

/// One tree group: offsets of its five tables inside the shared block, plus
/// the trivial-literal fast path data.
#[derive(Debug, Clone, Copy, Default)]
pub struct HTreeGroup {
    pub htrees: [usize; HUFFMAN_CODES_PER_META_CODE],
    pub is_trivial_literal: bool,
    /// Pre-packed `(alpha << 24) | (red << 16) | blue` when the red, blue and
    /// alpha trees each hold a single symbol.
    pub literal_arb: u32,
}

/// Worst-case block size per tree group, indexed by color-cache bits. The
/// red, blue, alpha and distance alphabets are fixed (worst cases 630 and
/// 410); the green alphabet grows with the cache.
pub const TABLE_SIZE: [usize; 12] = {
    const FIXED: usize = 630 * 3 + 410;
    [
        FIXED + 654,
        FIXED + 656,
        FIXED + 658,
        FIXED + 662,
        FIXED + 670,
        FIXED + 686,
        FIXED + 718,
        FIXED + 782,
        FIXED + 912,
        FIXED + 1168,
        FIXED + 1680,
        FIXED + 2704,
    ]
};

// Returns reverse(reverse(key, len) + 1, len).
fn next_key(key: u32, len: usize) -> u32 {
    let mut step = 1u32 << (len - 1);
    while key & step != 0 {
        step >>= 1;
    }
    if step == 0 {
        key
    } else {
        (key & (step - 1)) + step
    }
}

fn replicate_value(table: &mut [HuffmanCode], start: usize, step: usize, end: usize, code: HuffmanCode) {
    debug_assert!(end % step == 0);
    let mut i = end;
    loop {
        i -= step;
        table[start + i] = code;
        if i == 0 {
            break;
        }
    }
}

// Width of the next second-level table. `count` holds the histogram of the
// still-unassigned code lengths.
fn next_table_bit_size(count: &[usize; MAX_ALLOWED_CODE_LENGTH + 1], mut len: usize, root_bits: u32) -> usize {
    let mut left = 1i32 << (len as u32 - root_bits);
    while len < MAX_ALLOWED_CODE_LENGTH {
        left -= count[len] as i32;
        if left <= 0 {
            break;
        }
        len += 1;
        left <<= 1;
    }
    len - root_bits as usize
}

/// Build a canonical Huffman lookup table from per-symbol code lengths
/// (0 = symbol absent) into `table[offset..]`. Returns the number of entries
/// consumed, or 0 when the lengths do not describe a valid complete code
/// (over-subscribed, empty, or over-long) or the block cannot hold it.
pub fn build_huffman_table(
    table: &mut [HuffmanCode],
    offset: usize,
    root_bits: u32,
    code_lengths: &[u32],
) -> usize {
    debug_assert!(root_bits > 0);
    let root_size = 1usize << root_bits;

    let mut count = [0usize; MAX_ALLOWED_CODE_LENGTH + 1];
    for &l in code_lengths {
        if l as usize > MAX_ALLOWED_CODE_LENGTH {
            return 0;
        }
        count[l as usize] += 1;
    }
    if count[0] == code_lengths.len() {
        return 0; // no symbols at all
    }

    // Offsets into the sorted symbol array, per code length.
    let mut offsets = [0usize; MAX_ALLOWED_CODE_LENGTH + 1];
    for len in 1..MAX_ALLOWED_CODE_LENGTH {
        if count[len] > (1 << len) {
            return 0;
        }
        offsets[len + 1] = offsets[len] + count[len];
    }

    // Symbols sorted by (code length, symbol order).
    let num_symbols = code_lengths.len() - count[0];
    let mut sorted = vec![0u16; code_lengths.len()];
    {
        let mut cursor = offsets;
        for (symbol, &l) in code_lengths.iter().enumerate() {
            if l > 0 {
                sorted[cursor[l as usize]] = symbol as u16;
                cursor[l as usize] += 1;
            }
        }
    }

    if offset + root_size > table.len() {
        return 0;
    }

    // A single symbol decodes without consuming bits.
    if num_symbols == 1 {
        let code = HuffmanCode { bits: 0, value: sorted[0] };
        replicate_value(table, offset, 1, root_size, code);
        return root_size;
    }

    let mut total_size = root_size;
    let mut key = 0u32; // reversed prefix code
    let mut low = u32::MAX; // low bits of the last subtable key
    let mask = root_size as u32 - 1;
    let mut num_nodes = 1usize;
    let mut num_open = 1i32;
    let mut table_off = offset; // start of the table currently being filled
    let mut table_bits = root_bits as usize;
    let mut table_size = root_size;
    let mut symbol = 0usize;

    // Root table: codes no longer than root_bits.
    let mut step = 2usize;
    for len in 1..=root_bits as usize {
        num_open <<= 1;
        num_nodes += num_open as usize;
        num_open -= count[len] as i32;
        if num_open < 0 {
            return 0;
        }
        while count[len] > 0 {
            let code = HuffmanCode { bits: len as u8, value: sorted[symbol] };
            symbol += 1;
            replicate_value(table, table_off + key as usize, step, table_size, code);
            key = next_key(key, len);
            count[len] -= 1;
        }
        step <<= 1;
    }

    // Second-level tables, with pointer entries patched into the root.
    let mut step = 2usize;
    for len in (root_bits as usize + 1)..=MAX_ALLOWED_CODE_LENGTH {
        num_open <<= 1;
        num_nodes += num_open as usize;
        num_open -= count[len] as i32;
        if num_open < 0 {
            return 0;
        }
        while count[len] > 0 {
            if (key & mask) != low {
                table_off += table_size;
                table_bits = next_table_bit_size(&count, len, root_bits);
                table_size = 1 << table_bits;
                total_size += table_size;
                if table_off + table_size > table.len() {
                    return 0;
                }
                low = key & mask;
                table[offset + low as usize] = HuffmanCode {
                    bits: (table_bits + root_bits as usize) as u8,
                    value: (table_off - offset - low as usize) as u16,
                };
            }
            let code = HuffmanCode { bits: (len - root_bits as usize) as u8, value: sorted[symbol] };
            symbol += 1;
            replicate_value(table, table_off + (key >> root_bits) as usize, step, table_size, code);
            key = next_key(key, len);
            count[len] -= 1;
        }
        step <<= 1;
    }

    // Incomplete codes decode ambiguously; reject them.
    if num_nodes != 2 * num_symbols - 1 {
        return 0;
    }

    total_size
}

/// Decode one symbol. `fill_window` must have been called recently enough
/// that the whole code fits in the prefetched bits.
#[inline]
pub fn read_symbol(table: &[HuffmanCode], offset: usize, br: &mut BitReader) -> u32 {
    let mut idx = offset + (br.prefetch() & HUFFMAN_TABLE_MASK) as usize;
    let entry = table[idx];
    if entry.bits as u32 > HUFFMAN_TABLE_BITS {
        br.set_bit_pos(br.bit_pos() + HUFFMAN_TABLE_BITS);
        let nbits = entry.bits as u32 - HUFFMAN_TABLE_BITS;
        idx += entry.value as usize;
        idx += (br.prefetch() & ((1u32 << nbits) - 1)) as usize;
        let sub = table[idx];
        br.set_bit_pos(br.bit_pos() + sub.bits as u32);
        sub.value as u32
    } else {
        br.set_bit_pos(br.bit_pos() + entry.bits as u32);
        entry.value as u32
    }
}
