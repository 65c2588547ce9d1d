//! Bit vector primitives over raw byte buffers.
//!
//! Bit `n` lives in byte `n / 8` at position `n % 8` (least significant bit
//! first), independent of host endianness. Search functions return the
//! caller's `size` when nothing is found. Only bits the buffer holds are
//! ever reported or counted, even when `size` reaches past its end. Offsets
//! past `size` are the caller's bug; the functions stay memory-safe and
//! simply report "not found".

/// Set bit `nr`, returning its previous value.
pub fn set_bit(bitmap: &mut [u8], nr: usize) -> bool {
    let (byte, mask) = (nr / 8, 1_u8 << (nr % 8));
    let Some(slot) = bitmap.get_mut(byte) else {
        return false;
    };
    let old = *slot & mask != 0;
    *slot |= mask;
    old
}

/// Clear bit `nr`, returning its previous value.
pub fn clear_bit(bitmap: &mut [u8], nr: usize) -> bool {
    let (byte, mask) = (nr / 8, 1_u8 << (nr % 8));
    let Some(slot) = bitmap.get_mut(byte) else {
        return false;
    };
    let old = *slot & mask != 0;
    *slot &= !mask;
    old
}

#[must_use]
pub fn test_bit(bitmap: &[u8], nr: usize) -> bool {
    bitmap
        .get(nr / 8)
        .is_some_and(|byte| byte & (1_u8 << (nr % 8)) != 0)
}

/// First set bit in `0..size`, or `size`.
#[must_use]
pub fn find_first_set(bitmap: &[u8], size: usize) -> usize {
    find_next_set(bitmap, size, 0)
}

/// First set bit in `offset..size`, or `size`.
#[must_use]
pub fn find_next_set(bitmap: &[u8], size: usize, offset: usize) -> usize {
    find_next(bitmap, size, offset, 0x00)
}

/// First clear bit in `0..size`, or `size`.
#[must_use]
pub fn find_first_clear(bitmap: &[u8], size: usize) -> usize {
    find_next_clear(bitmap, size, 0)
}

/// First clear bit in `offset..size`, or `size`.
#[must_use]
pub fn find_next_clear(bitmap: &[u8], size: usize, offset: usize) -> usize {
    find_next(bitmap, size, offset, 0xFF)
}

/// Scan for the first bit that differs from `skip` (a byte made entirely of
/// the bit value being skipped), stepping whole bytes where possible.
fn find_next(bitmap: &[u8], size: usize, offset: usize, skip: u8) -> usize {
    let limit = size.min(bitmap.len() * 8);
    let mut nr = offset;
    while nr < limit {
        let byte = bitmap[nr / 8] ^ skip;
        let shift = nr % 8;
        let pending = byte >> shift;
        if pending != 0 {
            let found = nr + pending.trailing_zeros() as usize;
            return if found < limit { found } else { size };
        }
        nr += 8 - shift;
    }
    size
}

/// First run of at least `len` clear bits in `0..size`, first-fit. Runs
/// end at the buffer's last bit.
#[must_use]
pub fn find_clear_run(bitmap: &[u8], size: usize, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let size = size.min(bitmap.len() * 8);
    let mut start = 0;
    loop {
        let run_start = find_next_clear(bitmap, size, start);
        if run_start >= size {
            return None;
        }
        let run_end = find_next_set(bitmap, size, run_start);
        if run_end - run_start >= len {
            return Some(run_start);
        }
        start = run_end;
    }
}

/// Number of set bits in `0..size` that the buffer holds.
#[must_use]
pub fn count_set(bitmap: &[u8], size: usize) -> usize {
    let size = size.min(bitmap.len() * 8);
    let full = size / 8;
    let mut total: usize = bitmap[..full].iter().map(|b| b.count_ones() as usize).sum();
    let rem = size % 8;
    if rem > 0 {
        let mask = (1_u8 << rem) - 1;
        total += (bitmap[full] & mask).count_ones() as usize;
    }
    total
}
