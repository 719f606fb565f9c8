use crate::result::*;

/// A checked cast from u64 to usize
///
/// Offsets and lengths in every format we read are at most 32 bits wide,
/// but we carry them around as u64 so sums can't overflow.
/// Slicing still needs a usize.
pub fn usize<I: Into<u64>>(i: I) -> PakResult<usize> {
    let i: u64 = i.into();
    if cfg!(target_pointer_width = "64") {
        Ok(i as usize)
    } else if i > usize::MAX as u64 {
        Err(PakError::InsufficientAddressSpace)
    } else {
        Ok(i as usize)
    }
}

/// Adds an offset and a length, failing instead of wrapping.
pub fn end_of(offset: u64, length: u64) -> PakResult<u64> {
    offset
        .checked_add(length)
        .ok_or(PakError::InsufficientAddressSpace)
}
