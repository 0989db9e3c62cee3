/// Extract `bit_width` bits starting at `bit_offset`, most significant bit first, spanning byte
/// boundaries as needed. The result is right aligned.
///
/// Returns `None` if `bit_width` is 0 or larger than 64, or if the range extends past the end of
/// `buf`.
///
/// # Example
/// ```
/// use spackit::decode::extract_bits;
///
/// // 1010_0101 0011_1100
/// let buf = [0xa5, 0x3c];
/// assert_eq!(extract_bits(&buf, 0, 3), Some(0b101));
/// assert_eq!(extract_bits(&buf, 3, 13), Some(0x053c));
/// assert_eq!(extract_bits(&buf, 8, 13), None);
/// ```
#[must_use]
pub fn extract_bits(buf: &[u8], bit_offset: usize, bit_width: usize) -> Option<u64> {
    if bit_width == 0 || bit_width > 64 {
        return None;
    }
    let end = bit_offset.checked_add(bit_width)?;
    if end > buf.len() * 8 {
        return None;
    }

    let first = bit_offset / 8;
    let last = (end - 1) / 8;
    // at most 9 bytes are touched by a 64 bit value, which fits in 72 bits
    let mut acc: u128 = 0;
    for b in &buf[first..=last] {
        acc = acc << 8 | u128::from(*b);
    }
    let spanned = (last - first + 1) * 8;
    let shift = spanned - (bit_offset % 8) - bit_width;
    let mask: u128 = (1u128 << bit_width) - 1;
    // masked to at most 64 bits
    Some(((acc >> shift) & mask) as u64)
}

/// Extract `bit_width / 8` bytes starting at any bit offset.
///
/// Returns `None` under the same conditions as [`extract_bits`] or if the width is not a whole
/// number of bytes.
#[must_use]
pub fn extract_bytes(buf: &[u8], bit_offset: usize, bit_width: usize) -> Option<Vec<u8>> {
    if bit_width == 0 || bit_width % 8 != 0 {
        return None;
    }
    let end = bit_offset.checked_add(bit_width)?;
    if end > buf.len() * 8 {
        return None;
    }
    if bit_offset % 8 == 0 {
        return Some(buf[bit_offset / 8..end / 8].to_vec());
    }
    (0..bit_width / 8)
        .map(|i| extract_bits(buf, bit_offset + i * 8, 8).map(|v| v as u8))
        .collect()
}

/// Sign extend the low `bit_width` bits of `raw`.
#[must_use]
pub fn sign_extend(raw: u64, bit_width: usize) -> i64 {
    debug_assert!(bit_width > 0 && bit_width <= 64);
    let shift = 64 - bit_width as u32;
    ((raw << shift) as i64) >> shift
}

/// Reverse the byte order of the low `bit_width` bits of `raw`. `bit_width` must be a whole
/// number of bytes.
#[must_use]
pub fn swap_bytes(raw: u64, bit_width: usize) -> u64 {
    debug_assert!(bit_width > 0 && bit_width <= 64 && bit_width % 8 == 0);
    raw.swap_bytes() >> (64 - bit_width as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 8, 0xa5; "first byte")]
    #[test_case(8, 8, 0x3c; "second byte")]
    #[test_case(4, 8, 0x53; "straddle")]
    #[test_case(0, 16, 0xa53c; "both")]
    #[test_case(0, 1, 1; "msb")]
    #[test_case(15, 1, 0; "lsb")]
    #[test_case(5, 3, 0b101; "tail of first byte")]
    fn bits(offset: usize, width: usize, expected: u64) {
        assert_eq!(extract_bits(&[0xa5, 0x3c], offset, width), Some(expected));
    }

    #[test]
    fn full_width_unaligned() {
        #[rustfmt::skip]
        let buf = [0x0f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xf0];
        assert_eq!(extract_bits(&buf, 4, 64), Some(u64::MAX));
        assert_eq!(extract_bits(&buf, 0, 64), Some(0x0fff_ffff_ffff_ffff));
    }

    #[test]
    fn out_of_range() {
        let buf = [0xff, 0xff];
        assert_eq!(extract_bits(&buf, 9, 8), None);
        assert_eq!(extract_bits(&buf, 0, 0), None);
        assert_eq!(extract_bits(&buf, 0, 65), None);
        assert_eq!(extract_bits(&buf, usize::MAX, 2), None);
        assert_eq!(extract_bits(&[], 0, 1), None);
    }

    #[test]
    fn bytes_unaligned() {
        let buf = [0x12, 0x34, 0x56];
        assert_eq!(extract_bytes(&buf, 0, 16), Some(vec![0x12, 0x34]));
        assert_eq!(extract_bytes(&buf, 4, 16), Some(vec![0x23, 0x45]));
        assert_eq!(extract_bytes(&buf, 12, 16), None);
        assert_eq!(extract_bytes(&buf, 0, 12), None);
    }

    #[test_case(0b111, 3, -1; "all ones")]
    #[test_case(0b011, 3, 3; "positive")]
    #[test_case(0b100, 3, -4; "most negative")]
    #[test_case(0x8000, 16, -32768; "i16 min")]
    #[test_case(u64::MAX, 64, -1; "full width")]
    fn sign(raw: u64, width: usize, expected: i64) {
        assert_eq!(sign_extend(raw, width), expected);
    }

    #[test_case(0x12, 8, 0x12; "single byte")]
    #[test_case(0x1234, 16, 0x3412; "two bytes")]
    #[test_case(0x12_3456, 24, 0x56_3412; "three bytes")]
    #[test_case(0x0102_0304_0506_0708, 64, 0x0807_0605_0403_0201; "full width")]
    fn swap(raw: u64, width: usize, expected: u64) {
        assert_eq!(swap_bytes(raw, width), expected);
    }
}
