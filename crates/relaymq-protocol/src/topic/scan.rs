//! Byte-scanning primitives used by the topic matcher.
//!
//! Each function has a word-at-a-time fast path for long inputs and a
//! plain byte loop for the tail. The word paths load little-endian so the
//! lowest set bit of a mask always belongs to the earliest byte.

const LO: u64 = 0x0101_0101_0101_0101;
const HI: u64 = 0x8080_8080_8080_8080;

#[inline]
fn load_u128(bytes: &[u8]) -> u128 {
    let mut word = [0u8; 16];
    word.copy_from_slice(&bytes[..16]);
    u128::from_le_bytes(word)
}

#[inline]
fn load_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(word)
}

/// High bit set in every byte of `x` that is zero. Bytes above the first
/// zero may be flagged spuriously, the lowest flag is always exact.
#[inline]
fn zero_bytes(x: u64) -> u64 {
    x.wrapping_sub(LO) & !x & HI
}

#[inline]
fn splat(byte: u8) -> u64 {
    LO * u64::from(byte)
}

/// Length of the longest common prefix of `a` and `b`.
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    let len = a.len().min(b.len());
    let mut i = 0;
    while i + 16 <= len {
        let diff = load_u128(&a[i..]) ^ load_u128(&b[i..]);
        if diff != 0 {
            return i + (diff.trailing_zeros() / 8) as usize;
        }
        i += 16;
    }
    i + common_prefix_len_scalar(&a[i..len], &b[i..len])
}

/// Position of the first `needle` in `haystack`.
pub fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    let pattern = splat(needle);
    let mut i = 0;
    while i + 8 <= haystack.len() {
        let mask = zero_bytes(load_u64(&haystack[i..]) ^ pattern);
        if mask != 0 {
            return Some(i + (mask.trailing_zeros() / 8) as usize);
        }
        i += 8;
    }
    find_byte_scalar(&haystack[i..], needle).map(|pos| i + pos)
}

/// Position of the first `+` or `#` in `filter`.
pub fn find_wildcard(filter: &[u8]) -> Option<usize> {
    let plus = splat(b'+');
    let hash = splat(b'#');
    let mut i = 0;
    while i + 8 <= filter.len() {
        let word = load_u64(&filter[i..]);
        let mask = zero_bytes(word ^ plus) | zero_bytes(word ^ hash);
        if mask != 0 {
            return Some(i + (mask.trailing_zeros() / 8) as usize);
        }
        i += 8;
    }
    find_wildcard_scalar(&filter[i..]).map(|pos| i + pos)
}

pub fn common_prefix_len_scalar(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

pub fn find_byte_scalar(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

pub fn find_wildcard_scalar(filter: &[u8]) -> Option<usize> {
    filter.iter().position(|&b| b == b'+' || b == b'#')
}

#[cfg(test)]
mod tests {
    use super::*;

    const LENGTHS: [usize; 12] = [0, 1, 7, 8, 9, 15, 16, 17, 31, 32, 33, 64];

    fn filled(len: usize) -> Vec<u8> {
        (0..len).map(|i| b'a' + (i % 26) as u8).collect()
    }

    #[test]
    fn test_common_prefix_len_matches_scalar_at_every_position() {
        for len in LENGTHS.into_iter().chain([63, 65]) {
            let a = filled(len);
            assert_eq!(common_prefix_len(&a, &a), len);
            for pos in 0..len {
                let mut b = a.clone();
                b[pos] = b'/';
                assert_eq!(
                    common_prefix_len(&a, &b),
                    common_prefix_len_scalar(&a, &b),
                    "len {len}, diff at {pos}"
                );
                assert_eq!(common_prefix_len(&a, &b), pos);
            }
        }
    }

    #[test]
    fn test_common_prefix_len_unequal_lengths() {
        let a = filled(40);
        assert_eq!(common_prefix_len(&a, &a[..17]), 17);
        assert_eq!(common_prefix_len(&a[..33], &a), 33);
        assert_eq!(common_prefix_len(&[], &a), 0);
    }

    #[test]
    fn test_find_byte_matches_scalar_at_every_position() {
        for len in LENGTHS.into_iter().chain([63, 65]) {
            let base = filled(len);
            assert_eq!(find_byte(&base, b'/'), None);
            for pos in 0..len {
                let mut hay = base.clone();
                hay[pos] = b'/';
                // A second hit later must not win.
                if pos + 3 < len {
                    hay[pos + 3] = b'/';
                }
                assert_eq!(find_byte(&hay, b'/'), find_byte_scalar(&hay, b'/'), "len {len}");
                assert_eq!(find_byte(&hay, b'/'), Some(pos));
            }
        }
    }

    #[test]
    fn test_find_byte_high_bytes_do_not_false_match() {
        let hay = [0x80u8, 0xAF, 0x2E, 0x30, 0xFF, 0x01, 0x2F, 0x00, 0x2F];
        assert_eq!(find_byte(&hay, b'/'), Some(6));
        assert_eq!(find_byte(&hay, 0x00), Some(7));
    }

    #[test]
    fn test_find_wildcard_matches_scalar() {
        for len in LENGTHS.into_iter().chain([63, 65]) {
            let base = filled(len);
            assert_eq!(find_wildcard(&base), None);
            for pos in 0..len {
                for wildcard in [b'+', b'#'] {
                    let mut filter = base.clone();
                    filter[pos] = wildcard;
                    assert_eq!(find_wildcard(&filter), find_wildcard_scalar(&filter));
                    assert_eq!(find_wildcard(&filter), Some(pos));
                }
            }
        }
    }

    #[test]
    fn test_find_wildcard_reports_earliest_of_mixed() {
        let filter = b"sensors/room1/+/temp/#";
        assert_eq!(find_wildcard(filter), Some(14));
        assert_eq!(find_wildcard(&filter[15..]), Some(6));
    }
}
