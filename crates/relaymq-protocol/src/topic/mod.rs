//! Topic names, topic filters and wildcard matching.
//!
//! Topics are handled as raw bytes, exactly as they arrived on the wire.
//! Matching is byte-exact and case-sensitive; `/` separates levels and a
//! leading `/` makes an empty first level.
//!
//! Wildcards:
//!
//! - `+` matches exactly one level, including an empty one.
//! - `#` as the last level matches the remainder, including nothing at
//!   all: `a/#` matches `a`, `a/` and `a/b/c`.
//!
//! Topics starting with `$` (broker-internal topics such as `$SYS/...`)
//! are not matched by filters starting with a wildcard.

mod scan;

pub use scan::{
    common_prefix_len, common_prefix_len_scalar, find_byte, find_byte_scalar, find_wildcard,
    find_wildcard_scalar,
};

const SHARED_PREFIX: &[u8] = b"$share/";

/// Checks a filter from SUBSCRIBE or UNSUBSCRIBE.
///
/// Invalid when empty, when it contains U+0000, when `+` shares a level
/// with anything else, or when `#` is not alone in the last level.
pub fn is_valid_filter(filter: &[u8]) -> bool {
    if filter.is_empty() {
        return false;
    }
    let last = filter.len() - 1;
    for (i, &b) in filter.iter().enumerate() {
        let after_separator = i == 0 || filter[i - 1] == b'/';
        match b {
            0 => return false,
            b'+' => {
                if !after_separator || (i < last && filter[i + 1] != b'/') {
                    return false;
                }
            }
            b'#' => {
                if !after_separator || i != last {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

/// Checks a topic name from PUBLISH or a will: non-empty, no wildcards.
pub fn is_valid_topic_name(topic: &[u8]) -> bool {
    !topic.is_empty() && find_wildcard(topic).is_none() && find_byte(topic, 0).is_none()
}

/// `true` for `$share/<group>/<filter>` filters.
pub fn is_shared_subscription(filter: &[u8]) -> bool {
    filter.starts_with(SHARED_PREFIX)
}

/// Does `topic` match `filter`?
///
/// `filter` is assumed valid (see [`is_valid_filter`]). The matcher walks
/// the filter one literal run at a time: the bytes up to the next
/// wildcard must equal the topic at the same position, then `+` skips
/// the topic to its next `/` and `#` accepts whatever is left.
pub fn topic_matches(topic: &[u8], filter: &[u8]) -> bool {
    if topic.first() == Some(&b'$') && matches!(filter.first(), Some(b'+' | b'#')) {
        return false;
    }

    let mut t = 0;
    let mut f = 0;
    loop {
        let rest = &filter[f..];
        let literal_len = find_wildcard(rest).unwrap_or(rest.len());
        if literal_len > 0 {
            let literal = &rest[..literal_len];
            let remaining = &topic[t..];
            if common_prefix_len(literal, remaining) < literal_len {
                // "a/#" also matches the parent level "a".
                return filter.get(f + literal_len) == Some(&b'#')
                    && literal[literal_len - 1] == b'/'
                    && remaining == &literal[..literal_len - 1];
            }
            t += literal_len;
            f += literal_len;
        }

        match filter.get(f) {
            None => return t == topic.len(),
            Some(&b'#') => return true,
            Some(_) => {
                t += find_byte(&topic[t..], b'/').unwrap_or(topic.len() - t);
                f += 1;
            }
        }
    }
}
