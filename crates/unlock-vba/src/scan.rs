//! Byte-pattern search over raw buffers.
//!
//! Protection markers and module markers are both located through these helpers.

/// Return every offset at which `pattern` occurs verbatim in `haystack`, in ascending order.
///
/// Matches may overlap (each start offset is reported once). An empty pattern, or a pattern
/// longer than the haystack, yields an empty result rather than an error.
pub fn find_all(haystack: &[u8], pattern: &[u8]) -> Vec<usize> {
    if pattern.is_empty() || pattern.len() > haystack.len() {
        return Vec::new();
    }

    haystack
        .windows(pattern.len())
        .enumerate()
        .filter(|(_, window)| *window == pattern)
        .map(|(offset, _)| offset)
        .collect()
}

/// First offset of `pattern` at or after `from`.
pub fn find_from(haystack: &[u8], pattern: &[u8], from: usize) -> Option<usize> {
    if pattern.is_empty() {
        return None;
    }
    let rest = haystack.get(from..)?;
    rest.windows(pattern.len())
        .position(|window| window == pattern)
        .map(|idx| idx + from)
}

pub fn find_first(haystack: &[u8], pattern: &[u8]) -> Option<usize> {
    find_from(haystack, pattern, 0)
}

pub fn contains(haystack: &[u8], pattern: &[u8]) -> bool {
    find_first(haystack, pattern).is_some()
}
