//! Clearing of VBA project password/protection evidence.
//!
//! The VBA project binary is not parsed here. Instead a fixed catalogue of byte markers is
//! located with [`crate::scan::find_all`] and the bytes each marker governs are overwritten in a
//! copy of the buffer. Marker layouts live only in [`MARKER_CATALOGUE`].

use std::borrow::Cow;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::scan::find_all;

/// Offsets closer than this to the end of the buffer cannot hold a full record and are ignored.
pub const END_GUARD: usize = 100;

/// Look-ahead window for text markers that carry a flag byte somewhere after the marker.
pub const FLAG_WINDOW: usize = 20;

/// Value payloads longer than this are truncated; real `DPB`/`CMG`/`GC` values are < 200 bytes.
const MAX_PAYLOAD_LEN: usize = 1024;

/// Look-behind window used to decide whether a marker sits inside an XML-like tag.
const XML_CONTEXT_WINDOW: usize = 64;

/// How the bytes governed by a marker are cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearRule {
    /// The printable-ASCII run following the marker is overwritten.
    Payload,
    /// The byte directly after the marker is a `0x01` flag.
    TrailingFlag,
    /// Every `0x01` byte inside the window is a set flag.
    FlagWithin { window: usize },
    /// The lock byte sits `offset` bytes past the end of the marker.
    FixedOffset { offset: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerRule {
    pub name: &'static str,
    pub pattern: &'static [u8],
    pub rule: ClearRule,
}

pub const MARKER_CATALOGUE: &[MarkerRule] = &[
    MarkerRule {
        name: "DPB",
        pattern: b"DPB=",
        rule: ClearRule::Payload,
    },
    MarkerRule {
        name: "CMG",
        pattern: b"CMG=",
        rule: ClearRule::Payload,
    },
    MarkerRule {
        name: "GC",
        pattern: b"GC=",
        rule: ClearRule::Payload,
    },
    MarkerRule {
        name: "DPx",
        pattern: b"DPx",
        rule: ClearRule::TrailingFlag,
    },
    MarkerRule {
        name: "DPb",
        pattern: b"DPb",
        rule: ClearRule::TrailingFlag,
    },
    MarkerRule {
        name: "DPI",
        pattern: b"DPI",
        rule: ClearRule::TrailingFlag,
    },
    MarkerRule {
        name: "ProjectProtection",
        pattern: b"ProjectProtection",
        rule: ClearRule::FlagWithin {
            window: FLAG_WINDOW,
        },
    },
    MarkerRule {
        name: "PasswordProtection",
        pattern: b"PasswordProtection",
        rule: ClearRule::FlagWithin {
            window: FLAG_WINDOW,
        },
    },
    MarkerRule {
        name: "Protection",
        pattern: b"Protection",
        rule: ClearRule::FlagWithin {
            window: FLAG_WINDOW,
        },
    },
    MarkerRule {
        name: "PROJECTLOCKED",
        pattern: b"PROJECTLOCKED",
        rule: ClearRule::FixedOffset { offset: 4 },
    },
];

/// Byte written over value payloads.
///
/// A zero fill clears a quoted value together with its closing quote. A space fill keeps the
/// closing quote so the surrounding attribute stays terminated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FillPolicy {
    /// `0x00`, or space when the marker sits inside an XML-like tag.
    #[default]
    Auto,
    Zero,
    Space,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionMarker {
    pub offset: usize,
    pub pattern_name: &'static str,
    pub match_length: usize,
    /// Byte range that was overwritten.
    pub cleared: Range<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NeutralizeReport {
    pub cleared: Vec<ProtectionMarker>,
    /// Candidate offsets rejected by the end-of-buffer sanity check.
    pub rejected: Vec<(usize, &'static str)>,
}

impl NeutralizeReport {
    pub fn protection_found(&self) -> bool {
        !self.cleared.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Neutralized<'a> {
    /// Borrowed when nothing had to be cleared.
    pub bytes: Cow<'a, [u8]>,
    pub report: NeutralizeReport,
}

pub fn neutralize(buffer: &[u8]) -> Neutralized<'_> {
    neutralize_with(buffer, FillPolicy::Auto)
}

pub fn neutralize_with(buffer: &[u8], fill: FillPolicy) -> Neutralized<'_> {
    neutralize_with_catalogue(buffer, MARKER_CATALOGUE, fill)
}

/// Run an arbitrary marker catalogue over `buffer`.
///
/// Marker positions and flag positions are always evaluated against the original bytes, so
/// overlapping markers (e.g. `Protection` inside `ProjectProtection`) resolve to the same target.
pub fn neutralize_with_catalogue<'a>(
    buffer: &'a [u8],
    catalogue: &[MarkerRule],
    fill: FillPolicy,
) -> Neutralized<'a> {
    let mut out: Option<Vec<u8>> = None;
    let mut report = NeutralizeReport::default();

    for rule in catalogue {
        for offset in find_all(buffer, rule.pattern) {
            if offset.saturating_add(END_GUARD) > buffer.len() {
                report.rejected.push((offset, rule.name));
                continue;
            }

            for (target, value) in clear_targets(buffer, offset, rule, fill) {
                let current = out.as_deref().unwrap_or(buffer);
                if current[target.clone()].iter().all(|&b| b == value) {
                    continue;
                }

                let bytes = out.get_or_insert_with(|| buffer.to_vec());
                bytes[target.clone()].fill(value);
                log::debug!(
                    "cleared {} marker at offset {offset} ({} bytes at {})",
                    rule.name,
                    target.len(),
                    target.start
                );
                report.cleared.push(ProtectionMarker {
                    offset,
                    pattern_name: rule.name,
                    match_length: rule.pattern.len(),
                    cleared: target,
                });
            }
        }
    }

    Neutralized {
        bytes: match out {
            Some(bytes) => Cow::Owned(bytes),
            None => Cow::Borrowed(buffer),
        },
        report,
    }
}

/// Resolve the byte ranges a marker governs and the value each should hold once cleared.
fn clear_targets(
    buffer: &[u8],
    offset: usize,
    rule: &MarkerRule,
    fill: FillPolicy,
) -> Vec<(Range<usize>, u8)> {
    let end = offset + rule.pattern.len();
    let single = match rule.rule {
        ClearRule::Payload => payload_target(buffer, offset, end, fill),
        ClearRule::TrailingFlag => (buffer.get(end) == Some(&0x01)).then_some((end..end + 1, 0x00)),
        ClearRule::FlagWithin { window } => {
            let limit = end.saturating_add(window).min(buffer.len());
            return (end..limit)
                .filter(|&i| buffer[i] == 0x01)
                .map(|i| (i..i + 1, 0x00))
                .collect();
        }
        ClearRule::FixedOffset { offset: delta } => end
            .checked_add(delta)
            .filter(|&idx| buffer.get(idx).is_some_and(|&b| b != 0x00))
            .map(|idx| (idx..idx + 1, 0x00)),
    };
    single.into_iter().collect()
}

fn payload_target(
    buffer: &[u8],
    marker_start: usize,
    start: usize,
    fill: FillPolicy,
) -> Option<(Range<usize>, u8)> {
    let mut run_end = start;
    while run_end < buffer.len()
        && run_end - start < MAX_PAYLOAD_LEN
        && is_printable(buffer[run_end])
    {
        run_end += 1;
    }

    // A quoted value ends at its closing quote, not at the end of the printable run.
    let quoted = start < run_end && buffer[start] == b'"';
    if quoted {
        if let Some(close) = buffer[start + 1..run_end].iter().position(|&b| b == b'"') {
            run_end = start + 1 + close + 1;
        }
    }

    let run = &buffer[start..run_end];
    let inner_start = if quoted { start + 1 } else { start };

    let value = match fill {
        FillPolicy::Zero => 0x00,
        FillPolicy::Space => b' ',
        FillPolicy::Auto if in_xml_context(buffer, marker_start) => b' ',
        FillPolicy::Auto => 0x00,
    };

    // A space fill keeps the closing quote so an enclosing attribute stays terminated.
    let inner_end = if value == b' ' && quoted && run.len() >= 2 && run.last() == Some(&b'"') {
        run_end - 1
    } else {
        run_end
    };

    if inner_start >= inner_end {
        return None;
    }
    // Already blanked by an earlier pass (possibly with the other fill byte).
    if buffer[inner_start..inner_end].iter().all(|&b| b == b' ') {
        return None;
    }
    Some((inner_start..inner_end, value))
}

fn is_printable(b: u8) -> bool {
    (0x20..=0x7E).contains(&b)
}

/// `true` when an unclosed `<` precedes the marker within a short window.
fn in_xml_context(buffer: &[u8], marker_start: usize) -> bool {
    let from = marker_start.saturating_sub(XML_CONTEXT_WINDOW);
    let before = &buffer[from..marker_start];
    match before.iter().rposition(|&b| b == b'<') {
        Some(lt) => !before[lt..].contains(&b'>'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn padded(prefix: &[u8], body: &[u8]) -> Vec<u8> {
        let mut buf = prefix.to_vec();
        buf.extend_from_slice(body);
        buf.extend(std::iter::repeat(0xEEu8).take(END_GUARD));
        buf
    }

    #[test]
    fn clears_quoted_dpb_payload_and_keeps_marker() {
        let buf = padded(b"ID=\"{1}\"\r\n", b"DPB=\"AAA\"\r\nGC=");
        let result = neutralize(&buf);
        let out: &[u8] = &result.bytes;
        let at = 10;
        assert_eq!(&out[at..at + 4], b"DPB=");
        assert_eq!(out[at + 4], b'"');
        assert_eq!(&out[at + 5..at + 9], &[0u8; 4]);
        assert_eq!(&out[at + 9..at + 11], b"\r\n");
        assert!(result.report.protection_found());
    }

    #[test]
    fn clears_unquoted_payload_up_to_terminator() {
        let buf = padded(b"", b"CMG=0A0B0C\x00rest");
        let result = neutralize(&buf);
        assert_eq!(&result.bytes[..4], b"CMG=");
        assert_eq!(&result.bytes[4..10], &[0u8; 6]);
        assert_eq!(&result.bytes[10..15], b"\x00rest");
    }

    #[test]
    fn uses_spaces_inside_xml_like_tags() {
        let buf = padded(b"<project ", b"DPB=\"ABCD\" other=\"1\">");
        let result = neutralize(&buf);
        assert_eq!(&result.bytes[9..24], b"DPB=\"    \" othe");
    }

    #[test]
    fn clears_trailing_flags_only_when_set() {
        let buf = padded(b"..DPx\x01..DPb\x02..", b"");
        let result = neutralize(&buf);
        assert_eq!(result.bytes[5], 0x00);
        assert_eq!(result.bytes[11], 0x02);
        assert_eq!(result.report.cleared.len(), 1);
        assert_eq!(result.report.cleared[0].pattern_name, "DPx");
    }

    #[test]
    fn overlapping_text_markers_share_their_flags() {
        let buf = padded(b"ProjectProtection:\x05\x01\x01", b"");
        let result = neutralize(&buf);
        assert_eq!(&result.bytes[17..21], &[b':', 0x05u8, 0x00, 0x00]);
        assert_eq!(result.report.cleared.len(), 2);
        assert!(result
            .report
            .cleared
            .iter()
            .all(|m| m.pattern_name == "ProjectProtection"));
    }

    #[test]
    fn flag_after_a_zero_byte_in_the_window_is_cleared() {
        let buf = padded(b"Protection\x00\x00\x02\x01", b"");
        let result = neutralize(&buf);
        assert_eq!(&result.bytes[10..14], &[0x00u8, 0x00, 0x02, 0x00]);
        assert_eq!(result.report.cleared.len(), 1);
        assert_eq!(result.report.cleared[0].cleared, 13..14);
        assert!(neutralize(&result.bytes).report.cleared.is_empty());
    }

    #[test]
    fn clears_project_locked_byte() {
        let buf = padded(b"PROJECTLOCKED\x04\x00\x00\x00\x01", b"");
        let result = neutralize(&buf);
        assert_eq!(result.bytes[17], 0x00);
    }

    #[test]
    fn ignores_markers_near_the_end() {
        let mut buf = vec![0xEEu8; 10];
        buf.extend_from_slice(b"DPB=\"AAA\"");
        let result = neutralize(&buf);
        assert!(matches!(result.bytes, Cow::Borrowed(_)));
        assert_eq!(result.report.rejected, vec![(10, "DPB")]);
        assert!(!result.report.protection_found());
    }

    #[test]
    fn no_markers_returns_borrowed_input() {
        let buf = vec![0x41u8; 400];
        let result = neutralize(&buf);
        assert!(matches!(result.bytes, Cow::Borrowed(_)));
        assert!(!result.report.protection_found());
    }

    #[test]
    fn second_pass_is_a_fixed_point() {
        for fill in [FillPolicy::Auto, FillPolicy::Zero, FillPolicy::Space] {
            let buf = padded(
                b"<x DPB=\"00\">CMG=\"1234\"\r\nDPI\x01 Protection\x02\x01 ",
                b"PROJECTLOCKED\x04\x00\x00\x00\x01",
            );
            let first = neutralize_with(&buf, fill);
            assert!(first.report.protection_found());
            let once = first.bytes.into_owned();
            let second = neutralize_with(&once, fill);
            assert!(second.report.cleared.is_empty(), "{fill:?}: {:?}", second.report);
            assert_eq!(&*second.bytes, once.as_slice());
        }
    }
}
