use std::collections::HashSet;

use encoding_rs::WINDOWS_1252;

use super::{classify, Confidence, ExtractionInput, ModuleDescriptor};
use crate::scan::{find_all, find_first};

const NAME_MARKER: &[u8] = b"Attribute VB_Name = \"";

/// Headers that precede `Attribute VB_Name` in class and form sources.
const BEGIN_MARKERS: &[&[u8]] = &[b"VERSION 1.0 CLASS", b"Begin VB.Form", b"Begin {"];

/// How far before a name marker a begin-block header is looked for.
const BEGIN_LOOKBEHIND: usize = 4096;

const MAX_NAME_LEN: usize = 64;

/// A run of NULs this long ends a module span early; source text never contains one.
const NUL_RUN_TERMINATOR: &[u8] = &[0, 0, 0, 0];

pub(super) fn extract(input: &ExtractionInput<'_>) -> Option<Vec<ModuleDescriptor>> {
    let bin = input.vba_bin?;

    let markers: Vec<(usize, String)> = find_all(bin, NAME_MARKER)
        .into_iter()
        .filter_map(|offset| module_name(bin, offset + NAME_MARKER.len()).map(|n| (offset, n)))
        .collect();
    if markers.is_empty() {
        return None;
    }

    let starts: Vec<usize> = markers
        .iter()
        .enumerate()
        .map(|(idx, &(offset, _))| {
            let floor = match idx {
                0 => 0,
                _ => markers[idx - 1].0 + NAME_MARKER.len(),
            };
            begin_block_start(bin, offset, floor)
        })
        .collect();

    let mut seen = HashSet::new();
    let mut modules = Vec::new();
    for (idx, (offset, name)) in markers.iter().enumerate() {
        if !seen.insert(name.to_ascii_lowercase()) {
            continue;
        }
        let next = starts.get(idx + 1).copied().unwrap_or(bin.len());
        let span = &bin[starts[idx]..next.max(*offset)];
        let span = match find_first(span, NUL_RUN_TERMINATOR) {
            Some(end) => &span[..end],
            None => span,
        };
        let (code, _, _) = WINDOWS_1252.decode(span);
        modules.push(ModuleDescriptor {
            kind: classify(name, &code, None),
            name: name.clone(),
            code: code.into_owned(),
            confidence: Confidence::Partial,
        });
    }

    Some(modules)
}

/// The quoted module name following a name marker, if it looks like an identifier.
fn module_name(bin: &[u8], start: usize) -> Option<String> {
    let rest = bin.get(start..)?;
    let len = rest.iter().take(MAX_NAME_LEN + 1).position(|&b| b == b'"')?;
    let raw = &rest[..len];
    if raw.is_empty() || raw.iter().any(|&b| b < 0x20 || b == 0x7F) {
        return None;
    }
    let (name, _, _) = WINDOWS_1252.decode(raw);
    Some(name.trim().to_owned()).filter(|n| !n.is_empty())
}

/// Earliest begin-block header between `floor` and `marker`, within the look-behind window.
fn begin_block_start(bin: &[u8], marker: usize, floor: usize) -> usize {
    let from = floor.max(marker.saturating_sub(BEGIN_LOOKBEHIND));
    let window = &bin[from..marker];
    BEGIN_MARKERS
        .iter()
        .filter_map(|pattern| find_first(window, pattern))
        .min()
        .map_or(marker, |idx| from + idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ModuleKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn splits_modules_at_name_markers() {
        let mut bin = vec![0xD0, 0xCF, 0x00, 0x00, 0x11, 0x22];
        bin.extend_from_slice(b"Attribute VB_Name = \"Module1\"\r\nSub A()\r\nEnd Sub\r\n");
        bin.extend_from_slice(&[0, 0, 0, 0, 0, 0x99]);
        bin.extend_from_slice(
            b"VERSION 1.0 CLASS\r\nBEGIN\r\n  MultiUse = -1\r\nEND\r\n\
              Attribute VB_Name = \"Widget\"\r\n\
              Attribute VB_GlobalNameSpace = False\r\n\
              Attribute VB_Creatable = False\r\n",
        );

        let input = ExtractionInput {
            vba_bin: Some(&bin),
            ..ExtractionInput::default()
        };
        let modules = extract(&input).unwrap();
        assert_eq!(modules.len(), 2);

        assert_eq!(modules[0].name, "Module1");
        assert_eq!(modules[0].kind, ModuleKind::Standard);
        assert!(modules[0].code.ends_with("End Sub\r\n"));
        assert!(!modules[0].code.contains("VERSION"));

        assert_eq!(modules[1].name, "Widget");
        assert_eq!(modules[1].kind, ModuleKind::Class);
        assert!(modules[1].code.starts_with("VERSION 1.0 CLASS"));
        assert!(modules.iter().all(|m| m.confidence == Confidence::Partial));
    }

    #[test]
    fn ignores_markers_without_a_plausible_name() {
        let bin = b"Attribute VB_Name = \"\"\r\nAttribute VB_Name = \"Bad\x01Name\"".to_vec();
        let input = ExtractionInput {
            vba_bin: Some(&bin),
            ..ExtractionInput::default()
        };
        assert_eq!(extract(&input), None);
    }
}
