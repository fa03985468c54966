use std::io::Read;

use zip::read::ZipFile;

use crate::PackageError;

/// Default maximum uncompressed size permitted for any single part inflated into memory.
pub const DEFAULT_MAX_PART_BYTES: u64 = 256 * 1024 * 1024; // 256MiB

/// Default maximum total uncompressed bytes across every part of a package.
pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 512 * 1024 * 1024; // 512MiB

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Canonical lookup key for a part name:
/// - percent-decodes valid `%xx` sequences
/// - strips leading `/` or `\` separators (also when percent-encoded)
/// - normalizes `\` to `/`
/// - ASCII-lowercases
pub(crate) fn part_name_lookup_key(name: &str) -> Vec<u8> {
    let mut bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut in_leading_separators = true;
    while let Some(&b) = bytes.first() {
        let escaped = match bytes {
            [b'%', hi, lo, ..] => hex_val(*hi).zip(hex_val(*lo)),
            _ => None,
        };
        let decoded = match escaped {
            Some((hi, lo)) => {
                bytes = &bytes[3..];
                (hi << 4) | lo
            }
            None => {
                bytes = &bytes[1..];
                b
            }
        };

        if in_leading_separators && matches!(decoded, b'/' | b'\\') {
            continue;
        }
        in_leading_separators = false;

        out.push(if decoded == b'\\' {
            b'/'
        } else {
            decoded.to_ascii_lowercase()
        });
    }
    out
}

pub fn part_names_equivalent(a: &str, b: &str) -> bool {
    part_name_lookup_key(a) == part_name_lookup_key(b)
}

/// Shared budget for the total number of bytes inflated while loading one package.
#[derive(Debug, Clone)]
pub(crate) struct InflateBudget {
    max_total_bytes: u64,
    used_bytes: u64,
}

impl InflateBudget {
    pub(crate) fn new(max_total_bytes: u64) -> Self {
        Self {
            max_total_bytes,
            used_bytes: 0,
        }
    }

    fn remaining_bytes(&self) -> u64 {
        self.max_total_bytes.saturating_sub(self.used_bytes)
    }

    fn consume(&mut self, bytes: u64) -> Result<(), PackageError> {
        self.used_bytes = self.used_bytes.saturating_add(bytes);
        if self.used_bytes > self.max_total_bytes {
            return Err(PackageError::PackageTooLarge {
                total: self.used_bytes,
                max: self.max_total_bytes,
            });
        }
        Ok(())
    }
}

/// Read a ZIP entry into memory without trusting its declared size.
///
/// The declared uncompressed size is checked first, then the read itself is capped at
/// `limit + 1` bytes so forged metadata cannot push past the part or package budget.
pub(crate) fn read_zip_file_bytes_with_budget(
    file: &mut ZipFile<'_>,
    part: &str,
    max_part_bytes: u64,
    budget: &mut InflateBudget,
) -> Result<Vec<u8>, PackageError> {
    let declared_size = file.size();
    if declared_size > max_part_bytes {
        return Err(PackageError::PartTooLarge {
            part: part.to_string(),
            size: declared_size,
            max: max_part_bytes,
        });
    }

    let effective_max = max_part_bytes.min(budget.remaining_bytes());
    let limit_is_total = effective_max < max_part_bytes;
    if limit_is_total && declared_size > effective_max {
        return Err(PackageError::PackageTooLarge {
            total: budget.used_bytes.saturating_add(declared_size),
            max: budget.max_total_bytes,
        });
    }

    let mut buf = Vec::new();
    file.take(effective_max.saturating_add(1))
        .read_to_end(&mut buf)?;

    let observed = buf.len() as u64;
    if observed > effective_max {
        if limit_is_total {
            return Err(PackageError::PackageTooLarge {
                total: budget.used_bytes.saturating_add(observed),
                max: budget.max_total_bytes,
            });
        }
        return Err(PackageError::PartTooLarge {
            part: part.to_string(),
            size: observed,
            max: max_part_bytes,
        });
    }

    budget.consume(observed)?;
    Ok(buf)
}
