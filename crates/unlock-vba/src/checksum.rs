use thiserror::Error;

/// Offset of the little-endian checksum field in the VBA project buffer.
pub const CHECKSUM_OFFSET: usize = 4;

/// Start of the region covered by the checksum (`buffer[PAYLOAD_OFFSET..]`).
pub const PAYLOAD_OFFSET: usize = 8;

/// Smallest buffer that can hold the format signature and the checksum field.
pub const MIN_HEADER_LEN: usize = PAYLOAD_OFFSET;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("VBA project buffer is too small to carry a checksum ({len} bytes, need at least {MIN_HEADER_LEN})")]
    TooSmall { len: usize },
}

/// Additive checksum over `buffer[8..]`: the byte sum modulo 2^32.
///
/// Note: this is the self-consistent formula used by this crate, not the integrity algorithm
/// Office applies to real project binaries.
pub fn compute_checksum(buffer: &[u8]) -> Result<u32, ChecksumError> {
    let payload = buffer
        .get(PAYLOAD_OFFSET..)
        .ok_or(ChecksumError::TooSmall { len: buffer.len() })?;
    Ok(payload
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b))))
}

/// Read the checksum currently stored at offset 4.
pub fn stored_checksum(buffer: &[u8]) -> Result<u32, ChecksumError> {
    let field = buffer
        .get(CHECKSUM_OFFSET..PAYLOAD_OFFSET)
        .ok_or(ChecksumError::TooSmall { len: buffer.len() })?;
    Ok(u32::from_le_bytes([field[0], field[1], field[2], field[3]]))
}

pub fn is_consistent(buffer: &[u8]) -> bool {
    matches!(
        (stored_checksum(buffer), compute_checksum(buffer)),
        (Ok(stored), Ok(computed)) if stored == computed
    )
}

/// Rewrite the checksum field of `buffer` in place.
///
/// Nothing is written when the buffer is too small.
pub fn restamp_in_place(buffer: &mut [u8]) -> Result<u32, ChecksumError> {
    let checksum = compute_checksum(buffer)?;
    buffer[CHECKSUM_OFFSET..PAYLOAD_OFFSET].copy_from_slice(&checksum.to_le_bytes());
    Ok(checksum)
}

/// Return a copy of `buffer` with a freshly computed checksum at offset 4.
pub fn restamp(buffer: &[u8]) -> Result<Vec<u8>, ChecksumError> {
    let mut out = buffer.to_vec();
    restamp_in_place(&mut out)?;
    Ok(out)
}
