use thiserror::Error;

const CONTAINER_SIGNATURE: u8 = 0x01;
const CHUNK_SIGNATURE_BITS: u16 = 0b011;
const MAX_CHUNK_OUTPUT: usize = 4096;

/// Literals that fit a literal-only compressed chunk (`n + ceil(n / 8) <= 4096`).
const LITERALS_PER_CHUNK: usize = 3640;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("compressed container is empty")]
    Empty,
    #[error("invalid compressed container signature {0:#04x}")]
    InvalidSignature(u8),
    #[error("truncated compressed chunk header")]
    TruncatedChunkHeader,
    #[error("invalid compressed chunk signature bits {0:#x}")]
    InvalidChunkSignature(u16),
    #[error("truncated compressed chunk data")]
    TruncatedChunkData,
    #[error("truncated copy token")]
    TruncatedCopyToken,
    #[error("copy token references data before start of chunk (offset={offset}, out_len={out_len})")]
    BadCopyOffset { offset: usize, out_len: usize },
}

struct ChunkHeader {
    compressed: bool,
    data_len: usize,
}

impl ChunkHeader {
    fn parse(raw: u16) -> Result<Self, CompressionError> {
        let signature = (raw >> 12) & 0b111;
        if signature != CHUNK_SIGNATURE_BITS {
            return Err(CompressionError::InvalidChunkSignature(signature));
        }
        // The size field counts the whole chunk (header included) minus three.
        Ok(Self {
            compressed: raw & 0x8000 != 0,
            data_len: usize::from(raw & 0x0FFF) + 1,
        })
    }
}

/// Decompress an MS-OVBA `CompressedContainer` (the `VBA/dir` stream, or the source portion of
/// a module stream starting at its text offset).
pub fn decompress_container(input: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let (&signature, mut rest) = input.split_first().ok_or(CompressionError::Empty)?;
    if signature != CONTAINER_SIGNATURE {
        return Err(CompressionError::InvalidSignature(signature));
    }

    let mut out = Vec::with_capacity(input.len() * 2);
    while !rest.is_empty() {
        let [lo, hi] = rest
            .get(..2)
            .and_then(|b| <[u8; 2]>::try_from(b).ok())
            .ok_or(CompressionError::TruncatedChunkHeader)?;
        let header = ChunkHeader::parse(u16::from_le_bytes([lo, hi]))?;
        rest = &rest[2..];

        let data = rest
            .get(..header.data_len)
            .ok_or(CompressionError::TruncatedChunkData)?;
        rest = &rest[header.data_len..];

        if header.compressed {
            decompress_chunk(data, &mut out)?;
        } else {
            out.extend_from_slice(data);
        }
    }

    Ok(out)
}

fn decompress_chunk(chunk: &[u8], out: &mut Vec<u8>) -> Result<(), CompressionError> {
    let chunk_start = out.len();
    let mut idx = 0usize;

    while idx < chunk.len() && out.len() - chunk_start < MAX_CHUNK_OUTPUT {
        let flags = chunk[idx];
        idx += 1;

        for bit in 0..8 {
            if idx >= chunk.len() || out.len() - chunk_start >= MAX_CHUNK_OUTPUT {
                break;
            }

            if flags & (1 << bit) == 0 {
                out.push(chunk[idx]);
                idx += 1;
                continue;
            }

            let token = chunk
                .get(idx..idx + 2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .ok_or(CompressionError::TruncatedCopyToken)?;
            idx += 2;

            let decompressed = out.len() - chunk_start;
            let length_bits = 16 - copy_token_bit_count(decompressed);
            let offset = usize::from(token >> length_bits) + 1;
            let length = usize::from(token & ((1u16 << length_bits) - 1)) + 3;

            if offset > decompressed {
                return Err(CompressionError::BadCopyOffset {
                    offset,
                    out_len: decompressed,
                });
            }

            for _ in 0..length {
                if out.len() - chunk_start >= MAX_CHUNK_OUTPUT {
                    break;
                }
                let byte = out[out.len() - offset];
                out.push(byte);
            }
        }
    }

    Ok(())
}

/// Number of offset bits in a copy token, derived from the bytes decompressed so far in the
/// current chunk (minimum 4, maximum 12).
fn copy_token_bit_count(decompressed_in_chunk: usize) -> u32 {
    let n = decompressed_in_chunk.saturating_sub(1);
    (usize::BITS - n.leading_zeros()).clamp(4, 12)
}

/// Wrap `data` in a `CompressedContainer` made of literal-only chunks.
///
/// The output is valid input for [`decompress_container`] (and for Office), although it does not
/// attempt to find back-references.
pub fn compress_container(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8 + 8);
    out.push(CONTAINER_SIGNATURE);

    for literals in data.chunks(LITERALS_PER_CHUNK) {
        let mut chunk = Vec::with_capacity(literals.len() + literals.len() / 8 + 1);
        for group in literals.chunks(8) {
            chunk.push(0x00);
            chunk.extend_from_slice(group);
        }
        let size_field = (chunk.len() - 1) as u16;
        let header = 0x8000 | (CHUNK_SIGNATURE_BITS << 12) | size_field;
        out.extend_from_slice(&header.to_le_bytes());
        out.extend_from_slice(&chunk);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_copy_tokens() {
        // "ABC" as literals, then a copy token (offset 3, length 6) => "ABCABCABC".
        let mut chunk = vec![0b0000_1000];
        chunk.extend_from_slice(b"ABC");
        chunk.extend_from_slice(&0x2003u16.to_le_bytes());

        let header = 0xB000u16 | (chunk.len() as u16 - 1);
        let mut container = vec![0x01];
        container.extend_from_slice(&header.to_le_bytes());
        container.extend_from_slice(&chunk);

        assert_eq!(decompress_container(&container).unwrap(), b"ABCABCABC");
    }

    #[test]
    fn literal_only_containers_round_trip_across_chunks() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let container = compress_container(&data);
        assert_eq!(decompress_container(&container).unwrap(), data);
    }

    #[test]
    fn rejects_bad_signatures() {
        assert!(matches!(
            decompress_container(&[]),
            Err(CompressionError::Empty)
        ));
        assert!(matches!(
            decompress_container(&[0x02, 0x00]),
            Err(CompressionError::InvalidSignature(0x02))
        ));
        assert!(matches!(
            decompress_container(&[0x01, 0x00, 0x00]),
            Err(CompressionError::InvalidChunkSignature(0))
        ));
        assert!(matches!(
            decompress_container(&[0x01, 0xFF, 0x3F, 0xAA]),
            Err(CompressionError::TruncatedChunkData)
        ));
    }
}
