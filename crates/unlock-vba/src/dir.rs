use encoding_rs::{Encoding, UTF_16LE, WINDOWS_1252};
use thiserror::Error;

/// Module type as declared by the `VBA/dir` stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DirModuleType {
    /// `MODULETYPE` id `0x0021`: procedural (standard) module.
    Procedural,
    /// `MODULETYPE` id `0x0022`: document, class or designer module.
    NonProcedural,
    Unspecified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub name: String,
    pub stream_name: String,
    pub module_type: DirModuleType,
    pub text_offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirStream {
    pub codepage: Option<u16>,
    pub project_name: Option<String>,
    pub modules: Vec<ModuleRecord>,
}

#[derive(Debug, Error)]
pub enum DirParseError {
    #[error("dir stream is truncated")]
    Truncated,
    #[error("dir record claims a length beyond the remaining bytes (id={id:#06x}, len={len})")]
    BadRecordLength { id: u16, len: usize },
}

const PROJECTCODEPAGE: u16 = 0x0003;
const PROJECTNAME: u16 = 0x0004;
const PROJECTVERSION: u16 = 0x0009;
const MODULENAME: u16 = 0x0019;
const MODULESTREAMNAME: u16 = 0x001A;
const MODULETYPE_PROCEDURAL: u16 = 0x0021;
const MODULETYPE_NONPROCEDURAL: u16 = 0x0022;
const MODULETEXTOFFSET: u16 = 0x0031;
const MODULESTREAMNAMEUNICODE: u16 = 0x0032;
const MODULENAMEUNICODE: u16 = 0x0047;

/// Iterate `(id, payload)` records of a decompressed `VBA/dir` stream.
fn records(decompressed: &[u8]) -> impl Iterator<Item = Result<(u16, &[u8]), DirParseError>> {
    let mut offset = 0usize;
    let mut failed = false;
    std::iter::from_fn(move || {
        if failed || offset >= decompressed.len() {
            return None;
        }
        let Some(head) = decompressed.get(offset..offset + 6) else {
            failed = true;
            return Some(Err(DirParseError::Truncated));
        };
        let id = u16::from_le_bytes([head[0], head[1]]);
        let mut len = u32::from_le_bytes([head[2], head[3], head[4], head[5]]) as usize;
        // PROJECTVERSION declares a 4-byte size but carries 6 bytes (major u32 + minor u16).
        if id == PROJECTVERSION {
            len = 6;
        }
        offset += 6;
        let Some(data) = decompressed.get(offset..offset + len) else {
            failed = true;
            return Some(Err(DirParseError::BadRecordLength { id, len }));
        };
        offset += len;
        Some(Ok((id, data)))
    })
}

impl DirStream {
    /// Read the `PROJECTCODEPAGE` record without parsing the rest of the stream.
    pub fn detect_codepage(decompressed: &[u8]) -> Option<u16> {
        records(decompressed)
            .map_while(Result::ok)
            .find(|(id, data)| *id == PROJECTCODEPAGE && data.len() >= 2)
            .map(|(_, data)| u16::from_le_bytes([data[0], data[1]]))
    }

    pub fn parse(decompressed: &[u8]) -> Result<Self, DirParseError> {
        let encoding = Self::detect_codepage(decompressed)
            .map(|cp| crate::project::encoding_for_codepage(u32::from(cp)))
            .unwrap_or(WINDOWS_1252);
        Self::parse_with_encoding(decompressed, encoding)
    }

    /// Parse the records needed to enumerate modules: project name, codepage, and per-module
    /// name/stream name/type/text offset. Unicode name records win over their MBCS siblings.
    pub fn parse_with_encoding(
        decompressed: &[u8],
        encoding: &'static Encoding,
    ) -> Result<Self, DirParseError> {
        let mut codepage = None;
        let mut project_name = None;
        let mut modules: Vec<ModuleRecord> = Vec::new();
        let mut current: Option<ModuleRecord> = None;

        for record in records(decompressed) {
            let (id, data) = record?;
            match id {
                PROJECTCODEPAGE if data.len() >= 2 => {
                    codepage = Some(u16::from_le_bytes([data[0], data[1]]));
                }
                PROJECTNAME => project_name = Some(decode(data, encoding)),
                MODULENAME => {
                    modules.extend(current.take());
                    current = Some(ModuleRecord {
                        name: decode(data, encoding),
                        stream_name: String::new(),
                        module_type: DirModuleType::Unspecified,
                        text_offset: None,
                    });
                }
                MODULENAMEUNICODE => {
                    let name = decode_utf16(data);
                    match current.as_mut() {
                        // Follows MODULENAME for the same module.
                        Some(m) if m.stream_name.is_empty() => m.name = name,
                        _ => {
                            modules.extend(current.take());
                            current = Some(ModuleRecord {
                                name,
                                stream_name: String::new(),
                                module_type: DirModuleType::Unspecified,
                                text_offset: None,
                            });
                        }
                    }
                }
                MODULESTREAMNAME => {
                    if let Some(m) = current.as_mut() {
                        m.stream_name = decode(trim_reserved_u16(data), encoding);
                    }
                }
                MODULESTREAMNAMEUNICODE => {
                    if let Some(m) = current.as_mut() {
                        m.stream_name = decode_utf16(data);
                    }
                }
                MODULETYPE_PROCEDURAL | MODULETYPE_NONPROCEDURAL => {
                    if let Some(m) = current.as_mut() {
                        m.module_type = if id == MODULETYPE_PROCEDURAL {
                            DirModuleType::Procedural
                        } else {
                            DirModuleType::NonProcedural
                        };
                    }
                }
                MODULETEXTOFFSET if data.len() >= 4 => {
                    if let Some(m) = current.as_mut() {
                        m.text_offset =
                            Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize);
                    }
                }
                _ => {}
            }
        }
        modules.extend(current.take());

        for m in &mut modules {
            if m.stream_name.is_empty() {
                m.stream_name = m.name.clone();
            }
        }

        Ok(Self {
            codepage,
            project_name,
            modules,
        })
    }
}

fn trim_reserved_u16(bytes: &[u8]) -> &[u8] {
    bytes.strip_suffix(&[0x00, 0x00]).unwrap_or(bytes)
}

fn decode(bytes: &[u8], encoding: &'static Encoding) -> String {
    let (cow, _, _) = encoding.decode(bytes);
    cow.into_owned()
}

fn decode_utf16(bytes: &[u8]) -> String {
    let (cow, _) = UTF_16LE.decode_without_bom_handling(bytes);
    cow.into_owned()
}
