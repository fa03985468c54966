use std::collections::BTreeMap;

use encoding_rs::{
    Encoding, BIG5, EUC_KR, GBK, SHIFT_JIS, UTF_16LE, UTF_8, WINDOWS_1250, WINDOWS_1251,
    WINDOWS_1252, WINDOWS_1253, WINDOWS_1254, WINDOWS_1255, WINDOWS_1256, WINDOWS_1257,
    WINDOWS_1258, WINDOWS_874,
};
use thiserror::Error;

use crate::compression::{decompress_container, CompressionError};
use crate::dir::{DirModuleType, DirParseError, DirStream};
use crate::ole::{OleError, OleFile};

/// A VBA project read through its compound-file structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VBAProject {
    pub name: Option<String>,
    pub codepage: Option<u16>,
    pub modules: Vec<VBAModule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VBAModule {
    pub name: String,
    pub stream_name: String,
    pub module_type: DirModuleType,
    pub code: String,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("OLE error: {0}")]
    Ole(#[from] OleError),
    #[error("VBA compression error: {0}")]
    Compression(#[from] CompressionError),
    #[error("dir stream parse error: {0}")]
    Dir(#[from] DirParseError),
    #[error("missing required stream {0}")]
    MissingStream(&'static str),
}

impl VBAProject {
    /// Parse a `vbaProject.bin` compound file.
    ///
    /// Module streams that are missing or fail to decompress are skipped with a warning so a
    /// single damaged module does not hide the rest of the project.
    pub fn parse(vba_project_bin: &[u8]) -> Result<Self, ParseError> {
        let mut ole = OleFile::open(vba_project_bin)?;

        let project_stream = ole.read_stream_opt("PROJECT")?;
        let dir_bytes = ole
            .read_stream_opt("VBA/dir")?
            .ok_or(ParseError::MissingStream("VBA/dir"))?;
        let dir_decompressed = decompress_container(&dir_bytes)?;

        let encoding = project_stream
            .as_deref()
            .and_then(detect_project_codepage)
            .or_else(|| {
                DirStream::detect_codepage(&dir_decompressed)
                    .map(|cp| encoding_for_codepage(u32::from(cp)))
            })
            .unwrap_or(WINDOWS_1252);

        let name_from_project_stream = project_stream.as_deref().and_then(|bytes| {
            let text = decode_with_encoding(bytes, encoding);
            text.split(['\r', '\n'])
                .map(str::trim)
                .find_map(|line| line.strip_prefix("Name="))
                .map(|rest| rest.trim_matches('"').to_owned())
        });

        let dir = DirStream::parse_with_encoding(&dir_decompressed, encoding)?;

        let mut modules = Vec::with_capacity(dir.modules.len());
        for record in &dir.modules {
            let stream_path = format!("VBA/{}", record.stream_name);
            let Some(module_stream) = ole.read_stream_opt(&stream_path)? else {
                log::warn!("module stream {stream_path} listed in VBA/dir is missing");
                continue;
            };

            let text_offset = record
                .text_offset
                .unwrap_or_else(|| guess_text_offset(&module_stream))
                .min(module_stream.len());
            let source = match decompress_container(&module_stream[text_offset..]) {
                Ok(source) => source,
                Err(err) => {
                    log::warn!("failed to decompress module {}: {err}", record.name);
                    continue;
                }
            };
            let code = decode_with_encoding(&source, encoding);
            let attributes = parse_attributes(&code);

            modules.push(VBAModule {
                name: record.name.clone(),
                stream_name: record.stream_name.clone(),
                module_type: record.module_type,
                code,
                attributes,
            });
        }

        Ok(Self {
            name: dir.project_name.or(name_from_project_stream),
            codepage: dir.codepage,
            modules,
        })
    }
}

pub(crate) fn encoding_for_codepage(codepage: u32) -> &'static Encoding {
    match codepage {
        874 => WINDOWS_874,
        932 => SHIFT_JIS,
        936 => GBK,
        949 => EUC_KR,
        950 => BIG5,
        1250 => WINDOWS_1250,
        1251 => WINDOWS_1251,
        1252 => WINDOWS_1252,
        1253 => WINDOWS_1253,
        1254 => WINDOWS_1254,
        1255 => WINDOWS_1255,
        1256 => WINDOWS_1256,
        1257 => WINDOWS_1257,
        1258 => WINDOWS_1258,
        65001 => UTF_8,
        _ => WINDOWS_1252,
    }
}

/// Find `CodePage=<n>` among the `PROJECT` stream properties. The directive is ASCII, so this
/// works on raw bytes before the stream's own encoding is known.
fn detect_project_codepage(project_stream: &[u8]) -> Option<&'static Encoding> {
    const KEY: &[u8] = b"CodePage";

    for line in project_stream.split(|&b| b == b'\n' || b == b'\r') {
        let line = line.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(line);
        let line = line.trim_ascii();
        // Properties end at the first section header (`[Host Extender Info]`, `[Workspace]`).
        if line.starts_with(b"[") && line.ends_with(b"]") {
            break;
        }
        let Some(prefix) = line.get(..KEY.len()) else {
            continue;
        };
        if !prefix.eq_ignore_ascii_case(KEY) {
            continue;
        }
        let Some(value) = line[KEY.len()..].trim_ascii_start().strip_prefix(b"=") else {
            continue;
        };
        let value = value.trim_ascii_start();
        let digits = value.iter().take_while(|b| b.is_ascii_digit()).count();
        let Some(n) = std::str::from_utf8(&value[..digits])
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        return Some(encoding_for_codepage(n));
    }

    None
}

fn decode_with_encoding(bytes: &[u8], encoding: &'static Encoding) -> String {
    // Some producers store module source as UTF-16LE; treat it as such when at least half of the
    // high bytes are NUL.
    if bytes.len() >= 2 && bytes.len() % 2 == 0 {
        let total = bytes.len() / 2;
        let nul_high = bytes.iter().skip(1).step_by(2).filter(|&&b| b == 0).count();
        if nul_high * 2 >= total {
            let (cow, _) = UTF_16LE.decode_without_bom_handling(bytes);
            return cow.into_owned();
        }
    }

    let (cow, _, _) = encoding.decode(bytes);
    cow.into_owned()
}

/// Collect `Attribute Key = Value` lines, unquoting string values.
pub fn parse_attributes(code: &str) -> BTreeMap<String, String> {
    code.lines()
        .filter_map(|line| line.trim().strip_prefix("Attribute "))
        .filter_map(|rest| rest.split_once('='))
        .map(|(key, value)| {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            (key.trim().to_owned(), value.to_owned())
        })
        .collect()
}

/// Locate the compressed source container in a module stream when `VBA/dir` has no text offset:
/// the first `0x01` followed by a chunk header with signature bits `0b011` that decompresses.
fn guess_text_offset(module_stream: &[u8]) -> usize {
    (0..module_stream.len().saturating_sub(3))
        .filter(|&idx| module_stream[idx] == 0x01)
        .find(|&idx| {
            let header = u16::from_le_bytes([module_stream[idx + 1], module_stream[idx + 2]]);
            (header & 0x7000) >> 12 == 0b011
                && decompress_container(&module_stream[idx..]).is_ok()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::compress_container;
    use std::io::{Cursor, Write};

    fn push_record(out: &mut Vec<u8>, id: u16, data: &[u8]) {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
    }

    #[test]
    fn detects_codepage_directive_leniently() {
        let stream = b"ID=\"{X}\"\r\n  codepage = 1251 \r\nName=\"P\"\r\n";
        assert_eq!(detect_project_codepage(stream), Some(WINDOWS_1251));
        // Directives after the first section header are ignored.
        assert_eq!(
            detect_project_codepage(b"Name=\"P\"\r\n[Workspace]\r\nCodePage=932\r\n"),
            None
        );
    }

    #[test]
    fn parses_attributes_with_quoted_values() {
        let attrs = parse_attributes(
            "Attribute VB_Name = \"Module1\"\r\nAttribute VB_Exposed = False\r\nSub X()\r\n",
        );
        assert_eq!(attrs.get("VB_Name").map(String::as_str), Some("Module1"));
        assert_eq!(attrs.get("VB_Exposed").map(String::as_str), Some("False"));
        assert_eq!(attrs.len(), 2);
    }

    #[test]
    fn guesses_text_offset_past_stream_header() {
        let mut stream = vec![0x01, 0x00, 0x00, 0xAA, 0xBB];
        let container = compress_container(b"Sub A()\r\nEnd Sub\r\n");
        stream.extend_from_slice(&container);
        assert_eq!(guess_text_offset(&stream), 5);
    }

    #[test]
    fn respects_dir_codepage_for_module_source() {
        let code = "Attribute VB_Name = \"Module1\"\r\nSub Hello()\r\n'привет\r\nEnd Sub\r\n";
        let (code_bytes, _, _) = WINDOWS_1251.encode(code);
        let module_container = compress_container(code_bytes.as_ref());

        let mut dir = Vec::new();
        push_record(&mut dir, 0x0003, &1251u16.to_le_bytes());
        let (project_name, _, _) = WINDOWS_1251.encode("Проект");
        push_record(&mut dir, 0x0004, project_name.as_ref());
        push_record(&mut dir, 0x0019, b"Module1");
        push_record(&mut dir, 0x001A, b"Module1\0\0");
        push_record(&mut dir, 0x0021, &[]);
        push_record(&mut dir, 0x0031, &0u32.to_le_bytes());

        let mut ole = cfb::CompoundFile::create(Cursor::new(Vec::new())).expect("create cfb");
        ole.create_storage("VBA").expect("VBA storage");
        {
            let mut s = ole.create_stream("VBA/dir").expect("dir stream");
            s.write_all(&compress_container(&dir)).expect("write dir");
        }
        {
            let mut s = ole.create_stream("VBA/Module1").expect("module stream");
            s.write_all(&module_container).expect("write module");
        }
        let vba_bin = ole.into_inner().into_inner();

        let project = VBAProject::parse(&vba_bin).expect("parse");
        assert_eq!(project.name.as_deref(), Some("Проект"));
        assert_eq!(project.codepage, Some(1251));
        assert_eq!(project.modules.len(), 1);
        let module = &project.modules[0];
        assert!(module.code.contains("привет"));
        assert_eq!(module.module_type, DirModuleType::Procedural);
        assert_eq!(module.attributes.get("VB_Name").map(String::as_str), Some("Module1"));
    }

    #[test]
    fn missing_dir_stream_is_an_error() {
        let mut ole = cfb::CompoundFile::create(Cursor::new(Vec::new())).expect("create cfb");
        {
            let mut s = ole.create_stream("PROJECT").expect("PROJECT stream");
            s.write_all(b"Name=\"P\"\r\n").expect("write PROJECT");
        }
        let vba_bin = ole.into_inner().into_inner();
        assert!(matches!(
            VBAProject::parse(&vba_bin),
            Err(ParseError::MissingStream("VBA/dir"))
        ));
    }
}
