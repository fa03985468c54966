#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const CONTENT_TYPES_PREFIX: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Default Extension="bin" ContentType="application/vnd.ms-office.vbaProject"/>"#;

pub const WORKBOOK_MACRO_CT: &str = "application/vnd.ms-excel.sheet.macroEnabled.main+xml";
pub const WORKSHEET_CT: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml";
pub const VBA_CT: &str = "application/vnd.ms-office.vbaProject";

const REL_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
const OFFICE_DOCUMENT: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument";
const WORKSHEET: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet";
const VBA_PROJECT: &str = "http://schemas.microsoft.com/office/2006/relationships/vbaProject";

pub const EMPTY_SHEET: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData/></worksheet>"#;

/// A macro-enabled workbook assembled part by part.
#[derive(Debug, Clone)]
pub struct WorkbookFixture {
    parts: BTreeMap<String, Vec<u8>>,
}

impl WorkbookFixture {
    /// A consistent workbook with the given sheets and, when `vba` is set, `xl/vbaProject.bin`.
    pub fn new(sheet_names: &[&str], vba: Option<&[u8]>) -> Self {
        let mut overrides = format!(
            r#"<Override PartName="/xl/workbook.xml" ContentType="{WORKBOOK_MACRO_CT}"/>"#
        );
        let mut sheets = String::new();
        let mut rels = String::new();
        let mut parts = BTreeMap::new();
        for (i, name) in sheet_names.iter().enumerate() {
            let n = i + 1;
            overrides.push_str(&format!(
                r#"<Override PartName="/xl/worksheets/sheet{n}.xml" ContentType="{WORKSHEET_CT}"/>"#
            ));
            sheets.push_str(&format!(r#"<sheet name="{name}" sheetId="{n}" r:id="rId{n}"/>"#));
            rels.push_str(&format!(
                r#"<Relationship Id="rId{n}" Type="{WORKSHEET}" Target="worksheets/sheet{n}.xml"/>"#
            ));
            parts.insert(
                format!("xl/worksheets/sheet{n}.xml"),
                EMPTY_SHEET.as_bytes().to_vec(),
            );
        }
        if let Some(vba) = vba {
            let n = sheet_names.len() + 1;
            overrides.push_str(&format!(
                r#"<Override PartName="/xl/vbaProject.bin" ContentType="{VBA_CT}"/>"#
            ));
            rels.push_str(&format!(
                r#"<Relationship Id="rId{n}" Type="{VBA_PROJECT}" Target="vbaProject.bin"/>"#
            ));
            parts.insert("xl/vbaProject.bin".to_string(), vba.to_vec());
        }

        parts.insert(
            "[Content_Types].xml".to_string(),
            format!("{CONTENT_TYPES_PREFIX}{overrides}</Types>").into_bytes(),
        );
        parts.insert(
            "_rels/.rels".to_string(),
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="{REL_NS}"><Relationship Id="rId1" Type="{OFFICE_DOCUMENT}" Target="xl/workbook.xml"/></Relationships>"#
            )
            .into_bytes(),
        );
        parts.insert(
            "xl/workbook.xml".to_string(),
            workbook_xml(&sheets).into_bytes(),
        );
        parts.insert(
            "xl/_rels/workbook.xml.rels".to_string(),
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="{REL_NS}">{rels}</Relationships>"#
            )
            .into_bytes(),
        );
        Self { parts }
    }

    pub fn with_part(mut self, name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.parts.insert(name.to_string(), bytes.into());
        self
    }

    pub fn without_part(mut self, name: &str) -> Self {
        self.parts.remove(name);
        self
    }

    /// Replace the `<sheets>` element body of the workbook part.
    pub fn with_sheets_xml(self, sheets: &str) -> Self {
        let xml = workbook_xml(sheets);
        self.with_part("xl/workbook.xml", xml)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::<()>::default().compression_method(CompressionMethod::Stored);
        for (name, bytes) in &self.parts {
            zip.start_file(name.as_str(), options).expect("start_file");
            zip.write_all(bytes).expect("write entry bytes");
        }
        zip.finish().expect("finish").into_inner()
    }
}

fn workbook_xml(sheets: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>{sheets}</sheets></workbook>"#
    )
}

pub fn read_part(zip_bytes: &[u8], name: &str) -> Option<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(zip_bytes)).expect("open zip");
    let mut file = archive.by_name(name).ok()?;
    let mut out = Vec::new();
    file.read_to_end(&mut out).expect("read part");
    Some(out)
}

pub fn read_part_string(zip_bytes: &[u8], name: &str) -> String {
    String::from_utf8(read_part(zip_bytes, name).expect("part present")).expect("utf-8 part")
}

/// A raw (non compound-file) project buffer carrying a `DPB` password hash.
pub fn vba_with_dpb() -> Vec<u8> {
    let mut buf = vec![0xCC, 0x61, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    buf.extend_from_slice(b"ID=\"{00000000-0000-0000-0000-000000000000}\"\r\n");
    buf.extend_from_slice(b"DPB=\"0E0CD1ECDFF4E7F5E7F5E7\"\r\n");
    buf.extend(std::iter::repeat(b'x').take(200));
    buf
}

/// A raw project buffer with no protection markers at all.
pub fn vba_without_markers() -> Vec<u8> {
    let mut buf = vec![0xCC, 0x61, 0x00, 0x00, 0x12, 0x34, 0x56, 0x78];
    buf.extend(std::iter::repeat(b'z').take(300));
    buf
}
