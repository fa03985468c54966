use std::collections::BTreeMap;
use std::io::{Cursor, Write};

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::content_types::{parse_content_types, ContentTypeEntry, CONTENT_TYPES_PART, CT_VBA_PROJECT};
use crate::openxml::{
    parse_relationships, rels_part_name, resolve_target, REL_TYPE_OFFICE_DOCUMENT,
    REL_TYPE_VBA_PROJECT,
};
use crate::xml::{attr_value, check_well_formed, local_name};
use crate::zip_util::{
    part_name_lookup_key, read_zip_file_bytes_with_budget, InflateBudget, DEFAULT_MAX_PART_BYTES,
    DEFAULT_MAX_TOTAL_BYTES,
};

pub const ROOT_RELS_PART: &str = "_rels/.rels";
pub const WORKBOOK_PART: &str = "xl/workbook.xml";
pub const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
pub const VBA_PROJECT_PART: &str = "xl/vbaProject.bin";

/// Parts every loadable workbook package carries.
pub const REQUIRED_PARTS: [&str; 3] = [CONTENT_TYPES_PART, ROOT_RELS_PART, WORKBOOK_PART];

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("xml error: {0}")]
    RoXml(#[from] roxmltree::Error),
    #[error("xml attribute error: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),
    #[error("xml part is not valid utf-8")]
    NotUtf8,
    #[error("input is not a zip archive")]
    NotAZip,
    #[error("missing package part: {0}")]
    MissingPart(String),
    #[error(
        "package part is too large to load safely: {part} is {size} bytes (max {max} bytes)"
    )]
    PartTooLarge { part: String, size: u64, max: u64 },
    #[error("package is too large to load safely: {total} bytes uncompressed (max {max})")]
    PackageTooLarge { total: u64, max: u64 },
}

/// Inflate budgets applied while reading a package into memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageLimits {
    pub max_part_bytes: u64,
    pub max_total_bytes: u64,
}

impl Default for PackageLimits {
    fn default() -> Self {
        Self {
            max_part_bytes: DEFAULT_MAX_PART_BYTES,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
        }
    }
}

/// Result of one edit applied to one part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PartOutcome {
    Modified,
    Unchanged,
    /// The edit failed or produced a document that does not parse; the part was left untouched.
    Skipped { reason: String },
}

impl PartOutcome {
    pub fn is_modified(&self) -> bool {
        matches!(self, PartOutcome::Modified)
    }
}

/// One `<sheet>` entry of `xl/workbook.xml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetEntry {
    pub name: Option<String>,
    pub sheet_id: Option<String>,
    pub rel_id: Option<String>,
}

/// An Office Open XML package held fully in memory.
///
/// Stored part names are kept as found in the archive; lookups go through
/// [`crate::part_names_equivalent`] so producers that disagree on case, separators or
/// percent-encoding still resolve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfficePackage {
    parts: BTreeMap<String, Vec<u8>>,
}

impl OfficePackage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PackageError> {
        Self::from_bytes_limited(bytes, PackageLimits::default())
    }

    pub fn from_bytes_limited(bytes: &[u8], limits: PackageLimits) -> Result<Self, PackageError> {
        let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|err| match err {
            zip::result::ZipError::InvalidArchive(_) | zip::result::ZipError::UnsupportedArchive(_) => {
                PackageError::NotAZip
            }
            other => PackageError::Zip(other),
        })?;

        let mut parts = BTreeMap::new();
        let mut budget = InflateBudget::new(limits.max_total_bytes);
        for i in 0..zip.len() {
            let mut file = zip.by_index(i)?;
            if !file.is_file() {
                continue;
            }

            let name = file.name().to_string();
            let buf =
                read_zip_file_bytes_with_budget(&mut file, &name, limits.max_part_bytes, &mut budget)?;
            parts.insert(name, buf);
        }
        log::debug!("loaded package with {} parts", parts.len());

        Ok(Self { parts })
    }

    pub fn from_parts(parts: impl IntoIterator<Item = (String, Vec<u8>)>) -> Self {
        Self {
            parts: parts.into_iter().collect(),
        }
    }

    /// The stored key of the part equivalent to `name`.
    pub fn part_key(&self, name: &str) -> Option<&str> {
        if let Some((key, _)) = self.parts.get_key_value(name) {
            return Some(key.as_str());
        }
        let wanted = part_name_lookup_key(name);
        self.parts
            .keys()
            .find(|key| part_name_lookup_key(key) == wanted)
            .map(String::as_str)
    }

    pub fn part(&self, name: &str) -> Option<&[u8]> {
        let key = self.part_key(name)?;
        self.parts.get(key).map(Vec::as_slice)
    }

    pub fn has_part(&self, name: &str) -> bool {
        self.part_key(name).is_some()
    }

    /// Replace an existing equivalent part in place, or insert `name` as given.
    pub fn set_part(&mut self, name: &str, bytes: Vec<u8>) {
        let key = self
            .part_key(name)
            .map(str::to_string)
            .unwrap_or_else(|| name.trim_start_matches('/').to_string());
        self.parts.insert(key, bytes);
    }

    pub fn remove_part(&mut self, name: &str) -> Option<Vec<u8>> {
        let key = self.part_key(name)?.to_string();
        self.parts.remove(&key)
    }

    pub fn part_names(&self) -> impl Iterator<Item = &str> {
        self.parts.keys().map(String::as_str)
    }

    pub fn parts(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.parts
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
    }

    /// Run `edit` over an XML part and write the result back only if it is still well-formed.
    pub(crate) fn edit_xml_part(
        &mut self,
        name: &str,
        edit: impl FnOnce(&[u8]) -> Result<Option<Vec<u8>>, PackageError>,
    ) -> PartOutcome {
        let Some(bytes) = self.part(name) else {
            return PartOutcome::Skipped {
                reason: format!("{name} not found"),
            };
        };
        let edited = edit(bytes).and_then(|out| match out {
            Some(out) => check_well_formed(&out).map(|()| Some(out)),
            None => Ok(None),
        });
        match edited {
            Ok(Some(out)) => {
                self.set_part(name, out);
                PartOutcome::Modified
            }
            Ok(None) => PartOutcome::Unchanged,
            Err(err) => {
                log::warn!("leaving {name} untouched: {err}");
                PartOutcome::Skipped {
                    reason: err.to_string(),
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Fail with the first required part that is absent.
    pub fn validate(&self) -> Result<(), PackageError> {
        match REQUIRED_PARTS.iter().find(|part| !self.has_part(part)) {
            Some(missing) => Err(PackageError::MissingPart((*missing).to_string())),
            None => Ok(()),
        }
    }

    /// The workbook part, following the root `officeDocument` relationship when present.
    pub fn workbook_part(&self) -> String {
        let from_rels = self
            .part(ROOT_RELS_PART)
            .and_then(|bytes| parse_relationships(bytes).ok())
            .and_then(|rels| {
                rels.into_iter()
                    .find(|rel| rel.type_uri == REL_TYPE_OFFICE_DOCUMENT && !rel.is_external())
            })
            .map(|rel| resolve_target("", &rel.target))
            .filter(|part| self.has_part(part));
        from_rels.unwrap_or_else(|| WORKBOOK_PART.to_string())
    }

    /// Locate the VBA project part: the workbook `vbaProject` relationship first, then the
    /// conventional path, then any part named `vbaProject.bin`.
    pub fn vba_project_part(&self) -> Option<String> {
        let workbook = self.workbook_part();
        let via_rels = self
            .part(&rels_part_name(&workbook))
            .and_then(|bytes| parse_relationships(bytes).ok())
            .into_iter()
            .flatten()
            .filter(|rel| rel.type_uri == REL_TYPE_VBA_PROJECT && !rel.is_external())
            .map(|rel| resolve_target(&workbook, &rel.target))
            .find_map(|part| self.part_key(&part).map(str::to_string));
        if via_rels.is_some() {
            return via_rels;
        }

        if let Some(key) = self.part_key(VBA_PROJECT_PART) {
            return Some(key.to_string());
        }

        self.parts
            .keys()
            .find(|key| {
                key.rsplit(['/', '\\'])
                    .next()
                    .is_some_and(|file| file.eq_ignore_ascii_case("vbaProject.bin"))
            })
            .cloned()
    }

    /// Whether package metadata declares a VBA project, regardless of whether its bytes exist.
    pub fn declares_vba_project(&self) -> bool {
        let declared_by_types = self
            .part(CONTENT_TYPES_PART)
            .and_then(|bytes| parse_content_types(bytes).ok())
            .is_some_and(|entries| {
                entries.iter().any(|entry| {
                    matches!(entry, ContentTypeEntry::Override { content_type, .. } if content_type.trim() == CT_VBA_PROJECT)
                })
            });
        let declared_by_rels = self
            .part(&rels_part_name(&self.workbook_part()))
            .and_then(|bytes| parse_relationships(bytes).ok())
            .is_some_and(|rels| rels.iter().any(|rel| rel.type_uri == REL_TYPE_VBA_PROJECT));
        declared_by_types || declared_by_rels
    }

    /// `<sheet>` entries of the workbook part in document order.
    pub fn workbook_sheets(&self) -> Result<Vec<SheetEntry>, PackageError> {
        let workbook = self.workbook_part();
        let bytes = self
            .part(&workbook)
            .ok_or_else(|| PackageError::MissingPart(workbook.clone()))?;
        parse_workbook_sheets(bytes)
    }

    pub fn sheet_names(&self) -> Result<Vec<String>, PackageError> {
        Ok(self
            .workbook_sheets()?
            .into_iter()
            .filter_map(|sheet| sheet.name)
            .collect())
    }

    pub fn write_to_bytes(&self) -> Result<Vec<u8>, PackageError> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Serialize with maximum deflate compression. `[Content_Types].xml` and `_rels/.rels` are
    /// written first; the remaining parts follow in name order.
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<(), PackageError> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .compression_level(Some(9));

        let leading: Vec<&str> = [CONTENT_TYPES_PART, ROOT_RELS_PART]
            .iter()
            .filter_map(|name| self.part_key(name))
            .collect();
        let ordered = leading.iter().copied().chain(
            self.parts
                .keys()
                .map(String::as_str)
                .filter(|name| !leading.contains(name)),
        );

        for name in ordered {
            zip.start_file(name, options)?;
            zip.write_all(&self.parts[name])?;
        }

        let cursor = zip.finish()?;
        w.write_all(&cursor.into_inner())?;
        Ok(())
    }
}

pub(crate) fn parse_workbook_sheets(xml: &[u8]) -> Result<Vec<SheetEntry>, PackageError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut sheets = Vec::new();
    let mut in_sheets = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) if local_name(e.name().as_ref()) == b"sheets" => in_sheets = true,
            Event::End(ref e) if local_name(e.name().as_ref()) == b"sheets" => in_sheets = false,
            Event::Start(ref e) | Event::Empty(ref e)
                if in_sheets && local_name(e.name().as_ref()) == b"sheet" =>
            {
                sheets.push(SheetEntry {
                    name: attr_value(e, b"name")?,
                    sheet_id: attr_value(e, b"sheetId")?,
                    rel_id: relationship_id_attr(e)?,
                });
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(sheets)
}

/// The `r:id` attribute. Matched on a prefixed `id` so an unprefixed `id` is never mistaken for it.
pub(crate) fn relationship_id_attr(
    e: &quick_xml::events::BytesStart<'_>,
) -> Result<Option<String>, PackageError> {
    for attr in e.attributes().with_checks(false) {
        let attr = attr?;
        let key = attr.key.as_ref();
        if key.contains(&b':') && local_name(key) == b"id" {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use std::io::Write;

    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, bytes) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    const WORKBOOK: &[u8] = br#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Data" sheetId="1" r:id="rId1"/><sheet name="Summary" sheetId="2" r:id="rId2"/></sheets></workbook>"#;

    #[test]
    fn part_lookup_tolerates_producer_variations() {
        let pkg = OfficePackage::from_bytes(&zip_bytes(&[
            ("XL\\Workbook.xml", WORKBOOK),
            ("xl/media/image%201.png", &b"png"[..]),
        ]))
        .unwrap();
        assert!(pkg.part("/xl/workbook.xml").is_some());
        assert_eq!(pkg.part("xl/media/image 1.png"), Some(&b"png"[..]));
        assert_eq!(pkg.part_key("xl/workbook.xml"), Some("XL\\Workbook.xml"));
    }

    #[test]
    fn set_part_replaces_equivalent_key() {
        let mut pkg = OfficePackage::from_parts([("XL/Workbook.xml".to_string(), b"a".to_vec())]);
        pkg.set_part("/xl/workbook.xml", b"b".to_vec());
        assert_eq!(pkg.len(), 1);
        assert_eq!(pkg.part_names().collect::<Vec<_>>(), vec!["XL/Workbook.xml"]);
        assert_eq!(pkg.remove_part("xl/workbook.xml"), Some(b"b".to_vec()));
        assert!(pkg.is_empty());
    }

    #[test]
    fn rejects_non_zip_input() {
        assert!(matches!(
            OfficePackage::from_bytes(b"definitely not a zip"),
            Err(PackageError::NotAZip)
        ));
    }

    #[test]
    fn from_bytes_limited_rejects_parts_exceeding_part_limit() {
        let bytes = zip_bytes(&[("xl/workbook.xml", &[b'a'; 64][..])]);
        let err = OfficePackage::from_bytes_limited(
            &bytes,
            PackageLimits {
                max_part_bytes: 16,
                max_total_bytes: 1024,
            },
        )
        .unwrap_err();
        assert!(matches!(err, PackageError::PartTooLarge { size: 64, max: 16, .. }));
    }

    #[test]
    fn from_bytes_limited_rejects_packages_exceeding_total_limit() {
        let bytes = zip_bytes(&[("a.xml", &[b'a'; 40][..]), ("b.xml", &[b'b'; 40][..])]);
        let err = OfficePackage::from_bytes_limited(
            &bytes,
            PackageLimits {
                max_part_bytes: 64,
                max_total_bytes: 60,
            },
        )
        .unwrap_err();
        assert!(matches!(err, PackageError::PackageTooLarge { max: 60, .. }));
    }

    #[test]
    fn validate_names_missing_part() {
        let pkg = OfficePackage::from_parts([
            (CONTENT_TYPES_PART.to_string(), Vec::new()),
            (WORKBOOK_PART.to_string(), WORKBOOK.to_vec()),
        ]);
        match pkg.validate() {
            Err(PackageError::MissingPart(part)) => assert_eq!(part, ROOT_RELS_PART),
            other => panic!("expected missing part, got {other:?}"),
        }
    }

    #[test]
    fn finds_vba_project_through_workbook_relationship() {
        let rels = br#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId9" Type="http://schemas.microsoft.com/office/2006/relationships/vbaProject" Target="macros/project.bin"/></Relationships>"#;
        let pkg = OfficePackage::from_parts([
            (WORKBOOK_PART.to_string(), WORKBOOK.to_vec()),
            (WORKBOOK_RELS_PART.to_string(), rels.to_vec()),
            ("xl/macros/project.bin".to_string(), vec![0; 8]),
            ("xl/vbaProject.bin".to_string(), vec![1; 8]),
        ]);
        assert_eq!(pkg.vba_project_part().as_deref(), Some("xl/macros/project.bin"));
        assert!(pkg.declares_vba_project());

        let fallback = OfficePackage::from_parts([("custom/VBAPROJECT.BIN".to_string(), vec![0; 8])]);
        assert_eq!(fallback.vba_project_part().as_deref(), Some("custom/VBAPROJECT.BIN"));
        assert!(!fallback.declares_vba_project());
    }

    #[test]
    fn sheet_names_in_workbook_order() {
        let pkg = OfficePackage::from_parts([(WORKBOOK_PART.to_string(), WORKBOOK.to_vec())]);
        assert_eq!(pkg.sheet_names().unwrap(), vec!["Data", "Summary"]);
        assert_eq!(pkg.workbook_sheets().unwrap()[1].rel_id.as_deref(), Some("rId2"));
    }

    #[test]
    fn writes_content_types_first_and_round_trips() {
        let pkg = OfficePackage::from_parts([
            ("a/first.xml".to_string(), b"<a/>".to_vec()),
            (ROOT_RELS_PART.to_string(), b"<r/>".to_vec()),
            (CONTENT_TYPES_PART.to_string(), b"<t/>".to_vec()),
        ]);
        let bytes = pkg.write_to_bytes().unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.as_slice())).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec![CONTENT_TYPES_PART, ROOT_RELS_PART, "a/first.xml"]);
        assert_eq!(OfficePackage::from_bytes(&bytes).unwrap(), pkg);
    }
}
