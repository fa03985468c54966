use std::collections::BTreeSet;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::xml::{local_name, prefixed_tag};
use crate::PackageError;

pub const REL_TYPE_OFFICE_DOCUMENT: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument";
pub const REL_TYPE_WORKSHEET: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet";
pub const REL_TYPE_STYLES: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles";
pub const REL_TYPE_SHARED_STRINGS: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/sharedStrings";
pub const REL_TYPE_CUSTOM_PROPERTIES: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/custom-properties";
pub const REL_TYPE_VBA_PROJECT: &str =
    "http://schemas.microsoft.com/office/2006/relationships/vbaProject";
pub const REL_TYPE_VBA_SIGNATURE: &str =
    "http://schemas.microsoft.com/office/2006/relationships/vbaProjectSignature";
pub const REL_TYPE_VBA_SIGNATURE_AGILE: &str =
    "http://schemas.microsoft.com/office/2014/relationships/vbaProjectSignatureAgile";
pub const REL_TYPE_VBA_SIGNATURE_V3: &str =
    "http://schemas.microsoft.com/office/2020/07/relationships/vbaProjectSignatureV3";
pub const REL_TYPE_CTRL_PROP: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/ctrlProp";
pub const REL_TYPE_CONTROL: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/control";

const RELATIONSHIPS_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relationship {
    pub id: String,
    pub type_uri: String,
    pub target: String,
    pub target_mode: Option<String>,
}

impl Relationship {
    pub fn new(id: impl Into<String>, type_uri: &str, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_uri: type_uri.to_string(),
            target: target.into(),
            target_mode: None,
        }
    }

    pub fn is_external(&self) -> bool {
        self.target_mode
            .as_deref()
            .is_some_and(|mode| mode.trim().eq_ignore_ascii_case("External"))
    }

    fn to_start(&self, tag: &str) -> BytesStart<'static> {
        let mut el = BytesStart::new(tag.to_string());
        el.push_attribute(("Id", self.id.as_str()));
        el.push_attribute(("Type", self.type_uri.as_str()));
        el.push_attribute(("Target", self.target.as_str()));
        if let Some(mode) = &self.target_mode {
            el.push_attribute(("TargetMode", mode.as_str()));
        }
        el
    }
}

/// `xl/workbook.xml` -> `xl/_rels/workbook.xml.rels`.
pub fn rels_part_name(part_name: &str) -> String {
    let part_name = part_name.trim_start_matches('/');
    let (dir, file) = part_name.rsplit_once('/').unwrap_or(("", part_name));
    if dir.is_empty() {
        format!("_rels/{file}.rels")
    } else {
        format!("{dir}/_rels/{file}.rels")
    }
}

/// The part a `.rels` part describes; `_rels/.rels` maps to the package root (`""`).
pub fn source_part_for_rels(rels_part: &str) -> Option<String> {
    let rels_part = rels_part.trim_start_matches('/');
    let (dir, file) = rels_part.rsplit_once('/').unwrap_or(("", rels_part));
    let file = file.strip_suffix(".rels")?;
    let base = if dir == "_rels" {
        ""
    } else {
        dir.strip_suffix("/_rels")?
    };
    Some(if base.is_empty() {
        file.to_string()
    } else {
        format!("{base}/{file}")
    })
}

/// Resolve a relationship `target` against the part that owns the relationship.
///
/// Fragments are dropped, absolute targets are rooted at the package, `.` and `..` segments are
/// collapsed. The result has no leading `/`.
pub fn resolve_target(base_part: &str, target: &str) -> String {
    let target = target.split_once('#').map(|(base, _)| base).unwrap_or(target);
    if target.is_empty() {
        return base_part.trim_start_matches('/').to_string();
    }

    let (target, is_absolute) = match target.strip_prefix('/') {
        Some(target) => (target, true),
        None => (target, false),
    };
    let base_dir = if is_absolute {
        ""
    } else {
        base_part.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
    };

    let mut components: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            _ => components.push(segment),
        }
    }
    components.join("/")
}

/// Relative target from `source_part` to `target_part`, the inverse of [`resolve_target`].
pub fn relative_target(source_part: &str, target_part: &str) -> String {
    let source_dir: Vec<&str> = source_part
        .trim_start_matches('/')
        .rsplit_once('/')
        .map(|(dir, _)| dir.split('/').collect())
        .unwrap_or_default();
    let target: Vec<&str> = target_part.trim_start_matches('/').split('/').collect();

    let common = source_dir
        .iter()
        .zip(&target)
        .take_while(|(a, b)| a.eq_ignore_ascii_case(b))
        .count()
        .min(target.len().saturating_sub(1));
    let mut segments: Vec<&str> = std::iter::repeat("..")
        .take(source_dir.len() - common)
        .collect();
    segments.extend(&target[common..]);
    segments.join("/")
}

pub fn parse_relationships(xml: &[u8]) -> Result<Vec<Relationship>, PackageError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut relationships = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) | Event::Empty(ref e) => {
                if let Some(rel) = relationship_from_start(e)? {
                    relationships.push(rel);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(relationships)
}

fn relationship_from_start(e: &BytesStart<'_>) -> Result<Option<Relationship>, PackageError> {
    if !local_name(e.name().as_ref()).eq_ignore_ascii_case(b"Relationship") {
        return Ok(None);
    }
    let mut id = None;
    let mut target = None;
    let mut type_uri = None;
    let mut target_mode = None;
    for attr in e.attributes().with_checks(false) {
        let attr = attr?;
        let key = local_name(attr.key.as_ref());
        let value = attr.unescape_value()?.into_owned();
        if key.eq_ignore_ascii_case(b"Id") {
            id = Some(value);
        } else if key.eq_ignore_ascii_case(b"Target") {
            target = Some(value);
        } else if key.eq_ignore_ascii_case(b"Type") {
            type_uri = Some(value);
        } else if key.eq_ignore_ascii_case(b"TargetMode") {
            target_mode = Some(value);
        }
    }
    Ok(match (id, target, type_uri) {
        (Some(id), Some(target), Some(type_uri)) => Some(Relationship {
            id,
            type_uri,
            target,
            target_mode,
        }),
        _ => None,
    })
}

pub enum RelEdit {
    Keep,
    Drop,
    SetId(String),
}

/// Stream a `.rels` part, applying `edit` to each `<Relationship>` and appending `additions`
/// before `</Relationships>`. Returns `Ok(None)` when nothing changed.
pub fn edit_relationships(
    xml: &[u8],
    mut edit: impl FnMut(&Relationship) -> RelEdit,
    additions: &[Relationship],
) -> Result<Option<Vec<u8>>, PackageError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + additions.len() * 160));
    let mut buf = Vec::new();
    let mut changed = false;
    let mut skipping = false;

    let write_additions =
        |writer: &mut Writer<Vec<u8>>, root_name: &[u8]| -> Result<(), PackageError> {
            let tag = prefixed_tag(root_name, "Relationship");
            for rel in additions {
                writer.write_event(Event::Empty(rel.to_start(&tag)))?;
            }
            Ok(())
        };

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => break,
            Event::End(ref e) if skipping => {
                if local_name(e.name().as_ref()).eq_ignore_ascii_case(b"Relationship") {
                    skipping = false;
                }
            }
            _ if skipping => {}
            Event::Start(ref e) | Event::Empty(ref e)
                if local_name(e.name().as_ref()).eq_ignore_ascii_case(b"Relationship") =>
            {
                let is_start = matches!(event, Event::Start(_));
                let edited = match relationship_from_start(e)? {
                    Some(rel) => edit(&rel),
                    None => RelEdit::Keep,
                };
                match edited {
                    RelEdit::Keep => writer.write_event(event.borrow())?,
                    RelEdit::Drop => {
                        changed = true;
                        skipping = is_start;
                    }
                    RelEdit::SetId(id) => {
                        let mut patched = BytesStart::new(
                            String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                        );
                        for attr in e.attributes().with_checks(false) {
                            let attr = attr?;
                            if local_name(attr.key.as_ref()).eq_ignore_ascii_case(b"Id") {
                                patched.push_attribute((attr.key.as_ref(), id.as_bytes()));
                            } else {
                                patched.push_attribute((attr.key.as_ref(), attr.value.as_ref()));
                            }
                        }
                        changed = true;
                        writer.write_event(if is_start {
                            Event::Start(patched)
                        } else {
                            Event::Empty(patched)
                        })?;
                    }
                }
            }
            Event::End(ref e) if local_name(e.name().as_ref()) == b"Relationships" => {
                if !additions.is_empty() {
                    changed = true;
                    write_additions(&mut writer, e.name().as_ref())?;
                }
                writer.write_event(event.borrow())?;
            }
            Event::Empty(ref e) if local_name(e.name().as_ref()) == b"Relationships" => {
                if additions.is_empty() {
                    writer.write_event(event.borrow())?;
                } else {
                    changed = true;
                    let root_name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    writer.write_event(Event::Start(e.borrow()))?;
                    write_additions(&mut writer, root_name.as_bytes())?;
                    writer.write_event(Event::End(BytesEnd::new(root_name)))?;
                }
            }
            other => writer.write_event(other)?,
        }
        buf.clear();
    }

    Ok(changed.then(|| writer.into_inner()))
}

/// Smallest `rId{n}` (n >= 1) not in `taken`.
pub fn next_relationship_id<'a>(taken: impl IntoIterator<Item = &'a str>) -> String {
    let taken: BTreeSet<&str> = taken.into_iter().collect();
    (1u32..)
        .map(|n| format!("rId{n}"))
        .find(|id| !taken.contains(id.as_str()))
        .unwrap_or_default()
}

pub fn empty_relationships_xml() -> Vec<u8> {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
         <Relationships xmlns=\"{RELATIONSHIPS_NS}\"></Relationships>"
    )
    .into_bytes()
}
