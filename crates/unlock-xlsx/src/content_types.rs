//! `[Content_Types].xml` inspection and streaming edits.

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::xml::{attr_value, local_name, prefixed_tag};
use crate::zip_util::part_names_equivalent;
use crate::PackageError;

pub const CONTENT_TYPES_PART: &str = "[Content_Types].xml";

pub const CT_RELATIONSHIPS: &str = "application/vnd.openxmlformats-package.relationships+xml";
pub const CT_XML: &str = "application/xml";
pub const CT_VML: &str = "application/vnd.openxmlformats-officedocument.vmlDrawing";
pub const CT_VBA_PROJECT: &str = "application/vnd.ms-office.vbaProject";
pub const CT_VBA_SIGNATURE: &str = "application/vnd.ms-office.vbaProjectSignature";
pub const CT_WORKBOOK: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml";
pub const CT_WORKBOOK_MACRO_ENABLED: &str = "application/vnd.ms-excel.sheet.macroEnabled.main+xml";
pub const CT_WORKSHEET: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml";
pub const CT_CHARTSHEET: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.chartsheet+xml";
pub const CT_STYLES: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml";
pub const CT_SHARED_STRINGS: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sharedStrings+xml";
pub const CT_THEME: &str = "application/vnd.openxmlformats-officedocument.theme+xml";
pub const CT_CORE_PROPERTIES: &str = "application/vnd.openxmlformats-package.core-properties+xml";
pub const CT_EXTENDED_PROPERTIES: &str =
    "application/vnd.openxmlformats-officedocument.extended-properties+xml";
pub const CT_CUSTOM_PROPERTIES: &str =
    "application/vnd.openxmlformats-officedocument.custom-properties+xml";

/// `<Default>` content type for a file extension that packages commonly carry.
pub fn default_for_extension(ext: &str) -> Option<&'static str> {
    let ct = match ext.to_ascii_lowercase().as_str() {
        "rels" => CT_RELATIONSHIPS,
        "xml" => CT_XML,
        "bin" => CT_VBA_PROJECT,
        "vml" => CT_VML,
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "emf" => "image/x-emf",
        "wmf" => "image/x-wmf",
        "tif" | "tiff" => "image/tiff",
        "svg" => "image/svg+xml",
        _ => return None,
    };
    Some(ct)
}

/// `<Override>` content type for well-known part names (without a leading `/`).
pub fn override_for_part(part: &str, macro_enabled: bool) -> Option<&'static str> {
    let lower = part.trim_start_matches('/').to_ascii_lowercase();
    let numbered = |prefix: &str| {
        lower
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(".xml"))
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    };

    let ct = match lower.as_str() {
        "xl/workbook.xml" if macro_enabled => CT_WORKBOOK_MACRO_ENABLED,
        "xl/workbook.xml" => CT_WORKBOOK,
        "xl/vbaproject.bin" => CT_VBA_PROJECT,
        "xl/styles.xml" => CT_STYLES,
        "xl/sharedstrings.xml" => CT_SHARED_STRINGS,
        "docprops/core.xml" => CT_CORE_PROPERTIES,
        "docprops/app.xml" => CT_EXTENDED_PROPERTIES,
        "docprops/custom.xml" => CT_CUSTOM_PROPERTIES,
        _ if numbered("xl/worksheets/sheet") => CT_WORKSHEET,
        _ if numbered("xl/chartsheets/sheet") => CT_CHARTSHEET,
        _ if numbered("xl/theme/theme") => CT_THEME,
        _ => return None,
    };
    Some(ct)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentTypeEntry {
    Default {
        extension: String,
        content_type: String,
    },
    Override {
        part_name: String,
        content_type: String,
    },
}

impl ContentTypeEntry {
    pub fn new_default(extension: &str, content_type: &str) -> Self {
        Self::Default {
            extension: extension.to_string(),
            content_type: content_type.to_string(),
        }
    }

    /// `part` may be given with or without the leading `/`.
    pub fn new_override(part: &str, content_type: &str) -> Self {
        Self::Override {
            part_name: format!("/{}", part.trim_start_matches('/')),
            content_type: content_type.to_string(),
        }
    }

    fn content_type(&self) -> &str {
        match self {
            Self::Default { content_type, .. } | Self::Override { content_type, .. } => content_type,
        }
    }

    fn local_tag(&self) -> &'static str {
        match self {
            Self::Default { .. } => "Default",
            Self::Override { .. } => "Override",
        }
    }

    fn to_start(&self, tag: &str) -> BytesStart<'static> {
        let mut el = BytesStart::new(tag.to_string());
        match self {
            Self::Default { extension, .. } => el.push_attribute(("Extension", extension.as_str())),
            Self::Override { part_name, .. } => el.push_attribute(("PartName", part_name.as_str())),
        }
        el.push_attribute(("ContentType", self.content_type()));
        el
    }
}

/// Every `<Default>` and `<Override>` entry, in document order.
pub fn parse_content_types(xml: &[u8]) -> Result<Vec<ContentTypeEntry>, PackageError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut entries = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) | Event::Empty(ref e) => {
                if let Some(entry) = entry_from_start(e)? {
                    entries.push(entry);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(entries)
}

fn entry_from_start(e: &BytesStart<'_>) -> Result<Option<ContentTypeEntry>, PackageError> {
    let name = e.name();
    let content_type = attr_value(e, b"ContentType")?.unwrap_or_default();
    match local_name(name.as_ref()) {
        b"Default" => Ok(attr_value(e, b"Extension")?.map(|extension| ContentTypeEntry::Default {
            extension,
            content_type,
        })),
        b"Override" => Ok(attr_value(e, b"PartName")?.map(|part_name| ContentTypeEntry::Override {
            part_name,
            content_type,
        })),
        _ => Ok(None),
    }
}

pub enum EntryEdit {
    Keep,
    Drop,
    SetContentType(String),
}

/// Stream `[Content_Types].xml`, applying `edit` to each existing entry and appending `additions`
/// before `</Types>`. Returns `Ok(None)` when nothing changed.
pub fn edit_content_types(
    xml: &[u8],
    mut edit: impl FnMut(&ContentTypeEntry) -> EntryEdit,
    additions: &[ContentTypeEntry],
) -> Result<Option<Vec<u8>>, PackageError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + 128 * additions.len()));
    let mut buf = Vec::new();
    let mut changed = false;
    let mut skipping = false;

    let write_additions =
        |writer: &mut Writer<Vec<u8>>, types_name: &[u8]| -> Result<(), PackageError> {
            for entry in additions {
                let tag = prefixed_tag(types_name, entry.local_tag());
                writer.write_event(Event::Empty(entry.to_start(&tag)))?;
            }
            Ok(())
        };

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => break,
            Event::End(ref e) if skipping => {
                if matches!(local_name(e.name().as_ref()), b"Default" | b"Override") {
                    skipping = false;
                }
            }
            _ if skipping => {}
            Event::Start(ref e) | Event::Empty(ref e)
                if matches!(local_name(e.name().as_ref()), b"Default" | b"Override") =>
            {
                let is_start = matches!(event, Event::Start(_));
                let edited = match entry_from_start(e)? {
                    Some(entry) => edit(&entry),
                    None => EntryEdit::Keep,
                };
                match edited {
                    EntryEdit::Keep => writer.write_event(event.borrow())?,
                    EntryEdit::Drop => {
                        changed = true;
                        skipping = is_start;
                    }
                    EntryEdit::SetContentType(ct) => {
                        let mut patched = BytesStart::new(
                            String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                        );
                        for attr in e.attributes().with_checks(false) {
                            let attr = attr?;
                            if local_name(attr.key.as_ref()) != b"ContentType" {
                                patched.push_attribute((attr.key.as_ref(), attr.value.as_ref()));
                            }
                        }
                        patched.push_attribute(("ContentType", ct.as_str()));
                        changed = true;
                        writer.write_event(if is_start {
                            Event::Start(patched)
                        } else {
                            Event::Empty(patched)
                        })?;
                    }
                }
            }
            Event::End(ref e) if local_name(e.name().as_ref()) == b"Types" => {
                if !additions.is_empty() {
                    changed = true;
                    write_additions(&mut writer, e.name().as_ref())?;
                }
                writer.write_event(event.borrow())?;
            }
            Event::Empty(ref e) if local_name(e.name().as_ref()) == b"Types" => {
                if additions.is_empty() {
                    writer.write_event(event.borrow())?;
                } else {
                    changed = true;
                    let types_name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    writer.write_event(Event::Start(e.borrow()))?;
                    write_additions(&mut writer, types_name.as_bytes())?;
                    writer.write_event(Event::End(BytesEnd::new(types_name)))?;
                }
            }
            other => writer.write_event(other)?,
        }
        buf.clear();
    }

    Ok(changed.then(|| writer.into_inner()))
}

/// Make `part` carry exactly one `<Override>` with `content_type`: patch a mismatching entry,
/// drop duplicates, or append one.
pub fn ensure_override(
    xml: &[u8],
    part: &str,
    content_type: &str,
) -> Result<Option<Vec<u8>>, PackageError> {
    let mut seen = false;
    let addition = [ContentTypeEntry::new_override(part, content_type)];
    let exists = parse_content_types(xml)?.iter().any(|entry| {
        matches!(entry, ContentTypeEntry::Override { part_name, .. } if part_names_equivalent(part_name, part))
    });
    let additions: &[ContentTypeEntry] = if exists { &[] } else { &addition };
    edit_content_types(
        xml,
        |entry| match entry {
            ContentTypeEntry::Override {
                part_name,
                content_type: existing,
            } if part_names_equivalent(part_name, part) => {
                if seen {
                    EntryEdit::Drop
                } else {
                    seen = true;
                    if existing.trim() == content_type {
                        EntryEdit::Keep
                    } else {
                        EntryEdit::SetContentType(content_type.to_string())
                    }
                }
            }
            _ => EntryEdit::Keep,
        },
        additions,
    )
}

/// Drop every `<Override>` whose part name satisfies `pred`. Returns the removed part names.
pub fn remove_overrides(
    xml: &[u8],
    mut pred: impl FnMut(&str) -> bool,
) -> Result<Option<(Vec<u8>, Vec<String>)>, PackageError> {
    let mut removed = Vec::new();
    let out = edit_content_types(
        xml,
        |entry| match entry {
            ContentTypeEntry::Override { part_name, .. } if pred(part_name) => {
                removed.push(part_name.clone());
                EntryEdit::Drop
            }
            _ => EntryEdit::Keep,
        },
        &[],
    )?;
    Ok(out.map(|bytes| (bytes, removed)))
}

pub fn minimal_content_types() -> Vec<u8> {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
         <Types xmlns=\"http://schemas.openxmlformats.org/package/2006/content-types\">\
         <Default Extension=\"rels\" ContentType=\"{CT_RELATIONSHIPS}\"/>\
         <Default Extension=\"xml\" ContentType=\"{CT_XML}\"/>\
         </Types>"
    )
    .into_bytes()
}
