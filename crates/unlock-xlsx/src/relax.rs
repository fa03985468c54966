//! XML-level removal of sheet/workbook protection and macro trust restrictions.
//!
//! Every operation works on one part at a time and reports a [`PartOutcome`]; a part whose edit
//! fails (or no longer parses) is left as it was.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};

use crate::content_types::{
    ensure_override, parse_content_types, remove_overrides, ContentTypeEntry, CONTENT_TYPES_PART,
    CT_CUSTOM_PROPERTIES, CT_VBA_SIGNATURE,
};
use crate::openxml::{
    edit_relationships, next_relationship_id, parse_relationships, rels_part_name,
    resolve_target, Relationship, RelEdit, REL_TYPE_CUSTOM_PROPERTIES, REL_TYPE_VBA_SIGNATURE,
    REL_TYPE_VBA_SIGNATURE_AGILE, REL_TYPE_VBA_SIGNATURE_V3,
};
use crate::package::{OfficePackage, PartOutcome, ROOT_RELS_PART, VBA_PROJECT_PART};
use crate::xml::{
    attr_value, local_name, prefixed_tag, remove_elements, upsert_root_child, with_document,
    RootChild,
};
use crate::zip_util::part_names_equivalent;
use crate::PackageError;

pub const CUSTOM_PROPERTIES_PART: &str = "docProps/custom.xml";
pub const TRUSTED_PROPERTY: &str = "Trusted";

pub const VBA_SIGNATURE_PARTS: [&str; 3] = [
    "xl/vbaProjectSignature.bin",
    "xl/vbaProjectSignatureAgile.bin",
    "xl/vbaProjectSignatureV3.bin",
];

const SIGNATURE_REL_TYPES: [&str; 3] = [
    REL_TYPE_VBA_SIGNATURE,
    REL_TYPE_VBA_SIGNATURE_AGILE,
    REL_TYPE_VBA_SIGNATURE_V3,
];

const CUSTOM_PROPERTIES_NS: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/custom-properties";
const VT_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/docPropsVTypes";
/// Format id Office uses for user-defined custom properties.
const CUSTOM_PROPERTY_FMTID: &str = "{D5CDD505-2E9C-101B-9397-08002B2CF9AE}";

const SHEET_PROTECTION_ELEMENTS: [&str; 2] = ["sheetProtection", "protectedRanges"];
const WORKBOOK_PROTECTION_ELEMENTS: [&str; 2] = ["workbookProtection", "fileSharing"];

const WORKBOOK_PR: RootChild<'static> = RootChild {
    local: "workbookPr",
    attrs: &[("updateLinks", "1"), ("saveExternalLinkValues", "1")],
    after: &["fileVersion", "fileSharing"],
    patch_existing: true,
};

const FILE_VERSION: RootChild<'static> = RootChild {
    local: "fileVersion",
    attrs: &[("appName", "xl")],
    after: &[],
    patch_existing: false,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaxOptions {
    pub remove_sheet_protection: bool,
    pub remove_workbook_protection: bool,
    /// Set `updateLinks` and `saveExternalLinkValues` on `<workbookPr>`.
    pub enable_external_links: bool,
    pub ensure_file_version: bool,
    /// Record a `Trusted` custom document property.
    pub mark_trusted: bool,
    pub remove_vba_signatures: bool,
}

impl Default for RelaxOptions {
    fn default() -> Self {
        Self {
            remove_sheet_protection: true,
            remove_workbook_protection: true,
            enable_external_links: true,
            ensure_file_version: true,
            mark_trusted: true,
            remove_vba_signatures: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelaxStep {
    SheetProtection,
    WorkbookProtection,
    ExternalLinks,
    FileVersion,
    TrustMarker,
    VbaSignature,
}

impl RelaxStep {
    pub fn label(self) -> &'static str {
        match self {
            RelaxStep::SheetProtection => "sheet protection",
            RelaxStep::WorkbookProtection => "workbook protection",
            RelaxStep::ExternalLinks => "external link settings",
            RelaxStep::FileVersion => "file version",
            RelaxStep::TrustMarker => "trust marker",
            RelaxStep::VbaSignature => "VBA signature",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelaxEntry {
    pub step: RelaxStep,
    pub part: String,
    pub outcome: PartOutcome,
}

/// Apply every enabled relaxation to `package`, in a fixed order.
pub fn relax_package(package: &mut OfficePackage, options: &RelaxOptions) -> Vec<RelaxEntry> {
    let mut entries = Vec::new();
    let workbook = package.workbook_part();

    if options.remove_sheet_protection {
        for part in sheet_parts(package) {
            let outcome = package.edit_xml_part(&part, remove_sheet_protection);
            entries.push(RelaxEntry {
                step: RelaxStep::SheetProtection,
                part,
                outcome,
            });
        }
    }

    let workbook_steps: [(bool, RelaxStep, fn(&[u8]) -> XmlEdit); 3] = [
        (
            options.remove_workbook_protection,
            RelaxStep::WorkbookProtection,
            remove_workbook_protection,
        ),
        (options.enable_external_links, RelaxStep::ExternalLinks, enable_external_links),
        (options.ensure_file_version, RelaxStep::FileVersion, ensure_file_version),
    ];
    for (enabled, step, edit) in workbook_steps {
        if enabled {
            entries.push(RelaxEntry {
                step,
                part: workbook.clone(),
                outcome: package.edit_xml_part(&workbook, edit),
            });
        }
    }

    if options.mark_trusted {
        entries.extend(mark_trusted(package));
    }
    if options.remove_vba_signatures {
        entries.extend(remove_vba_signatures(package));
    }

    entries
}

type XmlEdit = Result<Option<Vec<u8>>, PackageError>;

/// Worksheet, chartsheet and dialogsheet parts.
fn sheet_parts(package: &OfficePackage) -> Vec<String> {
    package
        .part_names()
        .filter(|name| {
            let lower = name.trim_start_matches('/').replace('\\', "/").to_ascii_lowercase();
            let in_sheet_dir = ["xl/worksheets/", "xl/chartsheets/", "xl/dialogsheets/"]
                .iter()
                .any(|dir| lower.starts_with(dir));
            in_sheet_dir && !lower.contains("/_rels/") && lower.ends_with(".xml")
        })
        .map(str::to_string)
        .collect()
}

pub fn remove_sheet_protection(xml: &[u8]) -> XmlEdit {
    let (out, removed) = remove_elements(xml, &SHEET_PROTECTION_ELEMENTS)?;
    Ok((removed > 0).then_some(out))
}

pub fn remove_workbook_protection(xml: &[u8]) -> XmlEdit {
    let (out, removed) = remove_elements(xml, &WORKBOOK_PROTECTION_ELEMENTS)?;
    Ok((removed > 0).then_some(out))
}

pub fn enable_external_links(xml: &[u8]) -> XmlEdit {
    upsert_root_child(xml, &WORKBOOK_PR)
}

pub fn ensure_file_version(xml: &[u8]) -> XmlEdit {
    upsert_root_child(xml, &FILE_VERSION)
}

fn mark_trusted(package: &mut OfficePackage) -> Vec<RelaxEntry> {
    let entry = |part: &str, outcome| RelaxEntry {
        step: RelaxStep::TrustMarker,
        part: part.to_string(),
        outcome,
    };

    if package.has_part(CUSTOM_PROPERTIES_PART) {
        let outcome = package.edit_xml_part(CUSTOM_PROPERTIES_PART, set_trusted_property);
        return vec![entry(CUSTOM_PROPERTIES_PART, outcome)];
    }

    package.set_part(CUSTOM_PROPERTIES_PART, new_custom_properties_xml());
    let mut entries = vec![entry(CUSTOM_PROPERTIES_PART, PartOutcome::Modified)];

    let outcome = package.edit_xml_part(ROOT_RELS_PART, |xml| {
        let rels = parse_relationships(xml)?;
        let linked = rels.iter().any(|rel| {
            rel.type_uri == REL_TYPE_CUSTOM_PROPERTIES
                && part_names_equivalent(&resolve_target("", &rel.target), CUSTOM_PROPERTIES_PART)
        });
        if linked {
            return Ok(None);
        }
        let id = next_relationship_id(rels.iter().map(|rel| rel.id.as_str()));
        edit_relationships(
            xml,
            |_| RelEdit::Keep,
            &[Relationship::new(id, REL_TYPE_CUSTOM_PROPERTIES, CUSTOM_PROPERTIES_PART)],
        )
    });
    entries.push(entry(ROOT_RELS_PART, outcome));

    let outcome = package.edit_xml_part(CONTENT_TYPES_PART, |xml| {
        ensure_override(xml, CUSTOM_PROPERTIES_PART, CT_CUSTOM_PROPERTIES)
    });
    entries.push(entry(CONTENT_TYPES_PART, outcome));
    entries
}

fn new_custom_properties_xml() -> Vec<u8> {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
         <Properties xmlns=\"{CUSTOM_PROPERTIES_NS}\" xmlns:vt=\"{VT_NS}\">\
         <property fmtid=\"{CUSTOM_PROPERTY_FMTID}\" pid=\"2\" name=\"{TRUSTED_PROPERTY}\">\
         <vt:bool>true</vt:bool></property></Properties>"
    )
    .into_bytes()
}

struct CustomProperties {
    trusted: bool,
    max_pid: u32,
    vt_prefix: Option<String>,
}

/// Replace any `Trusted` property in an existing `docProps/custom.xml` with `Trusted = true`.
pub fn set_trusted_property(xml: &[u8]) -> XmlEdit {
    let props = with_document(xml, |doc| {
        let root = doc.root_element();
        let mut props = CustomProperties {
            trusted: false,
            max_pid: 1,
            vt_prefix: root.lookup_prefix(VT_NS).map(str::to_string),
        };
        for prop in root
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "property")
        {
            if let Some(pid) = prop.attribute("pid").and_then(|p| p.trim().parse::<u32>().ok()) {
                props.max_pid = props.max_pid.max(pid);
            }
            let is_trusted = prop
                .attribute("name")
                .is_some_and(|name| name.eq_ignore_ascii_case(TRUSTED_PROPERTY));
            let value_true = prop.children().any(|value| {
                value.tag_name().name() == "bool"
                    && value
                        .text()
                        .is_some_and(|text| matches!(text.trim(), "true" | "1"))
            });
            props.trusted |= is_trusted && value_true;
        }
        props
    })?;
    if props.trusted {
        return Ok(None);
    }

    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + 256));
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut skip_depth = 0usize;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => break,
            Event::Start(_) if skip_depth > 0 => skip_depth += 1,
            Event::End(_) if skip_depth > 0 => skip_depth -= 1,
            _ if skip_depth > 0 => {}
            Event::Start(ref e) | Event::Empty(ref e)
                if depth == 1 && is_trusted_property(e)? =>
            {
                if matches!(event, Event::Start(_)) {
                    skip_depth = 1;
                }
            }
            Event::Start(_) => {
                depth += 1;
                writer.write_event(event.borrow())?;
            }
            Event::Empty(ref e) if depth == 0 => {
                let root = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                writer.write_event(Event::Start(e.borrow()))?;
                write_trusted_property(&mut writer, root.as_bytes(), &props)?;
                writer.write_event(Event::End(BytesEnd::new(root)))?;
            }
            Event::End(ref e) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    write_trusted_property(&mut writer, e.name().as_ref(), &props)?;
                }
                writer.write_event(event.borrow())?;
            }
            other => writer.write_event(other)?,
        }
        buf.clear();
    }

    Ok(Some(writer.into_inner()))
}

fn is_trusted_property(e: &BytesStart<'_>) -> Result<bool, PackageError> {
    if local_name(e.name().as_ref()) != b"property" {
        return Ok(false);
    }
    Ok(attr_value(e, b"name")?.is_some_and(|name| name.eq_ignore_ascii_case(TRUSTED_PROPERTY)))
}

fn write_trusted_property(
    writer: &mut Writer<Vec<u8>>,
    root_name: &[u8],
    props: &CustomProperties,
) -> Result<(), PackageError> {
    let tag = prefixed_tag(root_name, "property");
    let pid = (props.max_pid + 1).to_string();
    let mut property = BytesStart::new(tag.clone());
    property.push_attribute(("fmtid", CUSTOM_PROPERTY_FMTID));
    property.push_attribute(("pid", pid.as_str()));
    property.push_attribute(("name", TRUSTED_PROPERTY));

    let value_tag = match props.vt_prefix.as_deref() {
        Some("") => "bool".to_string(),
        Some(prefix) => format!("{prefix}:bool"),
        None => {
            property.push_attribute(("xmlns:vt", VT_NS));
            "vt:bool".to_string()
        }
    };

    writer.write_event(Event::Start(property))?;
    writer.write_event(Event::Start(BytesStart::new(value_tag.clone())))?;
    writer.write_event(Event::Text(BytesText::new("true")))?;
    writer.write_event(Event::End(BytesEnd::new(value_tag)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

/// Drop the VBA signature parts, the relationships pointing at them and their content-type
/// overrides.
fn remove_vba_signatures(package: &mut OfficePackage) -> Vec<RelaxEntry> {
    let entry = |part: &str, outcome| RelaxEntry {
        step: RelaxStep::VbaSignature,
        part: part.to_string(),
        outcome,
    };
    let vba_part = package
        .vba_project_part()
        .unwrap_or_else(|| VBA_PROJECT_PART.to_string());
    let vba_rels = rels_part_name(&vba_part);

    let mut targets: Vec<String> = VBA_SIGNATURE_PARTS.iter().map(|p| p.to_string()).collect();
    if let Some(rels) = package.part(&vba_rels).and_then(|b| parse_relationships(b).ok()) {
        targets.extend(
            rels.iter()
                .filter(|rel| SIGNATURE_REL_TYPES.contains(&rel.type_uri.as_str()))
                .map(|rel| resolve_target(&vba_part, &rel.target)),
        );
    }
    // Signature parts declared only through their content type (Agile and V3 share the prefix).
    if let Some(types) = package
        .part(CONTENT_TYPES_PART)
        .and_then(|b| parse_content_types(b).ok())
    {
        for entry in types {
            if let ContentTypeEntry::Override {
                part_name,
                content_type,
            } = entry
            {
                let part = part_name.trim().trim_start_matches('/');
                if content_type.trim().starts_with(CT_VBA_SIGNATURE)
                    && !targets.iter().any(|t| part_names_equivalent(t, part))
                {
                    targets.push(part.to_string());
                }
            }
        }
    }

    let mut entries = Vec::new();
    let mut removed_any = false;
    for target in &targets {
        if package.remove_part(target).is_some() {
            removed_any = true;
            entries.push(entry(target, PartOutcome::Modified));
        }
    }

    if package.has_part(&vba_rels) {
        let outcome = package.edit_xml_part(&vba_rels, |xml| {
            edit_relationships(
                xml,
                |rel| {
                    let resolved = resolve_target(&vba_part, &rel.target);
                    let signature = SIGNATURE_REL_TYPES.contains(&rel.type_uri.as_str())
                        || targets.iter().any(|t| part_names_equivalent(t, &resolved));
                    if signature {
                        RelEdit::Drop
                    } else {
                        RelEdit::Keep
                    }
                },
                &[],
            )
        });
        if outcome != PartOutcome::Unchanged || removed_any {
            entries.push(entry(&vba_rels, outcome));
        }
    }

    let outcome = package.edit_xml_part(CONTENT_TYPES_PART, |xml| {
        let removed = remove_overrides(xml, |name| {
            targets.iter().any(|t| part_names_equivalent(t, name))
        })?;
        Ok(removed.map(|(bytes, _)| bytes))
    });
    if outcome != PartOutcome::Unchanged || removed_any {
        entries.push(entry(CONTENT_TYPES_PART, outcome));
    }

    entries
}
