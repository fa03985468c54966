//! Package consistency repairs run after the relaxer has edited the package.
//!
//! Each repair that changes something reports one [`IntegrityIssue`]. Running
//! [`repair_package`] on its own output reports nothing and leaves every part byte-identical.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use serde::Serialize;

use crate::content_types::{
    default_for_extension, edit_content_types, minimal_content_types, override_for_part,
    parse_content_types, remove_overrides, ContentTypeEntry, EntryEdit, CONTENT_TYPES_PART,
    CT_VBA_PROJECT, CT_WORKBOOK, CT_WORKBOOK_MACRO_ENABLED,
};
use crate::openxml::{
    edit_relationships, empty_relationships_xml, next_relationship_id, parse_relationships,
    relative_target, rels_part_name, resolve_target, source_part_for_rels, RelEdit,
    Relationship, REL_TYPE_SHARED_STRINGS, REL_TYPE_STYLES, REL_TYPE_VBA_PROJECT,
    REL_TYPE_WORKSHEET,
};
use crate::package::{parse_workbook_sheets, OfficePackage, PartOutcome, SheetEntry};
use crate::xml::{check_well_formed, local_name, prefixed_tag, with_document};
use crate::zip_util::{part_name_lookup_key, part_names_equivalent};
use crate::PackageError;

/// Parts under `xl/ctrlProps/` and `xl/activeX/` smaller than this are treated as truncated.
pub const MIN_CONTROL_PART_BYTES: usize = 16;

/// Duplicate relationship ids are renumbered to `rId{REPAIR_ID_BASE + n}`.
pub const REPAIR_ID_BASE: u32 = 1000;

const OFFICE_REL_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";

const SHEET_REL_SUFFIXES: [&str; 5] = [
    "/worksheet",
    "/chartsheet",
    "/dialogsheet",
    "/xlMacrosheet",
    "/xlIntlMacrosheet",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingPart,
    CorruptControlPart,
    DuplicateRelationshipId,
    MissingRelationship,
    MissingSheetAttribute,
    DuplicateSheetAttribute,
    UnresolvedSheetRelationship,
    UnreferencedSheet,
    MissingContentTypeDefault,
    MissingContentTypeOverride,
    WrongContentType,
    StaleContentTypeOverride,
    DuplicateContentTypeOverride,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityIssue {
    pub part_path: String,
    pub kind: IssueKind,
    pub remediation: String,
}

impl IntegrityIssue {
    fn new(part_path: &str, kind: IssueKind, remediation: impl Into<String>) -> Self {
        Self {
            part_path: part_path.to_string(),
            kind,
            remediation: remediation.into(),
        }
    }
}

/// A repair that could not be applied; the part was left as it was.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRepair {
    pub part_path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub issues: Vec<IntegrityIssue>,
    pub skipped: Vec<SkippedRepair>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty() && self.skipped.is_empty()
    }
}

pub fn repair_package(package: &mut OfficePackage) -> RepairReport {
    let mut repairer = Repairer {
        package,
        report: RepairReport::default(),
    };
    repairer.prune_control_parts();
    repairer.dedupe_relationship_ids();
    repairer.ensure_workbook_relationships();
    repairer.repair_workbook_sheets();
    repairer.repair_content_types();
    repairer.report
}

type XmlEdit = Result<Option<Vec<u8>>, PackageError>;

struct Repairer<'a> {
    package: &'a mut OfficePackage,
    report: RepairReport,
}

impl Repairer<'_> {
    /// Apply `edit` to `part`; the issues it records are kept only if the part was rewritten.
    fn edit(&mut self, part: &str, edit: impl FnOnce(&[u8], &mut Vec<IntegrityIssue>) -> XmlEdit) {
        let mut issues = Vec::new();
        let outcome = self.package.edit_xml_part(part, |xml| edit(xml, &mut issues));
        if outcome.is_modified() {
            self.report.issues.extend(issues);
        }
        self.note_skipped(part, outcome);
    }

    fn note_skipped(&mut self, part: &str, outcome: PartOutcome) {
        if let PartOutcome::Skipped { reason } = outcome {
            self.report.skipped.push(SkippedRepair {
                part_path: part.to_string(),
                reason,
            });
        }
    }

    fn names_matching(&self, pred: impl Fn(&str) -> bool) -> Vec<String> {
        self.package
            .part_names()
            .filter(|name| pred(name))
            .map(str::to_string)
            .collect()
    }

    fn prune_control_parts(&mut self) {
        let defective: Vec<(String, &'static str)> = self
            .package
            .parts()
            .filter(|(name, _)| is_control_part(name))
            .filter_map(|(name, bytes)| control_part_defect(name, bytes).map(|d| (name.to_string(), d)))
            .collect();
        for (part, defect) in defective {
            self.prune_part(&part, defect);
        }
    }

    fn prune_part(&mut self, part: &str, defect: &str) {
        log::debug!("pruning {defect} control part {part}");
        self.package.remove_part(part);
        self.package.remove_part(&rels_part_name(part));

        for rels in self.names_matching(is_rels_part) {
            let Some(source) = source_part_for_rels(&rels) else {
                continue;
            };
            let outcome = self.package.edit_xml_part(&rels, |xml| {
                edit_relationships(
                    xml,
                    |rel| {
                        let points_here = !rel.is_external()
                            && part_names_equivalent(&resolve_target(&source, &rel.target), part);
                        if points_here {
                            RelEdit::Drop
                        } else {
                            RelEdit::Keep
                        }
                    },
                    &[],
                )
            });
            self.note_skipped(&rels, outcome);
        }

        if self.package.has_part(CONTENT_TYPES_PART) {
            let outcome = self.package.edit_xml_part(CONTENT_TYPES_PART, |xml| {
                let removed = remove_overrides(xml, |name| part_names_equivalent(name, part))?;
                Ok(removed.map(|(bytes, _)| bytes))
            });
            self.note_skipped(CONTENT_TYPES_PART, outcome);
        }

        self.report.issues.push(IntegrityIssue::new(
            part,
            IssueKind::CorruptControlPart,
            format!("removed {defect} control part with its relationships and content-type override"),
        ));
    }

    fn dedupe_relationship_ids(&mut self) {
        for rels in self.names_matching(is_rels_part) {
            let part = rels.clone();
            self.edit(&rels, |xml, issues| {
                let relationships = parse_relationships(xml)?;
                let renames = plan_id_renames(&relationships);
                if renames.iter().all(Option::is_none) {
                    return Ok(None);
                }
                for (rel, rename) in relationships.iter().zip(&renames) {
                    if let Some(new_id) = rename {
                        issues.push(IntegrityIssue::new(
                            &part,
                            IssueKind::DuplicateRelationshipId,
                            format!("renumbered duplicate Id {} to {new_id}", rel.id),
                        ));
                    }
                }
                let mut index = 0;
                edit_relationships(
                    xml,
                    |_| {
                        let rename = renames.get(index).cloned().flatten();
                        index += 1;
                        match rename {
                            Some(id) => RelEdit::SetId(id),
                            None => RelEdit::Keep,
                        }
                    },
                    &[],
                )
            });
        }
    }

    fn ensure_workbook_relationships(&mut self) {
        let workbook = self.package.workbook_part();
        let rels_part = rels_part_name(&workbook);
        let existing = match self.package.part(&rels_part).map(parse_relationships) {
            Some(Ok(rels)) => rels,
            Some(Err(err)) => {
                self.note_skipped(&rels_part, PartOutcome::Skipped { reason: err.to_string() });
                return;
            }
            None => Vec::new(),
        };
        let has_type = |rel_type: &str| existing.iter().any(|rel| rel.type_uri == rel_type);
        let resolves_to = |part: &str| {
            existing.iter().any(|rel| {
                !rel.is_external()
                    && part_names_equivalent(&resolve_target(&workbook, &rel.target), part)
            })
        };

        let mut wanted: Vec<(&'static str, String)> = Vec::new();
        if let Some(vba) = self.package.vba_project_part() {
            if !has_type(REL_TYPE_VBA_PROJECT) {
                wanted.push((REL_TYPE_VBA_PROJECT, vba));
            }
        }
        let workbook_dir = workbook
            .rsplit_once('/')
            .map(|(dir, _)| format!("{dir}/"))
            .unwrap_or_default();
        for (file, rel_type) in [
            ("styles.xml", REL_TYPE_STYLES),
            ("sharedStrings.xml", REL_TYPE_SHARED_STRINGS),
        ] {
            if let Some(key) = self.package.part_key(&format!("{workbook_dir}{file}")) {
                if !has_type(rel_type) {
                    wanted.push((rel_type, key.to_string()));
                }
            }
        }
        let mut worksheets = self.names_matching(is_worksheet_part);
        worksheets.sort_by(|a, b| (a.len(), a).cmp(&(b.len(), b)));
        for sheet in worksheets {
            if !resolves_to(&sheet) {
                wanted.push((REL_TYPE_WORKSHEET, sheet));
            }
        }
        if wanted.is_empty() {
            return;
        }

        if !self.package.has_part(&rels_part) {
            self.package.set_part(&rels_part, empty_relationships_xml());
        }
        let issue_part = rels_part.clone();
        self.edit(&rels_part, |xml, issues| {
            let mut taken: Vec<String> = parse_relationships(xml)?
                .into_iter()
                .map(|rel| rel.id)
                .collect();
            let mut additions = Vec::with_capacity(wanted.len());
            for (rel_type, target_part) in &wanted {
                let id = next_relationship_id(taken.iter().map(String::as_str));
                taken.push(id.clone());
                issues.push(IntegrityIssue::new(
                    &issue_part,
                    IssueKind::MissingRelationship,
                    format!("added relationship {id} for {target_part}"),
                ));
                additions.push(Relationship::new(
                    id,
                    rel_type,
                    relative_target(&workbook, target_part),
                ));
            }
            edit_relationships(xml, |_| RelEdit::Keep, &additions)
        });
    }

    fn repair_workbook_sheets(&mut self) {
        let workbook = self.package.workbook_part();
        let rels_part = rels_part_name(&workbook);
        let sheet_rels: Vec<Relationship> = match self.package.part(&rels_part).map(parse_relationships)
        {
            Some(Ok(rels)) => rels.into_iter().filter(is_sheet_relationship).collect(),
            Some(Err(err)) => {
                self.note_skipped(&rels_part, PartOutcome::Skipped { reason: err.to_string() });
                return;
            }
            None => Vec::new(),
        };

        let part = workbook.clone();
        self.edit(&workbook, |xml, issues| {
            let sheets = parse_workbook_sheets(xml)?;
            let plan = plan_sheet_repairs(&part, &sheets, &sheet_rels);
            if plan.is_noop() {
                return Ok(None);
            }
            let rel_prefix = with_document(xml, |doc| {
                doc.root_element()
                    .lookup_prefix(OFFICE_REL_NS)
                    .filter(|prefix| !prefix.is_empty())
                    .map(str::to_string)
            })?;
            let out = rewrite_sheets(xml, &plan, rel_prefix.as_deref())?;
            issues.extend(plan.issues);
            Ok(out)
        });
    }

    fn repair_content_types(&mut self) {
        if !self.package.has_part(CONTENT_TYPES_PART) {
            self.package
                .set_part(CONTENT_TYPES_PART, minimal_content_types());
            self.report.issues.push(IntegrityIssue::new(
                CONTENT_TYPES_PART,
                IssueKind::MissingPart,
                "created a minimal content types part",
            ));
        }

        let part_names = self.names_matching(|name| !part_names_equivalent(name, CONTENT_TYPES_PART));
        let existing: HashSet<Vec<u8>> = part_names.iter().map(|n| part_name_lookup_key(n)).collect();
        let extensions: BTreeSet<String> = part_names
            .iter()
            .filter_map(|name| {
                let file = name.rsplit(['/', '\\']).next()?;
                let (_, ext) = file.rsplit_once('.')?;
                Some(ext.to_ascii_lowercase())
            })
            .filter(|ext| default_for_extension(ext).is_some())
            .collect();
        let wanted_overrides = self.wanted_overrides(&part_names);

        self.edit(CONTENT_TYPES_PART, |xml, issues| {
            let mut current: Option<Vec<u8>> = None;

            let mut seen = HashSet::new();
            let mut dropped = Vec::new();
            let pruned = edit_content_types(
                xml,
                |entry| match entry {
                    ContentTypeEntry::Override { part_name, .. } => {
                        let key = part_name_lookup_key(part_name);
                        if !existing.contains(&key) {
                            dropped.push((part_name.clone(), IssueKind::StaleContentTypeOverride));
                            EntryEdit::Drop
                        } else if !seen.insert(key) {
                            dropped.push((part_name.clone(), IssueKind::DuplicateContentTypeOverride));
                            EntryEdit::Drop
                        } else {
                            EntryEdit::Keep
                        }
                    }
                    ContentTypeEntry::Default { .. } => EntryEdit::Keep,
                },
                &[],
            )?;
            if let Some(out) = pruned {
                current = Some(out);
            }
            for (part_name, kind) in dropped {
                let what = match kind {
                    IssueKind::StaleContentTypeOverride => "override for missing part",
                    _ => "duplicate override",
                };
                issues.push(IntegrityIssue::new(
                    CONTENT_TYPES_PART,
                    kind,
                    format!("dropped {what} {part_name}"),
                ));
            }

            let input = current.as_deref().unwrap_or(xml);
            let entries = parse_content_types(input)?;
            let mut have_defaults = HashSet::new();
            let mut overrides: HashMap<Vec<u8>, String> = HashMap::new();
            for entry in entries {
                match entry {
                    ContentTypeEntry::Default { extension, .. } => {
                        have_defaults.insert(extension.trim().to_ascii_lowercase());
                    }
                    ContentTypeEntry::Override {
                        part_name,
                        content_type,
                    } => {
                        overrides
                            .entry(part_name_lookup_key(&part_name))
                            .or_insert(content_type);
                    }
                }
            }

            let mut additions = Vec::new();
            for ext in &extensions {
                if have_defaults.contains(ext) {
                    continue;
                }
                if let Some(content_type) = default_for_extension(ext) {
                    additions.push(ContentTypeEntry::new_default(ext, content_type));
                    issues.push(IntegrityIssue::new(
                        CONTENT_TYPES_PART,
                        IssueKind::MissingContentTypeDefault,
                        format!("added Default for .{ext}"),
                    ));
                }
            }

            let mut patches: HashMap<Vec<u8>, &'static str> = HashMap::new();
            for wanted in &wanted_overrides {
                let key = part_name_lookup_key(&wanted.part);
                match overrides.get(&key) {
                    None => {
                        additions.push(ContentTypeEntry::new_override(&wanted.part, wanted.content_type));
                        issues.push(IntegrityIssue::new(
                            CONTENT_TYPES_PART,
                            IssueKind::MissingContentTypeOverride,
                            format!("added Override for /{}", wanted.part),
                        ));
                    }
                    Some(existing) if wanted.patch && existing.trim() != wanted.content_type => {
                        issues.push(IntegrityIssue::new(
                            CONTENT_TYPES_PART,
                            IssueKind::WrongContentType,
                            format!(
                                "changed content type of /{} from {} to {}",
                                wanted.part,
                                existing.trim(),
                                wanted.content_type
                            ),
                        ));
                        patches.insert(key, wanted.content_type);
                    }
                    Some(_) => {}
                }
            }

            if additions.is_empty() && patches.is_empty() {
                return Ok(current);
            }
            let edited = edit_content_types(
                input,
                |entry| match entry {
                    ContentTypeEntry::Override {
                        part_name,
                        content_type,
                    } => match patches.get(&part_name_lookup_key(part_name)) {
                        Some(&target_type) if content_type.trim() != target_type => {
                            EntryEdit::SetContentType(target_type.to_string())
                        }
                        _ => EntryEdit::Keep,
                    },
                    ContentTypeEntry::Default { .. } => EntryEdit::Keep,
                },
                &additions,
            )?;
            Ok(edited.or(current))
        });
    }

    /// Overrides every package should carry for the parts it has. Only the workbook main part and
    /// the VBA project have their content type corrected when it differs.
    fn wanted_overrides(&self, part_names: &[String]) -> Vec<WantedOverride> {
        let vba_part = self.package.vba_project_part();
        let macro_enabled = vba_part.is_some();
        let workbook = self.package.workbook_part();

        let mut wanted: Vec<WantedOverride> = Vec::new();
        let mut push = |part: &str, content_type: &'static str, patch: bool| {
            let part = part.trim_start_matches('/');
            if !wanted.iter().any(|w| part_names_equivalent(&w.part, part)) {
                wanted.push(WantedOverride {
                    part: part.to_string(),
                    content_type,
                    patch,
                });
            }
        };

        if self.package.has_part(&workbook) {
            let content_type = if macro_enabled {
                CT_WORKBOOK_MACRO_ENABLED
            } else {
                CT_WORKBOOK
            };
            push(&workbook, content_type, macro_enabled);
        }
        if let Some(vba) = &vba_part {
            push(vba, CT_VBA_PROJECT, true);
        }
        for name in part_names {
            if is_rels_part(name) {
                continue;
            }
            if let Some(content_type) = override_for_part(name, macro_enabled) {
                push(name, content_type, false);
            }
        }
        wanted
    }
}

struct WantedOverride {
    part: String,
    content_type: &'static str,
    patch: bool,
}

fn is_rels_part(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".rels")
}

fn normalized_lower(name: &str) -> String {
    name.trim_start_matches(['/', '\\'])
        .replace('\\', "/")
        .to_ascii_lowercase()
}

fn is_control_part(name: &str) -> bool {
    let lower = normalized_lower(name);
    (lower.starts_with("xl/ctrlprops/") || lower.starts_with("xl/activex/"))
        && !lower.contains("/_rels/")
}

fn is_worksheet_part(name: &str) -> bool {
    let lower = normalized_lower(name);
    lower.starts_with("xl/worksheets/") && !lower.contains("/_rels/") && lower.ends_with(".xml")
}

fn is_sheet_relationship(rel: &Relationship) -> bool {
    !rel.is_external()
        && SHEET_REL_SUFFIXES
            .iter()
            .any(|suffix| rel.type_uri.ends_with(suffix))
}

fn control_part_defect(name: &str, bytes: &[u8]) -> Option<&'static str> {
    if bytes.is_empty() {
        return Some("empty");
    }
    if bytes.len() < MIN_CONTROL_PART_BYTES {
        return Some("truncated");
    }
    if normalized_lower(name).ends_with(".xml") && check_well_formed(bytes).is_err() {
        return Some("malformed");
    }
    None
}

/// New ids for the second and later occurrences of each relationship id, in document order.
fn plan_id_renames(relationships: &[Relationship]) -> Vec<Option<String>> {
    let mut taken: HashSet<String> = relationships.iter().map(|rel| rel.id.clone()).collect();
    let mut seen = HashSet::new();
    let mut n = 0u32;
    relationships
        .iter()
        .map(|rel| {
            if seen.insert(rel.id.as_str()) {
                return None;
            }
            let id = loop {
                let candidate = format!("rId{}", REPAIR_ID_BASE + n);
                n += 1;
                if !taken.contains(&candidate) {
                    break candidate;
                }
            };
            taken.insert(id.clone());
            Some(id)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SheetPlan {
    Keep,
    Rewrite {
        name: String,
        sheet_id: String,
        rel_id: String,
    },
    Remove,
}

#[derive(Debug, Default)]
struct SheetRepairPlan {
    sheets: Vec<SheetPlan>,
    /// `(name, sheetId, r:id)` entries for worksheet relationships no `<sheet>` refers to.
    appended: Vec<(String, String, String)>,
    issues: Vec<IntegrityIssue>,
}

impl SheetRepairPlan {
    fn is_noop(&self) -> bool {
        self.appended.is_empty() && self.sheets.iter().all(|plan| *plan == SheetPlan::Keep)
    }
}

fn plan_sheet_repairs(
    part: &str,
    sheets: &[SheetEntry],
    sheet_rels: &[Relationship],
) -> SheetRepairPlan {
    let mut plan = SheetRepairPlan::default();
    let referenced: HashSet<&str> = sheets.iter().filter_map(|s| s.rel_id.as_deref()).collect();
    let mut unclaimed: VecDeque<&Relationship> = sheet_rels
        .iter()
        .filter(|rel| !referenced.contains(rel.id.as_str()))
        .collect();
    let reserved_names: HashSet<String> = sheets
        .iter()
        .filter_map(|s| s.name.as_deref())
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    let parse_id = |sheet: &SheetEntry| sheet.sheet_id.as_deref()?.trim().parse::<u32>().ok();
    let mut next_id = sheets.iter().filter_map(parse_id).max().unwrap_or(0) + 1;

    let mut used_ids = HashSet::new();
    let mut used_names: HashSet<String> = HashSet::new();
    let mut used_rels: HashSet<String> = HashSet::new();
    let fresh_name = |used_names: &HashSet<String>| {
        (1u32..)
            .map(|n| format!("Sheet{n}"))
            .find(|candidate| {
                let lower = candidate.to_lowercase();
                !used_names.contains(&lower) && !reserved_names.contains(&lower)
            })
            .unwrap_or_default()
    };
    let mut issue = |kind, remediation: String| {
        plan.issues.push(IntegrityIssue::new(part, kind, remediation));
    };

    let mut sheet_plans = Vec::with_capacity(sheets.len());
    for (index, sheet) in sheets.iter().enumerate() {
        let label = sheet
            .name
            .clone()
            .unwrap_or_else(|| format!("#{}", index + 1));

        let resolvable = sheet.rel_id.as_deref().filter(|id| {
            sheet_rels.iter().any(|rel| rel.id == *id) && !used_rels.contains(*id)
        });
        let rel_id = if let Some(id) = resolvable {
            id.to_string()
        } else if let Some(spare) = unclaimed.pop_front() {
            let kind = if sheet.rel_id.is_none() {
                IssueKind::MissingSheetAttribute
            } else {
                IssueKind::UnresolvedSheetRelationship
            };
            issue(
                kind,
                format!("sheet {label}: pointed r:id at worksheet relationship {}", spare.id),
            );
            spare.id.clone()
        } else if sheets.len() > 1 {
            issue(
                IssueKind::UnresolvedSheetRelationship,
                format!("removed sheet entry {label}: no worksheet relationship left to point at"),
            );
            sheet_plans.push(SheetPlan::Remove);
            continue;
        } else {
            sheet_plans.push(SheetPlan::Keep);
            continue;
        };
        used_rels.insert(rel_id.clone());

        let sheet_id = match parse_id(sheet) {
            Some(id) if id > 0 && !used_ids.contains(&id) => id,
            parsed => {
                let id = next_id;
                next_id += 1;
                let (kind, what) = match parsed {
                    Some(old) if old > 0 => (IssueKind::DuplicateSheetAttribute, format!("duplicate sheetId {old}")),
                    _ if sheet.sheet_id.is_some() => (IssueKind::MissingSheetAttribute, "invalid sheetId".to_string()),
                    _ => (IssueKind::MissingSheetAttribute, "missing sheetId".to_string()),
                };
                issue(kind, format!("sheet {label}: replaced {what} with {id}"));
                id
            }
        };
        used_ids.insert(sheet_id);

        let name = match sheet.name.as_deref() {
            Some(name)
                if !name.trim().is_empty() && !used_names.contains(&name.trim().to_lowercase()) =>
            {
                name.to_string()
            }
            original => {
                let name = fresh_name(&used_names);
                let kind = if original.is_some_and(|n| !n.trim().is_empty()) {
                    IssueKind::DuplicateSheetAttribute
                } else {
                    IssueKind::MissingSheetAttribute
                };
                issue(kind, format!("sheet {label}: renamed to {name}"));
                name
            }
        };
        used_names.insert(name.trim().to_lowercase());

        let sheet_id = sheet_id.to_string();
        let unchanged = sheet.name.as_deref() == Some(name.as_str())
            && sheet.sheet_id.as_deref() == Some(sheet_id.as_str())
            && sheet.rel_id.as_deref() == Some(rel_id.as_str());
        sheet_plans.push(if unchanged {
            SheetPlan::Keep
        } else {
            SheetPlan::Rewrite {
                name,
                sheet_id,
                rel_id,
            }
        });
    }

    for rel in unclaimed {
        if !rel.type_uri.ends_with("/worksheet") {
            continue;
        }
        let name = fresh_name(&used_names);
        used_names.insert(name.to_lowercase());
        let sheet_id = next_id;
        next_id += 1;
        issue(
            IssueKind::UnreferencedSheet,
            format!("added sheet entry {name} for {}", rel.target),
        );
        plan.appended
            .push((name, sheet_id.to_string(), rel.id.clone()));
    }

    plan.sheets = sheet_plans;
    plan
}

fn rewrite_sheets(
    xml: &[u8],
    plan: &SheetRepairPlan,
    rel_prefix: Option<&str>,
) -> XmlEdit {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + 256));
    let mut buf = Vec::new();
    let mut in_sheets = false;
    let mut index = 0usize;
    let mut skip_depth = 0usize;

    let write_appended = |writer: &mut Writer<Vec<u8>>, sheets_name: &[u8]| -> Result<(), PackageError> {
        let tag = prefixed_tag(sheets_name, "sheet");
        for (name, sheet_id, rel_id) in &plan.appended {
            let el = sheet_element(&tag, None, name, sheet_id, rel_id, rel_prefix)?;
            writer.write_event(Event::Empty(el))?;
        }
        Ok(())
    };

    loop {
        let event = reader.read_event_into(&mut buf)?;
        match event {
            Event::Eof => break,
            Event::Start(_) if skip_depth > 0 => skip_depth += 1,
            Event::End(_) if skip_depth > 0 => skip_depth -= 1,
            _ if skip_depth > 0 => {}
            Event::Start(ref e) if local_name(e.name().as_ref()) == b"sheets" => {
                in_sheets = true;
                writer.write_event(event.borrow())?;
            }
            Event::Empty(ref e) if local_name(e.name().as_ref()) == b"sheets" => {
                if plan.appended.is_empty() {
                    writer.write_event(event.borrow())?;
                } else {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    writer.write_event(Event::Start(e.borrow()))?;
                    write_appended(&mut writer, name.as_bytes())?;
                    writer.write_event(Event::End(BytesEnd::new(name)))?;
                }
            }
            Event::End(ref e) if local_name(e.name().as_ref()) == b"sheets" => {
                in_sheets = false;
                write_appended(&mut writer, e.name().as_ref())?;
                writer.write_event(event.borrow())?;
            }
            Event::Start(ref e) | Event::Empty(ref e)
                if in_sheets && local_name(e.name().as_ref()) == b"sheet" =>
            {
                let is_start = matches!(event, Event::Start(_));
                let sheet_plan = plan.sheets.get(index).unwrap_or(&SheetPlan::Keep);
                index += 1;
                match sheet_plan {
                    SheetPlan::Keep => writer.write_event(event.borrow())?,
                    SheetPlan::Remove => {
                        if is_start {
                            skip_depth = 1;
                        }
                    }
                    SheetPlan::Rewrite {
                        name,
                        sheet_id,
                        rel_id,
                    } => {
                        let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                        let el = sheet_element(&tag, Some(e), name, sheet_id, rel_id, rel_prefix)?;
                        writer.write_event(if is_start {
                            Event::Start(el)
                        } else {
                            Event::Empty(el)
                        })?;
                    }
                }
            }
            other => writer.write_event(other)?,
        }
        buf.clear();
    }

    Ok(Some(writer.into_inner()))
}

/// A `<sheet>` element carrying `name`, `sheetId` and the relationship id, keeping any other
/// attribute of `original`.
fn sheet_element(
    tag: &str,
    original: Option<&BytesStart<'_>>,
    name: &str,
    sheet_id: &str,
    rel_id: &str,
    rel_prefix: Option<&str>,
) -> Result<BytesStart<'static>, PackageError> {
    let mut el = BytesStart::new(tag.to_string());
    let (mut wrote_name, mut wrote_id, mut wrote_rel) = (false, false, false);
    if let Some(original) = original {
        for attr in original.attributes().with_checks(false) {
            let attr = attr?;
            let key = attr.key.as_ref();
            if key == b"name" {
                el.push_attribute(("name", name));
                wrote_name = true;
            } else if key == b"sheetId" {
                el.push_attribute(("sheetId", sheet_id));
                wrote_id = true;
            } else if key.contains(&b':') && local_name(key) == b"id" && !key.starts_with(b"xmlns") {
                el.push_attribute((key, rel_id.as_bytes()));
                wrote_rel = true;
            } else {
                el.push_attribute((key, attr.value.as_ref()));
            }
        }
    }
    if !wrote_name {
        el.push_attribute(("name", name));
    }
    if !wrote_id {
        el.push_attribute(("sheetId", sheet_id));
    }
    if !wrote_rel {
        match rel_prefix {
            Some(prefix) => el.push_attribute((format!("{prefix}:id").as_str(), rel_id)),
            None => {
                el.push_attribute(("xmlns:r", OFFICE_REL_NS));
                el.push_attribute(("r:id", rel_id));
            }
        }
    }
    Ok(el)
}
