mod support;

use std::collections::HashSet;

use pretty_assertions::assert_eq;
use support::{vba_with_dpb, WorkbookFixture, CONTENT_TYPES_PREFIX, VBA_CT, WORKBOOK_MACRO_CT, WORKSHEET_CT};
use unlock_xlsx::content_types::{parse_content_types, ContentTypeEntry, CONTENT_TYPES_PART};
use unlock_xlsx::openxml::{parse_relationships, resolve_target};
use unlock_xlsx::{repair_package, IssueKind, OfficePackage, WORKBOOK_RELS_PART};

fn load(fixture: WorkbookFixture) -> OfficePackage {
    OfficePackage::from_bytes(&fixture.build()).expect("load fixture")
}

fn overrides_for(package: &OfficePackage, part_name: &str) -> Vec<String> {
    parse_content_types(package.part(CONTENT_TYPES_PART).unwrap())
        .unwrap()
        .into_iter()
        .filter_map(|entry| match entry {
            ContentTypeEntry::Override {
                part_name: name,
                content_type,
            } if name == part_name => Some(content_type),
            _ => None,
        })
        .collect()
}

fn kinds(report: &unlock_xlsx::RepairReport) -> Vec<IssueKind> {
    report.issues.iter().map(|issue| issue.kind).collect()
}

#[test]
fn consistent_workbook_needs_no_repair() {
    let mut package = load(WorkbookFixture::new(&["Sheet1", "Sheet2"], Some(&vba_with_dpb())));
    let before = package.clone();

    let report = repair_package(&mut package);

    assert!(report.is_clean(), "{report:?}");
    assert_eq!(package, before);
}

#[test]
fn missing_vba_override_is_added_exactly_once() {
    let types = format!(
        r#"{CONTENT_TYPES_PREFIX}<Override PartName="/xl/workbook.xml" ContentType="{WORKBOOK_MACRO_CT}"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="{WORKSHEET_CT}"/></Types>"#
    );
    let mut package = load(
        WorkbookFixture::new(&["Sheet1"], Some(&vba_with_dpb()))
            .with_part("[Content_Types].xml", types),
    );

    let first = repair_package(&mut package);
    assert_eq!(kinds(&first), vec![IssueKind::MissingContentTypeOverride]);
    assert_eq!(first.issues[0].part_path, CONTENT_TYPES_PART);

    for _ in 0..3 {
        let again = repair_package(&mut package);
        assert!(again.is_clean(), "{again:?}");
    }
    assert_eq!(overrides_for(&package, "/xl/vbaProject.bin"), vec![VBA_CT.to_string()]);
}

#[test]
fn duplicate_sheet_ids_become_distinct_and_resolvable() {
    let mut package = load(
        WorkbookFixture::new(&["Sheet1", "Sheet2"], Some(&vba_with_dpb())).with_sheets_xml(
            r#"<sheet name="Sheet1" sheetId="1" r:id="rId1"/><sheet name="Sheet2" sheetId="1" r:id="rId2"/>"#,
        ),
    );

    let report = repair_package(&mut package);
    assert!(kinds(&report).contains(&IssueKind::DuplicateSheetAttribute));

    let sheets = package.workbook_sheets().unwrap();
    assert_eq!(sheets.len(), 2);
    let ids: HashSet<_> = sheets.iter().map(|s| s.sheet_id.clone().unwrap()).collect();
    assert_eq!(ids.len(), 2);
    assert_eq!(sheets[0].sheet_id.as_deref(), Some("1"));

    let rels = parse_relationships(package.part(WORKBOOK_RELS_PART).unwrap()).unwrap();
    for sheet in &sheets {
        let rel_id = sheet.rel_id.as_deref().expect("r:id kept");
        let rel = rels.iter().find(|r| r.id == rel_id).expect("relationship exists");
        let target = resolve_target("xl/workbook.xml", &rel.target);
        assert!(package.has_part(&target), "{target} missing");
    }
    assert_eq!(
        package.sheet_names().unwrap(),
        vec!["Sheet1".to_string(), "Sheet2".to_string()]
    );
}

#[test]
fn repairs_are_idempotent() {
    let rels = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet2.xml"/></Relationships>"#;
    let types = format!(
        r#"{CONTENT_TYPES_PREFIX}<Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet9.xml" ContentType="{WORKSHEET_CT}"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="{WORKSHEET_CT}"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="{WORKSHEET_CT}"/></Types>"#
    );
    let mut package = load(
        WorkbookFixture::new(&["Sheet1", "Sheet2"], Some(&vba_with_dpb()))
            .with_part("xl/_rels/workbook.xml.rels", rels)
            .with_part("[Content_Types].xml", types)
            .with_part("xl/ctrlProps/ctrlProp1.xml", Vec::new())
            .with_sheets_xml(r#"<sheet name="Sheet1" sheetId="1" r:id="rId1"/><sheet sheetId="1" r:id="rId2"/>"#),
    );

    let first = repair_package(&mut package);
    let found = kinds(&first);
    for expected in [
        IssueKind::CorruptControlPart,
        IssueKind::DuplicateRelationshipId,
        IssueKind::MissingRelationship,
        IssueKind::StaleContentTypeOverride,
        IssueKind::DuplicateContentTypeOverride,
        IssueKind::WrongContentType,
        IssueKind::MissingContentTypeOverride,
    ] {
        assert!(found.contains(&expected), "{expected:?} not in {found:?}");
    }
    assert!(first.skipped.is_empty(), "{:?}", first.skipped);

    let after_first = package.clone();
    let second = repair_package(&mut package);
    assert!(second.is_clean(), "{second:?}");
    assert_eq!(package, after_first);

    assert_eq!(overrides_for(&package, "/xl/workbook.xml"), vec![WORKBOOK_MACRO_CT.to_string()]);
    assert!(overrides_for(&package, "/xl/worksheets/sheet9.xml").is_empty());
    assert_eq!(overrides_for(&package, "/xl/worksheets/sheet1.xml").len(), 1);
    assert_eq!(package.sheet_names().unwrap().len(), 2);
}

#[test]
fn empty_control_part_is_pruned_with_its_references() {
    let sheet_rels = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/ctrlProp" Target="../ctrlProps/ctrlProp1.xml"/></Relationships>"#;
    let types = format!(
        r#"{CONTENT_TYPES_PREFIX}<Override PartName="/xl/workbook.xml" ContentType="{WORKBOOK_MACRO_CT}"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="{WORKSHEET_CT}"/><Override PartName="/xl/vbaProject.bin" ContentType="{VBA_CT}"/><Override PartName="/xl/ctrlProps/ctrlProp1.xml" ContentType="application/vnd.ms-excel.controlproperties+xml"/></Types>"#
    );
    let mut package = load(
        WorkbookFixture::new(&["Sheet1"], Some(&vba_with_dpb()))
            .with_part("[Content_Types].xml", types)
            .with_part("xl/worksheets/_rels/sheet1.xml.rels", sheet_rels)
            .with_part("xl/ctrlProps/ctrlProp1.xml", Vec::new()),
    );

    let report = repair_package(&mut package);

    assert_eq!(kinds(&report), vec![IssueKind::CorruptControlPart]);
    assert!(!package.has_part("xl/ctrlProps/ctrlProp1.xml"));
    let rels = parse_relationships(package.part("xl/worksheets/_rels/sheet1.xml.rels").unwrap()).unwrap();
    assert!(rels.is_empty());
    assert!(overrides_for(&package, "/xl/ctrlProps/ctrlProp1.xml").is_empty());
}

#[test]
fn missing_content_types_part_is_recreated() {
    let mut package =
        load(WorkbookFixture::new(&["Sheet1"], Some(&vba_with_dpb())).without_part("[Content_Types].xml"));

    let report = repair_package(&mut package);

    assert_eq!(report.issues[0].kind, IssueKind::MissingPart);
    assert_eq!(overrides_for(&package, "/xl/workbook.xml"), vec![WORKBOOK_MACRO_CT.to_string()]);
    assert_eq!(overrides_for(&package, "/xl/vbaProject.bin"), vec![VBA_CT.to_string()]);
    assert_eq!(overrides_for(&package, "/xl/worksheets/sheet1.xml"), vec![WORKSHEET_CT.to_string()]);
    assert!(repair_package(&mut package).is_clean());
}
