use std::io::{Cursor, Write};

use pretty_assertions::assert_eq;
use unlock_vba::{
    compress_container, extract_modules, Confidence, ExtractionInput, ModuleKind, CFB_MAGIC,
};

fn push_record(out: &mut Vec<u8>, id: u16, data: &[u8]) {
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

fn push_module(dir: &mut Vec<u8>, name: &str, procedural: bool) {
    push_record(dir, 0x0019, name.as_bytes());
    let mut stream_name = name.as_bytes().to_vec();
    stream_name.extend_from_slice(&0u16.to_le_bytes());
    push_record(dir, 0x001A, &stream_name);
    push_record(dir, if procedural { 0x0021 } else { 0x0022 }, &[]);
    push_record(dir, 0x0031, &0u32.to_le_bytes());
}

fn build_vba_project(modules: &[(&str, bool, &str)]) -> Vec<u8> {
    let mut dir = Vec::new();
    push_record(&mut dir, 0x0003, &1252u16.to_le_bytes());
    push_record(&mut dir, 0x0004, b"VBAProject");
    for &(name, procedural, _) in modules {
        push_module(&mut dir, name, procedural);
    }

    let mut ole = cfb::CompoundFile::create(Cursor::new(Vec::new())).expect("create cfb");
    {
        let mut s = ole.create_stream("PROJECT").expect("PROJECT stream");
        s.write_all(b"ID=\"{00000000-0000-0000-0000-000000000000}\"\r\nName=\"VBAProject\"\r\n")
            .expect("write PROJECT");
    }
    ole.create_storage("VBA").expect("VBA storage");
    {
        let mut s = ole.create_stream("VBA/dir").expect("dir stream");
        s.write_all(&compress_container(&dir)).expect("write dir");
    }
    for &(name, _, code) in modules {
        let mut s = ole
            .create_stream(format!("VBA/{name}"))
            .expect("module stream");
        s.write_all(&compress_container(code.as_bytes()))
            .expect("write module");
    }
    ole.into_inner().into_inner()
}

#[test]
fn structured_parse_yields_full_confidence_in_display_order() {
    let bin = build_vba_project(&[
        (
            "Module1",
            true,
            "Attribute VB_Name = \"Module1\"\r\nSub Hello()\r\n    MsgBox \"hi\"\r\nEnd Sub\r\n",
        ),
        (
            "Sheet1",
            false,
            "Attribute VB_Name = \"Sheet1\"\r\nAttribute VB_Base = \"0{00020820-0000-0000-C000-000000000046}\"\r\n",
        ),
        (
            "ThisWorkbook",
            false,
            "Attribute VB_Name = \"ThisWorkbook\"\r\nAttribute VB_Base = \"0{00020819-0000-0000-C000-000000000046}\"\r\n",
        ),
        ("Widget", false, "Attribute VB_Name = \"Widget\"\r\nPrivate x As Long\r\n"),
    ]);

    let extraction = extract_modules(&ExtractionInput {
        vba_bin: Some(&bin),
        ..ExtractionInput::default()
    });

    assert_eq!(extraction.strategy, Some("structured"));
    let summary: Vec<(&str, ModuleKind)> = extraction
        .modules
        .iter()
        .map(|m| (m.name.as_str(), m.kind))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("ThisWorkbook", ModuleKind::Document),
            ("Sheet1", ModuleKind::Document),
            ("Module1", ModuleKind::Standard),
            ("Widget", ModuleKind::Class),
        ]
    );
    assert!(extraction
        .modules
        .iter()
        .all(|m| m.confidence == Confidence::Full));

    let module1 = &extraction.modules[2];
    assert_eq!(
        module1.code,
        "Attribute VB_Name = \"Module1\"\nSub Hello()\n    MsgBox \"hi\"\nEnd Sub\n"
    );
}

#[test]
fn falls_back_to_signature_scan_when_structure_is_unreadable() {
    // Compound-file magic followed by garbage: the structured parse fails.
    let mut bin = CFB_MAGIC.to_vec();
    bin.extend_from_slice(&[0xFF; 64]);
    bin.extend_from_slice(b"Attribute VB_Name = \"Module1\"\r\nSub A()\r\nEnd Sub\r\n");
    bin.extend_from_slice(&[0x00; 16]);
    bin.extend_from_slice(b"Attribute VB_Name = \"UserForm1\"\r\n");

    let sheets = vec!["Sheet1".to_string()];
    let extraction = extract_modules(&ExtractionInput {
        vba_bin: Some(&bin),
        sheet_names: &sheets,
        vba_present: true,
    });

    assert_eq!(extraction.strategy, Some("signature"));
    assert_eq!(extraction.modules.len(), 2);
    assert!(extraction
        .modules
        .iter()
        .all(|m| m.confidence == Confidence::Partial));
    assert_eq!(extraction.modules[0].name, "Module1");
    assert_eq!(extraction.modules[0].code, "Attribute VB_Name = \"Module1\"\nSub A()\nEnd Sub\n");
    assert_eq!(extraction.modules[1].kind, ModuleKind::Form);
}

#[test]
fn falls_back_to_placeholders_when_nothing_is_recoverable() {
    let bin = vec![0x5Au8; 512];
    let sheets = vec!["Budget".to_string(), "Notes".to_string()];
    let extraction = extract_modules(&ExtractionInput {
        vba_bin: Some(&bin),
        sheet_names: &sheets,
        vba_present: true,
    });

    assert_eq!(extraction.strategy, Some("placeholder"));
    let names: Vec<&str> = extraction.modules.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["ThisWorkbook", "Budget", "Notes", "ThisDocument"]);
    assert!(extraction
        .modules
        .iter()
        .all(|m| m.confidence == Confidence::Placeholder));
}
