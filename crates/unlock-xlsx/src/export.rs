//! File names and the combined text export offered to the user after a pipeline run.

use chrono::{Local, NaiveDateTime};
use unlock_vba::ModuleDescriptor;

/// MIME type of an unlocked workbook.
pub const UNLOCKED_MIME_TYPE: &str = "application/vnd.ms-excel.sheet.macroEnabled.12";
pub const MODULES_EXPORT_MIME_TYPE: &str = "text/plain; charset=utf-8";

const SEPARATOR_WIDTH: usize = 72;

/// File name without directories or its last extension.
fn file_stem(name: &str) -> &str {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => base,
    }
}

/// `Book1.xlsm` -> `Book1_unlocked.xlsm`.
pub fn unlocked_file_name(original: &str) -> String {
    format!("{}_unlocked.xlsm", file_stem(original))
}

/// `Book1.xlsm` -> `Book1_vba_modules.txt`.
pub fn modules_export_file_name(original: &str) -> String {
    format!("{}_vba_modules.txt", file_stem(original))
}

pub fn render_modules_export(source_name: &str, modules: &[ModuleDescriptor]) -> String {
    render_modules_export_at(source_name, modules, Local::now().naive_local())
}

/// Render every module into one text document, stamped with `extracted_at`.
pub fn render_modules_export_at(
    source_name: &str,
    modules: &[ModuleDescriptor],
    extracted_at: NaiveDateTime,
) -> String {
    let rule = "=".repeat(SEPARATOR_WIDTH);
    let mut out = String::new();
    out.push_str(&format!("VBA modules extracted from {source_name}\n"));
    out.push_str(&format!(
        "Extracted: {}\n",
        extracted_at.format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str(&format!("Modules: {}\n", modules.len()));

    for module in modules {
        out.push('\n');
        out.push_str(&rule);
        out.push('\n');
        out.push_str(&format!("' Module: {}\n", module.name));
        out.push_str(&format!("' Type: {}\n", module.kind.label()));
        out.push_str(&format!("' File: {}\n", module.file_name()));
        out.push_str(&format!("' Recovery: {}\n", module.confidence.label()));
        out.push_str(&rule);
        out.push('\n');
        out.push_str(module.code.trim_end_matches(['\r', '\n']));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use unlock_vba::{Confidence, ModuleKind};

    #[test]
    fn derived_file_names() {
        assert_eq!(unlocked_file_name("Book1.xlsm"), "Book1_unlocked.xlsm");
        assert_eq!(unlocked_file_name("dir/report.v2.xlsb"), "report.v2_unlocked.xlsm");
        assert_eq!(unlocked_file_name(r"C:\tmp\noext"), "noext_unlocked.xlsm");
        assert_eq!(modules_export_file_name(".hidden"), ".hidden_vba_modules.txt");
        assert_eq!(modules_export_file_name("Book1.xlsm"), "Book1_vba_modules.txt");
    }

    #[test]
    fn export_lists_modules_in_order_with_headers() {
        let modules = vec![
            ModuleDescriptor {
                name: "ThisWorkbook".to_string(),
                kind: ModuleKind::Document,
                code: "Private Sub Workbook_Open()\r\nEnd Sub\r\n".to_string(),
                confidence: Confidence::Full,
            },
            ModuleDescriptor {
                name: "Module1".to_string(),
                kind: ModuleKind::Standard,
                code: String::new(),
                confidence: Confidence::Placeholder,
            },
        ];
        let at = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(14, 5, 0)
            .unwrap();
        let rule = "=".repeat(72);
        let expected = format!(
            "VBA modules extracted from Book1.xlsm\n\
             Extracted: 2024-03-09 14:05:00\n\
             Modules: 2\n\
             \n{rule}\n\
             ' Module: ThisWorkbook\n\
             ' Type: Document Module\n\
             ' File: ThisWorkbook.cls\n\
             ' Recovery: full\n\
             {rule}\n\
             Private Sub Workbook_Open()\r\nEnd Sub\n\
             \n{rule}\n\
             ' Module: Module1\n\
             ' Type: Standard Module\n\
             ' File: Module1.bas\n\
             ' Recovery: placeholder\n\
             {rule}\n\
             \n"
        );
        assert_eq!(render_modules_export_at("Book1.xlsm", &modules, at), expected);
    }
}
