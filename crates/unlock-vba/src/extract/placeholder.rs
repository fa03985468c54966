use super::{Confidence, ExtractionInput, ModuleDescriptor, ModuleKind};

/// Host document modules every project is assumed to carry, ahead of the sheet modules.
const HOST_DOCUMENTS: [&str; 2] = ["ThisWorkbook", "ThisDocument"];

pub(super) fn extract(input: &ExtractionInput<'_>) -> Option<Vec<ModuleDescriptor>> {
    let vba_present = input.vba_present || input.vba_bin.is_some();
    if !vba_present && input.sheet_names.is_empty() {
        return None;
    }

    let names = HOST_DOCUMENTS.into_iter().chain(
        input
            .sheet_names
            .iter()
            .map(String::as_str)
            .filter(|name| !HOST_DOCUMENTS.iter().any(|h| name.eq_ignore_ascii_case(h))),
    );
    Some(
        names
            .map(|name| ModuleDescriptor {
                name: name.to_owned(),
                kind: ModuleKind::Document,
                code: placeholder_code(name),
                confidence: Confidence::Placeholder,
            })
            .collect(),
    )
}

fn placeholder_code(name: &str) -> String {
    format!(
        "' Module: {name}\n\
         ' The VBA project was detected but the source of this module could not be recovered.\n\
         ' Open the unlocked workbook in Excel (Alt+F11) to view the code.\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_host_documents_plus_each_sheet() {
        let sheets = vec!["Data".to_string(), "Summary".to_string()];
        let input = ExtractionInput {
            sheet_names: &sheets,
            ..ExtractionInput::default()
        };
        let modules = extract(&input).unwrap();
        let names: Vec<&str> = modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["ThisWorkbook", "ThisDocument", "Data", "Summary"]);
        assert!(modules
            .iter()
            .all(|m| m.confidence == Confidence::Placeholder && m.code.starts_with("' Module: ")));
    }

    #[test]
    fn needs_a_project_or_sheet_names() {
        assert!(extract(&ExtractionInput::default()).is_none());
        let input = ExtractionInput {
            vba_present: true,
            ..ExtractionInput::default()
        };
        assert_eq!(extract(&input).map(|m| m.len()), Some(2));
    }

    #[test]
    fn sheet_named_like_a_host_document_is_not_duplicated() {
        let sheets = vec!["thisdocument".to_string(), "Data".to_string()];
        let input = ExtractionInput {
            sheet_names: &sheets,
            ..ExtractionInput::default()
        };
        let names: Vec<String> = extract(&input).unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["ThisWorkbook", "ThisDocument", "Data"]);
    }
}
