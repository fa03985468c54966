//! Recovery of VBA module source from a project binary.
//!
//! Strategies are tried in order and each runs at most once; the first one that produces any
//! module wins. Every produced module goes through [`crate::decode::clean_code`] and the result is
//! sorted documents-first.

mod placeholder;
mod signature;
mod structured;

use serde::Serialize;

use crate::decode::clean_code;
use crate::dir::DirModuleType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Document,
    Standard,
    Class,
    Form,
    Unknown,
}

impl ModuleKind {
    /// File extension used when the module is exported on its own.
    pub fn extension(self) -> &'static str {
        match self {
            ModuleKind::Document | ModuleKind::Class => "cls",
            ModuleKind::Form => "frm",
            ModuleKind::Standard | ModuleKind::Unknown => "bas",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ModuleKind::Document => "Document Module",
            ModuleKind::Standard => "Standard Module",
            ModuleKind::Class => "Class Module",
            ModuleKind::Form => "UserForm",
            ModuleKind::Unknown => "Unknown",
        }
    }

    fn sort_rank(self) -> u8 {
        match self {
            ModuleKind::Document => 0,
            ModuleKind::Standard => 1,
            ModuleKind::Class => 2,
            ModuleKind::Form => 3,
            ModuleKind::Unknown => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Decoded from the project's compound-file structure.
    Full,
    /// Located by scanning raw bytes for module markers.
    Partial,
    /// No source recovered; the entry only records that the module exists.
    Placeholder,
}

impl Confidence {
    pub fn label(self) -> &'static str {
        match self {
            Confidence::Full => "full",
            Confidence::Partial => "partial",
            Confidence::Placeholder => "placeholder",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub kind: ModuleKind,
    pub code: String,
    pub confidence: Confidence,
}

impl ModuleDescriptor {
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, self.kind.extension())
    }
}

/// What the read path knows about a workbook when extraction starts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractionInput<'a> {
    pub vba_bin: Option<&'a [u8]>,
    /// Worksheet names from `xl/workbook.xml`, in workbook order.
    pub sheet_names: &'a [String],
    /// Set when package metadata (content types, relationships) declares a VBA project even if
    /// its bytes are unavailable.
    pub vba_present: bool,
}

pub type Strategy = fn(&ExtractionInput<'_>) -> Option<Vec<ModuleDescriptor>>;

pub const STRATEGIES: &[(&str, Strategy)] = &[
    ("structured", structured::extract),
    ("signature", signature::extract),
    ("placeholder", placeholder::extract),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub modules: Vec<ModuleDescriptor>,
    /// Name of the strategy that produced `modules`, `None` when every strategy came up empty.
    pub strategy: Option<&'static str>,
}

pub fn extract_modules(input: &ExtractionInput<'_>) -> Extraction {
    for &(name, strategy) in STRATEGIES {
        let Some(mut modules) = strategy(input).filter(|m| !m.is_empty()) else {
            log::debug!("module extraction strategy {name} found nothing");
            continue;
        };
        log::debug!(
            "module extraction strategy {name} produced {} modules",
            modules.len()
        );
        for module in &mut modules {
            module.code = clean_code(&module.code);
        }
        sort_modules(&mut modules);
        return Extraction {
            modules,
            strategy: Some(name),
        };
    }
    Extraction::default()
}

/// Documents first (`ThisWorkbook` leading), then standard, class, form and unknown modules;
/// ties broken by case-insensitive name.
pub fn sort_modules(modules: &mut [ModuleDescriptor]) {
    modules.sort_by_cached_key(|m| {
        (
            m.kind.sort_rank(),
            !m.name.eq_ignore_ascii_case("ThisWorkbook"),
            m.name.to_lowercase(),
        )
    });
}

/// Classify a module from its name, its code, and (when known) the `VBA/dir` module type.
///
/// Precedence: document, form, class, unknown (no `VB_Name` attribute and no dir type), standard.
pub fn classify(name: &str, code: &str, dir_type: Option<DirModuleType>) -> ModuleKind {
    let base = attribute_value(code, "VB_Base");

    let document_name = name.eq_ignore_ascii_case("ThisWorkbook")
        || name.eq_ignore_ascii_case("ThisDocument")
        || starts_with_ignore_case(name, "Sheet");
    // {00020819-...} is the workbook host class, {00020820-...} the worksheet.
    let document_base = base.as_deref().is_some_and(|b| {
        starts_with_ignore_case(b, "0{00020819-") || starts_with_ignore_case(b, "0{00020820-")
    });
    if document_name || document_base {
        return ModuleKind::Document;
    }

    // Designer modules carry two GUIDs in VB_Base (`0{form}{typeinfo}`).
    let designer_base = base.as_deref().is_some_and(|b| b.contains("}{"));
    if starts_with_ignore_case(name, "UserForm")
        || code.contains("Begin VB.Form")
        || code.contains("Begin {")
        || designer_base
    {
        return ModuleKind::Form;
    }

    let not_creatable = attribute_value(code, "VB_Creatable").is_some_and(|v| v == "False");
    let no_global = attribute_value(code, "VB_GlobalNameSpace").is_some_and(|v| v == "False");
    if (not_creatable && no_global) || dir_type == Some(DirModuleType::NonProcedural) {
        return ModuleKind::Class;
    }

    let has_name_attribute = attribute_value(code, "VB_Name").is_some();
    let procedural = dir_type == Some(DirModuleType::Procedural);
    if !has_name_attribute && !procedural {
        return ModuleKind::Unknown;
    }
    ModuleKind::Standard
}

fn attribute_value(code: &str, key: &str) -> Option<String> {
    code.lines()
        .filter_map(|line| line.trim().strip_prefix("Attribute "))
        .filter_map(|rest| rest.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case(key))
        .map(|(_, v)| v.trim().trim_matches('"').to_owned())
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}
