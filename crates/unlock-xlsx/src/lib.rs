//! Package-level handling of macro-enabled workbooks.
//!
//! - [`OfficePackage`]: the Open Packaging Convention (OPC) ZIP held in memory as part name ->
//!   bytes, with inflate budgets on load and deterministic re-serialization.
//! - [`relax_package`]: removes sheet/workbook protection and trust restrictions from XML parts.
//! - [`repair_package`]: restores relationship, sheet and content-type consistency.
//! - [`unlock_workbook`] / [`extract_workbook_modules`]: the write and read pipelines that tie the
//!   package layer to the byte-level engine in `unlock_vba`.

pub mod content_types;
mod export;
pub mod openxml;
mod package;
mod pipeline;
mod relax;
mod repair;
mod xml;
mod zip_util;

pub use export::{
    modules_export_file_name, render_modules_export, render_modules_export_at,
    unlocked_file_name, MODULES_EXPORT_MIME_TYPE, UNLOCKED_MIME_TYPE,
};
pub use package::{
    OfficePackage, PackageError, PackageLimits, PartOutcome, SheetEntry, REQUIRED_PARTS,
    ROOT_RELS_PART, VBA_PROJECT_PART, WORKBOOK_PART, WORKBOOK_RELS_PART,
};
pub use pipeline::{
    extract_workbook_modules, run_extract, run_unlock, unlock_workbook, CancellationToken,
    FnSink, LogEntry, PipelineError, PipelineReport, PipelineSink, RecordingSink, Severity,
    UnlockOptions, UnlockedWorkbook, DEFAULT_MAX_INPUT_BYTES,
};
pub use relax::{
    enable_external_links, ensure_file_version, relax_package, remove_sheet_protection,
    remove_workbook_protection, set_trusted_property, RelaxEntry, RelaxOptions, RelaxStep,
    CUSTOM_PROPERTIES_PART, TRUSTED_PROPERTY, VBA_SIGNATURE_PARTS,
};
pub use repair::{
    repair_package, IntegrityIssue, IssueKind, RepairReport, SkippedRepair,
    MIN_CONTROL_PART_BYTES, REPAIR_ID_BASE,
};
pub use xml::check_well_formed;
pub use zip_util::{part_names_equivalent, DEFAULT_MAX_PART_BYTES, DEFAULT_MAX_TOTAL_BYTES};
