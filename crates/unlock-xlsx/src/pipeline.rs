//! The write path (unlock) and read path (module extraction) over a whole workbook.
//!
//! Both pipelines are synchronous and own their [`OfficePackage`] for the duration of a call.
//! Stages run in a fixed order; between stages the [`CancellationToken`] is polled and coarse
//! progress is reported to the caller's [`PipelineSink`]. Part-level problems are logged and the
//! run continues; only the preconditions listed on [`PipelineError`] abort it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use unlock_vba::{
    extract_modules, looks_like_compound_file, neutralize_with, restamp_in_place, ChecksumError,
    Extraction, ExtractionInput, FillPolicy, Neutralized, ProtectionMarker, MIN_HEADER_LEN,
};

use crate::package::{OfficePackage, PackageError, PackageLimits, PartOutcome};
use crate::relax::{relax_package, RelaxEntry, RelaxOptions};
use crate::repair::{repair_package, RepairReport};

/// Inputs above this size are rejected before any parsing.
pub const DEFAULT_MAX_INPUT_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Success => "success",
        }
    }

    fn log_level(self) -> log::Level {
        match self {
            Severity::Info | Severity::Success => log::Level::Info,
            Severity::Warning => log::Level::Warn,
            Severity::Error => log::Level::Error,
        }
    }
}

/// Receives user-facing messages and progress from a pipeline run.
pub trait PipelineSink {
    fn log(&mut self, message: &str, severity: Severity);

    /// Coarse completion percentage, reported at stage boundaries.
    fn progress(&mut self, _percent: u8) {}
}

/// Adapts closures to [`PipelineSink`].
pub struct FnSink<L, P> {
    on_log: L,
    on_progress: P,
}

impl<L> FnSink<L, fn(u8)>
where
    L: FnMut(&str, Severity),
{
    pub fn new(on_log: L) -> Self {
        Self {
            on_log,
            on_progress: |_| {},
        }
    }
}

impl<L, P> FnSink<L, P> {
    pub fn with_progress<Q>(self, on_progress: Q) -> FnSink<L, Q>
    where
        Q: FnMut(u8),
    {
        FnSink {
            on_log: self.on_log,
            on_progress,
        }
    }
}

impl<L, P> PipelineSink for FnSink<L, P>
where
    L: FnMut(&str, Severity),
    P: FnMut(u8),
{
    fn log(&mut self, message: &str, severity: Severity) {
        (self.on_log)(message, severity);
    }

    fn progress(&mut self, percent: u8) {
        (self.on_progress)(percent);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub severity: Severity,
    pub message: String,
}

/// Keeps every message and progress value in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingSink {
    pub entries: Vec<LogEntry>,
    pub progress: Vec<u8>,
}

impl RecordingSink {
    pub fn messages(&self, severity: Severity) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |entry| entry.severity == severity)
            .map(|entry| entry.message.as_str())
    }
}

impl PipelineSink for RecordingSink {
    fn log(&mut self, message: &str, severity: Severity) {
        self.entries.push(LogEntry {
            severity,
            message: message.to_string(),
        });
    }

    fn progress(&mut self, percent: u8) {
        self.progress.push(percent);
    }
}

/// Cooperative cancellation flag shared between a running pipeline and its host.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnlockOptions {
    pub relax: RelaxOptions,
    /// Run the package consistency repairer after relaxing.
    pub repair: bool,
    pub fill_policy: FillPolicy,
    pub max_input_bytes: u64,
    pub limits: PackageLimits,
}

impl Default for UnlockOptions {
    fn default() -> Self {
        Self {
            relax: RelaxOptions::default(),
            repair: true,
            fill_policy: FillPolicy::default(),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            limits: PackageLimits::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("input is {size} bytes, larger than the {max} byte limit")]
    InputTooLarge { size: u64, max: u64 },
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error("workbook does not contain a VBA project")]
    MissingVbaProject,
    #[error("VBA project `{part}` is {len} bytes, shorter than the {min}-byte header", min = MIN_HEADER_LEN)]
    VbaTooSmall { part: String, len: usize },
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockedWorkbook {
    /// The re-serialized package.
    pub bytes: Vec<u8>,
    pub vba_part: String,
    pub markers: Vec<ProtectionMarker>,
    /// Checksum written at offset 4 of the project.
    pub checksum: Option<u32>,
    pub relaxed: Vec<RelaxEntry>,
    pub repair: Option<RepairReport>,
}

/// A pipeline result collapsed for display: success flag, output, and every logged message.
#[derive(Debug, Clone)]
pub struct PipelineReport<T> {
    pub success: bool,
    pub output: Option<T>,
    pub log: Vec<LogEntry>,
}

impl<T> PipelineReport<T> {
    /// Fold `result` into a report; a failure is appended to the log as an error.
    pub fn from_result(result: Result<T, PipelineError>, sink: RecordingSink) -> Self {
        let mut log = sink.entries;
        match result {
            Ok(output) => Self {
                success: true,
                output: Some(output),
                log,
            },
            Err(err) => {
                log.push(LogEntry {
                    severity: Severity::Error,
                    message: err.to_string(),
                });
                Self {
                    success: false,
                    output: None,
                    log,
                }
            }
        }
    }
}

struct Stage<'a> {
    sink: &'a mut dyn PipelineSink,
    cancel: &'a CancellationToken,
}

impl Stage<'_> {
    fn emit(&mut self, severity: Severity, message: &str) {
        log::log!(severity.log_level(), "{message}");
        self.sink.log(message, severity);
    }

    fn info(&mut self, message: &str) {
        self.emit(Severity::Info, message);
    }

    fn warn(&mut self, message: &str) {
        self.emit(Severity::Warning, message);
    }

    fn success(&mut self, message: &str) {
        self.emit(Severity::Success, message);
    }

    /// Report `percent` and stop if the host asked to cancel.
    fn finish(&mut self, percent: u8) -> Result<(), PipelineError> {
        self.sink.progress(percent);
        self.cancel.check()
    }
}

fn load_package(
    input: &[u8],
    options: &UnlockOptions,
    stage: &mut Stage<'_>,
) -> Result<OfficePackage, PipelineError> {
    let size = input.len() as u64;
    if size > options.max_input_bytes {
        return Err(PipelineError::InputTooLarge {
            size,
            max: options.max_input_bytes,
        });
    }
    stage.cancel.check()?;

    stage.info(&format!("Reading package ({size} bytes)"));
    let package = OfficePackage::from_bytes_limited(input, options.limits)?;
    stage.finish(10)?;

    package.validate()?;
    stage.info(&format!("Package structure is valid ({} parts)", package.len()));
    stage.finish(20)?;
    Ok(package)
}

/// Unlock the VBA project of `input` and relax/repair the surrounding package.
pub fn unlock_workbook(
    input: &[u8],
    options: &UnlockOptions,
    sink: &mut dyn PipelineSink,
    cancel: &CancellationToken,
) -> Result<UnlockedWorkbook, PipelineError> {
    let mut stage = Stage { sink, cancel };
    let mut package = load_package(input, options, &mut stage)?;

    let vba_part = package
        .vba_project_part()
        .ok_or(PipelineError::MissingVbaProject)?;
    let (mut patched, report, compound) = {
        let bytes = package
            .part(&vba_part)
            .ok_or(PipelineError::MissingVbaProject)?;
        if bytes.len() < MIN_HEADER_LEN {
            return Err(PipelineError::VbaTooSmall {
                part: vba_part,
                len: bytes.len(),
            });
        }
        stage.info(&format!("Found VBA project `{vba_part}` ({} bytes)", bytes.len()));
        stage.finish(30)?;

        let compound = looks_like_compound_file(bytes);
        let Neutralized { bytes, report } = neutralize_with(bytes, options.fill_policy);
        (bytes.into_owned(), report, compound)
    };

    for marker in &report.cleared {
        stage.info(&format!(
            "Cleared {} at offset {:#x} ({} bytes)",
            marker.pattern_name,
            marker.offset,
            marker.cleared.len()
        ));
    }
    for (offset, name) in &report.rejected {
        log::debug!("ignored {name} candidate at offset {offset:#x} near the end of the project");
    }
    if !report.protection_found() {
        stage.info("No protection markers found in the VBA project");
    }
    stage.finish(45)?;

    if compound {
        stage.warn("VBA project is a compound file; the checksum at offset 4 overlaps its header");
    }
    let checksum = restamp_in_place(&mut patched)?;
    stage.info(&format!("Checksum updated to {checksum:#010x}"));
    package.set_part(&vba_part, patched);
    stage.finish(55)?;

    let relaxed = relax_package(&mut package, &options.relax);
    for entry in &relaxed {
        let label = entry.step.label();
        match &entry.outcome {
            PartOutcome::Modified => stage.success(&format!("Relaxed {label} in {}", entry.part)),
            PartOutcome::Unchanged => log::debug!("{label}: nothing to change in {}", entry.part),
            PartOutcome::Skipped { reason } => {
                stage.warn(&format!("Skipped {label} in {}: {reason}", entry.part))
            }
        }
    }
    stage.finish(70)?;

    let repair = if options.repair {
        let report = repair_package(&mut package);
        for issue in &report.issues {
            stage.info(&format!("Repaired {}: {}", issue.part_path, issue.remediation));
        }
        for skipped in &report.skipped {
            stage.warn(&format!(
                "Could not repair {}: {}",
                skipped.part_path, skipped.reason
            ));
        }
        if report.issues.is_empty() {
            stage.info("Package structure is consistent");
        }
        Some(report)
    } else {
        None
    };
    stage.finish(85)?;

    let bytes = package.write_to_bytes()?;
    stage.sink.progress(100);
    stage.success(&format!("Workbook unlocked ({} bytes)", bytes.len()));

    Ok(UnlockedWorkbook {
        bytes,
        vba_part,
        markers: report.cleared,
        checksum: Some(checksum),
        relaxed,
        repair,
    })
}

/// Recover VBA module source from `input` without modifying it.
pub fn extract_workbook_modules(
    input: &[u8],
    options: &UnlockOptions,
    sink: &mut dyn PipelineSink,
    cancel: &CancellationToken,
) -> Result<Extraction, PipelineError> {
    let mut stage = Stage { sink, cancel };
    let package = load_package(input, options, &mut stage)?;

    let vba_part = package.vba_project_part();
    if vba_part.is_none() && !package.declares_vba_project() {
        return Err(PipelineError::MissingVbaProject);
    }
    let vba_bin = vba_part.as_deref().and_then(|part| package.part(part));
    match (&vba_part, vba_bin) {
        (Some(part), Some(bytes)) => {
            stage.info(&format!("Found VBA project `{part}` ({} bytes)", bytes.len()))
        }
        _ => stage.warn("VBA project is declared but its part is missing"),
    }

    let sheet_names = match package.sheet_names() {
        Ok(names) => names,
        Err(err) => {
            stage.warn(&format!("Could not read worksheet names: {err}"));
            Vec::new()
        }
    };
    stage.finish(40)?;

    let extraction = extract_modules(&ExtractionInput {
        vba_bin,
        sheet_names: &sheet_names,
        vba_present: true,
    });
    stage.finish(90)?;

    match extraction.strategy {
        Some("structured") => stage.success(&format!(
            "Extracted {} modules",
            extraction.modules.len()
        )),
        Some("placeholder") => stage.warn(&format!(
            "Module source could not be recovered; listed {} placeholder modules",
            extraction.modules.len()
        )),
        Some(strategy) => stage.warn(&format!(
            "Recovered {} modules by {strategy} scan; source may be incomplete",
            extraction.modules.len()
        )),
        None => stage.info("No VBA modules found"),
    }
    stage.sink.progress(100);
    Ok(extraction)
}

/// [`unlock_workbook`] with the log collected into a [`PipelineReport`].
pub fn run_unlock(
    input: &[u8],
    options: &UnlockOptions,
    cancel: &CancellationToken,
) -> PipelineReport<UnlockedWorkbook> {
    let mut sink = RecordingSink::default();
    let result = unlock_workbook(input, options, &mut sink, cancel);
    PipelineReport::from_result(result, sink)
}

/// [`extract_workbook_modules`] with the log collected into a [`PipelineReport`].
pub fn run_extract(
    input: &[u8],
    options: &UnlockOptions,
    cancel: &CancellationToken,
) -> PipelineReport<Extraction> {
    let mut sink = RecordingSink::default();
    let result = extract_workbook_modules(input, options, &mut sink, cancel);
    PipelineReport::from_result(result, sink)
}
