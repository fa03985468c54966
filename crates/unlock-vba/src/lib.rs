//! `unlock-vba` works on the VBA project embedded in macro-enabled workbooks (`vbaProject.bin`).
//!
//! - Write path: clear password/protection markers ([`neutralize`]) and restamp the additive
//!   checksum ([`restamp`]). Both are byte-level and never parse the compound file.
//! - Read path: recover module source through an ordered chain of strategies
//!   ([`extract_modules`]), starting with a structured MS-OVBA parse ([`VBAProject::parse`]).

mod checksum;
mod compression;
mod decode;
mod dir;
mod extract;
mod neutralize;
mod ole;
mod project;
pub mod scan;

pub use checksum::{
    compute_checksum, is_consistent, restamp, restamp_in_place, stored_checksum, ChecksumError,
    CHECKSUM_OFFSET, MIN_HEADER_LEN, PAYLOAD_OFFSET,
};
pub use compression::{compress_container, decompress_container, CompressionError};
pub use decode::clean_code;
pub use dir::{DirModuleType, DirParseError, DirStream, ModuleRecord};
pub use extract::{
    classify, extract_modules, sort_modules, Confidence, Extraction, ExtractionInput,
    ModuleDescriptor, ModuleKind, Strategy, STRATEGIES,
};
pub use neutralize::{
    neutralize, neutralize_with, neutralize_with_catalogue, ClearRule, FillPolicy, MarkerRule,
    Neutralized, NeutralizeReport, ProtectionMarker, END_GUARD, FLAG_WINDOW, MARKER_CATALOGUE,
};
pub use ole::{looks_like_compound_file, OleError, OleFile, CFB_MAGIC};
pub use project::{parse_attributes, ParseError, VBAModule, VBAProject};
