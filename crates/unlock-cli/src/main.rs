use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use unlock_vba::{FillPolicy, ModuleDescriptor};
use unlock_xlsx::{
    extract_workbook_modules, modules_export_file_name, render_modules_export,
    unlock_workbook, unlocked_file_name, CancellationToken, FnSink, RelaxEntry, RelaxOptions,
    RepairReport, Severity, UnlockOptions, UNLOCKED_MIME_TYPE,
};

/// Workbook extensions accepted as input.
const ACCEPTED_EXTENSIONS: [&str; 6] = ["xlsm", "xlsb", "xlam", "xltm", "xlsx", "xls"];

#[derive(Debug, Parser)]
#[command(name = "vba-unlock")]
#[command(
    about = "Remove VBA project protection from macro-enabled workbooks and recover module source."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Clear VBA project protection, relax workbook restrictions and repair the package.
    Unlock(UnlockArgs),
    /// Recover VBA module source into a text export (or a JSON listing).
    Extract(ExtractArgs),
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Workbook to read.
    input: PathBuf,

    /// JSON file overriding pipeline options (missing fields keep their defaults).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Only print warnings and errors on stderr.
    #[arg(long, short)]
    quiet: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FillArg {
    Auto,
    Zero,
    Space,
}

impl From<FillArg> for FillPolicy {
    fn from(value: FillArg) -> Self {
        match value {
            FillArg::Auto => FillPolicy::Auto,
            FillArg::Zero => FillPolicy::Zero,
            FillArg::Space => FillPolicy::Space,
        }
    }
}

#[derive(Debug, Args)]
struct UnlockArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Output workbook (default: `<stem>_unlocked.xlsm` next to the input).
    #[arg(long, short, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Byte written over cleared password values.
    #[arg(long, value_enum)]
    fill: Option<FillArg>,

    /// Leave sheet/workbook protection and trust settings untouched.
    #[arg(long)]
    no_relax: bool,

    /// Skip the package consistency repair.
    #[arg(long)]
    no_repair: bool,

    /// Print a JSON summary on stdout.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ExtractArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Text export path (default: `<stem>_vba_modules.txt` next to the input).
    #[arg(long, short, value_name = "PATH", conflicts_with = "json")]
    output: Option<PathBuf>,

    /// Print the module listing as JSON on stdout instead of writing a text export.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct MarkerSummary {
    pattern: &'static str,
    offset: usize,
    cleared_bytes: usize,
}

#[derive(Debug, Serialize)]
struct UnlockSummary<'a> {
    input: String,
    output: String,
    mime_type: &'static str,
    vba_part: &'a str,
    markers: Vec<MarkerSummary>,
    checksum: Option<u32>,
    relaxed: &'a [RelaxEntry],
    repair: Option<&'a RepairReport>,
}

#[derive(Debug, Serialize)]
struct ModuleEntry<'a> {
    #[serde(flatten)]
    module: &'a ModuleDescriptor,
    file_name: String,
}

#[derive(Debug, Serialize)]
struct ModuleListing<'a> {
    input: String,
    strategy: Option<&'static str>,
    modules: Vec<ModuleEntry<'a>>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Unlock(args) => run_unlock(args),
        Command::Extract(args) => run_extract(args),
    }
}

fn run_unlock(args: UnlockArgs) -> Result<()> {
    let mut options = load_options(args.common.config.as_deref())?;
    if let Some(fill) = args.fill {
        options.fill_policy = fill.into();
    }
    if args.no_relax {
        options.relax = RelaxOptions {
            remove_sheet_protection: false,
            remove_workbook_protection: false,
            enable_external_links: false,
            ensure_file_version: false,
            mark_trusted: false,
            remove_vba_signatures: false,
        };
    }
    if args.no_repair {
        options.repair = false;
    }

    let input = read_input(&args.common.input, options.max_input_bytes)?;
    let output = args
        .output
        .unwrap_or_else(|| sibling(&args.common.input, unlocked_file_name));

    let quiet = args.common.quiet;
    let mut sink = stderr_sink(quiet);
    let unlocked = unlock_workbook(&input, &options, &mut sink, &CancellationToken::new())
        .with_context(|| format!("unlock {}", args.common.input.display()))?;

    std::fs::write(&output, &unlocked.bytes)
        .with_context(|| format!("write {}", output.display()))?;
    if !quiet {
        eprintln!("wrote {}", output.display());
    }

    if args.json {
        let summary = UnlockSummary {
            input: args.common.input.to_string_lossy().into_owned(),
            output: output.to_string_lossy().into_owned(),
            mime_type: UNLOCKED_MIME_TYPE,
            vba_part: &unlocked.vba_part,
            markers: unlocked
                .markers
                .iter()
                .map(|marker| MarkerSummary {
                    pattern: marker.pattern_name,
                    offset: marker.offset,
                    cleared_bytes: marker.cleared.len(),
                })
                .collect(),
            checksum: unlocked.checksum,
            relaxed: &unlocked.relaxed,
            repair: unlocked.repair.as_ref(),
        };
        print_json(&summary)?;
    }
    Ok(())
}

fn run_extract(args: ExtractArgs) -> Result<()> {
    let options = load_options(args.common.config.as_deref())?;
    let input = read_input(&args.common.input, options.max_input_bytes)?;

    let quiet = args.common.quiet;
    let mut sink = stderr_sink(quiet);
    let extraction =
        extract_workbook_modules(&input, &options, &mut sink, &CancellationToken::new())
            .with_context(|| format!("extract {}", args.common.input.display()))?;

    if args.json {
        let listing = ModuleListing {
            input: args.common.input.to_string_lossy().into_owned(),
            strategy: extraction.strategy,
            modules: extraction
                .modules
                .iter()
                .map(|module| ModuleEntry {
                    module,
                    file_name: module.file_name(),
                })
                .collect(),
        };
        return print_json(&listing);
    }

    let source_name = args
        .common
        .input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let output = args
        .output
        .unwrap_or_else(|| sibling(&args.common.input, modules_export_file_name));
    std::fs::write(&output, render_modules_export(&source_name, &extraction.modules))
        .with_context(|| format!("write {}", output.display()))?;
    if !quiet {
        eprintln!("wrote {}", output.display());
    }
    Ok(())
}

/// Pipeline messages go to stderr with a severity prefix; stdout is reserved for JSON.
fn stderr_sink(quiet: bool) -> FnSink<impl FnMut(&str, Severity), impl FnMut(u8)> {
    FnSink::new(move |message: &str, severity: Severity| {
        if quiet && matches!(severity, Severity::Info | Severity::Success) {
            return;
        }
        eprintln!("[{}] {message}", severity.label());
    })
    .with_progress(move |percent| {
        if !quiet {
            eprintln!("progress: {percent}%");
        }
    })
}

fn load_options(path: Option<&Path>) -> Result<UnlockOptions> {
    let Some(path) = path else {
        return Ok(UnlockOptions::default());
    };
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse config {}", path.display()))
}

fn read_input(path: &Path, max_bytes: u64) -> Result<Vec<u8>> {
    let extension = path
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !ACCEPTED_EXTENSIONS.contains(&extension.as_str()) {
        bail!(
            "unsupported file type '{}' (expected one of: {})",
            path.display(),
            ACCEPTED_EXTENSIONS.join(", ")
        );
    }

    let size = std::fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    if size > max_bytes {
        bail!(
            "{} is {size} bytes, larger than the {max_bytes} byte limit",
            path.display()
        );
    }
    std::fs::read(path).with_context(|| format!("read {}", path.display()))
}

fn sibling(input: &Path, name_for: fn(&str) -> String) -> PathBuf {
    let original = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(name_for(&original))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    serde_json::to_writer_pretty(&mut handle, value)?;
    handle.write_all(b"\n")?;
    Ok(())
}
