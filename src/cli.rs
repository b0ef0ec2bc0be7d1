// Command-line driver for blockdelta.
//
// `diff` plans an update between two raw images and writes the transfer
// list, new-data and patch artifacts under an output prefix. `ranges` and
// `config` are small inspection helpers.

use std::path::{Path, PathBuf};
use std::process;

use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use log::LevelFilter;

use crate::image::{Alignment, BLOCK_SIZE, DataImage, Image};
use crate::io::{Artifacts, compute_to_prefix, read_image};
use crate::plan::{self, BlockImageDiff, ComputeStats, DiffOptions, DiffTool};
use crate::rangeset::RangeSet;

// ---------------------------------------------------------------------------
// Cache size and threshold parsing
// ---------------------------------------------------------------------------

/// Binary multiplier for a `--cache-size` unit. `B` is optional and units
/// are case-insensitive, so `256M`, `256MB` and `256MiB` are all 256 MiB.
fn cache_unit(unit: &str) -> Option<u64> {
    let unit = unit.to_ascii_lowercase();
    let unit = unit
        .strip_suffix("ib")
        .or_else(|| unit.strip_suffix('b'))
        .unwrap_or(unit.as_str());
    match unit {
        "" => Some(1),
        "k" => Some(1 << 10),
        "m" => Some(1 << 20),
        "g" => Some(1 << 30),
        "t" => Some(1 << 40),
        _ => None,
    }
}

/// Parse `--cache-size`: a positive byte count with an optional unit.
fn parse_cache_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(format!("invalid cache size '{s}': expected a number"));
    }
    let num: u64 = digits
        .parse()
        .map_err(|e| format!("invalid cache size '{s}': {e}"))?;
    let multiplier = cache_unit(unit.trim()).ok_or_else(|| format!("unknown unit in cache size '{s}'"))?;
    match num.checked_mul(multiplier) {
        Some(0) => Err("cache size must be positive".into()),
        Some(bytes) => Ok(bytes),
        None => Err(format!("cache size overflow: '{s}'")),
    }
}

fn parse_threshold(s: &str) -> Result<f64, String> {
    let value: f64 = s
        .trim()
        .parse()
        .map_err(|e| format!("invalid threshold '{s}': {e}"))?;
    if value > 0.0 && value <= 1.0 {
        Ok(value)
    } else {
        Err(format!("threshold must be in (0, 1], got {value}"))
    }
}

// ---------------------------------------------------------------------------
// Clap CLI definition
// ---------------------------------------------------------------------------

/// Block-image transfer list generator.
#[derive(Parser, Debug)]
#[command(
    name = "blockdelta",
    version,
    about = "Block-image transfer list generator",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Force overwrite existing output files.
    #[arg(short = 'f', long, global = true)]
    force: bool,

    /// Quiet mode (suppress non-error output).
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode (use multiple times for more detail).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Output stats as JSON to stderr.
    #[arg(long = "json", global = true)]
    json_output: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Plan an update from a source image to a target image.
    Diff(DiffArgs),
    /// Parse a block range set and print its forms.
    Ranges(RangesArgs),
    /// Print build/configuration details.
    Config,
}

#[derive(Args, Debug)]
struct DiffArgs {
    /// Target image.
    #[arg(short = 't', long, value_hint = ValueHint::FilePath)]
    target: PathBuf,

    /// Source image. Omit for a full (non-incremental) update.
    #[arg(short = 's', long, value_hint = ValueHint::FilePath)]
    source: Option<PathBuf>,

    /// Output prefix; writes <prefix>.transfer.list, .new.dat and .patch.dat.
    #[arg(short = 'o', long, value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Transfer list version (1-4).
    #[arg(long = "transfer-version", default_value_t = plan::MAX_VERSION)]
    version: u32,

    /// Patch worker threads (default: half the CPUs).
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Never use imgdiff.
    #[arg(long)]
    disable_imgdiff: bool,

    /// Device cache size limiting stashes (e.g. 256M).
    #[arg(long, value_parser = parse_cache_size)]
    cache_size: Option<u64>,

    /// Fraction of the cache stashes may use.
    #[arg(long, value_parser = parse_threshold, default_value_t = plan::DEFAULT_STASH_THRESHOLD)]
    stash_threshold: f64,

    /// Path to the bsdiff executable.
    #[arg(long, value_hint = ValueHint::ExecutablePath)]
    bsdiff: Option<PathBuf>,

    /// Path to the imgdiff executable.
    #[arg(long, value_hint = ValueHint::ExecutablePath)]
    imgdiff: Option<PathBuf>,

    /// Zero-pad a trailing partial block (it is then always rewritten).
    #[arg(long, conflicts_with = "trim")]
    pad: bool,

    /// Drop a trailing partial block.
    #[arg(long)]
    trim: bool,
}

#[derive(Args, Debug)]
struct RangesArgs {
    /// Range text, e.g. "10-19 30".
    text: String,

    /// Parse the raw form ("<count>,<b0>,...") instead.
    #[arg(long)]
    raw: bool,
}

// ---------------------------------------------------------------------------
// Resolved command + options (flattened from Cli)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Diff,
    Ranges,
    Config,
}

#[derive(Debug)]
struct Options {
    command: Command,
    force: bool,
    quiet: bool,
    verbose: u8,
    json_output: bool,
    target_file: Option<PathBuf>,
    source_file: Option<PathBuf>,
    output_prefix: Option<PathBuf>,
    alignment: Alignment,
    diff: DiffOptions,
    bsdiff_path: Option<PathBuf>,
    imgdiff_path: Option<PathBuf>,
    ranges_text: Option<String>,
    ranges_raw: bool,
}

fn resolve_options(cli: Cli) -> Options {
    let mut opts = Options {
        command: Command::Config,
        force: cli.force,
        quiet: cli.quiet,
        verbose: cli.verbose.min(2),
        json_output: cli.json_output,
        target_file: None,
        source_file: None,
        output_prefix: None,
        alignment: Alignment::Exact,
        diff: DiffOptions::default(),
        bsdiff_path: None,
        imgdiff_path: None,
        ranges_text: None,
        ranges_raw: false,
    };

    match cli.command {
        Cmd::Diff(args) => {
            opts.command = Command::Diff;
            opts.target_file = Some(args.target);
            opts.source_file = args.source;
            opts.output_prefix = Some(args.output);
            opts.alignment = if args.pad {
                Alignment::Pad
            } else if args.trim {
                Alignment::Trim
            } else {
                Alignment::Exact
            };
            opts.diff = DiffOptions {
                version: args.version,
                threads: args.threads,
                disable_imgdiff: args.disable_imgdiff,
                cache_size: args.cache_size,
                stash_threshold: args.stash_threshold,
            };
            opts.bsdiff_path = args.bsdiff;
            opts.imgdiff_path = args.imgdiff;
        }
        Cmd::Ranges(args) => {
            opts.command = Command::Ranges;
            opts.ranges_text = Some(args.text);
            opts.ranges_raw = args.raw;
        }
        Cmd::Config => {}
    }
    opts
}

#[cfg(any(test, feature = "fuzzing"))]
pub fn fuzz_try_parse_args(args: &[String]) {
    let argv: Vec<String> = std::iter::once("blockdelta".to_string())
        .chain(args.iter().cloned())
        .collect();
    if let Ok(cli) = Cli::try_parse_from(argv) {
        let _ = resolve_options(cli);
    }
}

fn log_level(opts: &Options) -> Option<LevelFilter> {
    if opts.quiet {
        return Some(LevelFilter::Error);
    }
    match opts.verbose {
        0 => None,
        1 => Some(LevelFilter::Info),
        _ => Some(LevelFilter::Debug),
    }
}

// ---------------------------------------------------------------------------
// Config command
// ---------------------------------------------------------------------------

fn cmd_config() -> i32 {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!("blockdelta version {version} (Rust)");

    let defaults = DiffOptions::default();
    eprintln!("BLOCK_SIZE={BLOCK_SIZE}");
    eprintln!("MAX_VERSION={}", plan::MAX_VERSION);
    eprintln!("DEFAULT_VERSION={}", defaults.version);
    eprintln!("DEFAULT_THREADS={}", plan::default_threads());
    eprintln!("DEFAULT_STASH_THRESHOLD={}", defaults.stash_threshold);
    eprintln!("IMGDIFF={}", u8::from(!defaults.disable_imgdiff));
    eprintln!("sizeof(usize)={}", std::mem::size_of::<usize>());

    0
}

// ---------------------------------------------------------------------------
// Ranges command
// ---------------------------------------------------------------------------

fn cmd_ranges(opts: &Options) -> i32 {
    let text = opts.ranges_text.as_deref().unwrap_or_default();
    let parsed = if opts.ranges_raw {
        RangeSet::parse_raw(text)
    } else {
        RangeSet::parse(text)
    };
    let ranges = match parsed {
        Ok(r) => r,
        Err(e) => {
            eprintln!("blockdelta: ranges: {e}");
            return 1;
        }
    };

    println!("ranges: {ranges}");
    println!("raw: {}", ranges.to_string_raw());
    println!("size: {}", ranges.size());
    println!("monotonic: {}", ranges.is_monotonic());

    if opts.json_output {
        let json = serde_json::json!({
            "command": "ranges",
            "ranges": ranges.to_string(),
            "raw": ranges.to_string_raw(),
            "size": ranges.size(),
            "monotonic": ranges.is_monotonic(),
        });
        print_json(&json);
    }
    0
}

// ---------------------------------------------------------------------------
// Diff command
// ---------------------------------------------------------------------------

fn load_image(label: &str, path: &Path, alignment: Alignment) -> Option<DataImage> {
    match read_image(path, alignment) {
        Ok(image) => Some(image),
        Err(e) => {
            eprintln!("blockdelta: {label} image: {}: {e}", path.display());
            None
        }
    }
}

fn cmd_diff(opts: &Options) -> i32 {
    let (Some(target_path), Some(prefix)) = (&opts.target_file, &opts.output_prefix) else {
        eprintln!("blockdelta: diff: missing target or output");
        return 1;
    };

    let artifacts = Artifacts::for_prefix(prefix);
    if !opts.force {
        for path in [&artifacts.transfer_list, &artifacts.new_data, &artifacts.patch_data] {
            if path.exists() {
                eprintln!(
                    "blockdelta: output file exists, use -f to overwrite: {}",
                    path.display()
                );
                return 1;
            }
        }
    }

    let Some(target) = load_image("target", target_path, opts.alignment) else {
        return 1;
    };
    let source = match &opts.source_file {
        Some(path) => match load_image("source", path, opts.alignment) {
            Some(image) => Some(image),
            None => return 1,
        },
        None => None,
    };

    let bsdiff = opts.bsdiff_path.clone();
    let imgdiff = opts.imgdiff_path.clone();
    let resolver = move |tool: DiffTool| {
        let configured = match tool {
            DiffTool::Bsdiff => bsdiff.as_ref(),
            DiffTool::Imgdiff => imgdiff.as_ref(),
        };
        configured.cloned().unwrap_or_else(|| PathBuf::from(tool.name()))
    };

    let src: Option<&dyn Image> = source.as_ref().map(|s| s as &dyn Image);
    let mut diff = match BlockImageDiff::new(&target, src, opts.diff.clone()) {
        Ok(d) => d.with_tool_resolver(resolver),
        Err(e) => {
            eprintln!("blockdelta: {e}");
            return 1;
        }
    };

    let stats = match compute_to_prefix(&mut diff, prefix) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("blockdelta: diff error: {e}");
            return 1;
        }
    };

    if opts.verbose > 0 && !opts.quiet {
        eprintln!(
            "blockdelta: version {}, {} transfers, {} blocks written, max stash {} blocks",
            stats.version, stats.transfers, stats.blocks_written, stats.max_stashed_blocks
        );
    }

    if opts.json_output {
        print_json(&stats_json(&stats, &target, source.as_ref()));
    }

    0
}

fn stats_json(stats: &ComputeStats, target: &DataImage, source: Option<&DataImage>) -> serde_json::Value {
    serde_json::json!({
        "command": "diff",
        "version": stats.version,
        "target_blocks": target.total_blocks(),
        "source_blocks": source.map_or(0, |s| s.total_blocks()),
        "transfers": stats.transfers,
        "blocks_written": stats.blocks_written,
        "stash_slots": stats.next_stash_id,
        "max_stashed_blocks": stats.max_stashed_blocks,
        "max_stashed_bytes": stats.max_stashed_bytes,
        "new_blocks": stats.new_blocks,
        "new_data_bytes": stats.new_data_bytes,
        "patch_bytes": stats.patch_bytes,
        "zero": stats.zero_transfers,
        "move": stats.move_transfers,
        "bsdiff": stats.bsdiff_transfers,
        "imgdiff": stats.imgdiff_transfers,
        "touched_src_sha1": stats.touched_src_sha1,
    })
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => eprintln!("{text}"),
        Err(e) => eprintln!("blockdelta: json: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Main CLI entry point. Parses arguments via clap, dispatches commands.
pub fn run() -> ! {
    let cli = Cli::parse();
    let opts = resolve_options(cli);

    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    logger.format_timestamp(None).format_target(false);
    if let Some(level) = log_level(&opts) {
        logger.filter_level(level);
    }
    logger.init();

    let exit_code = match opts.command {
        Command::Diff => cmd_diff(&opts),
        Command::Ranges => cmd_ranges(&opts),
        Command::Config => cmd_config(),
    };

    process::exit(exit_code);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
