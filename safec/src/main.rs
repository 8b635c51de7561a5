//! SafeC Instrumentation CLI
//!
//! # Usage
//!
//! ```text
//! safec [OPTIONS] <COMMAND>
//!
//! Commands:
//!   instrument  Instrument a module
//!   bitmap      Print the write-barrier bitmap of a type
//!   libcalls    List the recognized library calls
//!
//! Options:
//!   -v, --verbose  Increase verbosity (can be repeated)
//!   -q, --quiet    Suppress non-error output
//!   -h, --help     Print help information
//!   -V, --version  Print version information
//! ```
//!
//! Modules and types are read as JSON. `RUST_LOG` overrides the log level
//! chosen by `-v`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use safec::ir::{Module, Type};
use safec::{InstrumentError, KnownLibraryCalls, MemSafePass, PassConfig, TypeBitmapComputer};

/// Memory-safety instrumentation for C-like modules
#[derive(Parser)]
#[command(name = "safec")]
#[command(version)]
#[command(about = "Memory-safety instrumentation: heap promotion and runtime checks", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Instrument a module
    ///
    /// Promotes escaping stack allocations to the managed heap and inserts
    /// escape checks, bounds checks and write barriers.
    Instrument(InstrumentArgs),

    /// Print the write-barrier bitmap of a type
    Bitmap {
        /// JSON file holding one type
        #[arg(value_name = "TYPE")]
        file: PathBuf,
    },

    /// List the recognized library calls
    Libcalls,
}

#[derive(Args)]
struct InstrumentArgs {
    /// JSON module to instrument
    #[arg(value_name = "MODULE")]
    file: PathBuf,

    /// Output file (defaults to stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = Emit::Json)]
    emit: Emit,

    /// Leave escaping allocations on the stack
    #[arg(long)]
    no_promote: bool,

    /// Do not insert escape checks
    #[arg(long)]
    no_escape_checks: bool,

    /// Do not insert bounds checks
    #[arg(long)]
    no_bounds_checks: bool,

    /// Do not insert write barriers
    #[arg(long)]
    no_write_barriers: bool,

    /// Print instrumentation statistics to stderr
    #[arg(long)]
    stats: bool,
}

impl InstrumentArgs {
    fn pass_config(&self) -> PassConfig {
        PassConfig {
            promote: !self.no_promote,
            escape_checks: !self.no_escape_checks,
            bounds_checks: !self.no_bounds_checks,
            write_barriers: !self.no_write_barriers,
        }
    }
}

/// Output format of `instrument`
#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Emit {
    /// The instrumented module as JSON
    Json,
    /// A readable listing
    Text,
}

fn init_logging(verbose: u8, quiet: bool) {
    let filter = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let result = match &cli.command {
        Commands::Instrument(args) => cmd_instrument(args, cli.quiet),
        Commands::Bitmap { file } => cmd_bitmap(file),
        Commands::Libcalls => cmd_libcalls(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if err.downcast_ref::<InstrumentError>().is_some() {
                eprintln!("error: instrumentation failed: {err:#}");
            } else {
                eprintln!("error: {err:#}");
            }
            ExitCode::from(1)
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read '{}'", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse '{}'", path.display()))
}

/// Instrument command - run the pass and write the result
fn cmd_instrument(args: &InstrumentArgs, quiet: bool) -> Result<()> {
    let mut module: Module = read_json(&args.file)?;
    module
        .validate()
        .with_context(|| format!("invalid module '{}'", args.file.display()))?;
    let mut pass = MemSafePass::new(args.pass_config());
    let stats = pass.run_on_module(&mut module)?;

    let rendered = match args.emit {
        Emit::Json => {
            let mut json = serde_json::to_string_pretty(&module).context("failed to serialize module")?;
            json.push('\n');
            json
        }
        Emit::Text => module.to_string(),
    };
    match &args.output {
        Some(path) => {
            fs::write(path, rendered).with_context(|| format!("failed to write '{}'", path.display()))?
        }
        None => print!("{rendered}"),
    }

    if args.stats && !quiet {
        eprintln!("{stats}");
    }
    Ok(())
}

/// Bitmap command - print a type's bitmap in hex and binary
fn cmd_bitmap(path: &Path) -> Result<()> {
    let ty: Type = read_json(path)?;
    let mut computer = TypeBitmapComputer::default();
    let bitmap = computer.compute(&ty)?;
    println!("{ty}: {bitmap:#x} ({bitmap:#b})");
    Ok(())
}

/// Libcalls command - list recognized library routines
fn cmd_libcalls() -> Result<()> {
    for name in KnownLibraryCalls::new().names() {
        println!("{name}");
    }
    Ok(())
}
