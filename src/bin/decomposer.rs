//! `decomposer`: run CTE decomposition over the queries under `input/`.
//!
//! ```text
//! decomposer [--settings PATH] [--autorun] [--verbose] [run [NAMES…] | interactive]
//! ```
//!
//! Without a subcommand the `interface_mode` setting picks between a
//! sequential run over every `input/*.sql` file and an interactive loop
//! that reads query names from stdin.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sql_decomposer::cache::StdinPrompt;
use sql_decomposer::config::{DEFAULT_SETTINGS_PATH, InterfaceMode, Settings};
use sql_decomposer::error::ErrorKind;
use sql_decomposer::remote::PgRemote;
use sql_decomposer::{DecomposerError, Skeleton};

const DEFAULT_FILTER: &str = "sql_decomposer=info,decomposer=info";
const VERBOSE_FILTER: &str = "sql_decomposer=debug,decomposer=debug";

/// Exit codes by error kind.
mod exit_codes {
    pub const CONFIG_ERROR: i32 = 1;
    pub const REMOTE_ERROR: i32 = 2;
    pub const CACHE_ERROR: i32 = 3;
    pub const RECOMPOSITION_ERROR: i32 = 4;
    pub const OTHER_ERROR: i32 = 5;
}

#[derive(Debug, Parser)]
#[command(name = "decomposer", version, about)]
struct Cli {
    /// Settings file; a template is written here when it does not exist.
    #[arg(long, env = "DECOMPOSER_SETTINGS", default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,

    /// Reuse cached materializations without prompting.
    #[arg(long)]
    autorun: bool,

    /// Debug-level logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decompose the named queries, or every `input/*.sql` file.
    Run { names: Vec<String> },
    /// Read query names from stdin until EOF.
    Interactive,
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let mut settings = match Settings::load(&cli.settings) {
        Ok(s) => s,
        Err(e) => fail(&e),
    };
    if cli.autorun {
        settings.autorun = true;
    }

    let outcome = match cli.command {
        Some(Command::Run { names }) => run_sequential(&settings, &names),
        Some(Command::Interactive) => run_interactive(&settings),
        None => match settings.interface_mode {
            InterfaceMode::Sequential => run_sequential(&settings, &[]),
            InterfaceMode::Cli => run_interactive(&settings),
        },
    };
    if let Err(e) = outcome {
        fail(&e);
    }
}

fn fail(err: &DecomposerError) -> ! {
    error!(kind = %err.kind(), "{err}");
    eprintln!("\x1b[31m{}\x1b[0m", err.report());
    let code = match err.kind() {
        ErrorKind::Config => exit_codes::CONFIG_ERROR,
        ErrorKind::Remote => exit_codes::REMOTE_ERROR,
        ErrorKind::Cache => exit_codes::CACHE_ERROR,
        ErrorKind::Recomposition => exit_codes::RECOMPOSITION_ERROR,
        ErrorKind::Internal => exit_codes::OTHER_ERROR,
    };
    process::exit(code);
}

/// Normalize an operator-typed query name to its input file name.
fn query_file(name: &str) -> String {
    let name = name.trim().to_lowercase();
    if name.ends_with(".sql") {
        name
    } else {
        format!("{name}.sql")
    }
}

fn decompose(settings: &Settings, path: &Path) -> Result<(), DecomposerError> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| DecomposerError::Internal(format!("bad query path {}", path.display())))?;
    info!(query = name, "decomposing");
    let text = fs::read_to_string(path)?;
    let mut remote = PgRemote::connect(&settings.database)?;
    let mut skeleton = Skeleton::new(name, &text, settings)?;
    let result = skeleton.execute(&mut remote, &mut StdinPrompt)?;
    info!(query = name, rows = result.len(), "done");
    Ok(())
}

fn run_sequential(settings: &Settings, names: &[String]) -> Result<(), DecomposerError> {
    let input = settings.input_dir();
    let mut paths: Vec<PathBuf> = if names.is_empty() {
        fs::read_dir(&input)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "sql"))
            .collect()
    } else {
        names.iter().map(|n| input.join(query_file(n))).collect()
    };
    paths.sort();
    if paths.is_empty() {
        warn!(dir = %input.display(), "no queries to run");
    }
    for path in &paths {
        decompose(settings, path)?;
    }
    Ok(())
}

fn run_interactive(settings: &Settings) -> Result<(), DecomposerError> {
    let mut line = String::new();
    loop {
        print!("Query name: ");
        io::stdout().flush()?;
        // The stdin lock is released between reads; the reuse prompt needs it.
        line.clear();
        if io::stdin().read_line(&mut line)? == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let path = settings.input_dir().join(query_file(&line));
        match decompose(settings, &path) {
            Ok(()) => {}
            // An unreachable database only skips this query.
            Err(e @ DecomposerError::Connection(_)) => eprintln!("{}", e.report()),
            Err(e) => return Err(e),
        }
    }
}
