//! Materialization cache: file layout, table persistence, reuse prompt.
//!
//! Every materialized CTE is a CSV file. Files are keyed by skeleton name,
//! then step label, then role:
//!
//! ```text
//! <root>/{output|eph_materializations}/<skeleton>/[<step>/]materializations/<cte>.csv
//! <root>/output/<skeleton>/[<step>/]{final|<step>}.csv
//! <root>/knowledge_bank/<name>.csv
//! ```
//!
//! Each CSV written here gets a `<name>.schema.json` sidecar with its column
//! types. A CSV without one (or with a stale one) is loaded by inference.
//!
//! Files are not locked. Concurrent runs against the same skeleton are
//! undefined (last writer wins).

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::Settings;
use crate::error::DecomposerError;
use crate::table::{Schema, Table};

/// Directory names under a skeleton's output directory.
const MATERIALIZATIONS: &str = "materializations";
const ANCHORED: &str = "anchored";
const ERROR_LOG: &str = "error_log";

// ── Layout ─────────────────────────────────────────────────────────────────

/// Paths for one step of one skeleton.
#[derive(Debug, Clone)]
pub struct Layout {
    materialization_root: PathBuf,
    output_root: PathBuf,
    injected_root: PathBuf,
    backlink_root: PathBuf,
    log_dir: PathBuf,
    skeleton: String,
    step: String,
}

impl Layout {
    pub fn new(settings: &Settings, skeleton: &str, step: &str) -> Self {
        Self {
            materialization_root: settings.materialization_root(),
            output_root: settings.output_dir(),
            injected_root: settings.injected_dir(),
            backlink_root: settings.backlink_dir(),
            log_dir: settings.log_dir(),
            skeleton: skeleton.to_string(),
            step: step.to_string(),
        }
    }

    /// Step label; empty for a skeleton with a single unlabeled step.
    pub fn step(&self) -> &str {
        &self.step
    }

    fn scoped(&self, base: &Path) -> PathBuf {
        let dir = base.join(&self.skeleton);
        if self.step.is_empty() {
            dir
        } else {
            dir.join(&self.step)
        }
    }

    pub fn materialization_dir(&self) -> PathBuf {
        self.scoped(&self.materialization_root).join(MATERIALIZATIONS)
    }

    /// Shared cache directory for CTEs anchored across steps.
    pub fn anchor_dir(&self) -> PathBuf {
        self.materialization_root
            .join(&self.skeleton)
            .join(ANCHORED)
            .join(MATERIALIZATIONS)
    }

    pub fn injected_dir(&self) -> PathBuf {
        self.scoped(&self.injected_root)
    }

    pub fn backlink_dir(&self) -> PathBuf {
        self.scoped(&self.backlink_root)
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Where this step's recomposition result is written.
    pub fn step_output_path(&self) -> PathBuf {
        let file = if self.step.is_empty() {
            "final".to_string()
        } else {
            self.step.clone()
        };
        self.scoped(&self.output_root).join(format!("{file}.csv"))
    }

    /// Title of this step's recomposition query log.
    pub fn recomposition_log_title(&self) -> String {
        if self.step.is_empty() {
            self.skeleton.clone()
        } else {
            format!("{}_{}", self.skeleton, self.step)
        }
    }
}

/// Cache file of `cte` inside `dir`.
pub fn cache_file(dir: &Path, cte: &str) -> PathBuf {
    dir.join(format!("{cte}.csv"))
}

// ── Table persistence ──────────────────────────────────────────────────────

/// Schema sidecar of the CSV at `path`: `a.csv` → `a.schema.json`.
pub fn schema_file(path: &Path) -> PathBuf {
    path.with_extension("schema.json")
}

fn load_schema(path: &Path) -> Result<Option<Schema>, DecomposerError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DecomposerError::cache(path, e)),
    };
    match serde_json::from_str(&text) {
        Ok(schema) => Ok(Some(schema)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable schema, inferring types");
            Ok(None)
        }
    }
}

/// Load a cached table. A missing file is `Ok(None)`; an unreadable one is
/// an error.
pub fn load_table(path: &Path) -> Result<Option<Table>, DecomposerError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DecomposerError::cache(path, e)),
    };
    let schema = load_schema(&schema_file(path))?;
    Table::read_csv(file, schema.as_ref())
        .map(Some)
        .map_err(|e| DecomposerError::cache(path, e))
}

/// Persist `table` and its schema sidecar to `path`, creating parent
/// directories.
pub fn store_table(path: &Path, table: &Table) -> Result<(), DecomposerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| DecomposerError::cache(parent, e))?;
    }
    let file = File::create(path).map_err(|e| DecomposerError::cache(path, e))?;
    table
        .write_csv(file)
        .map_err(|e| DecomposerError::cache(path, e))?;

    let schema_path = schema_file(path);
    let json = serde_json::to_string_pretty(&table.schema())
        .map_err(|e| DecomposerError::cache(&schema_path, e))?;
    fs::write(&schema_path, json).map_err(|e| DecomposerError::cache(&schema_path, e))
}

// ── Diagnostic logs ────────────────────────────────────────────────────────

/// Write `sql` to `<dir>/<title>.sql`, replacing any previous dump.
pub fn write_sql_log(dir: &Path, title: &str, sql: &str) -> Result<(), DecomposerError> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(format!("{title}.sql")), sql)?;
    Ok(())
}

/// Append an entry to the standing error log in `dir`.
pub fn append_error_log(dir: &Path, context: &str, message: &str) -> Result<(), DecomposerError> {
    fs::create_dir_all(dir)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{ERROR_LOG}.sql")))?;
    writeln!(
        file,
        "-- {} {context}\n{message}\n",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
    )?;
    Ok(())
}

// ── Reuse prompt ───────────────────────────────────────────────────────────

/// Asks the operator whether a cached materialization should be reused.
pub trait ReusePrompt {
    fn confirm_reuse(&mut self, cte: &str) -> bool;
}

/// Prompt on stdout, answer on stdin. Only `y` confirms.
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl ReusePrompt for StdinPrompt {
    fn confirm_reuse(&mut self, cte: &str) -> bool {
        print!("    Serialization of '{cte}' detected. Skip materialization? (y) ");
        if io::stdout().flush().is_err() {
            return false;
        }
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(_) => line.trim().eq_ignore_ascii_case("y"),
            Err(_) => false,
        }
    }
}

/// A prompt that always gives the same answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl ReusePrompt for FixedAnswer {
    fn confirm_reuse(&mut self, _cte: &str) -> bool {
        self.0
    }
}
