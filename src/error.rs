//! Error types for the decomposer.
//!
//! All errors that can occur while decomposing, materializing, or
//! recomposing a query are represented by [`DecomposerError`]. Errors are
//! propagated via `Result<T, DecomposerError>` throughout the crate and
//! turned into a single operator-facing diagnostic line by the binary.
//!
//! # Error Classification
//!
//! Errors are classified into five categories:
//! - **Config**: malformed configuration block, missing bank file, missing
//!   anchor target. Fatal.
//! - **Remote**: the database rejected or failed a statement. "Statement too
//!   complex" is reported immediately; everything else is written to the
//!   error log first.
//! - **Cache**: a CTE flagged as materialized has no cache file behind it.
//! - **Recomposition**: the embedded engine could not evaluate the trailing
//!   query (or a backlink query).
//! - **Internal**: I/O failures and bugs.
//!
//! Nothing is retried: every variant ends the run.

use std::fmt;
use std::path::PathBuf;

/// Primary error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum DecomposerError {
    // ── Configuration errors ─────────────────────────────────────────────
    /// The leading configuration block or the settings file is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A banked CTE could not be loaded from the knowledge bank.
    #[error("invalid bank entry '{name}': {reason}")]
    InvalidBank { name: String, reason: String },

    /// An anchored CTE is not defined in every step.
    #[error("anchored CTE '{cte}' is missing from step '{step}'")]
    MissingAnchorTarget { cte: String, step: String },

    /// A CTE named by the configuration block does not exist in the query.
    #[error("CTE not found: {0}")]
    MissingCte(String),

    /// Two CTEs in one step share a (case-insensitive) name.
    #[error("duplicate CTE name: {0}")]
    DuplicateCte(String),

    // ── Remote execution errors ──────────────────────────────────────────
    /// The remote database refused the statement shape.
    #[error("statement too complex, avoid multi-indexing (CTE '{cte}')")]
    StatementTooComplex { cte: String },

    /// Any other remote failure. The raw text has already been appended to
    /// the error log when this is returned.
    #[error("remote execution failed for CTE '{cte}': {message}")]
    Remote { cte: String, message: String },

    /// The remote database could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    // ── Cache errors ─────────────────────────────────────────────────────
    /// A CTE marked as pre-materialized has no cache file.
    #[error("CTE '{cte}' marked as pre-materialized but {} is missing", .path.display())]
    CacheMissing { cte: String, path: PathBuf },

    /// A cache file exists but could not be read or written.
    #[error("cache error at {}: {message}", .path.display())]
    Cache { path: PathBuf, message: String },

    // ── Recomposition errors ─────────────────────────────────────────────
    /// The embedded engine failed to evaluate a query.
    #[error("recomposition failed: {0}")]
    Recomposition(String),

    /// Step results could not be stacked into one table.
    #[error("step result '{step}' has {found} columns, expected {expected}")]
    SchemaMismatch {
        step: String,
        expected: usize,
        found: usize,
    },

    // ── Post-execution errors ────────────────────────────────────────────
    /// The post-execution program could not be copied or started.
    #[error("post-exec hook failed: {0}")]
    PostExec(String),

    // ── Internal errors ──────────────────────────────────────────────────
    /// Filesystem failure outside the cache (logs, output directories).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Classification of error kind for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Remote,
    Cache,
    Recomposition,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Config => write!(f, "CONFIG"),
            ErrorKind::Remote => write!(f, "REMOTE"),
            ErrorKind::Cache => write!(f, "CACHE"),
            ErrorKind::Recomposition => write!(f, "RECOMPOSITION"),
            ErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl DecomposerError {
    /// Classify the error for reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecomposerError::Config(_)
            | DecomposerError::InvalidBank { .. }
            | DecomposerError::MissingAnchorTarget { .. }
            | DecomposerError::MissingCte(_)
            | DecomposerError::DuplicateCte(_) => ErrorKind::Config,

            DecomposerError::StatementTooComplex { .. }
            | DecomposerError::Remote { .. }
            | DecomposerError::Connection(_) => ErrorKind::Remote,

            DecomposerError::CacheMissing { .. } | DecomposerError::Cache { .. } => {
                ErrorKind::Cache
            }

            DecomposerError::Recomposition(_) | DecomposerError::SchemaMismatch { .. } => {
                ErrorKind::Recomposition
            }

            DecomposerError::PostExec(_)
            | DecomposerError::Io(_)
            | DecomposerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Indentation level of the operator-facing diagnostic line.
    pub fn report_indent(&self) -> usize {
        match self {
            DecomposerError::Remote { .. } => 2,
            DecomposerError::Recomposition(_)
            | DecomposerError::SchemaMismatch { .. }
            | DecomposerError::Connection(_) => 1,
            _ => 0,
        }
    }

    /// Render the diagnostic line with its indentation.
    pub fn report(&self) -> String {
        format!("{}{}", "  ".repeat(self.report_indent()), self)
    }

    pub(crate) fn cache(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        DecomposerError::Cache {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
