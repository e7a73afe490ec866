//! sql_decomposer: decompose CTE-heavy SQL into cached, re-runnable fragments.
//!
//! A query built from common table expressions is split at its top-level
//! CTE boundaries. Each CTE is executed on its own against a remote
//! PostgreSQL database and its result cached as a CSV file. Sub-selects that
//! read from an earlier sibling CTE ("backlinks") are resolved in-process and
//! injected back as literal `VALUES` tables. The trailing query is then run
//! over all cached tables by an embedded SQLite engine.
//!
//! Re-running a query after a partial failure or a data change only
//! recomputes the fragments whose caches are missing or declined.
//!
//! # Layout
//!
//! - [`scanner`] finds CTE boundaries.
//! - [`backlink`] rewrites sub-selects over siblings to placeholders.
//! - [`literal`] serializes resolved tables into injectable SQL.
//! - [`cache`] owns the on-disk layout and the reuse prompt.
//! - [`node`], [`step`] and [`skeleton`] orchestrate materialization.
//! - [`remote`] and [`engine`] are the remote and in-process SQL boundaries.

pub mod backlink;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod literal;
pub mod node;
pub mod remote;
pub mod scanner;
pub mod skeleton;
pub mod step;
pub mod table;

pub use error::DecomposerError;
pub use skeleton::Skeleton;
