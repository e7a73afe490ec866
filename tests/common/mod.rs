//! Shared test helpers for integration tests.
//!
//! [`StubRemote`] stands in for the remote database: it records every SQL
//! text it receives and answers from a list of substring routes.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use sql_decomposer::cache::{self, cache_file};
use sql_decomposer::config::Settings;
use sql_decomposer::remote::{RemoteDatabase, RemoteError};
use sql_decomposer::table::{Column, ColumnType, Table, Value};
use tempfile::TempDir;

/// Remote database double.
#[derive(Default)]
pub struct StubRemote {
    routes: Vec<(String, Result<Table, RemoteError>)>,
    /// Every SQL text received, in order.
    pub calls: Vec<String>,
}

impl StubRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer queries containing `needle` with `table`. Earlier routes win.
    pub fn route(mut self, needle: &str, table: Table) -> Self {
        self.routes.push((needle.to_string(), Ok(table)));
        self
    }

    /// Fail queries containing `needle` with `err`.
    pub fn fail(mut self, needle: &str, err: RemoteError) -> Self {
        self.routes.push((needle.to_string(), Err(err)));
        self
    }

    /// Number of received queries containing `needle`.
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls.iter().filter(|c| c.contains(needle)).count()
    }
}

impl RemoteDatabase for StubRemote {
    fn fetch(&mut self, sql: &str) -> Result<Table, RemoteError> {
        self.calls.push(sql.to_string());
        self.routes
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, answer)| answer.clone())
            .unwrap_or_else(|| Ok(int_table("v", &[1])))
    }
}

/// A temporary working root with unattended settings.
pub fn workspace() -> (TempDir, Settings) {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings::unattended(dir.path());
    (dir, settings)
}

pub fn int_table(col: &str, values: &[i64]) -> Table {
    Table::with_rows(
        vec![Column::new(col, ColumnType::Int)],
        values.iter().map(|v| vec![Value::Int(*v)]).collect(),
    )
}

/// Pre-populate the knowledge bank with `table` under `name`.
pub fn write_bank(settings: &Settings, name: &str, table: &Table) {
    cache::store_table(&cache_file(&settings.knowledge_bank_dir(), name), table)
        .expect("write bank entry");
}

/// Read a CSV output written by a run.
pub fn read_output(path: &Path) -> Table {
    cache::load_table(path)
        .expect("readable output")
        .unwrap_or_else(|| panic!("{} missing", path.display()))
}

pub fn final_csv(settings: &Settings, skeleton: &str) -> PathBuf {
    settings.output_dir().join(skeleton).join("final.csv")
}
