//! CTE node: one fragment of a decomposed query and its materialization.
//!
//! A node moves one way, `unmaterialized → materialized`. Materializing
//! resolves the node's backlinks against already-materialized siblings,
//! injects the results as literal tables, then either reuses the cached
//! table or fetches it from the remote database, and persists it to every
//! configured cache directory.
//!
//! Cross-step anchoring uses one-shot events: callbacks registered on a node
//! are returned, in registration order, by the call that materializes it.
//! The owning skeleton applies them to the other steps.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::backlink::{self, Backlink, placeholder};
use crate::cache::{self, Layout, ReusePrompt, cache_file};
use crate::config::Settings;
use crate::engine;
use crate::error::DecomposerError;
use crate::literal;
use crate::remote::{RemoteDatabase, RemoteError};
use crate::table::Table;

/// One-shot notification fired when a node becomes materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// An anchored CTE was materialized by the first step; the same-named
    /// node of every later step can now load it from the shared cache.
    AnchorReleased { cte: String },
}

/// Run-wide collaborators needed to materialize nodes.
pub struct Session<'a> {
    pub settings: &'a Settings,
    pub remote: &'a mut dyn RemoteDatabase,
    pub prompt: &'a mut dyn ReusePrompt,
}

/// One CTE of one step.
#[derive(Debug, Clone)]
pub struct CteNode {
    name: String,
    raw: String,
    transformed: String,
    backlinks: Vec<Backlink>,
    materialized: bool,
    table: Option<Table>,
    /// Cache directories; the first is the one reads come from.
    cache_dirs: Vec<PathBuf>,
    callbacks: Vec<NodeEvent>,
}

impl CteNode {
    /// Build a node from its body. `is_known` names the siblings (and banked
    /// tables) visible to its sub-selects.
    pub fn new(
        name: &str,
        body: &str,
        cache_dir: PathBuf,
        is_known: impl Fn(&str) -> bool,
    ) -> Self {
        let raw = body.to_lowercase();
        let analysis = backlink::analyze(&raw, is_known);
        Self {
            name: name.to_lowercase(),
            raw,
            transformed: analysis.transformed,
            backlinks: analysis.backlinks,
            materialized: false,
            table: None,
            cache_dirs: vec![cache_dir],
            callbacks: Vec::new(),
        }
    }

    /// A knowledge-bank entry, loaded from `<bank_dir>/<name>.csv` and
    /// materialized from the start.
    pub fn banked(name: &str, bank_dir: &Path) -> Result<Self, DecomposerError> {
        let name = name.to_lowercase();
        let path = cache_file(bank_dir, &name);
        let table = cache::load_table(&path)
            .map_err(|e| DecomposerError::InvalidBank {
                name: name.clone(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| DecomposerError::InvalidBank {
                name: name.clone(),
                reason: format!("{} does not exist", path.display()),
            })?;
        debug!(cte = %name, rows = table.len(), "loaded bank entry");
        Ok(Self {
            name,
            raw: String::new(),
            transformed: String::new(),
            backlinks: Vec::new(),
            materialized: true,
            table: Some(table),
            cache_dirs: vec![bank_dir.to_path_buf()],
            callbacks: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lower-cased body as written in the query.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Body with backlinked sub-selects pointing at placeholders.
    pub fn transformed(&self) -> &str {
        &self.transformed
    }

    pub fn backlinks(&self) -> &[Backlink] {
        &self.backlinks
    }

    pub fn is_materialized(&self) -> bool {
        self.materialized
    }

    pub fn table(&self) -> Option<&Table> {
        self.table.as_ref()
    }

    pub fn cache_dirs(&self) -> &[PathBuf] {
        &self.cache_dirs
    }

    fn primary_cache(&self) -> PathBuf {
        cache_file(&self.cache_dirs[0], &self.name)
    }

    // ── Staging ────────────────────────────────────────────────────────

    /// Move the read location to `dir`.
    pub fn redirect_cache(&mut self, dir: PathBuf) {
        self.cache_dirs[0] = dir;
    }

    /// Also persist the materialized table under `dir`.
    pub fn add_cache_dir(&mut self, dir: PathBuf) {
        if !self.cache_dirs.contains(&dir) {
            self.cache_dirs.push(dir);
        }
    }

    pub fn on_materialized(&mut self, event: NodeEvent) {
        self.callbacks.push(event);
    }

    /// Flag the node as materialized elsewhere. Its table is read from the
    /// primary cache when it is materialized.
    pub fn mark_materialized(&mut self) {
        self.materialized = true;
    }

    // ── Materialization ────────────────────────────────────────────────

    /// Materialize this node and return the events registered on it.
    ///
    /// `lookup` gives the table of an already-materialized sibling or bank
    /// entry by name.
    pub fn materialize<'t>(
        &mut self,
        layout: &Layout,
        session: &mut Session<'_>,
        lookup: impl Fn(&str) -> Option<&'t Table>,
    ) -> Result<Vec<NodeEvent>, DecomposerError> {
        if self.materialized {
            if self.table.is_none() {
                let path = self.primary_cache();
                let table = cache::load_table(&path)?.ok_or_else(|| {
                    DecomposerError::CacheMissing {
                        cte: self.name.clone(),
                        path: path.clone(),
                    }
                })?;
                info!(cte = %self.name, "read anchored materialization");
                self.table = Some(table);
            }
            return Ok(Vec::new());
        }

        info!(cte = %self.name, backlinks = self.backlinks.len(), "resolving backlinks");
        let mut expressions = Vec::with_capacity(self.backlinks.len());
        for (k, link) in self.backlinks.iter().enumerate() {
            let target = lookup(&link.target).ok_or_else(|| {
                DecomposerError::Internal(format!(
                    "backlink target '{}' of '{}' is not materialized",
                    link.target, self.name
                ))
            })?;
            let resolved = engine::evaluate_on(target, &link.query)?;
            debug!(cte = %self.name, target = %link.target, rows = resolved.len(), "resolved backlink");
            expressions.push(literal::serialize_table(&resolved, &placeholder(k)));
        }
        let injected = literal::inject(&expressions, &self.transformed);

        let settings = session.settings;
        if settings.backlink_logging {
            cache::write_sql_log(&layout.backlink_dir(), &self.name, &self.transformed)?;
        }
        if settings.inject_logging {
            cache::write_sql_log(&layout.injected_dir(), &self.name, &injected)?;
        }

        let primary = self.primary_cache();
        let table = match cache::load_table(&primary)? {
            Some(cached) if settings.autorun || session.prompt.confirm_reuse(&self.name) => {
                info!(cte = %self.name, "reusing cached materialization");
                self.persist(&cached, 1)?;
                cached
            }
            found => {
                if found.is_none() {
                    debug!(cte = %self.name, "no cached materialization");
                }
                let fetched = self.fetch(&injected, layout, session)?;
                self.persist(&fetched, 0)?;
                fetched
            }
        };

        self.table = Some(table);
        self.materialized = true;
        Ok(std::mem::take(&mut self.callbacks))
    }

    fn fetch(
        &self,
        sql: &str,
        layout: &Layout,
        session: &mut Session<'_>,
    ) -> Result<Table, DecomposerError> {
        info!(cte = %self.name, "fetching");
        match session.remote.fetch(sql) {
            Ok(table) => Ok(table),
            Err(RemoteError::TooComplex(message)) => {
                warn!(cte = %self.name, %message, "statement too complex");
                Err(DecomposerError::StatementTooComplex {
                    cte: self.name.clone(),
                })
            }
            Err(RemoteError::Other(message)) => {
                cache::append_error_log(layout.log_dir(), &self.name, &message)?;
                Err(DecomposerError::Remote {
                    cte: self.name.clone(),
                    message: message.lines().next().unwrap_or_default().to_string(),
                })
            }
        }
    }

    fn persist(&self, table: &Table, skip: usize) -> Result<(), DecomposerError> {
        for dir in self.cache_dirs.iter().skip(skip) {
            cache::store_table(&cache_file(dir, &self.name), table)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FixedAnswer;
    use crate::table::{Column, ColumnType, Value};

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        fail: Option<RemoteError>,
    }

    impl RemoteDatabase for Recorder {
        fn fetch(&mut self, sql: &str) -> Result<Table, RemoteError> {
            self.calls.push(sql.to_string());
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            Ok(ints("v", &[1]))
        }
    }

    fn ints(col: &str, values: &[i64]) -> Table {
        Table::with_rows(
            vec![Column::new(col, ColumnType::Int)],
            values.iter().map(|v| vec![Value::Int(*v)]).collect(),
        )
    }

    fn none(_: &str) -> Option<&'static Table> {
        None
    }

    fn setup() -> (tempfile::TempDir, Settings, Layout) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::unattended(dir.path());
        let layout = Layout::new(&settings, "q", "");
        (dir, settings, layout)
    }

    #[test]
    fn test_fetch_and_persist() {
        let (_dir, settings, layout) = setup();
        let mut node = CteNode::new("A", "SELECT 1 AS v", layout.materialization_dir(), |_| false);
        let mut remote = Recorder::default();
        let mut prompt = FixedAnswer(false);
        let mut session = Session {
            settings: &settings,
            remote: &mut remote,
            prompt: &mut prompt,
        };
        node.materialize(&layout, &mut session, none).unwrap();
        assert!(node.is_materialized());
        assert_eq!(node.name(), "a");
        assert_eq!(remote.calls, vec!["select 1 as v".to_string()]);
        let path = cache_file(&layout.materialization_dir(), "a");
        assert_eq!(cache::load_table(&path).unwrap(), Some(ints("v", &[1])));
    }

    #[test]
    fn test_unattended_reuse_skips_remote() {
        let (_dir, settings, layout) = setup();
        let dir = layout.materialization_dir();
        cache::store_table(&cache_file(&dir, "a"), &ints("v", &[42])).unwrap();
        let mut node = CteNode::new("a", "select 1 as v", dir, |_| false);
        let mut remote = Recorder::default();
        let mut prompt = FixedAnswer(false);
        let mut session = Session {
            settings: &settings,
            remote: &mut remote,
            prompt: &mut prompt,
        };
        node.materialize(&layout, &mut session, none).unwrap();
        assert!(remote.calls.is_empty());
        assert_eq!(node.table(), Some(&ints("v", &[42])));
    }

    #[test]
    fn test_declined_reuse_fetches() {
        let (_dir, mut settings, layout) = setup();
        settings.autorun = false;
        let dir = layout.materialization_dir();
        cache::store_table(&cache_file(&dir, "a"), &ints("v", &[42])).unwrap();
        let mut node = CteNode::new("a", "select 1 as v", dir, |_| false);
        let mut remote = Recorder::default();
        let mut prompt = FixedAnswer(false);
        let mut session = Session {
            settings: &settings,
            remote: &mut remote,
            prompt: &mut prompt,
        };
        node.materialize(&layout, &mut session, none).unwrap();
        assert_eq!(remote.calls.len(), 1);
        assert_eq!(node.table(), Some(&ints("v", &[1])));
    }

    #[test]
    fn test_backlink_injected_before_fetch() {
        let (_dir, settings, layout) = setup();
        let sibling = ints("id", &[3, 3, 5]);
        let mut node = CteNode::new(
            "b",
            "select * from t where id in (select id from a where id > 4)",
            layout.materialization_dir(),
            |n| n == "a",
        );
        let mut remote = Recorder::default();
        let mut prompt = FixedAnswer(false);
        let mut session = Session {
            settings: &settings,
            remote: &mut remote,
            prompt: &mut prompt,
        };
        node.materialize(&layout, &mut session, |n| (n == "a").then_some(&sibling))
            .unwrap();
        let sent = &remote.calls[0];
        assert!(sent.starts_with("with backlink_0 as ("));
        assert!(sent.contains("(5)"));
        assert!(!sent.contains("(3)"));
        assert!(sent.ends_with("(select id from backlink_0 where id > 4)"));
    }

    #[test]
    fn test_too_complex_is_fatal_without_error_log() {
        let (dir, settings, layout) = setup();
        let mut node = CteNode::new("a", "select 1", layout.materialization_dir(), |_| false);
        let mut remote = Recorder {
            fail: Some(RemoteError::TooComplex("54001".into())),
            ..Default::default()
        };
        let mut prompt = FixedAnswer(false);
        let mut session = Session {
            settings: &settings,
            remote: &mut remote,
            prompt: &mut prompt,
        };
        let err = node.materialize(&layout, &mut session, none).unwrap_err();
        assert!(matches!(err, DecomposerError::StatementTooComplex { .. }));
        assert!(!dir.path().join("logs").join("error_log.sql").exists());
        assert!(!node.is_materialized());
    }

    #[test]
    fn test_remote_error_is_logged() {
        let (dir, settings, layout) = setup();
        let mut node = CteNode::new("a", "select 1", layout.materialization_dir(), |_| false);
        let mut remote = Recorder {
            fail: Some(RemoteError::Other("relation \"t\" does not exist".into())),
            ..Default::default()
        };
        let mut prompt = FixedAnswer(false);
        let mut session = Session {
            settings: &settings,
            remote: &mut remote,
            prompt: &mut prompt,
        };
        let err = node.materialize(&layout, &mut session, none).unwrap_err();
        assert!(matches!(err, DecomposerError::Remote { .. }));
        let log = std::fs::read_to_string(dir.path().join("logs").join("error_log.sql")).unwrap();
        assert!(log.contains("relation \"t\" does not exist"));
    }

    #[test]
    fn test_flagged_without_cache_is_fatal() {
        let (_dir, settings, layout) = setup();
        let mut node = CteNode::new("a", "select 1", layout.anchor_dir(), |_| false);
        node.mark_materialized();
        let mut remote = Recorder::default();
        let mut prompt = FixedAnswer(true);
        let mut session = Session {
            settings: &settings,
            remote: &mut remote,
            prompt: &mut prompt,
        };
        let err = node.materialize(&layout, &mut session, none).unwrap_err();
        assert!(matches!(err, DecomposerError::CacheMissing { .. }));
        assert!(remote.calls.is_empty());
    }

    #[test]
    fn test_callbacks_fire_once_in_order() {
        let (_dir, settings, layout) = setup();
        let mut node = CteNode::new("a", "select 1", layout.materialization_dir(), |_| false);
        node.on_materialized(NodeEvent::AnchorReleased { cte: "a".into() });
        node.on_materialized(NodeEvent::AnchorReleased { cte: "z".into() });
        let mut remote = Recorder::default();
        let mut prompt = FixedAnswer(false);
        let mut session = Session {
            settings: &settings,
            remote: &mut remote,
            prompt: &mut prompt,
        };
        let events = node.materialize(&layout, &mut session, none).unwrap();
        assert_eq!(
            events,
            vec![
                NodeEvent::AnchorReleased { cte: "a".into() },
                NodeEvent::AnchorReleased { cte: "z".into() },
            ]
        );
        let again = node.materialize(&layout, &mut session, none).unwrap();
        assert!(again.is_empty());
        assert_eq!(remote.calls.len(), 1);
    }

    #[test]
    fn test_extra_cache_dir_written_on_reuse() {
        let (dir, settings, layout) = setup();
        let primary = layout.materialization_dir();
        cache::store_table(&cache_file(&primary, "a"), &ints("v", &[9])).unwrap();
        let bank = dir.path().join("knowledge_bank");
        let mut node = CteNode::new("a", "select 1", primary, |_| false);
        node.add_cache_dir(bank.clone());
        let mut remote = Recorder::default();
        let mut prompt = FixedAnswer(false);
        let mut session = Session {
            settings: &settings,
            remote: &mut remote,
            prompt: &mut prompt,
        };
        node.materialize(&layout, &mut session, none).unwrap();
        assert_eq!(
            cache::load_table(&cache_file(&bank, "a")).unwrap(),
            Some(ints("v", &[9]))
        );
    }

    #[test]
    fn test_banked_entry() {
        let dir = tempfile::tempdir().unwrap();
        cache::store_table(&cache_file(dir.path(), "ref"), &ints("v", &[1, 2])).unwrap();
        let node = CteNode::banked("REF", dir.path()).unwrap();
        assert!(node.is_materialized());
        assert_eq!(node.table().map(Table::len), Some(2));

        let err = CteNode::banked("missing", dir.path()).unwrap_err();
        assert!(matches!(err, DecomposerError::InvalidBank { .. }));
    }
}
