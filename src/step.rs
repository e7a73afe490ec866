//! Step: one (possibly parameter-substituted) copy of a query.
//!
//! A step owns the CTE nodes parsed from its text, in textual order, and the
//! trailing recomposition query. Textual order is the only dependency order:
//! a CTE can backlink to siblings defined before it, never after.

use tracing::info;

use crate::cache::{self, Layout};
use crate::engine::Sandbox;
use crate::error::DecomposerError;
use crate::node::{CteNode, NodeEvent, Session};
use crate::scanner::split_query;
use crate::table::Table;

/// Recomposition text that skips recomposition.
const PASS: &str = "pass";

pub struct Step {
    layout: Layout,
    nodes: Vec<CteNode>,
    recomposition: String,
    table: Option<Table>,
}

impl Step {
    /// Parse `query` into nodes. `banked` lists the knowledge-bank names
    /// visible to every CTE.
    pub fn new(query: &str, layout: Layout, banked: &[String]) -> Result<Self, DecomposerError> {
        let (spans, recomposition) = split_query(query);
        let mut nodes: Vec<CteNode> = Vec::with_capacity(spans.len());
        for span in &spans {
            let name = span.name.to_lowercase();
            if nodes.iter().any(|n| n.name() == name) {
                return Err(DecomposerError::DuplicateCte(name));
            }
            let node = CteNode::new(
                &name,
                span.body(query),
                layout.materialization_dir(),
                |ident| banked.iter().any(|b| b == ident) || nodes.iter().any(|n| n.name() == ident),
            );
            nodes.push(node);
        }

        cache::write_sql_log(
            layout.log_dir(),
            &layout.recomposition_log_title(),
            recomposition,
        )?;

        Ok(Self {
            layout,
            nodes,
            recomposition: recomposition.to_string(),
            table: None,
        })
    }

    /// Step label; empty for an unlabeled single step.
    pub fn label(&self) -> &str {
        self.layout.step()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn nodes(&self) -> &[CteNode] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&CteNode> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut CteNode> {
        self.nodes.iter_mut().find(|n| n.name() == name)
    }

    pub fn recomposition(&self) -> &str {
        &self.recomposition
    }

    /// Recomposed result, once executed (and unless the step passes).
    pub fn table(&self) -> Option<&Table> {
        self.table.as_ref()
    }

    fn passes(&self) -> bool {
        self.recomposition.trim().eq_ignore_ascii_case(PASS)
    }

    /// Materialize every node in textual order, then recompose.
    ///
    /// Returns the events fired by the nodes, in firing order.
    pub fn execute(
        &mut self,
        bank: &[CteNode],
        session: &mut Session<'_>,
    ) -> Result<Vec<NodeEvent>, DecomposerError> {
        info!(step = %self.label(), ctes = self.nodes.len(), "executing step");
        let mut events = Vec::new();
        for idx in 0..self.nodes.len() {
            let (done, rest) = self.nodes.split_at_mut(idx);
            let done: &[CteNode] = done;
            let lookup = |name: &str| {
                done.iter()
                    .chain(bank)
                    .find(|n| n.name() == name)
                    .and_then(CteNode::table)
            };
            events.extend(rest[0].materialize(&self.layout, session, lookup)?);
        }

        if self.passes() {
            info!(step = %self.label(), "no recomposition needed");
            return Ok(events);
        }

        info!(step = %self.label(), "recomposing");
        let mut sandbox = Sandbox::new()?;
        // Local tables are registered last and shadow bank entries.
        for node in bank.iter().chain(&self.nodes) {
            if let Some(table) = node.table() {
                sandbox.register(node.name(), table)?;
            }
        }
        let table = sandbox.execute(&self.recomposition)?;
        info!(step = %self.label(), rows = table.len(), "recomposed");
        cache::store_table(&self.layout.step_output_path(), &table)?;
        self.table = Some(table);
        Ok(events)
    }
}
