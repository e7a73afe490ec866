//! Query skeleton: the unit of work for one input query file.
//!
//! Construction parses the optional configuration block that precedes the
//! `WITH` keyword and stages everything it asks for:
//!
//! 1. **Bank setup**: every `banked` name is loaded from the knowledge bank.
//! 2. **Steps**: `clean` wipes the previous output; `repeater_params` builds
//!    one step per substitution set (`part_1`, `part_2`, …), otherwise one
//!    unlabeled step runs the query as written.
//! 3. **Anchors**: each anchored CTE reads and writes a shared cache
//!    directory. When the first step materializes it, the same-named nodes
//!    of all later steps are flagged materialized and load that cache.
//! 4. **Knowledge bank**: listed CTEs of the first step are also written to
//!    the knowledge bank for later runs to `bank`.
//! 5. **Post-exec**: an external program staged to run after all steps.
//!
//! [`Skeleton::execute`] runs the steps in order, stacks their results into
//! `final.csv` and fires the post-exec hook.

use std::fs;
use std::io;

use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::cache::{self, Layout, ReusePrompt};
use crate::config::{QueryConfig, Settings, split_config_block};
use crate::error::DecomposerError;
use crate::hooks::PostExecHook;
use crate::node::{CteNode, NodeEvent, Session};
use crate::remote::RemoteDatabase;
use crate::step::Step;
use crate::table::Table;

/// Label of the `n`-th (1-based) repeated step.
fn step_label(n: usize) -> String {
    format!("part_{n}")
}

fn param_literal(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => format!("'{s}'"),
        other => other.to_string(),
    }
}

/// Substitute `{key}` placeholders of `template` with the values of one
/// substitution set, in a single pass: substituted text is never rescanned.
/// Strings are quoted; other values use their JSON text.
pub fn substitute(template: &str, params: &Map<String, JsonValue>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let hit = tail
            .find('}')
            .and_then(|close| params.get(&tail[1..close]).map(|value| (close, value)));
        match hit {
            Some((close, value)) => {
                out.push_str(&param_literal(value));
                rest = &tail[close + 1..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

pub struct Skeleton {
    name: String,
    settings: Settings,
    config: QueryConfig,
    bank: Vec<CteNode>,
    steps: Vec<Step>,
    hook: Option<PostExecHook>,
}

impl Skeleton {
    /// Parse and stage the query `text` under the skeleton name `name`.
    pub fn new(name: &str, text: &str, settings: &Settings) -> Result<Self, DecomposerError> {
        let (block, query) = split_config_block(text).unwrap_or(("", text));
        let config = QueryConfig::parse(block)?;
        if block.trim().is_empty() {
            debug!(skeleton = name, "no config block");
        } else {
            info!(skeleton = name, "loaded config");
        }

        let bank = config
            .banked
            .iter()
            .map(|b| CteNode::banked(b, &settings.knowledge_bank_dir()))
            .collect::<Result<Vec<_>, _>>()?;
        if bank.is_empty() {
            debug!(skeleton = name, "no banked CTEs");
        }

        if config.clean {
            let previous = settings.output_dir().join(name);
            match fs::remove_dir_all(&previous) {
                Ok(()) => info!(skeleton = name, "cleaned previous output"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(skeleton = name, "nothing to clean")
                }
                Err(e) => warn!(
                    skeleton = name,
                    path = %previous.display(),
                    error = %e,
                    "could not clean previous output"
                ),
            }
        }

        let mut steps = Self::stage_steps(name, query, &config, settings, &bank)?;
        if let Some(rp) = &config.repeater_params {
            Self::stage_anchors(&mut steps, &rp.anchored_ctes)?;
        }
        Self::stage_knowledge(&mut steps, &config.knowledge_bank, settings)?;

        fs::create_dir_all(settings.output_dir().join(name))?;
        let hook = config
            .post_exec
            .as_ref()
            .map(|post| PostExecHook::stage(post, settings, name));

        Ok(Self {
            name: name.to_string(),
            settings: settings.clone(),
            config,
            bank,
            steps,
            hook,
        })
    }

    fn stage_steps(
        name: &str,
        query: &str,
        config: &QueryConfig,
        settings: &Settings,
        bank: &[CteNode],
    ) -> Result<Vec<Step>, DecomposerError> {
        let banked: Vec<String> = bank.iter().map(|b| b.name().to_string()).collect();
        match &config.repeater_params {
            None => {
                debug!(skeleton = name, "no repeater params, running a single step");
                Ok(vec![Step::new(query, Layout::new(settings, name, ""), &banked)?])
            }
            Some(rp) => rp
                .steps
                .iter()
                .enumerate()
                .map(|(i, params)| {
                    let layout = Layout::new(settings, name, &step_label(i + 1));
                    Step::new(&substitute(query, params), layout, &banked)
                })
                .collect(),
        }
    }

    fn stage_anchors(steps: &mut [Step], anchored: &[String]) -> Result<(), DecomposerError> {
        for cte in anchored {
            let cte = cte.to_lowercase();
            for (i, step) in steps.iter_mut().enumerate() {
                let shared = step.layout().anchor_dir();
                let label = step.label().to_string();
                let node = step
                    .node_mut(&cte)
                    .ok_or_else(|| DecomposerError::MissingAnchorTarget {
                        cte: cte.clone(),
                        step: label,
                    })?;
                node.redirect_cache(shared);
                if i == 0 {
                    node.on_materialized(NodeEvent::AnchorReleased { cte: cte.clone() });
                }
            }
            debug!(cte = %cte, steps = steps.len(), "anchored");
        }
        Ok(())
    }

    fn stage_knowledge(
        steps: &mut [Step],
        names: &[String],
        settings: &Settings,
    ) -> Result<(), DecomposerError> {
        if names.is_empty() {
            return Ok(());
        }
        if steps.len() > 1 {
            warn!("only the first step commits to the knowledge bank");
        }
        let Some(first) = steps.first_mut() else {
            return Ok(());
        };
        for name in names {
            let name = name.to_lowercase();
            first
                .node_mut(&name)
                .ok_or_else(|| DecomposerError::MissingCte(name.clone()))?
                .add_cache_dir(settings.knowledge_bank_dir());
        }
        info!("staged knowledge bank");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn bank(&self) -> &[CteNode] {
        &self.bank
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn hook(&self) -> Option<&PostExecHook> {
        self.hook.as_ref()
    }

    /// Run every step in order and return the stacked result.
    ///
    /// A non-empty result is also written to `output/<name>/final.csv`.
    pub fn execute(
        &mut self,
        remote: &mut dyn RemoteDatabase,
        prompt: &mut dyn ReusePrompt,
    ) -> Result<Table, DecomposerError> {
        info!(skeleton = %self.name, steps = self.steps.len(), "executing");
        let mut session = Session {
            settings: &self.settings,
            remote,
            prompt,
        };
        for idx in 0..self.steps.len() {
            let events = self.steps[idx].execute(&self.bank, &mut session)?;
            for event in events {
                release(&mut self.steps[idx + 1..], event);
            }
        }

        let combined = Table::concat(
            self.steps
                .iter()
                .filter_map(|s| s.table().map(|t| (s.label(), t))),
        )?;
        if !combined.is_empty() {
            let path = self.settings.output_dir().join(&self.name).join("final.csv");
            cache::store_table(&path, &combined)?;
            info!(skeleton = %self.name, rows = combined.len(), "wrote final output");
        }

        match &self.hook {
            Some(hook) => hook.run()?,
            None => debug!(skeleton = %self.name, "no post-exec hook"),
        }
        Ok(combined)
    }
}

/// Apply a node event to the steps after the one that fired it.
fn release(later: &mut [Step], event: NodeEvent) {
    match event {
        NodeEvent::AnchorReleased { cte } => {
            for step in later {
                if let Some(node) = step.node_mut(&cte) {
                    node.mark_materialized();
                    info!(step = %step.label(), cte = %cte, "anchored CTE released");
                }
            }
        }
    }
}
