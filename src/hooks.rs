//! Post-execution hook.
//!
//! A query may name an external program (a file under `input/`) to run once
//! all of its steps have completed. The file is copied into the query's
//! output directory, next to `final.csv`, and run from there as a separate
//! process. Its standard output is streamed line by line with a `> ` prefix;
//! the run blocks until the process exits.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{info, warn};

use crate::config::{PostExec, Settings};
use crate::error::DecomposerError;

/// Prefix of every streamed output line.
pub const OUTPUT_PREFIX: &str = "> ";

/// A staged post-execution program.
#[derive(Debug, Clone)]
pub struct PostExecHook {
    source: PathBuf,
    target: PathBuf,
    args: Vec<String>,
    interpreter: Option<String>,
}

impl PostExecHook {
    pub fn stage(post: &PostExec, settings: &Settings, skeleton: &str) -> Self {
        Self {
            source: settings.input_dir().join(&post.file),
            target: settings.output_dir().join(skeleton).join(&post.file),
            args: post.args.clone(),
            interpreter: post.interpreter.clone(),
        }
    }

    /// Where the program is copied to and run from.
    pub fn target(&self) -> &PathBuf {
        &self.target
    }

    /// Copy the program into place and run it to completion.
    pub fn run(&self) -> Result<(), DecomposerError> {
        if let Some(parent) = self.target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&self.source, &self.target).map_err(|e| {
            DecomposerError::PostExec(format!("copying {}: {e}", self.source.display()))
        })?;

        let mut command = match &self.interpreter {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(&self.target);
                c
            }
            None => Command::new(&self.target),
        };
        command.args(&self.args).stdout(Stdio::piped());

        info!(program = %self.target.display(), "starting subprocess");
        let mut child = command.spawn().map_err(|e| {
            DecomposerError::PostExec(format!("spawning {}: {e}", self.target.display()))
        })?;
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line?;
                println!("{OUTPUT_PREFIX}{}", line.trim_end());
            }
        }
        let status = child.wait()?;
        if !status.success() {
            warn!(program = %self.target.display(), %status, "subprocess exited unsuccessfully");
        }
        info!("finished subprocess");
        Ok(())
    }
}
