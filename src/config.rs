//! Configuration for the decomposer.
//!
//! Two layers:
//! - [`Settings`]: process-wide toggles read once at startup from a TOML
//!   file and passed explicitly into every [`crate::skeleton::Skeleton`].
//! - [`QueryConfig`]: the JSON object that may precede the `WITH` keyword of
//!   an input query. It is parsed eagerly into a typed structure; anything
//!   that is not a valid configuration object is one consolidated
//!   [`DecomposerError::Config`].

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DecomposerError;

/// Default location of the settings file, relative to the working directory.
pub const DEFAULT_SETTINGS_PATH: &str = "config/settings.toml";

/// Written to [`DEFAULT_SETTINGS_PATH`] when no settings file exists.
pub const SETTINGS_TEMPLATE: &str = r#"# Decomposer settings
autorun = false
material_permanence = true
backlink_logging = true
inject_logging = true
interface_mode = "sequential"
root = "."

[database]
host = "localhost"
port = 5432
user = "postgres"
password = ""
dbname = "postgres"
"#;

// ── Run settings ───────────────────────────────────────────────────────────

/// How the binary picks queries to run when no subcommand is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceMode {
    /// Decompose every `*.sql` file under `input/`.
    #[default]
    Sequential,
    /// Prompt for query names on stdin.
    Cli,
}

/// Connection parameters for the remote database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            dbname: "postgres".to_string(),
        }
    }
}

/// Process-wide toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Unattended mode: reuse cached materializations without prompting.
    pub autorun: bool,
    /// Durable (`output/`) vs ephemeral (`eph_materializations/`) cache root.
    pub material_permanence: bool,
    /// Dump each CTE's pre-injection text under `backlink_queries/`.
    pub backlink_logging: bool,
    /// Dump each CTE's final remote text under `injected_queries/`.
    pub inject_logging: bool,
    pub interface_mode: InterfaceMode,
    /// Working directory that every other path is resolved against.
    pub root: PathBuf,
    pub database: DatabaseSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            autorun: false,
            material_permanence: true,
            backlink_logging: true,
            inject_logging: true,
            interface_mode: InterfaceMode::Sequential,
            root: PathBuf::from("."),
            database: DatabaseSettings::default(),
        }
    }
}

impl Settings {
    /// Settings for an unattended run rooted at `root`, with diagnostic dumps
    /// switched off.
    pub fn unattended(root: impl Into<PathBuf>) -> Self {
        Self {
            autorun: true,
            backlink_logging: false,
            inject_logging: false,
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, DecomposerError> {
        toml::from_str(text).map_err(|e| DecomposerError::Config(format!("settings: {e}")))
    }

    /// Load settings from `path`. When the file does not exist a template is
    /// written in its place and a configuration error asks the operator to
    /// fill it in.
    pub fn load(path: &Path) -> Result<Self, DecomposerError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, SETTINGS_TEMPLATE)?;
            return Err(DecomposerError::Config(format!(
                "settings missing, populated {} with template data; edit it and re-run",
                path.display()
            )));
        }
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Root of the materialization cache (durable or ephemeral).
    pub fn materialization_root(&self) -> PathBuf {
        if self.material_permanence {
            self.output_dir()
        } else {
            self.root.join("eph_materializations")
        }
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn knowledge_bank_dir(&self) -> PathBuf {
        self.root.join("knowledge_bank")
    }

    pub fn injected_dir(&self) -> PathBuf {
        self.root.join("injected_queries")
    }

    pub fn backlink_dir(&self) -> PathBuf {
        self.root.join("backlink_queries")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

// ── Query configuration block ──────────────────────────────────────────────

/// Repeated execution of one query template with different substitutions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepeaterParams {
    /// One substitution set per step, in step order.
    pub steps: Vec<serde_json::Map<String, serde_json::Value>>,
    /// CTEs computed once by the first step and shared by the rest.
    #[serde(default)]
    pub anchored_ctes: Vec<String>,
}

/// External program run after all steps complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostExec {
    /// File name under `input/`; copied into the query's output directory.
    pub file: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Program used to run the copied file. Without it the file itself is
    /// executed.
    #[serde(default)]
    pub interpreter: Option<String>,
}

/// The JSON object preceding `WITH` in an input query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    /// Knowledge-bank tables made visible to every step.
    #[serde(default)]
    pub banked: Vec<String>,
    /// Remove the query's previous output directory before running.
    #[serde(default)]
    pub clean: bool,
    #[serde(default)]
    pub repeater_params: Option<RepeaterParams>,
    /// CTEs whose first-step result is also written to the knowledge bank.
    #[serde(default)]
    pub knowledge_bank: Vec<String>,
    #[serde(default)]
    pub post_exec: Option<PostExec>,
}

impl QueryConfig {
    /// Parse a configuration block. A blank block is the empty configuration.
    pub fn parse(block: &str) -> Result<Self, DecomposerError> {
        if block.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: QueryConfig = serde_json::from_str(block)
            .map_err(|e| DecomposerError::Config(format!("malformed config block: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), DecomposerError> {
        if let Some(rp) = &self.repeater_params {
            if rp.steps.is_empty() {
                return Err(DecomposerError::Config(
                    "repeater_params.steps must not be empty".into(),
                ));
            }
        }
        if let Some(pe) = &self.post_exec {
            if pe.file.trim().is_empty() || pe.file.contains(['/', '\\']) {
                return Err(DecomposerError::Config(format!(
                    "post_exec.file must be a plain file name, got '{}'",
                    pe.file
                )));
            }
        }
        Ok(())
    }
}

/// Split raw query text into `(config_block, query)` at the first `WITH`
/// keyword that is not inside a JSON string. Returns `None` when the text has
/// no `WITH` keyword at all.
pub fn split_config_block(text: &str) -> Option<(&str, &str)> {
    let bytes = text.as_bytes();
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            match b {
                b'\\' => i += 2,
                b'"' => {
                    in_string = false;
                    i += 1;
                }
                _ => i += 1,
            }
            continue;
        }
        if b == b'"' {
            in_string = true;
        } else if i + 4 <= bytes.len() && bytes[i..i + 4].eq_ignore_ascii_case(b"with") {
            let before_ok = i == 0 || !is_word_byte(bytes[i - 1]);
            let after_ok = i + 4 >= bytes.len() || !is_word_byte(bytes[i + 4]);
            if before_ok && after_ok {
                return Some((&text[..i], &text[i..]));
            }
        }
        i += 1;
    }
    None
}

pub(crate) fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_blank_block_is_empty_config() {
        assert_eq!(QueryConfig::parse("  \n").unwrap(), QueryConfig::default());
    }

    #[test]
    fn test_parse_full_block() {
        let config = QueryConfig::parse(
            r#"{
                "banked": ["regions"],
                "clean": true,
                "repeater_params": {
                    "steps": [{"year": 2023}, {"year": 2024}],
                    "anchored_ctes": ["base"]
                },
                "knowledge_bank": ["base"],
                "post_exec": {"file": "report.py", "args": ["--fast"], "interpreter": "python3"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.banked, vec!["regions"]);
        assert!(config.clean);
        let rp = config.repeater_params.unwrap();
        assert_eq!(rp.steps.len(), 2);
        assert_eq!(rp.anchored_ctes, vec!["base"]);
        assert_eq!(config.knowledge_bank, vec!["base"]);
        let pe = config.post_exec.unwrap();
        assert_eq!(pe.file, "report.py");
        assert_eq!(pe.interpreter.as_deref(), Some("python3"));
    }

    #[test]
    fn test_parse_malformed_block_is_config_error() {
        let err = QueryConfig::parse("{ not json").unwrap_err();
        assert!(matches!(err, DecomposerError::Config(_)));
    }

    #[test]
    fn test_parse_unknown_key_is_config_error() {
        let err = QueryConfig::parse(r#"{"banks": []}"#).unwrap_err();
        assert!(matches!(err, DecomposerError::Config(_)));
    }

    #[test]
    fn test_parse_empty_repeater_steps_rejected() {
        let err = QueryConfig::parse(r#"{"repeater_params": {"steps": []}}"#).unwrap_err();
        assert!(matches!(err, DecomposerError::Config(_)));
    }

    #[test]
    fn test_parse_post_exec_path_rejected() {
        let err = QueryConfig::parse(r#"{"post_exec": {"file": "../x.py"}}"#).unwrap_err();
        assert!(matches!(err, DecomposerError::Config(_)));
    }

    #[test]
    fn test_split_config_block() {
        let text = "{\"clean\": true}\nWITH a AS (select 1) select * from a";
        let (block, query) = split_config_block(text).unwrap();
        assert_eq!(block.trim(), "{\"clean\": true}");
        assert!(query.starts_with("WITH a"));
    }

    #[test]
    fn test_split_config_block_skips_json_strings() {
        let text = r#"{"post_exec": {"file": "with.py"}} with a as (select 1) select 1"#;
        let (block, query) = split_config_block(text).unwrap();
        assert!(block.contains("with.py"));
        assert!(query.starts_with("with a"));
    }

    #[test]
    fn test_split_config_block_word_boundary() {
        let text = "select withdrawn from t";
        assert!(split_config_block(text).is_none());
    }

    #[test]
    fn test_settings_from_toml() {
        let settings = Settings::from_toml(
            "autorun = true\nmaterial_permanence = false\n[database]\nport = 6000\n",
        )
        .unwrap();
        assert!(settings.autorun);
        assert!(settings.inject_logging);
        assert_eq!(settings.database.port, 6000);
        assert_eq!(settings.database.user, "postgres");
        assert!(settings.materialization_root().ends_with("eph_materializations"));
    }

    #[test]
    fn test_settings_template_parses() {
        let settings = Settings::from_toml(SETTINGS_TEMPLATE).unwrap();
        assert_eq!(settings.interface_mode, InterfaceMode::Sequential);
        assert!(settings.material_permanence);
    }

    #[test]
    fn test_settings_load_writes_template_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("settings.toml");
        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, DecomposerError::Config(_)));
        assert!(path.exists());
        assert!(Settings::load(&path).is_ok());
    }
}
