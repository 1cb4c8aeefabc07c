//! Core types for the gear.
//!
//! Option values, the ordered parameter map, command specs, and the
//! per-run session context shared by every stage.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::label::sanitize_label;

// --- Option values ---

/// Numeric option value. Integers and floats are kept apart so that
/// `n_cpus = 8` renders as `8`, not `8.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Int(v) => *v as f64,
            Self::Float(v) => *v,
        }
    }

    pub fn is_positive(&self) -> bool {
        match self {
            Self::Int(v) => *v > 0,
            Self::Float(v) => *v > 0.0,
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

/// A single configuration value as declared in the gear config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Number(Number),
    Text(String),
}

impl OptionValue {
    pub fn int(v: i64) -> Self {
        Self::Number(Number::Int(v))
    }

    pub fn float(v: f64) -> Self {
        Self::Number(Number::Float(v))
    }

    pub fn text(v: impl Into<String>) -> Self {
        Self::Text(v.into())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Kind name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Text(_) => "string",
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        Self::int(v)
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        Self::float(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        Self::text(v)
    }
}

// --- Maps ---

/// Option key to value, in declaration order.
pub type ConfigMap = IndexMap<String, OptionValue>;

/// Parameters destined for the command line, in emission order.
pub type ParamMap = IndexMap<String, OptionValue>;

/// Option keys that must never reach the command line.
pub type ExclusionSet = HashSet<String>;

/// Full environment handed to the child process.
pub type Environment = BTreeMap<String, String>;

// --- Commands ---

/// Fixed parts of the composed command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable invocation (not user-controlled).
    pub prefix: Vec<String>,
    /// Positional arguments: BIDS dir, session output dir, run level.
    pub suffix: Vec<String>,
}

/// Outcome of a completed child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// --- Session ---

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session label {0:?} has no letters or digits after sanitizing")]
    EmptyLabel(String),
    #[error("session label {0:?} must be a relative path without empty, '.' or '..' segments")]
    InvalidPath(String),
}

/// Per-run context, created once the input stage has finished.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session_label: String,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub environment: Environment,
}

impl SessionContext {
    /// Build a context from a raw, human-readable session label.
    pub fn new(
        raw_label: &str,
        work_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        environment: Environment,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            session_label: Self::label_for(raw_label)?,
            work_dir: work_dir.into(),
            output_dir: output_dir.into(),
            environment,
        })
    }

    /// Sanitize a raw label and check that it names a directory strictly
    /// below the work directory.
    pub fn label_for(raw_label: &str) -> Result<String, SessionError> {
        let label = sanitize_label(raw_label);
        if !label.chars().any(|c| c.is_ascii_alphanumeric()) {
            return Err(SessionError::EmptyLabel(raw_label.to_string()));
        }
        if label
            .split('/')
            .any(|segment| matches!(segment, "" | "." | ".."))
        {
            return Err(SessionError::InvalidPath(raw_label.to_string()));
        }
        Ok(label)
    }

    pub fn session_label(&self) -> &str {
        &self.session_label
    }

    /// Directory the pipeline writes into: `<work_dir>/<session_label>`.
    pub fn session_path(&self) -> PathBuf {
        self.work_dir.join(&self.session_label)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_value_deserializes_by_json_type() {
        let map: ConfigMap = serde_json::from_str(
            r#"{"verbose": true, "n_cpus": 8, "mem_gb": 12.5, "pipeline": "default"}"#,
        )
        .unwrap();

        assert_eq!(map["verbose"], OptionValue::Bool(true));
        assert_eq!(map["n_cpus"], OptionValue::int(8));
        assert_eq!(map["mem_gb"], OptionValue::float(12.5));
        assert_eq!(map["pipeline"], OptionValue::text("default"));
    }

    #[test]
    fn config_map_keeps_declaration_order() {
        let map: ConfigMap =
            serde_json::from_str(r#"{"zeta": 1, "alpha": 2, "mid": 3}"#).unwrap();
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn numbers_render_without_spurious_decimals() {
        assert_eq!(OptionValue::int(8).to_string(), "8");
        assert_eq!(OptionValue::float(14.4).to_string(), "14.4");
        assert_eq!(OptionValue::float(6.0).to_string(), "6");
    }

    #[test]
    fn session_context_sanitizes_label() {
        let ctx = SessionContext::new("My Session #1", "/flywheel/v0/work", "/out", Environment::new())
            .unwrap();
        assert_eq!(ctx.session_label(), "My_Session_1");
        assert_eq!(
            ctx.session_path(),
            PathBuf::from("/flywheel/v0/work/My_Session_1")
        );
    }

    #[test]
    fn session_context_rejects_empty_label() {
        let err = SessionContext::new("", "/work", "/out", Environment::new()).unwrap_err();
        assert_eq!(err, SessionError::EmptyLabel(String::new()));
    }

    #[test]
    fn label_without_letters_or_digits_is_rejected() {
        for raw in ["###", "  ", "_", "./."] {
            assert_eq!(
                SessionContext::label_for(raw),
                Err(SessionError::EmptyLabel(raw.to_string()))
            );
        }
    }

    #[test]
    fn label_must_stay_below_work_dir() {
        for raw in ["../escape", "a/../b", "/abs", "a//b", "trailing/", "./a"] {
            assert_eq!(
                SessionContext::label_for(raw),
                Err(SessionError::InvalidPath(raw.to_string()))
            );
        }
    }

    #[test]
    fn nested_label_is_allowed() {
        let ctx = SessionContext::new("sub 01/ses 02", "/work", "/out", Environment::new()).unwrap();
        assert_eq!(ctx.session_label(), "sub_01/ses_02");
        assert_eq!(ctx.session_path(), PathBuf::from("/work/sub_01/ses_02"));
    }
}
