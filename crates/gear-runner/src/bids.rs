//! Input dataset acquisition and BIDS validation.
//!
//! The dataset is fetched into `<work_dir>/bids` once; an existing tree is
//! reused as-is. A generic `dataset_description.json` is written when a
//! freshly fetched dataset lacks one. Validation shells out to `bids-validator --json` and
//! logs every reported error and warning.

use gear_core::Environment;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// File every BIDS dataset must carry at its root.
pub const DATASET_DESCRIPTION: &str = "dataset_description.json";

#[derive(Debug, Error)]
pub enum InputError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to copy dataset: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("dataset source not found: {0}")]
    SourceNotFound(PathBuf),
    #[error("failed to run {program}: {source}")]
    ValidatorSpawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("could not parse validator output: {0}")]
    ValidatorOutput(#[from] serde_json::Error),
    #[error("{0} BIDS validation errors were found")]
    Invalid(usize),
}

pub type Result<T> = std::result::Result<T, InputError>;

/// Somewhere a session's dataset can be fetched from.
pub trait DatasetSource {
    /// Materialize the dataset at `target`, which does not exist yet.
    fn fetch(&self, target: &Path) -> Result<()>;
}

/// Dataset already present on local disk, copied into place.
#[derive(Debug, Clone)]
pub struct LocalDatasetSource {
    root: PathBuf,
}

impl LocalDatasetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DatasetSource for LocalDatasetSource {
    fn fetch(&self, target: &Path) -> Result<()> {
        if !self.root.is_dir() {
            return Err(InputError::SourceNotFound(self.root.clone()));
        }
        copy_tree(&self.root, target)
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Fetch the dataset into `bids_dir` unless it is already there.
pub fn acquire(source: &dyn DatasetSource, bids_dir: &Path) -> Result<()> {
    if bids_dir.is_dir() {
        info!(bids_dir = %bids_dir.display(), "using existing BIDS directory");
        return Ok(());
    }
    source.fetch(bids_dir)?;
    info!(bids_dir = %bids_dir.display(), "BIDS dataset downloaded");
    ensure_dataset_description(bids_dir)?;
    Ok(())
}

/// Write a generic `dataset_description.json` when the dataset lacks one.
///
/// Returns whether a stub was written.
pub fn ensure_dataset_description(bids_dir: &Path) -> Result<bool> {
    let path = bids_dir.join(DATASET_DESCRIPTION);
    if path.exists() {
        debug!(path = %path.display(), "dataset description exists");
        return Ok(false);
    }

    let stub = serde_json::json!({
        "Acknowledgements": "",
        "Authors": [],
        "BIDSVersion": "1.2.0",
        "DatasetDOI": "",
        "Funding": "",
        "HowToAcknowledge": "",
        "License": "",
        "Name": "tome",
        "ReferencesAndLinks": [],
        "template": "project"
    });
    fs::write(&path, serde_json::to_vec_pretty(&stub).map_err(io::Error::from)?)?;
    info!(path = %path.display(), "created missing dataset description");
    Ok(true)
}

// --- Validator report ---

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueFileRef {
    #[serde(rename = "relativePath")]
    pub relative_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueFile {
    pub file: Option<IssueFileRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Issue {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub files: Vec<IssueFile>,
}

impl Issue {
    /// Reason followed by one indented line per affected file.
    pub fn describe(&self) -> String {
        let mut msg = format!("{}: {}", self.key, self.reason);
        for path in self
            .files
            .iter()
            .filter_map(|f| f.file.as_ref()?.relative_path.as_deref())
        {
            msg.push_str("\n       ");
            msg.push_str(path);
        }
        msg
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Issues {
    #[serde(default)]
    pub errors: Vec<Issue>,
    #[serde(default)]
    pub warnings: Vec<Issue>,
}

/// Parsed `bids-validator --json` output.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidationReport {
    #[serde(default)]
    pub issues: Issues,
    #[serde(default)]
    pub summary: serde_json::Value,
}

impl ValidationReport {
    pub fn parse(output: &str) -> Result<Self> {
        Ok(serde_json::from_str(output)?)
    }

    pub fn error_count(&self) -> usize {
        self.issues.errors.len()
    }

    /// Log errors and warnings, then fail if any errors were reported.
    pub fn into_result(self) -> Result<Self> {
        info!(summary = %self.summary, "bids-validator summary");
        for issue in &self.issues.warnings {
            warn!("{}", issue.describe());
        }
        for issue in &self.issues.errors {
            error!("{}", issue.describe());
        }
        match self.error_count() {
            0 => Ok(self),
            n => Err(InputError::Invalid(n)),
        }
    }
}

/// Structural validator for an acquired dataset.
#[allow(async_fn_in_trait)]
pub trait BidsValidator {
    async fn validate(&self, bids_dir: &Path, environment: &Environment) -> Result<ValidationReport>;
}

/// Runs the `bids-validator` CLI.
#[derive(Debug, Clone)]
pub struct BidsValidatorCli {
    program: PathBuf,
}

impl BidsValidatorCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl BidsValidator for BidsValidatorCli {
    async fn validate(&self, bids_dir: &Path, environment: &Environment) -> Result<ValidationReport> {
        let program = self.program.display().to_string();
        info!(command = %format!("{program} --verbose --json {}", bids_dir.display()), "running BIDS validation");

        let output = Command::new(&self.program)
            .arg("--verbose")
            .arg("--json")
            .arg(bids_dir)
            .env_clear()
            .envs(environment)
            .output()
            .await
            .map_err(|source| InputError::ValidatorSpawn {
                program: program.clone(),
                source,
            })?;

        info!(
            exit_code = output.status.code().unwrap_or(-1),
            "bids-validator finished"
        );

        let report = ValidationReport::parse(&String::from_utf8_lossy(&output.stdout))?;
        report.into_result()
    }
}
