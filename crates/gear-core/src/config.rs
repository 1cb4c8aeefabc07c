//! Gear configuration.
//!
//! Three sources feed a run:
//! - the gear config document (`config.json`): declared options and inputs
//! - the environment document (`/tmp/gear_environ.json`): the child's full
//!   environment
//! - runtime settings: directories, executable and run level
//!
//! Precedence for runtime settings: CLI flags > defaults.

use crate::types::{ConfigMap, Environment, ExclusionSet, OptionValue};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default root of the gear's directory layout.
pub const DEFAULT_GEAR_DIR: &str = "/flywheel/v0";

/// Default location of the environment document.
pub const DEFAULT_ENVIRON_PATH: &str = "/tmp/gear_environ.json";

/// Default pipeline entry point.
pub const DEFAULT_EXECUTABLE: &str = "/code/run.py";

/// Default analysis level passed as the last positional argument.
pub const DEFAULT_RUN_LEVEL: &str = "participant";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
}

// --- Gear config document ---

/// Location of a provided input file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InputLocation {
    pub path: PathBuf,
}

/// A provided input as described in the config document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InputEntry {
    pub location: InputLocation,
}

/// Parsed `config.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GearConfig {
    /// Declared options, in declaration order.
    pub config: ConfigMap,
    /// Provided inputs by name.
    pub inputs: IndexMap<String, InputEntry>,
}

impl GearConfig {
    /// Load the config document from a file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Path of a named input, if it was provided.
    pub fn input_path(&self, name: &str) -> Option<&Path> {
        self.inputs.get(name).map(|entry| entry.location.path.as_path())
    }

    /// Policy flags declared in the config.
    pub fn policy(&self) -> Result<Policy, ConfigError> {
        Policy::from_config(&self.config)
    }
}

// --- Policy flags ---

/// Lifecycle switches. These keys are never passed to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Run the BIDS validator on the downloaded dataset.
    pub run_bids_validation: bool,
    /// Stop before running the pipeline when input acquisition fails.
    pub abort_on_bids_error: bool,
    /// Archive the session output even when the run failed.
    pub save_output_on_error: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            run_bids_validation: true,
            abort_on_bids_error: true,
            save_output_on_error: true,
        }
    }
}

impl Policy {
    pub const RUN_BIDS_VALIDATION: &'static str = "gear-run-bids-validation";
    pub const ABORT_ON_BIDS_ERROR: &'static str = "gear-abort-on-bids-error";
    pub const SAVE_OUTPUT_ON_ERROR: &'static str = "gear-save-output-on-error";

    /// All policy keys.
    pub const KEYS: [&'static str; 3] = [
        Self::SAVE_OUTPUT_ON_ERROR,
        Self::RUN_BIDS_VALIDATION,
        Self::ABORT_ON_BIDS_ERROR,
    ];

    /// Read policy flags from config, defaulting any that are absent.
    pub fn from_config(config: &ConfigMap) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            run_bids_validation: Self::flag(
                config,
                Self::RUN_BIDS_VALIDATION,
                defaults.run_bids_validation,
            )?,
            abort_on_bids_error: Self::flag(
                config,
                Self::ABORT_ON_BIDS_ERROR,
                defaults.abort_on_bids_error,
            )?,
            save_output_on_error: Self::flag(
                config,
                Self::SAVE_OUTPUT_ON_ERROR,
                defaults.save_output_on_error,
            )?,
        })
    }

    fn flag(config: &ConfigMap, key: &str, default: bool) -> Result<bool, ConfigError> {
        match config.get(key) {
            None => Ok(default),
            Some(OptionValue::Bool(b)) => Ok(*b),
            Some(other) => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: other.to_string(),
            }),
        }
    }

    /// Keys to drop when building pipeline parameters.
    pub fn exclusion_set() -> ExclusionSet {
        Self::KEYS.iter().map(|k| (*k).to_string()).collect()
    }
}

// --- Environment document ---

/// Load the child environment from a JSON object of strings.
pub fn load_environment(path: &Path) -> Result<Environment, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

// --- Runtime settings ---

/// Directories and invocation details for one run.
#[derive(Debug, Clone)]
pub struct GearSettings {
    /// Root of the gear layout (`config.json`, `work/`, `output/`, `input/`).
    pub gear_dir: PathBuf,
    /// Config document; defaults to `<gear_dir>/config.json`.
    pub config_path: Option<PathBuf>,
    /// Environment document.
    pub environ_path: PathBuf,
    /// Where the dataset is fetched from; defaults to `<gear_dir>/input/bids`.
    pub dataset_source: Option<PathBuf>,
    /// Executable invocation placed before the parameters.
    pub executable: Vec<String>,
    /// Analysis level, the last positional argument.
    pub run_level: String,
    /// BIDS validator binary.
    pub validator_bin: PathBuf,
    /// Log the command instead of running it.
    pub dry_run: bool,
    /// Child timeout in seconds (0 = no timeout).
    pub timeout_sec: u32,
}

impl Default for GearSettings {
    fn default() -> Self {
        Self {
            gear_dir: PathBuf::from(DEFAULT_GEAR_DIR),
            config_path: None,
            environ_path: PathBuf::from(DEFAULT_ENVIRON_PATH),
            dataset_source: None,
            executable: vec![DEFAULT_EXECUTABLE.to_string()],
            run_level: DEFAULT_RUN_LEVEL.to_string(),
            validator_bin: PathBuf::from("bids-validator"),
            dry_run: false,
            timeout_sec: 0,
        }
    }
}

impl GearSettings {
    pub fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| self.gear_dir.join("config.json"))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.gear_dir.join("work")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.gear_dir.join("output")
    }

    /// Where the dataset lives once acquired: `<work_dir>/bids`.
    pub fn bids_dir(&self) -> PathBuf {
        self.work_dir().join("bids")
    }

    pub fn dataset_source(&self) -> PathBuf {
        self.dataset_source
            .clone()
            .unwrap_or_else(|| self.gear_dir.join("input").join("bids"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"{
        "config": {
            "gear-run-bids-validation": false,
            "gear-abort-on-bids-error": false,
            "gear-save-output-on-error": true,
            "n_cpus": 4,
            "mem_gb": 0,
            "save_working_dir": true
        },
        "inputs": {
            "pipeline_file": {
                "location": { "path": "/flywheel/v0/input/pipeline_file/pipe.yml" }
            }
        },
        "destination": { "id": "abc", "type": "analysis" }
    }"#;

    #[test]
    fn parses_config_document() {
        let cfg = GearConfig::parse(SAMPLE, Path::new("config.json")).unwrap();
        let keys: Vec<&str> = cfg.config.keys().map(String::as_str).collect();
        assert_eq!(keys[3..], ["n_cpus", "mem_gb", "save_working_dir"]);
        assert_eq!(
            cfg.input_path("pipeline_file"),
            Some(Path::new("/flywheel/v0/input/pipeline_file/pipe.yml"))
        );
        assert_eq!(cfg.input_path("missing"), None);
    }

    #[test]
    fn policy_reads_flags() {
        let cfg = GearConfig::parse(SAMPLE, Path::new("config.json")).unwrap();
        assert_eq!(
            cfg.policy().unwrap(),
            Policy {
                run_bids_validation: false,
                abort_on_bids_error: false,
                save_output_on_error: true,
            }
        );
    }

    #[test]
    fn policy_defaults_missing_flags() {
        let policy = Policy::from_config(&ConfigMap::new()).unwrap();
        assert_eq!(policy, Policy::default());
        assert!(policy.save_output_on_error);
    }

    #[test]
    fn policy_rejects_non_boolean_flag() {
        let mut config = ConfigMap::new();
        config.insert(Policy::SAVE_OUTPUT_ON_ERROR.to_string(), OptionValue::text("yes"));
        let err = Policy::from_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { ref key, .. } if key == Policy::SAVE_OUTPUT_ON_ERROR));
    }

    #[test]
    fn exclusion_set_covers_every_policy_key() {
        let set = Policy::exclusion_set();
        assert_eq!(set.len(), 3);
        for key in Policy::KEYS {
            assert!(set.contains(key));
        }
    }

    #[test]
    fn missing_config_file_names_path() {
        let err = GearConfig::from_file(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/config.json"));
    }

    #[test]
    fn loads_environment_document() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"PATH": "/usr/bin:/bin", "FSLDIR": "/usr/share/fsl"}}"#
        )
        .unwrap();

        let env = load_environment(file.path()).unwrap();
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin:/bin"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn environment_must_be_strings() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"OMP_NUM_THREADS": 4}}"#).unwrap();
        assert!(matches!(
            load_environment(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn settings_derive_layout_from_gear_dir() {
        let settings = GearSettings {
            gear_dir: PathBuf::from("/gear"),
            ..Default::default()
        };
        assert_eq!(settings.config_path(), PathBuf::from("/gear/config.json"));
        assert_eq!(settings.work_dir(), PathBuf::from("/gear/work"));
        assert_eq!(settings.output_dir(), PathBuf::from("/gear/output"));
        assert_eq!(settings.bids_dir(), PathBuf::from("/gear/work/bids"));
        assert_eq!(settings.dataset_source(), PathBuf::from("/gear/input/bids"));
        assert_eq!(settings.executable, vec![DEFAULT_EXECUTABLE.to_string()]);
        assert_eq!(settings.run_level, "participant");
    }
}
