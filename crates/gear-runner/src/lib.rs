//! gear-runner - BIDS App gear lifecycle
//!
//! Input acquisition, pipeline execution and result archiving for one
//! session. The `gear-run` binary wires these together from the gear's
//! config and environment documents.

pub mod archive;
pub mod bids;
pub mod lifecycle;
pub mod runner;

pub use archive::{ArchiveReport, ResultArchiver};
pub use bids::{BidsValidator, BidsValidatorCli, DatasetSource, LocalDatasetSource};
pub use lifecycle::{GearInputs, GearLifecycle, GearOutcome, LifecycleState};
pub use runner::{ProcessRunner, RunnerConfig, RunnerError};
