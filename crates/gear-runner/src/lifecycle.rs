//! Gear lifecycle.
//!
//! `START → INPUT_READY → PARAMS_READY → VALIDATED → EXECUTED → ARCHIVED`,
//! ending in `SUCCESS` or `FAILURE`.
//!
//! - Input failures are logged; they end the run with exit code 1 only when
//!   `gear-abort-on-bids-error` is set.
//! - Once the session directory exists, an archive guard is armed. It runs
//!   on every exit path (including unwinding and a dropped future): always
//!   after success, after failure only with `gear-save-output-on-error`.
//! - Exit code: 0 on success, the child's code when it exited non-zero,
//!   1 for every other failure.

use crate::archive::{ArchiveReport, ResultArchiver};
use crate::bids::{self, BidsValidator, BidsValidatorCli, DatasetSource, LocalDatasetSource};
use crate::runner::{ProcessRunner, RunnerConfig};
use gear_core::config::ConfigError;
use gear_core::params::{self, PIPELINE_FILE_KEY};
use gear_core::resources::{self, HostProbe, LiveHost};
use gear_core::{
    CommandSpec, Environment, GearConfig, GearSettings, Policy, SessionContext, SessionError,
};
use std::io;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit code for failures that happen before or around the child process.
pub const GENERIC_FAILURE: i32 = 1;

/// Lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Start,
    InputReady,
    ParamsReady,
    Validated,
    Executed,
    Archived,
    Success,
    Failure,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::InputReady => "INPUT_READY",
            Self::ParamsReady => "PARAMS_READY",
            Self::Validated => "VALIDATED",
            Self::Executed => "EXECUTED",
            Self::Archived => "ARCHIVED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SessionSetupError {
    #[error(transparent)]
    Label(#[from] SessionError),
    #[error("failed to create session directory: {0}")]
    Io(#[from] io::Error),
}

/// Result of one gear run.
#[derive(Debug, Clone)]
pub struct GearOutcome {
    pub exit_code: i32,
    /// Every state entered, in order, ending with `Success` or `Failure`.
    pub states: Vec<LifecycleState>,
    pub archive: Option<ArchiveReport>,
}

impl GearOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    pub fn final_state(&self) -> LifecycleState {
        self.states.last().copied().unwrap_or(LifecycleState::Start)
    }
}

/// Records and logs state transitions.
struct StateTrace {
    states: Vec<LifecycleState>,
}

impl StateTrace {
    fn new() -> Self {
        info!(state = %LifecycleState::Start, "gear starting");
        Self {
            states: vec![LifecycleState::Start],
        }
    }

    fn advance(&mut self, state: LifecycleState) {
        info!(state = %state, "gear state");
        self.states.push(state);
    }

    fn finish(mut self, exit_code: i32, archive: Option<ArchiveReport>) -> GearOutcome {
        if archive.is_some() {
            self.advance(LifecycleState::Archived);
        }
        let terminal = if exit_code == 0 {
            LifecycleState::Success
        } else {
            LifecycleState::Failure
        };
        self.advance(terminal);
        GearOutcome {
            exit_code,
            states: self.states,
            archive,
        }
    }
}

/// Archives the session on drop unless `finish` already did.
struct ArchiveOnExit<'a> {
    archiver: &'a ResultArchiver,
    session: &'a SessionContext,
    archive_on_error: bool,
    succeeded: bool,
    finished: bool,
}

impl<'a> ArchiveOnExit<'a> {
    fn arm(archiver: &'a ResultArchiver, session: &'a SessionContext, archive_on_error: bool) -> Self {
        Self {
            archiver,
            session,
            archive_on_error,
            succeeded: false,
            finished: false,
        }
    }

    fn mark_succeeded(&mut self) {
        self.succeeded = true;
    }

    fn finish(mut self) -> Option<ArchiveReport> {
        self.finished = true;
        self.archive()
    }

    fn archive(&self) -> Option<ArchiveReport> {
        if !self.succeeded && !self.archive_on_error {
            info!(
                "run failed and {} is false; not archiving output",
                Policy::SAVE_OUTPUT_ON_ERROR
            );
            return None;
        }
        match self.archiver.archive(
            self.session.work_dir(),
            self.session.session_label(),
            self.session.output_dir(),
        ) {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "failed to archive session output");
                None
            }
        }
    }
}

impl Drop for ArchiveOnExit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.archive();
        }
    }
}

/// Everything a run reads, resolved before the lifecycle starts.
#[derive(Debug, Clone)]
pub struct GearInputs {
    pub settings: GearSettings,
    pub config: GearConfig,
    pub policy: Policy,
    pub environment: Environment,
    /// Human-readable session label, sanitized when the session opens.
    pub session_label: String,
}

impl GearInputs {
    pub fn new(
        settings: GearSettings,
        config: GearConfig,
        environment: Environment,
        session_label: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let policy = config.policy()?;
        Ok(Self {
            settings,
            config,
            policy,
            environment,
            session_label: session_label.into(),
        })
    }
}

/// Sequences one gear run.
pub struct GearLifecycle<V = BidsValidatorCli> {
    inputs: GearInputs,
    source: Box<dyn DatasetSource>,
    validator: V,
    host: Box<dyn HostProbe>,
    runner: ProcessRunner,
    archiver: ResultArchiver,
}

impl<V: std::fmt::Debug> std::fmt::Debug for GearLifecycle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GearLifecycle")
            .field("inputs", &self.inputs)
            .field("validator", &self.validator)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

impl GearLifecycle<BidsValidatorCli> {
    /// Lifecycle wired to the local dataset source, the validator CLI and
    /// the live host.
    pub fn new(inputs: GearInputs) -> Self {
        let source = LocalDatasetSource::new(inputs.settings.dataset_source());
        let validator = BidsValidatorCli::new(&inputs.settings.validator_bin);
        Self::with_collaborators(inputs, Box::new(source), validator, Box::new(LiveHost))
    }
}

impl<V: BidsValidator> GearLifecycle<V> {
    pub fn with_collaborators(
        inputs: GearInputs,
        source: Box<dyn DatasetSource>,
        validator: V,
        host: Box<dyn HostProbe>,
    ) -> Self {
        let runner = ProcessRunner::new(RunnerConfig::from_settings(&inputs.settings));
        Self {
            inputs,
            source,
            validator,
            host,
            runner,
            archiver: ResultArchiver::new(),
        }
    }

    pub fn inputs(&self) -> &GearInputs {
        &self.inputs
    }

    /// Run every stage and return the outcome. Never panics on stage errors.
    pub async fn run(&self, cancel_token: CancellationToken) -> GearOutcome {
        let mut trace = StateTrace::new();
        let policy = self.inputs.policy;

        match self.prepare_input().await {
            Ok(()) => trace.advance(LifecycleState::InputReady),
            Err(err) => {
                error!(error = %err, "cannot download and validate BIDS");
                if policy.abort_on_bids_error {
                    return trace.finish(GENERIC_FAILURE, None);
                }
                warn!("continuing with unvalidated input");
            }
        }

        let session = match self.open_session() {
            Ok(session) => session,
            Err(err) => {
                error!(error = %err, "cannot open session");
                return trace.finish(GENERIC_FAILURE, None);
            }
        };
        let mut finalizer =
            ArchiveOnExit::arm(&self.archiver, &session, policy.save_output_on_error);

        let mut params = params::build(
            &self.inputs.config.config,
            &Policy::exclusion_set(),
            self.inputs.config.input_path(PIPELINE_FILE_KEY),
        );
        trace.advance(LifecycleState::ParamsReady);

        resources::validate(&mut params, self.host.as_ref());
        trace.advance(LifecycleState::Validated);

        let command = self.command_spec(&session).compose(&params);
        let exit_code = match self
            .runner
            .run(&command, &session.environment, cancel_token)
            .await
        {
            Ok(_) => {
                trace.advance(LifecycleState::Executed);
                finalizer.mark_succeeded();
                info!("commands successfully executed");
                0
            }
            Err(err) => {
                error!(error = %err, "cannot execute pipeline command");
                err.exit_code()
            }
        };

        let archive = finalizer.finish();
        trace.finish(exit_code, archive)
    }

    /// Fetch the dataset and, if enabled, validate it.
    async fn prepare_input(&self) -> bids::Result<()> {
        let bids_dir = self.inputs.settings.bids_dir();
        bids::acquire(self.source.as_ref(), &bids_dir)?;

        if self.inputs.policy.run_bids_validation {
            self.validator
                .validate(&bids_dir, &self.inputs.environment)
                .await?;
        } else {
            info!("BIDS validation disabled");
        }
        Ok(())
    }

    /// Create the session context and its output directory.
    fn open_session(&self) -> Result<SessionContext, SessionSetupError> {
        let settings = &self.inputs.settings;
        let session = SessionContext::new(
            &self.inputs.session_label,
            settings.work_dir(),
            settings.output_dir(),
            self.inputs.environment.clone(),
        )?;
        std::fs::create_dir_all(session.session_path())?;
        info!(
            session_label = session.session_label(),
            session_path = %session.session_path().display(),
            "session directory ready"
        );
        Ok(session)
    }

    /// Executable prefix and positional suffix for this session.
    fn command_spec(&self, session: &SessionContext) -> CommandSpec {
        let settings = &self.inputs.settings;
        CommandSpec::new(
            settings.executable.clone(),
            vec![
                settings.bids_dir().display().to_string(),
                session.session_path().display().to_string(),
                settings.run_level.clone(),
            ],
        )
    }
}
