//! gear-run - BIDS App gear entry point
//!
//! Loads the gear's config and environment documents, runs the lifecycle for
//! one session and exits with its exit code.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use eyre::WrapErr;
use gear_core::config::{load_environment, DEFAULT_ENVIRON_PATH, DEFAULT_GEAR_DIR, DEFAULT_RUN_LEVEL};
use gear_core::{GearConfig, GearSettings, SessionContext};
use gear_runner::{GearInputs, GearLifecycle};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "gear-run", about = "Run a BIDS App pipeline for one session", version)]
struct Cli {
    /// Human-readable session label
    #[arg(long, env = "GEAR_SESSION_LABEL")]
    session_label: String,

    /// Gear root directory
    #[arg(long, default_value = DEFAULT_GEAR_DIR)]
    gear_dir: PathBuf,

    /// Gear config document (default: <gear-dir>/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Environment document handed to the pipeline
    #[arg(long, default_value = DEFAULT_ENVIRON_PATH)]
    environ: PathBuf,

    /// Directory the BIDS dataset is fetched from (default: <gear-dir>/input/bids)
    #[arg(long)]
    dataset_source: Option<PathBuf>,

    /// Executable invocation; repeat for multiple tokens
    #[arg(long = "executable", value_name = "TOKEN")]
    executable: Vec<String>,

    /// Analysis level passed as the last argument
    #[arg(long, default_value = DEFAULT_RUN_LEVEL)]
    run_level: String,

    /// BIDS validator binary
    #[arg(long, default_value = "bids-validator")]
    validator: PathBuf,

    /// Log the pipeline command instead of running it
    #[arg(long)]
    dry_run: bool,

    /// Kill the pipeline after this many seconds (0 = no timeout)
    #[arg(long, default_value = "0")]
    timeout_sec: u32,
}

impl Cli {
    fn settings(&self) -> GearSettings {
        let defaults = GearSettings::default();
        GearSettings {
            gear_dir: self.gear_dir.clone(),
            config_path: self.config.clone(),
            environ_path: self.environ.clone(),
            dataset_source: self.dataset_source.clone(),
            executable: if self.executable.is_empty() {
                defaults.executable
            } else {
                self.executable.clone()
            },
            run_level: self.run_level.clone(),
            validator_bin: self.validator.clone(),
            dry_run: self.dry_run,
            timeout_sec: self.timeout_sec,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let code = match try_main(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn try_main(cli: Cli) -> eyre::Result<i32> {
    let settings = cli.settings();

    SessionContext::label_for(&cli.session_label).wrap_err("invalid session label")?;

    let environment = load_environment(&settings.environ_path)
        .wrap_err("cannot load gear environment")?;
    let config = GearConfig::from_file(&settings.config_path())
        .wrap_err("cannot load gear config")?;
    let inputs = GearInputs::new(settings, config, environment, cli.session_label)
        .wrap_err("invalid gear policy")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let cancel_token = CancellationToken::new();
        tokio::spawn(cancel_on_signal(cancel_token.clone()));

        let lifecycle = GearLifecycle::new(inputs);
        let outcome = lifecycle.run(cancel_token).await;
        info!(
            exit_code = outcome.exit_code,
            state = %outcome.final_state(),
            "gear finished"
        );
        Ok(outcome.exit_code)
    })
}

/// Cancel the run on SIGINT or SIGTERM.
async fn cancel_on_signal(cancel_token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "failed to register signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, cancelling pipeline"),
            _ = sigterm.recv() => info!("received SIGTERM, cancelling pipeline"),
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received SIGINT, cancelling pipeline");
        }
    }

    cancel_token.cancel();
}
