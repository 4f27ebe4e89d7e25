mod allocator;
mod case;
mod config;
mod domain;
mod lifecycle;
mod plan;
mod summary;

use case::{Case, RunOptions};
use clap::{Parser, Subcommand};
use config::{ConfigErrors, RunConfig};
use lifecycle::{marker::MarkerContent, RunLifecycle, RunState};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;


/// Run coordinator for coupled MPI solvers
#[derive(Parser)]
#[command(name = "cosim", version, about, long_about = None)]
struct Cli {
    /// YAML run configuration
    #[arg(short, long, default_value = "cosim.yaml")]
    config: PathBuf,
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare, run and save a calculation
    Run {
        /// Skip data preparation (requires --run-id)
        #[arg(long)]
        no_prepare: bool,
        /// Skip running the solver
        #[arg(long)]
        no_run: bool,
        /// Skip saving results
        #[arg(long)]
        no_save: bool,
        /// Total number of processes
        #[arg(short, long)]
        n_procs: Option<u32>,
        #[arg(long)]
        run_id: Option<String>,
        /// Run in <SCRATCH_DIR>/<scratch_name> instead of the result directory
        #[arg(long)]
        scratch_dir: Option<PathBuf>,
    },
    /// Check the run configuration without running anything
    Check,
    /// Show the state of a run
    Status {
        #[arg(long)]
        run_id: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    std::process::exit(execute(cli));
}

fn configuration_error(error: &dyn std::error::Error) -> i32 {
    error!(error = %error, "Invalid run configuration");
    eprintln!(" Error in configuration stage.");

    1
}

/// state of a run followed by the lines of its marker
fn status_report(run_id: &str, state: RunState, content: Option<&MarkerContent>) -> String {
    let mut report = match state {
        RunState::Done => format!("{run_id}: inactive\n"),
        state => format!("{run_id}: {state}\n"),
    };
    if let Some(content) = content {
        report.push_str(&format!("  run id:              {}\n", content.run_id));
        report.push_str(&format!("  execution directory: {}\n", content.exec_dir.display()));
        report.push_str(&format!("  result directory:    {}\n", content.result_dir.display()));
    }

    report
}

fn execute(cli: Cli) -> i32 {
    let mut config = match RunConfig::load(&cli.config) {
        Ok(config) => config,
        Err(error) => return configuration_error(&error),
    };

    if config.preflight_checks() {
        return configuration_error(&ConfigErrors::Preflight);
    }

    let mut case = match Case::from_config(config) {
        Ok(case) => case,
        Err(error) => return configuration_error(&error),
    };

    match cli.command {
        Commands::Run {
            no_prepare,
            no_run,
            no_save,
            n_procs,
            run_id,
            scratch_dir,
        } => {
            let code = case.run(
                RunOptions {
                    n_procs,
                    run_id,
                    scratch_dir,
                    config_path: Some(cli.config),
                    prepare: !no_prepare,
                    run_solver: !no_run,
                    save: !no_save,
                },
                |_| (),
            );

            match case.error() {
                Some(stage) => error!(
                    stage = stage,
                    result_dir = ?case.result_dir(),
                    exec_dir = ?case.exec_dir(),
                    "Run finished with errors"
                ),
                None => info!(result_dir = ?case.result_dir(), "Run finished"),
            }

            code
        }
        Commands::Check => {
            info!(domains = case.participants().len(), "Run configuration is valid");
            0
        }
        Commands::Status { run_id } => {
            let (state, content) = RunLifecycle::observe(case.script_dir(), &run_id);
            print!("{}", status_report(&run_id, state, content.as_ref()));

            0
        }
    }
}
