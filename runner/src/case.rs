use crate::{
    allocator::{allocate, AllocationError, DomainResourceSpec},
    config::{n_procs_from_resource_manager, LauncherConfig, MpiFlavor, RunConfig},
    domain::{DomainError, ExternalDomain, Participant},
    lifecycle::{
        marker::{MarkerBoard, MarkerContent},
        LifecycleError, LoggingMode, RunLifecycle, RunState,
    },
    plan::{self, script, LaunchEntry, LaunchMode, LaunchPlan, PlanError},
    summary::{self, SummaryHeader},
};
use chrono::Local;
use itertools::Itertools;
use std::{
    env, fs, io,
    path::{Path, PathBuf},
    process::Command,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};


#[derive(Error, Debug)]
pub enum CaseError {
    #[error("{0}")]
    Configuration(String),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("Working directory {path:?} {reason}, calculation will not be run")]
    DirectoryConflict { path: PathBuf, reason: &'static str },
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("{stage} exited with status {status}")]
    ExternalTool { stage: &'static str, status: i32 },
    #[error("Failed to set up {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl CaseError {
    /// stage label used in the one line error report
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Configuration(_) | Self::Allocation(_) => "configuration",
            Self::DirectoryConflict { .. } | Self::Io { .. } => "preparation",
            Self::Plan(_) => "launch plan",
            Self::Domain(error) => error.stage(),
            Self::ExternalTool { stage, .. } => *stage,
            Self::Lifecycle(_) => "run state",
        }
    }
}

/// user facing name of an error stage
fn stage_label(stage: &str) -> &str {
    match stage {
        "preprocess" => "preprocessing",
        "solver" => "calculation",
        other => other,
    }
}

/// Run parameters that may be adjusted once, right before process allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseOverrides {
    pub n_procs: Option<u32>,
    pub scratch_dir: Option<PathBuf>,
    pub launcher: LauncherConfig,
}

/// Which stages to run and the values given on the command line
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub n_procs: Option<u32>,
    pub run_id: Option<String>,
    pub scratch_dir: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub prepare: bool,
    pub run_solver: bool,
    pub save: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            n_procs: None,
            run_id: None,
            scratch_dir: None,
            config_path: None,
            prepare: true,
            run_solver: true,
            save: true,
        }
    }
}

/// Remaining wall time to export as `CS_MAXTIME`, in seconds for batch systems.
pub fn remaining_wall_time(max_time: Option<&str>, job_end: Option<&str>, now: i64) -> Option<String> {
    if let Some(max_time) = max_time {
        return Some(max_time.to_string());
    }

    job_end
        .and_then(|end| end.trim().parse::<i64>().ok())
        .map(|end| (end - now).max(0).to_string())
}

/// One run of a set of coupled domains
#[derive(Debug)]
pub struct Case {
    config: RunConfig,
    participants: Vec<Box<dyn Participant>>,
    case_dir: PathBuf,
    study_dir: PathBuf,
    name: String,
    script_dir: PathBuf,
    run_id: Option<String>,
    exec_prefix: Option<PathBuf>,
    exec_dir: Option<PathBuf>,
    result_dir: Option<PathBuf>,
    exec_solver: bool,
    config_path: Option<PathBuf>,
    plan: Option<LaunchPlan>,
    lifecycle: Option<RunLifecycle>,
    /// failing stage, if any
    error: Option<String>,
}

impl Case {
    /// build a case with one `ExternalDomain` per configured domain
    pub fn from_config(config: RunConfig) -> Result<Self, CaseError> {
        let participants = config
            .domains
            .iter()
            .map(|domain| {
                Box::new(ExternalDomain::new(domain.clone(), config.case_dir.clone()))
                    as Box<dyn Participant>
            })
            .collect_vec();

        Self::new(config, participants)
    }

    pub fn new(config: RunConfig, participants: Vec<Box<dyn Participant>>) -> Result<Self, CaseError> {
        if participants.is_empty() {
            return Err(CaseError::Configuration(String::from(
                "No domain was defined, nothing to run",
            )));
        }

        let coupled = participants.len() > 1;

        if coupled && participants.iter().any(|domain| domain.name().is_none()) {
            return Err(CaseError::Configuration(String::from(
                "In case of multiple domains (i.e. code coupling), each domain must have a name",
            )));
        }

        let executing = participants
            .iter()
            .filter(|domain| domain.exec_solver())
            .count();
        if executing != 0 && executing != participants.len() {
            return Err(CaseError::Configuration(String::from(
                "In case of multiple domains (i.e. code coupling), all or no domains must execute their solver",
            )));
        }

        let case_dir = fs::canonicalize(&config.case_dir).map_err(|_| {
            CaseError::Configuration(format!(
                "Case directory {:?} does not exist",
                config.case_dir
            ))
        })?;
        let name = case_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("case"));

        // standard study structure: <study>/<case>/{DATA,SCRIPTS,RESU}
        let (study_dir, script_dir) = if !coupled && case_dir.join("DATA").is_dir() {
            let scripts = case_dir.join("SCRIPTS");
            let script_dir = if scripts.is_dir() {
                scripts
            } else {
                debug!(case_dir = ?case_dir, "No SCRIPTS directory, markers go to the case directory");
                case_dir.clone()
            };

            (case_dir.parent().unwrap_or(&case_dir).to_path_buf(), script_dir)
        } else {
            (case_dir.clone(), case_dir.clone())
        };

        Ok(Self {
            run_id: config.run_id.clone(),
            config,
            participants,
            case_dir,
            study_dir,
            name,
            script_dir,
            exec_prefix: None,
            exec_dir: None,
            result_dir: None,
            exec_solver: executing != 0,
            config_path: None,
            plan: None,
            lifecycle: None,
            error: None,
        })
    }

    pub fn coupled(&self) -> bool {
        self.participants.len() > 1
    }

    pub fn exec_dir(&self) -> Option<&Path> {
        self.exec_dir.as_deref()
    }

    pub fn result_dir(&self) -> Option<&Path> {
        self.result_dir.as_deref()
    }

    pub fn script_dir(&self) -> &Path {
        &self.script_dir
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn participants(&self) -> &[Box<dyn Participant>] {
        &self.participants
    }

    fn set_error(&mut self, stage: &str) {
        if self.error.is_none() {
            self.error = Some(stage.to_string());
        }
    }

    /// `RESU` or `RESU_COUPLING`, preferring whichever already exists
    fn results_root(&self) -> PathBuf {
        let single = self.case_dir.join("RESU");
        let coupling = self.case_dir.join("RESU_COUPLING");

        if single.is_dir() {
            single
        } else if coupling.is_dir() || self.coupled() {
            coupling
        } else {
            single
        }
    }

    /// Execution directory for `run_id`, under the scratch prefix if one is set.
    pub fn define_exec_dir(&self, run_id: &str) -> PathBuf {
        match self.exec_prefix {
            Some(ref prefix) => {
                let mut name = if self.case_dir != self.study_dir || self.coupled() {
                    let study_dir = if self.coupled() {
                        self.case_dir.parent().unwrap_or(&self.case_dir)
                    } else {
                        &self.study_dir
                    };
                    let study = study_dir
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default();

                    format!("{study}.{}", self.name)
                } else {
                    self.name.clone()
                };
                name.push('.');
                name.push_str(run_id);

                prefix.join(name)
            }
            None => self.results_root().join(run_id),
        }
    }

    fn set_result_dir(&mut self, run_id: &str) -> Result<PathBuf, CaseError> {
        let result_dir = self.results_root().join(run_id);

        fs::create_dir_all(&result_dir).map_err(|source| CaseError::Io {
            path: result_dir.clone(),
            source,
        })?;
        self.result_dir = Some(result_dir.clone());

        Ok(result_dir)
    }

    /// Create the execution directory, refusing to reuse one from another run.
    ///
    /// The existence check and the creation are not atomic: two runs racing
    /// for the same directory may both succeed.
    fn mk_exec_dir(&mut self, run_id: &str) -> Result<PathBuf, CaseError> {
        let exec_dir = self.define_exec_dir(run_id);

        if self.result_dir.as_ref() != Some(&exec_dir) {
            if exec_dir.is_dir() {
                return Err(CaseError::DirectoryConflict {
                    path: exec_dir,
                    reason: "already exists",
                });
            }

            fs::create_dir_all(&exec_dir).map_err(|source| CaseError::Io {
                path: exec_dir.clone(),
                source,
            })?;
        } else {
            let entries = fs::read_dir(&exec_dir)
                .map_err(|source| CaseError::Io {
                    path: exec_dir.clone(),
                    source,
                })?
                .count();

            if entries > self.participants.len() {
                return Err(CaseError::DirectoryConflict {
                    path: exec_dir,
                    reason: "is not empty",
                });
            }
        }

        self.exec_dir = Some(exec_dir.clone());

        Ok(exec_dir)
    }

    /// hand each domain its own directories (a sub-directory per domain when coupled)
    fn assign_domain_dirs(&mut self) {
        let (Some(exec_dir), Some(result_dir)) = (self.exec_dir.clone(), self.result_dir.clone())
        else {
            return;
        };
        let coupled = self.coupled();

        for domain in self.participants.iter_mut() {
            match (coupled, domain.name().map(str::to_string)) {
                (true, Some(name)) => {
                    domain.set_dirs(exec_dir.join(&name), result_dir.join(&name))
                }
                _ => domain.set_dirs(exec_dir.clone(), result_dir.clone()),
            }
        }
    }

    /// make sure directories are known when stages run in separate invocations
    fn ensure_dirs(&mut self) -> Result<(), CaseError> {
        if self.exec_dir.is_some() && self.result_dir.is_some() {
            return Ok(());
        }

        let run_id = self.run_id.clone().ok_or_else(|| {
            CaseError::Configuration(String::from(
                "A run id is required when the preparation stage is skipped",
            ))
        })?;

        if self.exec_dir.is_none() {
            self.exec_dir = Some(self.define_exec_dir(&run_id));
        }
        if self.result_dir.is_none() {
            self.result_dir = Some(self.results_root().join(&run_id));
        }
        self.assign_domain_dirs();

        Ok(())
    }

    fn marker_board(&self) -> MarkerBoard {
        MarkerBoard::new(
            self.script_dir.clone(),
            MarkerContent {
                run_id: self.run_id.clone().unwrap_or_default(),
                exec_dir: self.exec_dir.clone().unwrap_or_default(),
                result_dir: self.result_dir.clone().unwrap_or_default(),
            },
        )
    }

    /// lifecycle of this run, attaching to the markers on disk if needed
    fn lifecycle(&mut self, assumed: RunState) -> &mut RunLifecycle {
        let board = self.marker_board();

        self.lifecycle
            .get_or_insert_with(|| RunLifecycle::attach(board, assumed))
    }

    /// run the mesh adaptation tool for domains that ask for it
    fn adapt(&self) -> Result<(), CaseError> {
        let Some(ref prefix) = self.config.adaptation_prefix else {
            return Ok(());
        };

        for option in self.participants.iter().filter_map(|domain| domain.adaptation()) {
            let mut command = Command::new(prefix.join("saturne_homard"));
            if let Some(ref config_path) = self.config_path {
                command.arg("-Saturne_Script").arg(config_path);
            }
            command
                .arg(&self.case_dir)
                .args(["-Pilotage_Adaptation", option, "-v"]);

            info!(option = option, "Running mesh adaptation");
            let status = command.status().map_err(|source| CaseError::Io {
                path: prefix.join("saturne_homard"),
                source,
            })?;

            if !status.success() {
                return Err(CaseError::ExternalTool {
                    stage: "adaptation",
                    status: status.code().unwrap_or(-1),
                });
            }
        }

        Ok(())
    }

    /// Distribute `n_procs` over the domains and return the total in use.
    pub fn distribute_procs(&mut self, n_procs: Option<u32>) -> Result<u32, CaseError> {
        let specs = self
            .participants
            .iter()
            .map(|domain| domain.resource_spec())
            .collect::<Vec<DomainResourceSpec>>();

        let allocation = allocate(&specs, n_procs).map_err(|error| {
            error!(missing = error.deficit(), "Not enough processes for the minimum of every domain");
            error
        })?;

        for (domain, count) in self.participants.iter_mut().zip(allocation.counts.iter()) {
            domain.set_resolved_count(*count);
        }

        Ok(allocation.total())
    }

    fn report_procs_distribution(&self) {
        if let [domain] = self.participants.as_slice() {
            let count = domain.resolved_count();
            if count > 1 {
                info!("Parallel {} on {count} processes", self.name);
            } else {
                info!("Single processor {} simulation", self.name);
            }
        } else {
            for domain in self.participants.iter() {
                info!(
                    "Domain {} on {} process(es)",
                    domain.name().unwrap_or("-"),
                    domain.resolved_count()
                );
            }
        }
    }

    /// Build the launch plan and the solver script in the execution directory.
    fn generate_solver_script(&mut self, exec_dir: &Path) -> Result<(), CaseError> {
        let entries = self
            .participants
            .iter()
            .map(|domain| {
                Ok(LaunchEntry {
                    role: domain.role(),
                    spec: domain.launch_spec()?,
                    count: domain.resolved_count(),
                })
            })
            .collect::<Result<Vec<_>, DomainError>>()?;

        let mode = LaunchMode::select(&self.config.launcher, entries.len())?;
        let plan = plan::build(&entries, mode, &self.config.launcher, exec_dir)?;
        script::write_solver_script(exec_dir, &plan, &self.config.launcher)?;

        info!(mode = %plan.mode, command = plan.command, "Generated launch plan");
        self.plan = Some(plan);

        Ok(())
    }

    fn summary_header(&self, exec_dir: &Path) -> SummaryHeader {
        SummaryHeader {
            start: Local::now(),
            command: env::args().join(" "),
            launcher: self.config.launcher.mpiexec.clone(),
            mpi_flavor: match self.config.launcher.flavor {
                MpiFlavor::Generic => None,
                MpiFlavor::BlueGeneP => Some(String::from("Blue Gene/P")),
                MpiFlavor::BlueGeneQ => Some(String::from("Blue Gene/Q")),
            },
            adaptation_prefix: self.config.adaptation_prefix.clone(),
            n_procs: self
                .participants
                .iter()
                .map(|domain| domain.resolved_count())
                .sum::<u32>()
                .max(1),
            exec_dir: self.coupled().then(|| exec_dir.to_path_buf()),
            domains: self
                .participants
                .iter()
                .map(|domain| domain.summary_info())
                .collect(),
        }
    }

    /// Prepare data for the calculation: directories, allocation, preprocessing and launch plan.
    ///
    /// Errors returned here are fatal. A failing preprocessing step is only
    /// recorded and moves the run to `Failed`.
    pub fn prepare_data(&mut self, n_procs: Option<u32>) -> Result<(), CaseError> {
        let run_id = self
            .run_id
            .get_or_insert_with(|| Local::now().format("%Y%m%d-%H%M").to_string())
            .clone();

        self.adapt()?;

        self.set_result_dir(&run_id)?;
        let exec_dir = self.mk_exec_dir(&run_id)?;
        self.assign_domain_dirs();

        self.lifecycle = Some(RunLifecycle::new(self.marker_board()));
        self.lifecycle(RunState::Done).advance(RunState::Preparing)?;

        if let (Some(config_path), Some(result_dir)) = (self.config_path.clone(), self.result_dir.clone()) {
            if let Some(file_name) = config_path.file_name() {
                if let Err(error) = fs::copy(&config_path, result_dir.join(file_name)) {
                    warn!(error = ?error, "Failed to copy run configuration to the result directory");
                }
            }
        }

        let n_procs_tot = self.distribute_procs(n_procs)?;

        info!(
            result_dir = ?self.result_dir,
            exec_dir = ?exec_dir,
            n_procs = n_procs_tot,
            "{} is running",
            self.name
        );
        self.report_procs_distribution();

        info!("Preparing calculation data");
        for domain in self.participants.iter_mut() {
            domain.prepare_data()?;
        }

        info!("Preprocessing calculation");
        if let Err(error) = summary::write_header(&exec_dir, &self.summary_header(&exec_dir)) {
            warn!(error = ?error, "Failed to write run summary");
        }

        let mut failed = None;
        for domain in self.participants.iter_mut() {
            if let Err(error) = domain.preprocess() {
                error!(error = %error, domain = domain.name().unwrap_or("-"), "Preprocessing failed");
                domain.set_error(error.stage());
                failed = Some(error.stage());
            }
        }
        if let Some(stage) = failed {
            self.set_error(stage);
        }

        if self.exec_solver {
            self.generate_solver_script(&exec_dir)?;
        }

        let status = if self.error.is_none() {
            RunState::Ready
        } else {
            RunState::Failed
        };
        self.lifecycle(RunState::Preparing).advance(status)?;

        Ok(())
    }

    /// Run the solver script and record its outcome. Returns the script's exit code.
    pub fn run_solver(&mut self) -> Result<i32, CaseError> {
        if !self.exec_solver {
            return Ok(0);
        }

        self.ensure_dirs()?;
        let exec_dir = self.exec_dir.clone().unwrap_or_default();
        let logging = self
            .participants
            .first()
            .map(|domain| domain.logging())
            .unwrap_or(LoggingMode::Standard);

        self.lifecycle(RunState::Ready)
            .advance(RunState::Running(logging))?;

        info!("Starting calculation");

        let solver_script = exec_dir.join(script::SOLVER_SCRIPT_NAME);
        let mut command = Command::new(&solver_script);
        command.current_dir(&exec_dir);

        let job_end = env::var("SLURM_JOB_END_TIME").ok();
        if let Some(max_time) = remaining_wall_time(
            self.config.max_time.as_deref(),
            job_end.as_deref(),
            Local::now().timestamp(),
        ) {
            debug!(max_time = max_time, "Exporting remaining wall time");
            command.env("CS_MAXTIME", max_time);
        }

        let retcode = match command.status() {
            Ok(status) => status.code().unwrap_or(-1),
            Err(error) => {
                error!(error = ?error, script = ?solver_script, "Failed to start solver script");
                -1
            }
        };

        if retcode != 0 {
            self.set_error("solver");
            eprintln!(" solver script exited with status {retcode}.");
            // the exit status does not tell which domain failed
            for domain in self.participants.iter_mut() {
                domain.set_error("solver");
            }

            let domains = self
                .participants
                .iter()
                .filter_map(|domain| domain.name())
                .join(", ");
            if self.coupled() {
                error!(
                    domains = domains,
                    "Error running the coupled calculation, either domain may have failed. Check the domain logs for details"
                );
            } else {
                error!("Error running the calculation. Check the solver log for details");
            }
        }

        let status = if retcode == 0 {
            RunState::Finished
        } else {
            RunState::Failed
        };
        self.lifecycle(RunState::Ready).advance(status)?;

        Ok(retcode)
    }

    /// Save results from the execution directory to the result directory.
    ///
    /// Runs after failures too, to preserve partial results.
    pub fn save_results(&mut self) -> Result<(), CaseError> {
        self.ensure_dirs()?;
        let exec_dir = self.exec_dir.clone().unwrap_or_default();
        let result_dir = self.result_dir.clone().unwrap_or_default();

        let assumed = if self.error.is_some() {
            RunState::Failed
        } else {
            RunState::Finished
        };
        self.lifecycle(assumed).advance(RunState::Saving)?;

        info!("Saving calculation results");

        if exec_dir.is_dir() {
            if let Err(error) = summary::append_footer(&exec_dir, self.error.as_deref().map(stage_label)) {
                warn!(error = ?error, "Failed to finalize run summary");
            }
            self.copy_log(summary::SUMMARY_NAME, &exec_dir, &result_dir);
        }

        if self.coupled() && self.error.is_none() {
            let mut generated = self
                .plan
                .as_ref()
                .map(|plan| plan.generated_files.clone())
                .unwrap_or_default();
            generated.push(exec_dir.join(script::SOLVER_SCRIPT_NAME));

            for path in generated.iter().filter(|path| path.is_file()) {
                if let Err(error) = fs::remove_file(path) {
                    debug!(error = ?error, path = ?path, "Failed to remove generated file");
                }
            }
        }

        let keep_sources = self.error.is_some();
        let mut copy_failed = false;
        for domain in self.participants.iter_mut() {
            if let Err(error) = domain.copy_results(keep_sources) {
                error!(error = %error, domain = domain.name().unwrap_or("-"), "Failed to save results");
                copy_failed = true;
            }
        }
        if copy_failed {
            self.set_error("save");
        }

        if exec_dir != result_dir && fs::remove_dir(&exec_dir).is_ok() {
            info!(exec_dir = ?exec_dir, "Cleaned working directory");
        }

        self.lifecycle(RunState::Saving).advance(RunState::Done)?;

        Ok(())
    }

    /// copy a single log file to the result directory, removing it when no error occurred
    fn copy_log(&self, name: &str, exec_dir: &Path, result_dir: &Path) {
        if exec_dir == result_dir {
            return;
        }

        let source = exec_dir.join(name);
        if !source.is_file() {
            return;
        }

        match fs::copy(&source, result_dir.join(name)) {
            Ok(_) if self.error.is_none() => {
                if let Err(error) = fs::remove_file(&source) {
                    debug!(error = ?error, path = ?source, "Failed to remove copied log");
                }
            }
            Ok(_) => (),
            Err(error) => warn!(error = ?error, path = ?source, "Failed to copy log to the result directory"),
        }
    }

    /// Run the selected stages: prepare, run and save. Returns the process exit code.
    ///
    /// `overrides` is invoked once, before process allocation, and may adjust
    /// the process count, scratch directory and MPI launcher.
    pub fn run<F>(&mut self, options: RunOptions, overrides: F) -> i32
    where
        F: FnOnce(&mut CaseOverrides),
    {
        let mut values = CaseOverrides {
            n_procs: options
                .n_procs
                .or(self.config.n_procs)
                .or_else(|| n_procs_from_resource_manager(|name| env::var(name).ok())),
            scratch_dir: options
                .scratch_dir
                .clone()
                .or_else(|| self.config.scratch_dir.clone()),
            launcher: self.config.launcher.clone(),
        };
        overrides(&mut values);

        self.config.launcher = values.launcher;
        self.config.scratch_dir = values.scratch_dir;
        self.exec_prefix = self.config.scratch_prefix(&self.case_dir);
        self.config_path = options.config_path.clone();

        if options.run_id.is_some() {
            self.run_id = options.run_id.clone();
        }

        let outcome = self.stages(&options, values.n_procs);

        // whatever marker is left is removed once the lifecycle is gone
        if let Some(lifecycle) = self.lifecycle.take() {
            debug!(state = %lifecycle.state(), "Leaving run");
        }

        match outcome {
            Ok(()) => match self.error {
                Some(ref stage) => {
                    eprintln!(" Error in {} stage.", stage_label(stage));
                    1
                }
                None => 0,
            },
            Err(error) => {
                error!(stage = error.stage(), "{error}");
                self.set_error(error.stage());
                eprintln!(" Error in {} stage.", stage_label(error.stage()));
                1
            }
        }
    }

    fn stages(&mut self, options: &RunOptions, n_procs: Option<u32>) -> Result<(), CaseError> {
        if options.prepare {
            self.prepare_data(n_procs)?;
        }

        if options.run_solver && self.error.is_none() {
            self.run_solver()?;
        }

        if options.save {
            self.save_results()?;
        }

        Ok(())
    }
}
