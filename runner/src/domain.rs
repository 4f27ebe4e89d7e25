use crate::{
    allocator::DomainResourceSpec,
    config::{CommandConfig, DomainConfig},
    lifecycle::LoggingMode,
    plan::DomainLaunchSpec,
};
use globset::GlobSet;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::{
    fmt::Debug,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;


#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Failed to spawn {stage} command for domain {domain}")]
    Spawn {
        domain: String,
        stage: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{stage} command for domain {domain} exited with status {status}")]
    Exit {
        domain: String,
        stage: &'static str,
        status: i32,
    },
    #[error("{stage} command for domain {domain} ran into a timeout")]
    Timeout { domain: String, stage: &'static str },
    #[error("Failed to copy {path:?}")]
    Copy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Result globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("Domain {0} has no working directory yet")]
    NoWorkingDir(String),
}

impl DomainError {
    /// stage name reported to the user
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Spawn { stage, .. } | Self::Exit { stage, .. } | Self::Timeout { stage, .. } => {
                *stage
            }
            Self::Copy { .. } | Self::InvalidGlobs(_) => "save",
            Self::NoWorkingDir(_) => "prepare",
        }
    }
}

/// Which side of a coupling a domain is on
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DomainRole {
    /// main compute domain
    #[default]
    Primary,
    /// coupled physics, launched on the lowest ranks
    Secondary,
}

impl DomainRole {
    pub fn launch_order(self) -> u8 {
        match self {
            Self::Secondary => 0,
            Self::Primary => 1,
        }
    }
}

/// One coupled solver instance taking part in a run
pub trait Participant: Debug {
    fn name(&self) -> Option<&str>;
    fn role(&self) -> DomainRole;
    fn exec_solver(&self) -> bool;
    fn logging(&self) -> LoggingMode;

    /// mesh adaptation option, run before the directories are set up
    fn adaptation(&self) -> Option<&str> {
        None
    }

    /// process bounds before allocation
    fn resource_spec(&self) -> DomainResourceSpec;
    fn set_resolved_count(&mut self, count: u32);
    fn resolved_count(&self) -> u32;

    /// working and result directories of this domain
    fn set_dirs(&mut self, exec_dir: PathBuf, result_dir: PathBuf);
    fn launch_spec(&self) -> Result<DomainLaunchSpec, DomainError>;

    fn prepare_data(&mut self) -> Result<(), DomainError>;
    fn preprocess(&mut self) -> Result<(), DomainError>;
    /// move (or copy, when `keep_sources`) results out of the working directory
    fn copy_results(&mut self, keep_sources: bool) -> Result<(), DomainError>;

    /// stage this domain failed in
    fn set_error(&mut self, stage: &str);
    fn error(&self) -> Option<&str>;

    /// key/value rows for the run summary
    fn summary_info(&self) -> Vec<(String, String)>;
}

/// Domain driven entirely by the run configuration: external executables for
/// data preparation, preprocessing and the solver itself.
#[derive(Debug, Clone)]
pub struct ExternalDomain {
    config: DomainConfig,
    case_dir: PathBuf,
    count: u32,
    exec_dir: Option<PathBuf>,
    result_dir: Option<PathBuf>,
    error: Option<String>,
}

impl ExternalDomain {
    pub fn new(config: DomainConfig, case_dir: PathBuf) -> Self {
        let count = config.n_procs.unwrap_or(config.min_procs);

        Self {
            config,
            case_dir,
            count,
            exec_dir: None,
            result_dir: None,
            error: None,
        }
    }

    fn label(&self) -> String {
        self.config
            .name
            .clone()
            .unwrap_or_else(|| self.config.executable.to_string_lossy().into_owned())
    }

    fn working_dir(&self) -> Result<&Path, DomainError> {
        self.exec_dir
            .as_deref()
            .ok_or_else(|| DomainError::NoWorkingDir(self.label()))
    }

    /// run an external tool in the working directory, logging into `<stage>.log`
    fn run_tool(&self, stage: &'static str, command: &CommandConfig) -> Result<(), DomainError> {
        let working_dir = self.working_dir()?;
        let domain = self.label();
        let spawn_error = |source| DomainError::Spawn {
            domain: domain.clone(),
            stage,
            source,
        };

        let log = File::create(working_dir.join(format!("{stage}.log"))).map_err(spawn_error)?;
        let log_err = log.try_clone().map_err(spawn_error)?;

        info!(domain = %domain, stage = stage, exec = ?command.exec, "Running external tool");

        let mut child = Command::new(&command.exec)
            .args(command.args.iter())
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(spawn_error)?;

        let status = match command.timeout {
            Some(seconds) => match child
                .wait_timeout(Duration::from_secs(seconds))
                .map_err(spawn_error)?
            {
                Some(status) => status,
                None => {
                    // child hasn't exited yet
                    if let Err(error) = child.kill().and_then(|()| child.wait().map(|_| ())) {
                        warn!(error = ?error, "Failed to kill timed out {stage} command");
                    }

                    return Err(DomainError::Timeout { domain, stage });
                }
            },
            None => child.wait().map_err(spawn_error)?,
        };

        debug!(domain = %domain, stage = stage, status = ?status, "External tool finished");

        if status.success() {
            Ok(())
        } else {
            Err(DomainError::Exit {
                domain,
                stage,
                status: status.code().unwrap_or(-1),
            })
        }
    }
}

impl Participant for ExternalDomain {
    fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    fn role(&self) -> DomainRole {
        self.config.role
    }

    fn exec_solver(&self) -> bool {
        self.config.exec_solver
    }

    fn logging(&self) -> LoggingMode {
        self.config.logging
    }

    fn adaptation(&self) -> Option<&str> {
        self.config.adaptation.as_deref()
    }

    fn resource_spec(&self) -> DomainResourceSpec {
        let min = self.config.min_procs;
        if self.config.max_procs == Some(min) {
            return DomainResourceSpec::pinned(min);
        }

        let mut requested = self.config.n_procs.unwrap_or(min).max(min);

        if let Some(max) = self.config.max_procs {
            requested = requested.min(max.max(min));
        }

        DomainResourceSpec::new(requested, min, self.config.max_procs)
    }

    fn set_resolved_count(&mut self, count: u32) {
        self.count = count;
    }

    fn resolved_count(&self) -> u32 {
        self.count
    }

    fn set_dirs(&mut self, exec_dir: PathBuf, result_dir: PathBuf) {
        self.exec_dir = Some(exec_dir);
        self.result_dir = Some(result_dir);
    }

    fn launch_spec(&self) -> Result<DomainLaunchSpec, DomainError> {
        Ok(DomainLaunchSpec {
            working_dir: self.working_dir()?.to_path_buf(),
            executable: self.config.executable.to_string_lossy().into_owned(),
            arguments: self.config.args.join(" "),
        })
    }

    fn prepare_data(&mut self) -> Result<(), DomainError> {
        let working_dir = self.working_dir()?.to_path_buf();

        fs::create_dir_all(&working_dir).map_err(|source| DomainError::Copy {
            path: working_dir.clone(),
            source,
        })?;

        for data in self.config.data.iter() {
            let source_path = if data.is_relative() {
                self.case_dir.join(data)
            } else {
                data.clone()
            };
            let target = working_dir.join(source_path.file_name().unwrap_or(data.as_os_str()));

            debug!(source = ?source_path, target = ?target, "Copying input data");
            fs::copy(&source_path, &target).map_err(|source| DomainError::Copy {
                path: source_path.clone(),
                source,
            })?;
        }

        match self.config.prepare {
            Some(ref command) => self.run_tool("prepare", command),
            None => Ok(()),
        }
    }

    fn preprocess(&mut self) -> Result<(), DomainError> {
        match self.config.preprocess {
            Some(ref command) => self.run_tool("preprocess", command),
            None => Ok(()),
        }
    }

    fn copy_results(&mut self, keep_sources: bool) -> Result<(), DomainError> {
        // sources of a failed domain stay for inspection
        let keep_sources = keep_sources || self.error.is_some();
        let working_dir = self.working_dir()?.to_path_buf();
        let result_dir = match self.result_dir {
            Some(ref result_dir) if *result_dir != working_dir => result_dir.clone(),
            // results are already in place
            _ => return Ok(()),
        };

        if !working_dir.is_dir() {
            return Ok(());
        }

        let globs: GlobSet = self.config.compile_results()?;
        let mut copied = 0;

        for entry in WalkBuilder::new(&working_dir)
            .standard_filters(false)
            .build()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
        {
            let relative = match entry.path().strip_prefix(&working_dir) {
                Ok(relative) if globs.is_match(relative) => relative.to_path_buf(),
                _ => continue,
            };
            let target = result_dir.join(&relative);
            let copy_error = |source| DomainError::Copy {
                path: entry.path().to_path_buf(),
                source,
            };

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(copy_error)?;
            }
            fs::copy(entry.path(), &target).map_err(copy_error)?;

            if !keep_sources {
                fs::remove_file(entry.path()).map_err(copy_error)?;
            }
            copied += 1;
        }

        if !keep_sources {
            remove_empty_dirs(&working_dir);
        }

        info!(domain = %self.label(), files = copied, dir = ?result_dir, "Copied results");

        Ok(())
    }

    fn set_error(&mut self, stage: &str) {
        warn!(domain = %self.label(), stage = stage, "Domain failed");
        self.error = Some(stage.to_string());
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn summary_info(&self) -> Vec<(String, String)> {
        let mut rows = Vec::new();

        if let Some(name) = self.name() {
            rows.push(("Domain".to_string(), name.to_string()));
        }
        rows.push((
            "Executable".to_string(),
            self.config.executable.to_string_lossy().into_owned(),
        ));
        rows.push(("N procs".to_string(), self.count.to_string()));
        if let Some(ref dir) = self.exec_dir {
            rows.push(("Exec. dir.".to_string(), dir.display().to_string()));
        }
        if let Some(ref stage) = self.error {
            rows.push(("Error".to_string(), stage.clone()));
        }

        rows
    }
}

/// remove `dir` and every empty directory below it, bottom up
fn remove_empty_dirs(dir: &Path) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.filter_map(Result::ok) {
            if entry.file_type().map_or(false, |kind| kind.is_dir()) {
                remove_empty_dirs(&entry.path());
            }
        }
    }

    // fails on non-empty directories, which are kept
    let _ = fs::remove_dir(dir);
}
