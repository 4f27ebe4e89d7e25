mod configfile;
pub mod script;

#[cfg(test)]
mod plan_test;

use crate::{
    config::{LauncherConfig, MpiFlavor, MpmdSupport},
    domain::DomainRole,
};
use itertools::Itertools;
use std::{
    fmt::{self, Display},
    ops::RangeInclusive,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("No allowed MPI MPMD mode defined for {domains} domains")]
    NoLaunchMode { domains: usize },
    #[error("An MPMD launch requires an MPI launcher (launcher.mpiexec)")]
    NoLauncher,
    #[error("No domain with a solver to launch")]
    Empty,
    #[error("Failed to write launch file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What a resolved domain needs to be launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainLaunchSpec {
    pub working_dir: PathBuf,
    pub executable: String,
    pub arguments: String,
}

impl DomainLaunchSpec {
    /// executable followed by its arguments, if any
    pub fn command_line(&self) -> String {
        if self.arguments.trim().is_empty() {
            self.executable.clone()
        } else {
            format!("{} {}", self.executable, self.arguments.trim())
        }
    }
}

/// A domain ready to be placed in a launch plan
#[derive(Debug, Clone)]
pub struct LaunchEntry {
    pub role: DomainRole,
    pub spec: DomainLaunchSpec,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// one domain, optionally under mpiexec
    Direct,
    /// single mpiexec invocation with `:` separated applications
    MpmdInline,
    /// `-configfile` with one line per application
    MpmdConfigFile,
    /// Blue Gene/Q mapping file with rank range blocks
    MpmdConfigFileBgq,
    /// dispatch script selecting the application by rank
    MpmdScript,
}

impl LaunchMode {
    /// pick the launch mechanism for `domains` domains from what the launcher supports
    pub fn select(launcher: &LauncherConfig, domains: usize) -> Result<Self, PlanError> {
        if domains <= 1 {
            return Ok(Self::Direct);
        }

        launcher
            .mpmd
            .iter()
            .map(|support| match support {
                MpmdSupport::Inline => Self::MpmdInline,
                MpmdSupport::ConfigFile if launcher.flavor == MpiFlavor::BlueGeneQ => {
                    Self::MpmdConfigFileBgq
                }
                MpmdSupport::ConfigFile => Self::MpmdConfigFile,
                MpmdSupport::Script => Self::MpmdScript,
            })
            .next()
            .ok_or(PlanError::NoLaunchMode { domains })
    }
}

impl Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::MpmdInline => "mpmd-inline",
            Self::MpmdConfigFile => "mpmd-configfile",
            Self::MpmdConfigFileBgq => "mpmd-configfile-bgq",
            Self::MpmdScript => "mpmd-script",
        })
    }
}

/// Ready to execute command line plus the files it depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub mode: LaunchMode,
    pub command: String,
    /// directory to change into before running `command`, if any
    pub working_dir: Option<PathBuf>,
    pub generated_files: Vec<PathBuf>,
    pub total_procs: u32,
}

/// Build a launch plan, writing any side files into `exec_dir`.
///
/// Secondary domains are placed before primary ones so that coupled codes get
/// the lowest ranks; the order within each role is preserved.
pub fn build(
    entries: &[LaunchEntry],
    mode: LaunchMode,
    launcher: &LauncherConfig,
    exec_dir: &Path,
) -> Result<LaunchPlan, PlanError> {
    let entries = entries
        .iter()
        .filter(|entry| {
            if entry.count == 0 {
                warn!(dir = ?entry.spec.working_dir, "Skipping domain without processes");
            }
            entry.count > 0
        })
        .sorted_by_key(|entry| entry.role.launch_order())
        .cloned()
        .collect_vec();

    if entries.is_empty() {
        return Err(PlanError::Empty);
    }

    if entries.len() > 1 && mode == LaunchMode::Direct {
        return Err(PlanError::NoLaunchMode {
            domains: entries.len(),
        });
    }

    let total_procs: u32 = entries.iter().map(|entry| entry.count).sum();
    debug!(mode = %mode, total_procs = total_procs, "Building launch plan");

    let mut generated_files = Vec::new();
    let mut working_dir = None;

    let command = match mode {
        LaunchMode::Direct => {
            let entry = &entries[0];
            working_dir = Some(entry.spec.working_dir.clone());

            direct_command(&entry.spec, entry.count, launcher)
        }
        LaunchMode::MpmdInline => {
            let mut tokens = mpmd_prefix(launcher)?;
            tokens.extend(launcher.separator.clone());
            tokens.push(
                entries
                    .iter()
                    .map(|entry| app_segment(&entry.spec, entry.count))
                    .join(" : "),
            );

            tokens.join(" ")
        }
        LaunchMode::MpmdConfigFile => {
            let mut tokens = mpmd_prefix(launcher)?;
            let path = configfile::write_configfile(
                exec_dir,
                &entries,
                launcher.flavor != MpiFlavor::BlueGeneP,
            )?;

            tokens.push(format!("-configfile {}", path.display()));
            generated_files.push(path);

            tokens.join(" ")
        }
        LaunchMode::MpmdConfigFileBgq => {
            let mut tokens = mpmd_prefix(launcher)?;
            let path = configfile::write_bgq_configfile(exec_dir, &entries)?;

            if launcher.mpiexec.as_deref() == Some("srun") {
                tokens.push(format!("--launcher-opts='--mapping {}'", path.display()));
            } else {
                tokens.push(format!("--mapping {}", path.display()));
            }
            tokens.extend(launcher.separator.clone());
            if let Some(primary) = entries
                .iter()
                .find(|entry| entry.role == DomainRole::Primary)
            {
                tokens.push(primary.spec.executable.clone());
            }
            generated_files.push(path);

            tokens.join(" ")
        }
        LaunchMode::MpmdScript => {
            if launcher.mpiexec.is_none() {
                return Err(PlanError::NoLauncher);
            }

            let path = script::write_dispatch_script(exec_dir, &entries, launcher)?;
            let mut tokens = launch_prefix(launcher, total_procs);
            tokens.push(path.display().to_string());
            generated_files.push(path);

            tokens.join(" ")
        }
    };

    Ok(LaunchPlan {
        mode,
        command,
        working_dir,
        generated_files,
        total_procs,
    })
}

/// contiguous rank ranges for each entry, in entry order (counts must be non-zero)
pub fn rank_ranges(entries: &[LaunchEntry]) -> Vec<RangeInclusive<u32>> {
    let mut rank = 0;

    entries
        .iter()
        .map(|entry| {
            let range = rank..=rank + entry.count - 1;
            rank += entry.count;

            range
        })
        .collect()
}

/// `-n <count> -wdir <dir> <exe> <args>`
fn app_segment(spec: &DomainLaunchSpec, count: u32) -> String {
    format!(
        "-n {count} -wdir {} {}",
        spec.working_dir.display(),
        spec.command_line()
    )
}

fn direct_command(spec: &DomainLaunchSpec, count: u32, launcher: &LauncherConfig) -> String {
    if count <= 1 {
        return spec.command_line();
    }

    if launcher.mpiexec.is_none() {
        warn!(count = count, "No MPI launcher configured, running without mpiexec");
        return spec.command_line();
    }

    let mut tokens = launch_prefix(launcher, count);
    tokens.push(spec.executable.clone());
    tokens.extend(launcher.extra_args.clone());
    if !spec.arguments.trim().is_empty() {
        tokens.push(spec.arguments.trim().to_string());
    }

    tokens.join(" ")
}

/// launcher prefix for a single program running on `count` processes
fn launch_prefix(launcher: &LauncherConfig, count: u32) -> Vec<String> {
    let mut tokens = Vec::new();

    tokens.extend(launcher.mpiexec.clone());
    tokens.extend(launcher.options.clone());
    if let Some(ref flag) = launcher.n_flag {
        tokens.push(format!("{} {count}", flag.trim()));
    }
    tokens.extend(launcher.n_per_node.clone());
    tokens.extend(launcher.separator.clone());
    tokens.extend(launcher.exe_wrapper.clone());

    tokens
}

/// launcher prefix for MPMD syntaxes, process counts are given per application
fn mpmd_prefix(launcher: &LauncherConfig) -> Result<Vec<String>, PlanError> {
    let mpiexec = launcher.mpiexec.clone().ok_or(PlanError::NoLauncher)?;
    let mut tokens = vec![mpiexec];
    tokens.extend(launcher.options.clone());

    Ok(tokens)
}
