use crate::{domain::DomainRole, lifecycle::LoggingMode};
use globset::{Glob, GlobSet, GlobSetBuilder};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{fs::File, io::Error, os::unix::fs::MetadataExt, path::Path, path::PathBuf};
use thiserror::Error;
use tracing::{error, warn};

#[cfg(test)]
mod config_test;

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::Io(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Failed to access file")]
    Io(#[from] Error),
    #[error("Failed to parse run configuration")]
    Parse(#[from] serde_yaml::Error),
    #[error("Run configuration contains errors")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    // case directory, relative paths are resolved against the config file
    #[serde(default = "default_case_dir")]
    pub case_dir: PathBuf,
    pub run_id: Option<String>,
    // total number of processes, overrides the resource manager
    pub n_procs: Option<u32>,
    pub scratch_dir: Option<PathBuf>,
    // sub-directory of the scratch directory holding execution directories
    #[serde(default = "default_scratch_name")]
    pub scratch_name: String,
    // remaining batch wall time exported as CS_MAXTIME
    pub max_time: Option<String>,
    // install prefix of the mesh adaptation tool
    pub adaptation_prefix: Option<PathBuf>,
    #[serde(default)]
    pub launcher: LauncherConfig,
    pub domains: Vec<DomainConfig>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MpmdSupport {
    Inline,
    ConfigFile,
    Script,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MpiFlavor {
    #[default]
    Generic,
    /// Blue Gene/P: config files must not contain comments
    #[serde(rename = "bgp")]
    BlueGeneP,
    /// Blue Gene/Q: config files use rank range directives
    #[serde(rename = "bgq")]
    BlueGeneQ,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LauncherConfig {
    #[serde(default = "default_mpiexec")]
    pub mpiexec: Option<String>,
    pub options: Option<String>,
    #[serde(default = "default_n_flag")]
    pub n_flag: Option<String>,
    pub n_per_node: Option<String>,
    pub separator: Option<String>,
    pub exe_wrapper: Option<String>,
    // appended after the executable when running under mpiexec
    pub extra_args: Option<String>,
    // supported MPMD mechanisms, in order of preference
    #[serde(default = "default_mpmd")]
    pub mpmd: Vec<MpmdSupport>,
    #[serde(default)]
    pub flavor: MpiFlavor,
    // helper printing the MPI rank, used by dispatch scripts
    pub rank_command: Option<String>,
    #[serde(default = "default_shell")]
    pub shell: String,
    pub boot: Option<String>,
    pub halt: Option<String>,
    pub gen_hostsfile: Option<String>,
    pub del_hostsfile: Option<String>,
    pub bindir: Option<PathBuf>,
    pub libdir: Option<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            mpiexec: default_mpiexec(),
            options: None,
            n_flag: default_n_flag(),
            n_per_node: None,
            separator: None,
            exe_wrapper: None,
            extra_args: None,
            mpmd: default_mpmd(),
            flavor: MpiFlavor::default(),
            rank_command: None,
            shell: default_shell(),
            boot: None,
            halt: None,
            gen_hostsfile: None,
            del_hostsfile: None,
            bindir: None,
            libdir: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub exec: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    // seconds
    pub timeout: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DomainConfig {
    // required as soon as more than one domain is coupled
    pub name: Option<String>,
    #[serde(default)]
    pub role: DomainRole,
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    // preferred process count
    pub n_procs: Option<u32>,
    #[serde(default = "default_min_procs")]
    pub min_procs: u32,
    pub max_procs: Option<u32>,
    #[serde(default = "default_true")]
    pub exec_solver: bool,
    #[serde(default)]
    pub logging: LoggingMode,
    // files copied into the working directory before preprocessing
    #[serde(default)]
    pub data: Vec<PathBuf>,
    pub prepare: Option<CommandConfig>,
    pub preprocess: Option<CommandConfig>,
    // globs (relative to the working directory) of files to keep
    #[serde(default = "default_results")]
    pub results: Vec<String>,
    pub adaptation: Option<String>,
}

impl DomainConfig {
    /// Compile the result globs into a single set
    pub fn compile_results(&self) -> Result<GlobSet, globset::Error> {
        self.results
            .iter()
            .try_fold(GlobSetBuilder::new(), |mut builder, pattern| {
                builder.add(Glob::new(pattern)?);

                Ok::<GlobSetBuilder, globset::Error>(builder)
            })?
            .build()
    }
}

impl RunConfig {
    /// load a run description from a YAML file
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        if !path.is_file() {
            return Err(ConfigErrors::FileNotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&content)?;

        if config.case_dir.is_relative() {
            let base = path.parent().unwrap_or(Path::new("."));
            config.case_dir = base.join(&config.case_dir);
        }

        Ok(config)
    }

    /// whether several domains are coupled in this run
    pub fn coupled(&self) -> bool {
        self.domains.len() > 1
    }

    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.domains.is_empty() {
            error!("No domain was defined, nothing to run");
            contains_error = true;
        }

        if self.coupled() {
            for (index, domain) in self.domains.iter().enumerate() {
                if domain.name.is_none() {
                    error!("domains.{index}.name is required when coupling multiple domains");
                    contains_error = true;
                }
            }

            let duplicates = self
                .domains
                .iter()
                .filter_map(|domain| domain.name.as_deref())
                .duplicates()
                .collect_vec();
            for name in duplicates {
                error!("Domain name {name} is used more than once");
                contains_error = true;
            }

            if self.launcher.mpmd.is_empty() {
                error!("launcher.mpmd is empty, coupled domains can't be launched");
                contains_error = true;
            }
        }

        let executing = self
            .domains
            .iter()
            .filter(|domain| domain.exec_solver)
            .count();
        if executing != 0 && executing != self.domains.len() {
            error!("In case of multiple domains, all or no domains must execute their solver");
            contains_error = true;
        }

        for (index, domain) in self.domains.iter_mut().enumerate() {
            let name = domain
                .name
                .clone()
                .unwrap_or_else(|| format!("domains.{index}"));

            if let Some(max) = domain.max_procs {
                if domain.min_procs > max {
                    error!(
                        "{name}: min_procs ({}) is larger than max_procs ({max})",
                        domain.min_procs
                    );
                    contains_error = true;
                }
            }

            match domain.n_procs {
                Some(requested) if requested < domain.min_procs => {
                    warn!(
                        "{name}: n_procs ({requested}) is below min_procs ({}), raising it",
                        domain.min_procs
                    );
                    domain.n_procs = Some(domain.min_procs);
                }
                _ => (),
            }

            // bare names are looked up in PATH at launch time
            if domain.executable.components().count() > 1 {
                contains_error |= report_executable(&format!("{name}.executable"), &domain.executable);
            }

            for (stage, command) in [("prepare", &domain.prepare), ("preprocess", &domain.preprocess)] {
                if let Some(command) = command {
                    contains_error |= report_executable(&format!("{name}.{stage}.exec"), &command.exec);
                }
            }

            if let Err(e) = domain.compile_results() {
                error!("{name}.results contains an invalid glob: {e}");
                contains_error = true;
            }

            if domain.adaptation.is_some() && self.adaptation_prefix.is_none() {
                error!("{name}.adaptation requires adaptation_prefix to be set");
                contains_error = true;
            }
        }

        contains_error
    }

    /// Scratch directory for execution directories, if one applies to this case.
    ///
    /// A case already located below the scratch directory runs in place.
    pub fn scratch_prefix(&self, case_dir: &Path) -> Option<PathBuf> {
        let scratch = expand_home(self.scratch_dir.as_ref()?);

        if case_dir.starts_with(&scratch) {
            None
        } else {
            Some(scratch.join(&self.scratch_name))
        }
    }
}

fn report_executable(field: &str, path: &Path) -> bool {
    match check_executable(path) {
        Ok(true) => false,
        Ok(false) => {
            error!("{field} ({}) is not executable", path.to_string_lossy());
            true
        }
        Err(e) => {
            error!(
                "Failed to determine if {field} ({}) is an executable: {e}",
                path.to_string_lossy()
            );
            true
        }
    }
}

/// replace a leading `~` with the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Total process count granted by a resource manager, if any
pub fn n_procs_from_resource_manager<F>(lookup: F) -> Option<u32>
where
    F: Fn(&str) -> Option<String>,
{
    ["SLURM_NTASKS", "PBS_NP"]
        .iter()
        .filter_map(|variable| lookup(variable))
        .find_map(|value| value.trim().parse().ok())
}

fn default_case_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_scratch_name() -> String {
    String::from("cosim")
}

fn default_mpiexec() -> Option<String> {
    Some(String::from("mpiexec"))
}

fn default_n_flag() -> Option<String> {
    Some(String::from("-n"))
}

fn default_mpmd() -> Vec<MpmdSupport> {
    vec![MpmdSupport::Inline, MpmdSupport::ConfigFile, MpmdSupport::Script]
}

fn default_shell() -> String {
    String::from("/bin/sh")
}

fn default_min_procs() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_results() -> Vec<String> {
    vec![String::from("*")]
}
