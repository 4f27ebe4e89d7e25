use super::{
    check_executable, expand_home, n_procs_from_resource_manager, ConfigErrors, MpiFlavor,
    MpmdSupport, RunConfig,
};
use crate::{domain::DomainRole, lifecycle::LoggingMode};
use std::{
    collections::HashMap,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

const COUPLED: &str = r#"
case_dir: study
scratch_dir: /scratch
launcher:
  mpiexec: srun
  n_flag: --ntasks
  mpmd: [configfile]
  flavor: bgq
domains:
  - name: fluid
    executable: /bin/true
    n_procs: 6
    max_procs: 8
    logging: extended
  - name: solid
    role: secondary
    executable: /bin/true
    results: ["*.med", "monitoring/*"]
"#;

fn write_config(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("run.yaml");
    fs::write(&path, content).unwrap();

    path
}

#[test]
pub fn load_coupled_config() {
    let dir = TempDir::new().unwrap();
    let config = RunConfig::load(&write_config(dir.path(), COUPLED)).unwrap();

    assert_eq!(config.case_dir, dir.path().join("study"));
    assert_eq!(config.scratch_name, "cosim");
    assert!(config.coupled());

    assert_eq!(config.launcher.mpiexec.as_deref(), Some("srun"));
    assert_eq!(config.launcher.n_flag.as_deref(), Some("--ntasks"));
    assert_eq!(config.launcher.mpmd, vec![MpmdSupport::ConfigFile]);
    assert_eq!(config.launcher.flavor, MpiFlavor::BlueGeneQ);
    assert_eq!(config.launcher.shell, "/bin/sh");

    let fluid = &config.domains[0];
    assert_eq!(fluid.role, DomainRole::Primary);
    assert_eq!(fluid.min_procs, 1);
    assert_eq!(fluid.max_procs, Some(8));
    assert_eq!(fluid.logging, LoggingMode::Extended);
    assert!(fluid.exec_solver);
    assert_eq!(fluid.results, vec!["*".to_string()]);

    let solid = &config.domains[1];
    assert_eq!(solid.role, DomainRole::Secondary);
    let globs = solid.compile_results().unwrap();
    assert!(globs.is_match("mesh.med"));
    assert!(globs.is_match("monitoring/probes.csv"));
    assert!(!globs.is_match("listing"));
}

#[test]
pub fn unknown_fields_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        dir.path(),
        "domains:\n  - executable: /bin/true\n    nprocs: 2\n",
    );

    assert!(matches!(RunConfig::load(&path), Err(ConfigErrors::Parse(_))));
}

#[test]
pub fn missing_config_file() {
    let dir = TempDir::new().unwrap();

    assert!(matches!(
        RunConfig::load(&dir.path().join("missing.yaml")),
        Err(ConfigErrors::FileNotFound(_))
    ));
}

#[test]
pub fn resource_manager_process_count() {
    let env = HashMap::from([("PBS_NP", " 12 "), ("SLURM_NTASKS", "not a number")]);
    let lookup = |name: &str| env.get(name).map(|value| value.to_string());

    assert_eq!(n_procs_from_resource_manager(lookup), Some(12));
    assert_eq!(n_procs_from_resource_manager(|_| None), None);
    assert_eq!(
        n_procs_from_resource_manager(|name| (name == "SLURM_NTASKS").then(|| "4".to_string())),
        Some(4)
    );
}

#[test]
pub fn scratch_prefix_outside_and_inside_scratch() {
    let dir = TempDir::new().unwrap();
    let mut config = RunConfig::load(&write_config(dir.path(), COUPLED)).unwrap();

    assert_eq!(
        config.scratch_prefix(Path::new("/home/user/study")),
        Some(PathBuf::from("/scratch/cosim"))
    );
    // already running from scratch
    assert_eq!(config.scratch_prefix(Path::new("/scratch/user/study")), None);

    config.scratch_dir = None;
    assert_eq!(config.scratch_prefix(Path::new("/home/user/study")), None);
}

#[test]
pub fn preflight_catches_every_error() {
    let dir = TempDir::new().unwrap();
    let mut config = RunConfig::load(&write_config(
        dir.path(),
        r#"
domains:
  - executable: /bin/true
    min_procs: 4
    max_procs: 2
  - name: solid
    executable: /bin/true
    exec_solver: false
"#,
    ))
    .unwrap();

    assert!(config.preflight_checks());
}

#[test]
pub fn preflight_raises_requested_count_to_minimum() {
    let dir = TempDir::new().unwrap();
    let mut config = RunConfig::load(&write_config(
        dir.path(),
        "domains:\n  - executable: /bin/true\n    n_procs: 1\n    min_procs: 3\n",
    ))
    .unwrap();

    assert!(!config.preflight_checks());
    assert_eq!(config.domains[0].n_procs, Some(3));
}

#[test]
pub fn executable_bits() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("solver");
    fs::write(&path, "#!/bin/sh\n").unwrap();

    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
    assert!(!check_executable(&path).unwrap());

    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    assert!(check_executable(&path).unwrap());

    assert!(matches!(
        check_executable(&dir.path().join("missing")),
        Err(ConfigErrors::FileNotFound(_))
    ));
}

#[test]
pub fn home_prefix_is_expanded() {
    let home = dirs::home_dir().unwrap();

    assert_eq!(expand_home(Path::new("~/scratch")), home.join("scratch"));
    assert_eq!(expand_home(Path::new("~")), home);
    assert_eq!(expand_home(Path::new("/tmp/~user")), PathBuf::from("/tmp/~user"));
    assert_eq!(expand_home(Path::new("relative/dir")), PathBuf::from("relative/dir"));
}
