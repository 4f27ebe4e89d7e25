use super::{
    build, configfile, rank_ranges,
    script::{self, DISPATCH_SCRIPT_NAME, SOLVER_SCRIPT_NAME},
    DomainLaunchSpec, LaunchEntry, LaunchMode, PlanError,
};
use crate::{
    config::{LauncherConfig, MpiFlavor, MpmdSupport},
    domain::DomainRole,
};
use proptest::prelude::*;
use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf};
use tempfile::TempDir;

fn entry(role: DomainRole, dir: &str, executable: &str, arguments: &str, count: u32) -> LaunchEntry {
    LaunchEntry {
        role,
        spec: DomainLaunchSpec {
            working_dir: PathBuf::from(dir),
            executable: executable.to_string(),
            arguments: arguments.to_string(),
        },
        count,
    }
}

fn coupled() -> Vec<LaunchEntry> {
    vec![
        entry(DomainRole::Primary, "/run/fluid", "cs_solver", "--mpi", 4),
        entry(DomainRole::Secondary, "/run/solid", "syrthes", "-d solid.syd", 2),
    ]
}

#[test]
pub fn direct_single_process_has_no_launcher() {
    let dir = TempDir::new().unwrap();
    let entries = [entry(DomainRole::Primary, "/run", "cs_solver", "--trace", 1)];

    let plan = build(
        &entries,
        LaunchMode::Direct,
        &LauncherConfig::default(),
        dir.path(),
    )
    .unwrap();

    assert_eq!(plan.command, "cs_solver --trace");
    assert_eq!(plan.working_dir, Some(PathBuf::from("/run")));
    assert_eq!(plan.total_procs, 1);
    assert!(plan.generated_files.is_empty());
}

#[test]
pub fn direct_parallel_uses_launcher_prefix() {
    let dir = TempDir::new().unwrap();
    let entries = [entry(DomainRole::Primary, "/run", "cs_solver", "--trace", 4)];

    let plan = build(
        &entries,
        LaunchMode::Direct,
        &LauncherConfig::default(),
        dir.path(),
    )
    .unwrap();
    assert_eq!(plan.command, "mpiexec -n 4 cs_solver --trace");

    let launcher = LauncherConfig {
        mpiexec: Some(String::from("srun")),
        options: Some(String::from("--exclusive")),
        n_flag: Some(String::from("--ntasks")),
        exe_wrapper: Some(String::from("valgrind")),
        extra_args: Some(String::from("--mpi")),
        ..LauncherConfig::default()
    };
    let plan = build(&entries, LaunchMode::Direct, &launcher, dir.path()).unwrap();
    assert_eq!(
        plan.command,
        "srun --exclusive --ntasks 4 valgrind cs_solver --mpi --trace"
    );
}

#[test]
pub fn direct_without_launcher_runs_plain() {
    let dir = TempDir::new().unwrap();
    let entries = [entry(DomainRole::Primary, "/run", "cs_solver", "", 4)];
    let launcher = LauncherConfig {
        mpiexec: None,
        ..LauncherConfig::default()
    };

    let plan = build(&entries, LaunchMode::Direct, &launcher, dir.path()).unwrap();
    assert_eq!(plan.command, "cs_solver");
}

#[test]
pub fn inline_places_secondary_domains_first() {
    let dir = TempDir::new().unwrap();

    let plan = build(
        &coupled(),
        LaunchMode::MpmdInline,
        &LauncherConfig::default(),
        dir.path(),
    )
    .unwrap();

    assert_eq!(
        plan.command,
        "mpiexec -n 2 -wdir /run/solid syrthes -d solid.syd : -n 4 -wdir /run/fluid cs_solver --mpi"
    );
    assert_eq!(plan.total_procs, 6);
    assert_eq!(plan.working_dir, None);
}

#[test]
pub fn zero_count_entries_are_skipped() {
    let dir = TempDir::new().unwrap();
    let mut entries = coupled();
    entries.push(entry(DomainRole::Primary, "/run/idle", "idle", "", 0));

    let plan = build(
        &entries,
        LaunchMode::MpmdInline,
        &LauncherConfig::default(),
        dir.path(),
    )
    .unwrap();

    assert!(!plan.command.contains("idle"));
    assert_eq!(plan.total_procs, 6);
}

#[test]
pub fn configfile_with_and_without_comment() {
    let dir = TempDir::new().unwrap();

    let plan = build(
        &coupled(),
        LaunchMode::MpmdConfigFile,
        &LauncherConfig::default(),
        dir.path(),
    )
    .unwrap();

    let path = dir.path().join(configfile::CONFIGFILE_NAME);
    assert_eq!(plan.command, format!("mpiexec -configfile {}", path.display()));
    assert_eq!(plan.generated_files, vec![path.clone()]);
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "# MPMD configuration file for mpiexec\n\
         -n 2 -wdir /run/solid syrthes -d solid.syd\n\
         -n 4 -wdir /run/fluid cs_solver --mpi\n"
    );

    let launcher = LauncherConfig {
        flavor: MpiFlavor::BlueGeneP,
        ..LauncherConfig::default()
    };
    build(&coupled(), LaunchMode::MpmdConfigFile, &launcher, dir.path()).unwrap();
    assert!(!fs::read_to_string(&path).unwrap().contains('#'));
}

#[test]
pub fn bgq_configfile_uses_rank_ranges() {
    let dir = TempDir::new().unwrap();
    let launcher = LauncherConfig {
        mpiexec: Some(String::from("runjob")),
        flavor: MpiFlavor::BlueGeneQ,
        separator: Some(String::from(":")),
        ..LauncherConfig::default()
    };

    let plan = build(&coupled(), LaunchMode::MpmdConfigFileBgq, &launcher, dir.path()).unwrap();

    let path = dir.path().join(configfile::CONFIGFILE_NAME);
    assert_eq!(
        plan.command,
        format!("runjob --mapping {} : cs_solver", path.display())
    );
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "#mpmdbegin 0-1\n#mpmdcmd syrthes -d solid.syd -wdir /run/solid\n#mpmdend\n\
         #mpmdbegin 2-5\n#mpmdcmd cs_solver --mpi -wdir /run/fluid\n#mpmdend\n"
    );

    let srun = LauncherConfig {
        mpiexec: Some(String::from("srun")),
        ..launcher
    };
    let plan = build(&coupled(), LaunchMode::MpmdConfigFileBgq, &srun, dir.path()).unwrap();
    assert!(plan
        .command
        .starts_with(&format!("srun --launcher-opts='--mapping {}'", path.display())));
}

#[test]
pub fn dispatch_script_selects_by_rank() {
    let dir = TempDir::new().unwrap();

    let plan = build(
        &coupled(),
        LaunchMode::MpmdScript,
        &LauncherConfig::default(),
        dir.path(),
    )
    .unwrap();

    let path = dir.path().join(DISPATCH_SCRIPT_NAME);
    assert_eq!(plan.command, format!("mpiexec -n 6 {}", path.display()));

    let content = fs::read_to_string(&path).unwrap();
    assert!(content.starts_with("#!/bin/sh\n"));
    assert!(content.contains("MPI_RANK=${OMPI_COMM_WORLD_RANK:-"));
    assert!(content.contains(
        "if [ $MPI_RANK -lt 2 ] ; then\n  cd /run/solid\n  syrthes -d solid.syd \"$@\"\n"
    ));
    assert!(content.contains(
        "elif [ $MPI_RANK -lt 6 ] ; then\n  cd /run/fluid\n  cs_solver --mpi \"$@\"\n"
    ));
    assert!(content.ends_with("fi\nCS_RET=$?\nexit $CS_RET\n"));

    let mode = fs::metadata(&path).unwrap().permissions().mode();
    assert_ne!(mode & 0o100, 0);
}

#[test]
pub fn dispatch_script_with_rank_command() {
    let launcher = LauncherConfig {
        rank_command: Some(String::from("/opt/mpi/bin/rank")),
        ..LauncherConfig::default()
    };

    let content = script::render_dispatch_script(&coupled(), &launcher);
    assert!(content.contains("MPI_RANK=`/opt/mpi/bin/rank $@`\n"));
}

#[test]
pub fn mpmd_requires_a_launcher() {
    let dir = TempDir::new().unwrap();
    let launcher = LauncherConfig {
        mpiexec: None,
        ..LauncherConfig::default()
    };

    for mode in [
        LaunchMode::MpmdInline,
        LaunchMode::MpmdConfigFile,
        LaunchMode::MpmdScript,
    ] {
        assert!(matches!(
            build(&coupled(), mode, &launcher, dir.path()),
            Err(PlanError::NoLauncher)
        ));
    }
}

#[test]
pub fn select_launch_mode() {
    let mut launcher = LauncherConfig::default();

    assert_eq!(LaunchMode::select(&launcher, 1).unwrap(), LaunchMode::Direct);
    assert_eq!(
        LaunchMode::select(&launcher, 2).unwrap(),
        LaunchMode::MpmdInline
    );

    launcher.mpmd = vec![MpmdSupport::ConfigFile, MpmdSupport::Inline];
    assert_eq!(
        LaunchMode::select(&launcher, 2).unwrap(),
        LaunchMode::MpmdConfigFile
    );

    launcher.flavor = MpiFlavor::BlueGeneQ;
    assert_eq!(
        LaunchMode::select(&launcher, 3).unwrap(),
        LaunchMode::MpmdConfigFileBgq
    );

    launcher.mpmd.clear();
    assert!(matches!(
        LaunchMode::select(&launcher, 2),
        Err(PlanError::NoLaunchMode { domains: 2 })
    ));
}

#[test]
pub fn direct_mode_rejects_several_domains() {
    let dir = TempDir::new().unwrap();

    assert!(matches!(
        build(
            &coupled(),
            LaunchMode::Direct,
            &LauncherConfig::default(),
            dir.path()
        ),
        Err(PlanError::NoLaunchMode { domains: 2 })
    ));
    assert!(matches!(
        build(
            &[],
            LaunchMode::Direct,
            &LauncherConfig::default(),
            dir.path()
        ),
        Err(PlanError::Empty)
    ));
}

#[test]
pub fn solver_script_for_direct_run() {
    let dir = TempDir::new().unwrap();
    let entries = [entry(DomainRole::Primary, "/run", "cs_solver", "", 4)];
    let launcher = LauncherConfig {
        bindir: Some(PathBuf::from("/opt/cs/bin")),
        boot: Some(String::from("mpdboot")),
        halt: Some(String::from("mpdallexit")),
        ..LauncherConfig::default()
    };

    let plan = build(&entries, LaunchMode::Direct, &launcher, dir.path()).unwrap();
    let path = script::write_solver_script(dir.path(), &plan, &launcher).unwrap();
    assert_eq!(path, dir.path().join(SOLVER_SCRIPT_NAME));

    let content = fs::read_to_string(&path).unwrap();
    assert!(content.contains("export PATH=\"/opt/cs/bin:$PATH\"\n"));
    assert!(content.contains("# Boot MPI daemons.\nmpdboot || exit $?\n"));
    assert!(content.contains("cd \"/run\"\nmpiexec -n 4 cs_solver \"$@\"\nCS_RET=$?\n"));
    assert!(content.contains("# Halt MPI daemons.\nmpdallexit\n"));
    assert!(content.ends_with("exit $CS_RET\n"));

    // daemons are only managed for parallel runs
    let serial = build(
        &[entry(DomainRole::Primary, "/run", "cs_solver", "", 1)],
        LaunchMode::Direct,
        &launcher,
        dir.path(),
    )
    .unwrap();
    assert!(!script::render_solver_script(&serial, &launcher).contains("mpdboot"));
}

proptest! {
    #[test]
    fn rank_ranges_partition_all_ranks(counts in prop::collection::vec(1u32..64, 1..8)) {
        let entries = counts
            .iter()
            .map(|count| entry(DomainRole::Primary, "/run", "exe", "", *count))
            .collect::<Vec<_>>();
        let total: u32 = counts.iter().sum();

        let ranges = rank_ranges(&entries);
        prop_assert_eq!(*ranges[0].start(), 0);
        prop_assert_eq!(*ranges[ranges.len() - 1].end(), total - 1);

        for (range, count) in ranges.iter().zip(counts.iter()) {
            prop_assert_eq!(range.end() - range.start() + 1, *count);
        }
        for pair in ranges.windows(2) {
            prop_assert_eq!(*pair[1].start(), pair[0].end() + 1);
        }
    }
}
