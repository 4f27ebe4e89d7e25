use super::{rank_ranges, LaunchEntry, LaunchMode, LaunchPlan, PlanError};
use crate::config::LauncherConfig;
use std::{
    fmt::Write as _,
    fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tracing::debug;

pub const DISPATCH_SCRIPT_NAME: &str = "mpmd_exec.sh";
pub const SOLVER_SCRIPT_NAME: &str = "run_solver";

/// rank lookup used when the launcher provides no helper command
const RANK_FROM_ENV: &str =
    "${OMPI_COMM_WORLD_RANK:-${PMI_RANK:-${PMIX_RANK:-${SLURM_PROCID:-0}}}}";

/// add the user execute bit to `path`
pub fn make_executable(path: &Path) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o100);

    fs::set_permissions(path, permissions)
}

/// Script run by every rank, selecting its application from the rank number.
pub fn render_dispatch_script(entries: &[LaunchEntry], launcher: &LauncherConfig) -> String {
    let mut script = String::new();

    let _ = write!(
        script,
        "#!{}\n\n\
         # Make sure to transmit possible additional arguments assigned by mpirun to\n\
         # the executable with some MPI-1 implementations:\n\
         # we use $@ to forward arguments passed to this script to the executable files.\n\n",
        launcher.shell
    );

    match launcher.rank_command {
        Some(ref command) => {
            let _ = writeln!(script, "MPI_RANK=`{command} $@`");
        }
        None => {
            let _ = writeln!(script, "MPI_RANK={RANK_FROM_ENV}");
        }
    }

    for (index, (entry, range)) in entries.iter().zip(rank_ranges(entries)).enumerate() {
        let test = if index == 0 { "if" } else { "elif" };
        let boundary = range.end() + 1;

        let _ = write!(
            script,
            "{test} [ $MPI_RANK -lt {boundary} ] ; then\n  cd {}\n  {} \"$@\"\n",
            entry.spec.working_dir.display(),
            entry.spec.command_line()
        );
    }

    script.push_str("fi\nCS_RET=$?\nexit $CS_RET\n");

    script
}

pub fn write_dispatch_script(
    exec_dir: &Path,
    entries: &[LaunchEntry],
    launcher: &LauncherConfig,
) -> Result<PathBuf, PlanError> {
    let path = exec_dir.join(DISPATCH_SCRIPT_NAME);

    write_script(&path, &render_dispatch_script(entries, launcher))?;
    debug!(path = ?path, "Wrote MPMD dispatch script");

    Ok(path)
}

/// Top level script executed for a run: environment, MPI daemons and the plan command.
pub fn render_solver_script(plan: &LaunchPlan, launcher: &LauncherConfig) -> String {
    let mut script = format!("#!{}\n\n", launcher.shell);

    if launcher.bindir.is_some() || launcher.libdir.is_some() {
        script.push_str("# Export paths here if necessary or recommended.\n");
        if let Some(ref bindir) = launcher.bindir {
            let _ = writeln!(script, "export PATH=\"{}:$PATH\"", bindir.display());
        }
        if let Some(ref libdir) = launcher.libdir {
            let _ = writeln!(
                script,
                "export LD_LIBRARY_PATH=\"{}:$LD_LIBRARY_PATH\"",
                libdir.display()
            );
        }
        script.push('\n');
    }

    if let Some(ref command) = launcher.gen_hostsfile {
        let _ = write!(script, "# Generate hostsfile.\n{command} || exit $?\n\n");
    }

    let parallel = plan.total_procs > 1;

    if parallel {
        if let Some(ref command) = launcher.boot {
            let _ = write!(script, "# Boot MPI daemons.\n{command} || exit $?\n\n");
        }
    }

    script.push_str("# Run solver.\n");
    match (plan.mode, &plan.working_dir) {
        (LaunchMode::Direct, Some(dir)) => {
            let _ = write!(script, "cd \"{}\"\n{} \"$@\"\n", dir.display(), plan.command);
        }
        _ => {
            let _ = writeln!(script, "{}", plan.command);
        }
    }
    script.push_str("CS_RET=$?\n\n");

    if parallel {
        if let Some(ref command) = launcher.halt {
            let _ = write!(script, "# Halt MPI daemons.\n{command}\n\n");
        }
    }

    if let Some(ref command) = launcher.del_hostsfile {
        let _ = write!(script, "# Remove hostsfile.\n{command}\n\n");
    }

    script.push_str("exit $CS_RET\n");

    script
}

pub fn write_solver_script(
    exec_dir: &Path,
    plan: &LaunchPlan,
    launcher: &LauncherConfig,
) -> Result<PathBuf, PlanError> {
    let path = exec_dir.join(SOLVER_SCRIPT_NAME);

    write_script(&path, &render_solver_script(plan, launcher))?;
    debug!(path = ?path, "Wrote solver script");

    Ok(path)
}

fn write_script(path: &Path, content: &str) -> Result<(), PlanError> {
    fs::write(path, content)
        .and_then(|()| make_executable(path))
        .map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })
}
