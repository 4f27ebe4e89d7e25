use super::{app_segment, rank_ranges, LaunchEntry, PlanError};
use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

pub const CONFIGFILE_NAME: &str = "mpmd_configfile";

/// one `-n <count> -wdir <dir> <exe> <args>` line per application
pub fn render_configfile(entries: &[LaunchEntry], with_comment: bool) -> String {
    let mut content = String::new();

    // some launchers (Blue Gene/P) reject comment lines
    if with_comment {
        content.push_str("# MPMD configuration file for mpiexec\n");
    }

    for entry in entries {
        content.push_str(&app_segment(&entry.spec, entry.count));
        content.push('\n');
    }

    content
}

/// `#mpmdbegin` / `#mpmdcmd` / `#mpmdend` block per application
pub fn render_bgq_configfile(entries: &[LaunchEntry]) -> String {
    let mut content = String::new();

    for (entry, range) in entries.iter().zip(rank_ranges(entries)) {
        // writing into a String cannot fail
        let _ = write!(
            content,
            "#mpmdbegin {}-{}\n#mpmdcmd {} -wdir {}\n#mpmdend\n",
            range.start(),
            range.end(),
            entry.spec.command_line(),
            entry.spec.working_dir.display()
        );
    }

    content
}

pub fn write_configfile(
    exec_dir: &Path,
    entries: &[LaunchEntry],
    with_comment: bool,
) -> Result<PathBuf, PlanError> {
    write_launch_file(exec_dir, &render_configfile(entries, with_comment))
}

pub fn write_bgq_configfile(exec_dir: &Path, entries: &[LaunchEntry]) -> Result<PathBuf, PlanError> {
    write_launch_file(exec_dir, &render_bgq_configfile(entries))
}

fn write_launch_file(exec_dir: &Path, content: &str) -> Result<PathBuf, PlanError> {
    let path = exec_dir.join(CONFIGFILE_NAME);

    fs::write(&path, content).map_err(|source| PlanError::Io {
        path: path.clone(),
        source,
    })?;
    debug!(path = ?path, "Wrote MPMD configuration file");

    Ok(path)
}
