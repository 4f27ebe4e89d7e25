use chrono::{DateTime, Local};
use itertools::Itertools;
use std::{
    env,
    fmt::Write as _,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::debug;

pub const SUMMARY_NAME: &str = "summary";

const DOUBLE_RULE: &str = "========================================================\n";
const RULE: &str = "  ----------------------------------------------------\n";
const DATE_FORMAT: &str = "%A %B %d %H:%M:%S %Y";

/// Everything the summary header reports about a run
#[derive(Debug, Clone)]
pub struct SummaryHeader {
    pub start: DateTime<Local>,
    pub command: String,
    pub launcher: Option<String>,
    pub mpi_flavor: Option<String>,
    pub adaptation_prefix: Option<PathBuf>,
    pub n_procs: u32,
    /// only reported for coupled runs
    pub exec_dir: Option<PathBuf>,
    pub domains: Vec<Vec<(String, String)>>,
}

fn row(out: &mut String, key: &str, value: &str) {
    let _ = writeln!(out, "  {key:<15}: {value}");
}

/// `uname` fields joined by spaces
fn machine() -> String {
    match nix::sys::utsname::uname() {
        Ok(uts) => [
            uts.sysname(),
            uts.nodename(),
            uts.release(),
            uts.version(),
            uts.machine(),
        ]
        .iter()
        .map(|field| field.to_string_lossy())
        .join(" "),
        Err(error) => {
            debug!(error = ?error, "Failed to query uname");
            String::from("unknown")
        }
    }
}

pub fn render_header(header: &SummaryHeader) -> String {
    let mut out = String::new();

    out.push_str(DOUBLE_RULE);
    let _ = writeln!(out, "Start time       : {}", header.start.format(DATE_FORMAT));
    out.push_str(DOUBLE_RULE);
    row(&mut out, "Command", &header.command);
    out.push_str(DOUBLE_RULE);

    if let Some(ref prefix) = header.adaptation_prefix {
        row(&mut out, "Adaptation", &prefix.display().to_string());
        out.push_str(RULE);
    }
    if let Some(ref launcher) = header.launcher {
        row(&mut out, "MPI launcher", launcher);
    }
    if let Some(ref flavor) = header.mpi_flavor {
        row(&mut out, "MPI type", flavor);
    }
    out.push_str(RULE);

    row(
        &mut out,
        "User",
        &env::var("USER").unwrap_or_else(|_| String::from("unknown")),
    );
    out.push_str(RULE);
    row(&mut out, "Machine", &machine());
    row(&mut out, "N Procs", &header.n_procs.to_string());
    out.push_str(RULE);

    if let Some(ref exec_dir) = header.exec_dir {
        row(&mut out, "Exec. dir.", &exec_dir.display().to_string());
        out.push_str(RULE);
    }

    for domain in header.domains.iter() {
        for (key, value) in domain {
            row(&mut out, key, value);
        }
        out.push_str(RULE);
    }

    out
}

pub fn render_footer(error: Option<&str>, finish: DateTime<Local>) -> String {
    let mut out = String::new();

    if let Some(stage) = error {
        let _ = writeln!(out, "  {stage} failed");
    }
    out.push_str(DOUBLE_RULE);
    let _ = writeln!(out, "Finish time      : {}", finish.format(DATE_FORMAT));
    out.push_str(DOUBLE_RULE);

    out
}

pub fn write_header(exec_dir: &Path, header: &SummaryHeader) -> io::Result<PathBuf> {
    let path = exec_dir.join(SUMMARY_NAME);
    fs::write(&path, render_header(header))?;

    Ok(path)
}

pub fn append_footer(exec_dir: &Path, error: Option<&str>) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(exec_dir.join(SUMMARY_NAME))?;

    file.write_all(render_footer(error, Local::now()).as_bytes())
}
