use super::RunState;
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, error, warn};

/// Content written when a marker is first created, preserved by renames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerContent {
    pub run_id: String,
    pub exec_dir: PathBuf,
    pub result_dir: PathBuf,
}

impl MarkerContent {
    pub fn render(&self) -> String {
        format!(
            "{}\n{}\n{}\n",
            self.run_id,
            self.exec_dir.display(),
            self.result_dir.display()
        )
    }

    pub fn parse(content: &str) -> Option<Self> {
        let mut lines = content.lines();

        Some(Self {
            run_id: lines.next()?.to_string(),
            exec_dir: PathBuf::from(lines.next()?),
            result_dir: PathBuf::from(lines.next()?),
        })
    }

    pub fn read(path: &Path) -> Option<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(error) => {
                debug!(error = ?error, path = ?path, "Marker vanished before it could be read");
                None
            }
        }
    }
}

/// `<script_dir>/<state>.<run_id>`
pub fn marker_path(script_dir: &Path, state: RunState, run_id: &str) -> Option<PathBuf> {
    state
        .marker_name()
        .map(|name| script_dir.join(format!("{name}.{run_id}")))
}

/// first marker found for `run_id`, if any
pub fn find_marker(script_dir: &Path, run_id: &str) -> Option<(RunState, PathBuf)> {
    RunState::MARKED.into_iter().find_map(|state| {
        marker_path(script_dir, state, run_id)
            .filter(|path| path.is_file())
            .map(|path| (state, path))
    })
}

/// Publishes the state of one run through marker files in the script directory.
///
/// This is a status channel for external monitors, not a lock: a reader may
/// observe a state that is about to change.
#[derive(Debug, Clone)]
pub struct MarkerBoard {
    script_dir: PathBuf,
    content: MarkerContent,
}

impl MarkerBoard {
    pub fn new(script_dir: PathBuf, content: MarkerContent) -> Self {
        Self {
            script_dir,
            content,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.content.run_id
    }

    /// marker currently present for this run
    pub fn current(&self) -> Option<(RunState, PathBuf)> {
        find_marker(&self.script_dir, &self.content.run_id)
    }

    /// Replace whatever marker exists for this run by the one for `next`.
    ///
    /// Without a prior marker a fresh one is created; `RunState::Done` removes
    /// the marker. Failures are logged and swallowed.
    pub fn publish(&self, next: RunState) {
        let prior = self.current().map(|(_, path)| path);
        let target = marker_path(&self.script_dir, next, &self.content.run_id);
        let creating = prior.is_none();

        let result = match (prior, target) {
            (Some(prior), Some(target)) if prior == target => Ok(()),
            (Some(_), Some(target)) if target.exists() => {
                warn!(target = ?target, "Run marker already exists, leaving state untouched");
                Ok(())
            }
            (Some(prior), Some(target)) => fs::rename(&prior, &target),
            (None, Some(target)) => self.create(&target),
            (Some(prior), None) => fs::remove_file(&prior),
            (None, None) => Ok(()),
        };

        match result {
            Ok(()) => debug!(state = %next, run_id = self.run_id(), "Published run state"),
            Err(error) => match error.kind() {
                _ if creating => warn!(
                    error = ?error,
                    script_dir = ?self.script_dir,
                    state = %next,
                    "Failed to create run marker"
                ),
                io::ErrorKind::NotFound => {
                    debug!(state = %next, "Run marker disappeared before it could be updated")
                }
                io::ErrorKind::AlreadyExists => {
                    warn!(state = %next, "Run marker already exists, leaving state untouched")
                }
                _ => error!(error = ?error, state = %next, "Failed to publish run state"),
            },
        }
    }

    fn create(&self, target: &Path) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(target)?;

        file.write_all(self.content.render().as_bytes())
    }
}
