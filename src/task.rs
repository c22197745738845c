//! Goal generation and completion checking over a sandbox's file tree.
//!
//! A task is a verifiable end state: one file either moved into a chosen
//! top-level directory or deleted. The completion predicate only reads
//! the scratch filesystem, so polling it never disturbs the episode.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use rand::{Rng, RngCore};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::sandbox::RUNTIME_ENTRIES;

/// What the agent is asked to achieve.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Goal {
    /// The file must appear in `dest` and vanish from its source.
    Move { dest: PathBuf },
    /// The file must vanish from its source.
    Delete,
}

/// A generated goal with its completion predicate.
#[derive(Debug, Clone)]
pub struct Task {
    instruction: String,
    file_name: String,
    src_dir: PathBuf,
    goal: Goal,
}

impl Task {
    /// Human/agent readable instruction text.
    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    /// Whether the goal state currently holds.
    pub fn is_complete(&self) -> bool {
        let at_source = self.src_dir.join(&self.file_name).exists();
        match &self.goal {
            Goal::Move { dest } => dest.join(&self.file_name).exists() && !at_source,
            Goal::Delete => !at_source,
        }
    }

    /// Polls the completion predicate until it holds or `timeout`
    /// elapses. `true` on completion; never mutates sandbox state.
    pub async fn wait_for_completion(
        &self,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> bool {
        let start = Instant::now();
        loop {
            if self.is_complete() {
                info!("Task completed: {}", self.instruction);
                return true;
            }
            if timeout.is_some_and(|t| start.elapsed() > t) {
                debug!("Timed out waiting for task: {}", self.instruction);
                return false;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Picks a goal over the current tree under `home`: a uniformly random
/// file, then uniformly move-or-delete. Move destinations are drawn
/// from the top-level directories, excluding the file's own directory
/// whenever an alternative exists.
pub(crate) fn generate(home: &Path, rng: &mut dyn RngCore) -> Result<Task> {
    let files: Vec<PathBuf> = WalkDir::new(home)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !RUNTIME_ENTRIES.contains(&e.file_name().to_string_lossy().as_ref()))
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();

    if files.is_empty() {
        bail!("No files under {} to build a task from", home.display());
    }

    let file = &files[rng.random_range(0..files.len())];
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let src_dir = file
        .parent()
        .map_or_else(|| home.to_path_buf(), Path::to_path_buf);

    let mut dirs: Vec<PathBuf> = std::fs::read_dir(home)?
        .filter_map(std::result::Result::ok)
        .filter(|e| e.path().is_dir())
        .filter(|e| !RUNTIME_ENTRIES.contains(&e.file_name().to_string_lossy().as_ref()))
        .map(|e| e.path())
        .collect();
    dirs.sort();

    let wants_move = !dirs.is_empty() && rng.random_bool(0.5);
    let task = if wants_move {
        // A same-directory move is a legal goal, but only as a last
        // resort: prefer any real destination when one exists.
        let candidates: Vec<&PathBuf> = {
            let other: Vec<&PathBuf> = dirs.iter().filter(|d| **d != src_dir).collect();
            if other.is_empty() {
                dirs.iter().collect()
            } else {
                other
            }
        };
        let dest = candidates[rng.random_range(0..candidates.len())].clone();
        let dest_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Task {
            instruction: format!("move {file_name} into the directory '{dest_name}'"),
            file_name,
            src_dir,
            goal: Goal::Move { dest },
        }
    } else {
        Task {
            instruction: format!("delete the document {file_name}"),
            file_name,
            src_dir,
            goal: Goal::Delete,
        }
    };

    debug!("Generated task: {}", task.instruction);
    Ok(task)
}
