//! Home-directory population from template descriptors.
//!
//! A template is plain text, one entry per line, indented two spaces per
//! nesting level. A trailing `/` declares a directory; `name (SIZE)`
//! declares a file of exactly SIZE bytes, where SIZE is
//! `NUMBER{B|KB|MB|GB}` (case-insensitive, decimals allowed). File names
//! may contain `/`; intermediate directories are created implicitly.
//!
//! Files get a modification time uniformly within the last year,
//! directories within the last month. Directory stamps are applied only
//! after the whole tree exists so child creation cannot disturb them.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Context, Result};
use rand::{Rng, RngCore};
use tracing::debug;

const SECONDS_PER_DAY: f64 = 24.0 * 3600.0;
const FILE_MTIME_WINDOW: f64 = 365.0 * SECONDS_PER_DAY;
const DIR_MTIME_WINDOW: f64 = 30.0 * SECONDS_PER_DAY;

/// Parses a `NUMBER{B|KB|MB|GB}` size into bytes.
pub(crate) fn parse_size(input: &str) -> Result<u64> {
    let input = input.trim();
    let split = input
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| anyhow!("Missing size unit in {input:?}"))?;
    let (number, unit) = input.split_at(split);

    let value: f64 = number
        .trim()
        .parse()
        .with_context(|| format!("Cannot parse size {input:?}"))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "B" => 1,
        "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        other => bail!("Unknown size unit {other:?} in {input:?}"),
    };

    Ok((value * multiplier as f64) as u64)
}

/// Chooses a template: a random file from `dir` if configured,
/// otherwise the built-in tree.
pub(crate) fn choose(dir: Option<&Path>, rng: &mut dyn RngCore) -> Result<String> {
    let Some(dir) = dir else {
        return Ok(crate::templates::DEFAULT_HOME_TREE.to_string());
    };

    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read template directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    candidates.sort();

    if candidates.is_empty() {
        bail!("Template directory {} contains no files", dir.display());
    }

    let chosen = &candidates[rng.random_range(0..candidates.len())];
    debug!("Chose template {}", chosen.display());
    fs::read_to_string(chosen)
        .with_context(|| format!("Failed to read template {}", chosen.display()))
}

/// Materializes `template` under `root`.
pub(crate) fn populate(root: &Path, template: &str, rng: &mut dyn RngCore) -> Result<()> {
    let now = SystemTime::now();
    let mut stack: Vec<String> = Vec::new();
    let mut dirs: Vec<PathBuf> = Vec::new();

    for raw in template.lines() {
        let line = raw.trim_end();
        if line.trim().is_empty() {
            continue;
        }

        let leading = line.len() - line.trim_start_matches(' ').len();
        let level = leading / 2;
        let entry = line.trim_start_matches(' ');

        if let Some(name) = entry.strip_suffix('/') {
            stack.truncate(level);
            stack.push(name.to_string());
            let path = stack.iter().fold(root.to_path_buf(), |p, s| p.join(s));
            fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create directory {}", path.display()))?;
            dirs.push(path);
        } else {
            let (name_part, size_part) = entry
                .rsplit_once('(')
                .ok_or_else(|| anyhow!("File entry without size: {entry:?}"))?;
            let name = name_part.trim();
            let size = parse_size(size_part.trim_end_matches(')'))?;

            let prefix = &stack[..level.min(stack.len())];
            let path = prefix
                .iter()
                .fold(root.to_path_buf(), |p, s| p.join(s))
                .join(name);

            // The name itself may carry subdirectories.
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }

            let file = fs::File::create(&path)
                .with_context(|| format!("Failed to create file {}", path.display()))?;
            file.set_len(size)
                .with_context(|| format!("Failed to size file {}", path.display()))?;

            stamp_mtime(&path, random_past(now, FILE_MTIME_WINDOW, rng))?;
        }
    }

    // Directory mtimes last: creating children above would reset them.
    for dir in dirs {
        stamp_mtime(&dir, random_past(now, DIR_MTIME_WINDOW, rng))?;
    }

    Ok(())
}

/// Deletes everything under `root` except `keep`, tolerating races with
/// the sandbox side still touching files.
pub(crate) fn clear(root: &Path, keep: &str) -> Result<()> {
    for entry in
        fs::read_dir(root).with_context(|| format!("Failed to list {}", root.display()))?
    {
        let Ok(entry) = entry else { continue };
        if entry.file_name().to_string_lossy() == keep {
            continue;
        }
        let path = entry.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = result {
            debug!("Failed to remove {}: {}", path.display(), e);
        }
    }
    Ok(())
}

/// Textual tree of `root`: two-space indent, `/`-suffixed directories,
/// runtime bookkeeping entries hidden.
pub(crate) fn directory_tree(root: &Path, ignore: &[&str]) -> String {
    let mut lines = Vec::new();
    walk_tree(root, 0, ignore, &mut lines);
    lines.join("\n")
}

fn walk_tree(dir: &Path, level: usize, ignore: &[&str], lines: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.filter_map(Result::ok).collect();
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if ignore.contains(&name.as_str()) {
            continue;
        }
        let indent = "  ".repeat(level);
        if entry.path().is_dir() {
            lines.push(format!("{indent}{name}/"));
            walk_tree(&entry.path(), level + 1, ignore, lines);
        } else {
            lines.push(format!("{indent}{name}"));
        }
    }
}

fn random_past(now: SystemTime, window_secs: f64, rng: &mut dyn RngCore) -> SystemTime {
    let offset = Duration::from_secs_f64(rng.random_range(0.0..window_secs));
    now.checked_sub(offset).unwrap_or(now)
}

fn stamp_mtime(path: &Path, mtime: SystemTime) -> Result<()> {
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open {} for timestamping", path.display()))?;
    file.set_times(fs::FileTimes::new().set_modified(mtime))
        .with_context(|| format!("Failed to stamp mtime on {}", path.display()))?;
    Ok(())
}
