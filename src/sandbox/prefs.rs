//! Randomized per-episode UI preferences.
//!
//! Each sandbox starts with its own sidebar visibility, default view
//! mode, and a handful of sidebar bookmarks so episodes do not all look
//! alike. Bookmarks are restricted to standard folders that actually
//! exist in the populated home tree.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rand::seq::IndexedRandom;
use rand::{Rng, RngCore};

/// Standard folders eligible for sidebar bookmarks.
const BOOKMARK_OPTIONS: &[&str] = &[
    "Documents",
    "Desktop",
    "Downloads",
    "Music",
    "Pictures",
    "Videos",
    "Templates",
];

/// File-manager view mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    IconView,
    ListView,
}

impl ViewMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IconView => "icon-view",
            Self::ListView => "list-view",
        }
    }
}

impl std::fmt::Display for ViewMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sandbox's randomized UI preferences.
#[derive(Debug, Clone)]
pub struct UiPrefs {
    pub sidebar_hidden: bool,
    pub view: ViewMode,
    /// Folder names under the home root, relative.
    pub bookmarks: Vec<String>,
}

impl UiPrefs {
    /// Draws fresh preferences. `home` is the populated scratch root;
    /// only folders that exist there can become bookmarks, 2–4 of them
    /// when available.
    pub fn randomize(home: &Path, rng: &mut dyn RngCore) -> Self {
        let sidebar_hidden = rng.random_bool(0.5);
        let view = if rng.random_bool(0.5) {
            ViewMode::IconView
        } else {
            ViewMode::ListView
        };

        let existing: Vec<&str> = BOOKMARK_OPTIONS
            .iter()
            .copied()
            .filter(|name| home.join(name).is_dir())
            .collect();

        let bookmarks = if existing.is_empty() {
            Vec::new()
        } else {
            let count = rng.random_range(2..=4).min(existing.len());
            existing
                .choose_multiple(rng, count)
                .map(|s| (*s).to_string())
                .collect()
        };

        Self {
            sidebar_hidden,
            view,
            bookmarks,
        }
    }

    /// Environment variables the desktop image reads on startup.
    pub fn env(&self) -> Vec<String> {
        vec![
            format!("SIDEBAR_HIDDEN={}", self.sidebar_hidden),
            format!(
                "ICONVIEW={}",
                matches!(self.view, ViewMode::IconView)
            ),
            format!("BOOKMARKS={}", self.bookmarks.join(",")),
        ]
    }
}

/// Writes the GTK bookmark files into the scratch root so the running
/// file manager picks the new sidebar up. Both the XDG location and the
/// legacy dotfile are written.
pub(crate) fn write_bookmark_files(scratch: &Path, home: &str, prefs: &UiPrefs) -> Result<()> {
    let lines: Vec<String> = prefs
        .bookmarks
        .iter()
        .map(|name| format!("file://{home}/{name} {name}"))
        .collect();
    let body = lines.join("\n");

    let gtk_dir = scratch.join(".config/gtk-3.0");
    fs::create_dir_all(&gtk_dir).context("Failed to create gtk config directory")?;
    fs::write(gtk_dir.join("bookmarks"), &body).context("Failed to write bookmarks")?;
    fs::write(scratch.join(".gtk-bookmarks"), &body).context("Failed to write legacy bookmarks")?;
    Ok(())
}

/// Shell script run inside the sandbox to reseed the container-side
/// bookmark list under the runtime XDG root.
pub(crate) fn bookmark_seed_script(prefs: &UiPrefs) -> String {
    let mut script = String::from(
        "export XDG_CONFIG_HOME=/tmp/xdg-config\n\
         rm -f \"$XDG_CONFIG_HOME/gtk-3.0/bookmarks\"\n\
         mkdir -p \"$XDG_CONFIG_HOME/gtk-3.0\"\n",
    );
    for name in &prefs.bookmarks {
        script.push_str(&format!(
            "echo \"file://$HOME/{name} {name}\" >> \"$XDG_CONFIG_HOME/gtk-3.0/bookmarks\"\n"
        ));
    }
    script
}

/// Shell command that applies the new preferences and relaunches the
/// file manager pointed at the home root. Run detached inside the
/// sandbox after the old process is killed.
pub(crate) fn relaunch_script(prefs: &UiPrefs, home: &str, file_manager: &str) -> String {
    [
        "export XDG_CONFIG_HOME=/tmp/xdg-config".to_string(),
        "export XDG_CACHE_HOME=/tmp/xdg-cache".to_string(),
        "export XDG_STATE_HOME=/tmp/xdg-state".to_string(),
        "export XDG_DATA_HOME=/tmp/xdg-data".to_string(),
        "export XDG_RUNTIME_DIR=/tmp/xdg-runtime".to_string(),
        format!(
            "gsettings set org.gnome.nautilus.window-state start-with-sidebar {}",
            !prefs.sidebar_hidden
        ),
        format!(
            "gsettings set org.gnome.nautilus.preferences default-folder-viewer {}",
            prefs.view
        ),
        format!("exec {file_manager} --no-desktop \"{home}\""),
    ]
    .join(" && ")
}
