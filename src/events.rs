//! Out-of-band navigation event channel.
//!
//! The in-sandbox observer writes one JSON object per line onto a named
//! FIFO inside the scratch root: `{"path": "<absolute>", "view": "<mode>"}`.
//! One listener thread per sandbox reads it for the sandbox's whole
//! running lifetime and reconciles the records into a single
//! `(path, view)` pair. The listener is the only writer of that pair.
//!
//! Writers come and go as the file manager restarts, so the reader must
//! survive EOF indefinitely: the FIFO is opened non-blocking and polled
//! with a short backoff. Teardown sets the stop flag first and removes
//! the FIFO second, so a straggling iteration fails closed (open or read
//! error) instead of hanging.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, trace, warn};

/// File name of the channel inside the scratch root. Hidden so it never
/// shows up in the file manager.
pub(crate) const CHANNEL_FILE: &str = ".hidden";

/// How long the listener sleeps when the channel has no data.
const IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// Callback invoked with the home-relative path and view mode whenever
/// the reconciled navigation state changes.
pub type NavCallback = Box<dyn Fn(&str, &str) + Send + Sync>;

/// One navigation record as written by the in-sandbox observer.
#[derive(Debug, Deserialize)]
struct NavRecord {
    path: String,
    view: String,
}

/// The reconciled navigation state of one sandbox, shared between the
/// listener thread (sole writer) and everyone else (readers).
#[derive(Debug)]
pub(crate) struct NavState {
    inner: Mutex<(String, String)>,
    stop: AtomicBool,
}

impl NavState {
    /// Baseline state: the absolute home root and the default view.
    pub fn new(path: impl Into<String>, view: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new((path.into(), view.into())),
            stop: AtomicBool::new(false),
        }
    }

    /// Current `(absolute path, view)` pair.
    pub fn snapshot(&self) -> (String, String) {
        self.lock().clone()
    }

    /// Overwrites the pair, e.g. when reset reseeds the baseline.
    pub fn reseed(&self, path: impl Into<String>, view: impl Into<String>) {
        *self.lock() = (path.into(), view.into());
    }

    /// Signals the listener to exit on its next iteration.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (String, String)> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Translates an absolute in-sandbox path to one relative to the home
/// root (`/` for the root itself). `None` if the path is outside home.
pub(crate) fn relative_to_home(path: &str, home: &str) -> Option<String> {
    let rel = Path::new(path).strip_prefix(home).ok()?;
    let rel = rel.to_string_lossy();
    if rel.is_empty() {
        Some("/".to_string())
    } else {
        Some(format!("/{rel}"))
    }
}

/// Applies one raw channel line to the navigation state.
///
/// Returns the `(relative path, view)` pair to hand to the callback, or
/// `None` when the line is malformed, a duplicate of the current state,
/// or points outside the home root. Only the first case is logged;
/// duplicates are routine.
fn reconcile(state: &NavState, home: &str, line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let record: NavRecord = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            trace!("Dropping malformed event: {e}");
            return None;
        }
    };

    let mut current = state.lock();
    if current.0 == record.path && current.1 == record.view {
        return None;
    }

    // Navigation outside the home root (trash, recents) is not part of
    // the observable state and leaves the reconciled pair untouched.
    let rel = relative_to_home(&record.path, home)?;

    *current = (record.path, record.view.clone());
    Some((rel, record.view))
}

/// The named duplex channel of one sandbox.
#[derive(Debug)]
pub(crate) struct EventChannel {
    path: PathBuf,
}

impl EventChannel {
    /// Creates the FIFO inside `scratch_root`. An already-existing
    /// channel is fine: provisioning may be retried over the same root.
    pub fn create(scratch_root: &Path) -> Result<Self> {
        let path = scratch_root.join(CHANNEL_FILE);
        match nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o644)) {
            Ok(()) | Err(nix::errno::Errno::EEXIST) => Ok(Self { path }),
            Err(e) => Err(anyhow::Error::new(e))
                .with_context(|| format!("Failed to create event channel {}", path.display())),
        }
    }

    #[allow(dead_code)] // Exercised by tests; useful for callers
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the FIFO. Call only after the stop flag is set.
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove event channel {}: {}", self.path.display(), e);
            }
        }
    }

    /// Starts the dedicated listener thread for this channel.
    pub fn spawn_listener(
        &self,
        state: Arc<NavState>,
        home: String,
        callback: Option<Arc<NavCallback>>,
    ) -> Result<thread::JoinHandle<()>> {
        let path = self.path.clone();
        thread::Builder::new()
            .name("deskbox-events".to_string())
            .spawn(move || listen(&path, &state, &home, callback.as_deref()))
            .context("Failed to spawn event listener thread")
    }
}

/// Listener loop: (re)open the channel, drain lines, back off when idle,
/// exit when the stop flag is set or the channel file disappears.
fn listen(path: &Path, state: &NavState, home: &str, callback: Option<&NavCallback>) {
    while !state.stopped() {
        // Non-blocking open: succeeds immediately for a FIFO even with
        // no writer attached, so the stop flag stays responsive.
        let mut file = match File::options()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(f) => f,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::NotFound {
                    debug!("Event channel removed, listener exiting");
                    return;
                }
                warn!("Failed to open event channel: {e}");
                thread::sleep(IDLE_BACKOFF);
                continue;
            }
        };

        let mut pending = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            if state.stopped() {
                return;
            }
            match file.read(&mut buf) {
                // No writer currently holds the channel open.
                Ok(0) => thread::sleep(IDLE_BACKOFF),
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line);
                        if let Some((rel, view)) = reconcile(state, home, &line) {
                            debug!("Navigation: {} ({})", rel, view);
                            if let Some(cb) = callback {
                                cb(&rel, &view);
                            }
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(IDLE_BACKOFF);
                }
                Err(e) => {
                    debug!("Event channel read failed ({e}), reopening");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const HOME: &str = "/home/user";

    fn state() -> NavState {
        NavState::new(HOME, "icon-view")
    }

    #[test]
    fn test_relative_to_home() {
        assert_eq!(
            relative_to_home("/home/user/Documents", HOME).as_deref(),
            Some("/Documents")
        );
        assert_eq!(relative_to_home("/home/user", HOME).as_deref(), Some("/"));
        assert_eq!(relative_to_home("/tmp/elsewhere", HOME), None);
        // Prefix matching is per component, not textual.
        assert_eq!(relative_to_home("/home/username/x", HOME), None);
    }

    #[test]
    fn test_reconcile_updates_and_translates() {
        let state = state();
        let out = reconcile(
            &state,
            HOME,
            r#"{"path":"/home/user/Documents","view":"icon-view"}"#,
        );
        assert_eq!(
            out,
            Some(("/Documents".to_string(), "icon-view".to_string()))
        );
        assert_eq!(
            state.snapshot(),
            ("/home/user/Documents".to_string(), "icon-view".to_string())
        );
    }

    #[test]
    fn test_reconcile_duplicate_fires_once() {
        let state = state();
        let line = r#"{"path":"/home/user/Documents","view":"icon-view"}"#;

        assert!(reconcile(&state, HOME, line).is_some());
        assert!(reconcile(&state, HOME, line).is_none());
    }

    #[test]
    fn test_reconcile_view_change_alone_fires() {
        let state = state();
        let out = reconcile(&state, HOME, r#"{"path":"/home/user","view":"list-view"}"#);
        assert_eq!(out, Some(("/".to_string(), "list-view".to_string())));
    }

    #[test]
    fn test_reconcile_drops_malformed() {
        let state = state();
        assert!(reconcile(&state, HOME, "not json").is_none());
        assert!(reconcile(&state, HOME, r#"{"path": 7}"#).is_none());
        assert!(reconcile(&state, HOME, "").is_none());
        // State untouched.
        assert_eq!(state.snapshot().0, HOME);
    }

    #[test]
    fn test_reconcile_ignores_paths_outside_home() {
        let state = state();
        let out = reconcile(&state, HOME, r#"{"path":"/tmp/x","view":"list-view"}"#);
        assert!(out.is_none());
        // Outside-home records do not update the reconciled state either.
        assert_eq!(state.snapshot(), (HOME.to_string(), "icon-view".to_string()));
    }

    #[test]
    fn test_listener_reads_fifo_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let channel = EventChannel::create(dir.path()).unwrap();

        let nav = Arc::new(NavState::new(HOME, "icon-view"));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = fired.clone();
        let callback: NavCallback = Box::new(move |_, _| {
            fired_in_cb.fetch_add(1, Ordering::SeqCst);
        });

        let handle = channel
            .spawn_listener(nav.clone(), HOME.to_string(), Some(Arc::new(callback)))
            .unwrap();

        // The listener opens read-side non-blocking, so this open
        // completes as soon as the thread is up.
        let mut writer = File::options().write(true).open(channel.path()).unwrap();
        writer
            .write_all(b"{\"path\":\"/home/user/Documents\",\"view\":\"icon-view\"}\n")
            .unwrap();
        writer
            .write_all(b"{\"path\":\"/home/user/Documents\",\"view\":\"icon-view\"}\n")
            .unwrap();
        writer.flush().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while nav.snapshot().0 != "/home/user/Documents" && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }

        // Give the listener a moment to chew through the duplicate too.
        thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(nav.snapshot().0, "/home/user/Documents");

        nav.request_stop();
        channel.remove();
        handle.join().unwrap();
    }

    #[test]
    fn test_channel_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let first = EventChannel::create(dir.path()).unwrap();
        let second = EventChannel::create(dir.path()).unwrap();
        assert_eq!(first.path(), second.path());
    }
}
