//! restart.txt / always_restart.txt detection.
//!
//! - `restart.txt`: first sighting triggers a restart (its mtime is
//!   recorded); subsequent sightings trigger only if the mtime changed;
//!   after a triggered restart the file is unlinked.
//! - `tmp/always_restart.txt`: mere existence triggers a restart on every
//!   check; it is never unlinked.
//! - The underlying `stat()` calls are routed through [`CachedFileStat`] so
//!   repeated checks within `stat_throttle_rate` reuse the previous result
//!   instead of hitting the filesystem again.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::warn;

use crate::app_root::AppRoot;
use crate::cached_stat::CachedFileStat;

#[derive(Default)]
pub struct RestartChecker {
    stats: CachedFileStat,
    /// mtime of restart.txt as of the last *triggered* restart, per appRoot.
    /// Absent means "not seen" (first sighting will trigger).
    last_trigger_mtime: HashMap<AppRoot, SystemTime>,
}

impl RestartChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything we know about an appRoot (called when its
    /// instance list is fully removed from the pool).
    pub fn forget(&mut self, app_root: &AppRoot) {
        self.last_trigger_mtime.remove(app_root);
    }

    /// Returns `true` if a restart should be triggered for `app_root` right
    /// now. `restart_dir` is `SpawnOptions::restart_dir()`.
    pub fn should_restart(
        &mut self,
        app_root: &AppRoot,
        restart_dir: &Path,
        stat_throttle_rate: Duration,
    ) -> bool {
        let always_restart_path = restart_dir.join("tmp").join("always_restart.txt");
        let always_restart = self
            .stats
            .stat(&always_restart_path, stat_throttle_rate)
            .exists;

        let restart_txt_path = restart_dir.join("tmp").join("restart.txt");
        let restart_stat = self.stats.stat(&restart_txt_path, stat_throttle_rate);

        let restart_triggered = if restart_stat.exists {
            let previous = self.last_trigger_mtime.get(app_root).copied();
            let triggered = previous.is_none() || previous != restart_stat.mtime;
            if triggered {
                unlink_best_effort(&restart_txt_path);
                self.stats.forget(&restart_txt_path);
                // Next sighting starts over as "first sighting".
                self.last_trigger_mtime.remove(app_root);
            } else if let Some(mtime) = restart_stat.mtime {
                self.last_trigger_mtime.insert(app_root.clone(), mtime);
            }
            triggered
        } else {
            self.last_trigger_mtime.remove(app_root);
            false
        };

        always_restart || restart_triggered
    }
}

/// Unlink `path`, retrying EINTR/EAGAIN and ignoring ENOENT, per the
/// restart-file policy.
fn unlink_best_effort(path: &Path) {
    loop {
        match std::fs::remove_file(path) {
            Ok(()) => return,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) if is_retryable(&e) => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to unlink restart.txt");
                return;
            }
        }
    }
}

fn is_retryable(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == libc::EINTR || code == libc::EAGAIN
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(dir: &Path) -> AppRoot {
        AppRoot::normalize(dir).unwrap()
    }

    #[test]
    fn restart_txt_triggers_once_then_waits_for_mtime_change() {
        let tmp = tempfile::tempdir().unwrap();
        let app_root = root(tmp.path());
        let tmp_dir = tmp.path().join("tmp");
        std::fs::create_dir_all(&tmp_dir).unwrap();
        let restart_txt = tmp_dir.join("restart.txt");
        std::fs::write(&restart_txt, b"x").unwrap();

        let mut checker = RestartChecker::new();
        assert!(checker.should_restart(&app_root, tmp.path(), Duration::ZERO));
        assert!(!restart_txt.exists(), "restart.txt must be unlinked");

        // No file present any more: no further trigger.
        assert!(!checker.should_restart(&app_root, tmp.path(), Duration::ZERO));

        // Recreate it: triggers again (treated as a fresh sighting).
        std::fs::write(&restart_txt, b"y").unwrap();
        assert!(checker.should_restart(&app_root, tmp.path(), Duration::ZERO));
    }

    #[test]
    fn always_restart_triggers_every_time_and_is_not_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let app_root = root(tmp.path());
        let tmp_dir = tmp.path().join("tmp");
        std::fs::create_dir_all(&tmp_dir).unwrap();
        std::fs::write(tmp_dir.join("always_restart.txt"), b"x").unwrap();

        let mut checker = RestartChecker::new();
        for _ in 0..3 {
            assert!(checker.should_restart(&app_root, tmp.path(), Duration::ZERO));
        }
        assert!(tmp_dir.join("always_restart.txt").exists());
    }

    #[test]
    fn throttle_suppresses_repeat_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let app_root = root(tmp.path());
        let tmp_dir = tmp.path().join("tmp");
        std::fs::create_dir_all(&tmp_dir).unwrap();
        let restart_txt = tmp_dir.join("restart.txt");

        let mut checker = RestartChecker::new();
        assert!(!checker.should_restart(&app_root, tmp.path(), Duration::from_secs(60)));

        // Even though restart.txt now exists, the throttle window hasn't
        // elapsed, so the check is skipped and no restart is observed yet.
        std::fs::write(&restart_txt, b"x").unwrap();
        assert!(!checker.should_restart(&app_root, tmp.path(), Duration::from_secs(60)));
    }
}
