//! Throttled `stat()` helper used by the restart-file check.
//!
//! A `stat()` is only actually performed if more than `throttle_rate`
//! seconds have elapsed since the last one for this path; otherwise the
//! previous result is returned.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone, Copy)]
pub struct StatResult {
    pub exists: bool,
    pub mtime: Option<SystemTime>,
}

struct Entry {
    last_checked: Instant,
    result: StatResult,
}

/// One throttled cache per (process-wide) set of watched paths.
#[derive(Default)]
pub struct CachedFileStat {
    entries: HashMap<PathBuf, Entry>,
}

impl CachedFileStat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached or freshly-obtained stat result for `path`.
    /// `throttle_rate` of 0 disables throttling (always re-stats).
    pub fn stat(&mut self, path: &Path, throttle_rate: Duration) -> StatResult {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(path) {
            if throttle_rate > Duration::ZERO && now - entry.last_checked < throttle_rate {
                return entry.result;
            }
        }

        let result = match std::fs::metadata(path) {
            Ok(meta) => StatResult {
                exists: true,
                mtime: meta.modified().ok(),
            },
            Err(_) => StatResult {
                exists: false,
                mtime: None,
            },
        };

        self.entries.insert(
            path.to_path_buf(),
            Entry {
                last_checked: now,
                result,
            },
        );
        result
    }

    /// Drop cached state for a path, e.g. after it was deleted by us.
    pub fn forget(&mut self, path: &Path) {
        self.entries.remove(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttles_repeat_stats() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("restart.txt");
        std::fs::write(&path, b"x").unwrap();

        let mut cache = CachedFileStat::new();
        let first = cache.stat(&path, Duration::from_secs(60));
        assert!(first.exists);

        std::fs::remove_file(&path).unwrap();
        // Still within the throttle window: cached "exists" result returned.
        let second = cache.stat(&path, Duration::from_secs(60));
        assert!(second.exists);

        // Disabling throttling re-stats immediately.
        let third = cache.stat(&path, Duration::ZERO);
        assert!(!third.exists);
    }

    #[test]
    fn missing_file_reports_not_exists() {
        let mut cache = CachedFileStat::new();
        let result = cache.stat(Path::new("/definitely/not/here"), Duration::ZERO);
        assert!(!result.exists);
    }
}
