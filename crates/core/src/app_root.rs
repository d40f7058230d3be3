//! ApplicationRoot: the canonicalized path that keys the pool.

use std::path::{Path, PathBuf};

use crate::error::{PoolError, PoolResult};

/// A canonicalized, absolute filesystem path identifying one application.
///
/// Two [`AppRoot`]s built from paths that resolve to the same canonical
/// location MUST compare equal, so that `get()` calls reaching the same
/// application through different symlinks share instances. `normalize()`
/// actually calls `fs::canonicalize` rather than passing the path through
/// unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppRoot(PathBuf);

impl AppRoot {
    /// Canonicalize `path` into an [`AppRoot`]. Fails if the path doesn't
    /// exist or can't be resolved.
    pub fn normalize(path: impl AsRef<Path>) -> PoolResult<Self> {
        let canonical = std::fs::canonicalize(path.as_ref())
            .map_err(|e| PoolError::file_system(path.as_ref(), e))?;
        Ok(AppRoot(canonical))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl std::fmt::Display for AppRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_paths_to_same_app_normalize_equal() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("app");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let a = AppRoot::normalize(&real).unwrap();
        let b = AppRoot::normalize(&link).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_path_fails() {
        let err = AppRoot::normalize("/nonexistent/definitely/not/here");
        assert!(err.is_err());
    }
}
