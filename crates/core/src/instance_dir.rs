//! Server-instance directory and generation-directory layout.
//!
//! `<tmpDir>/passenger.<pid>/generation-<N>/{socket,helper_server.pid,
//! backends/,buffered_uploads/,logging.socket,structure_version.txt,
//! passenger_version.txt}`. `structure_version.txt` pins the layout
//! contract; a loader that finds a newer major version MUST refuse to
//! attach to it.

use std::path::{Path, PathBuf};

use crate::error::{PoolError, PoolResult};

/// Major.minor of the on-disk layout this crate writes and understands.
pub const STRUCTURE_VERSION_MAJOR: u32 = 1;
pub const STRUCTURE_VERSION_MINOR: u32 = 0;

pub struct ServerInstanceDir {
    root: PathBuf,
}

impl ServerInstanceDir {
    /// Create `<temp_dir>/passenger.<pid>`.
    pub fn create(temp_dir: &Path, pid: u32) -> PoolResult<Self> {
        let root = temp_dir.join(format!("passenger.{pid}"));
        std::fs::create_dir_all(&root).map_err(|e| PoolError::file_system(&root, e))?;
        set_mode(&root, 0o700)?;
        Ok(ServerInstanceDir { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn generation(&self, number: u32, user_switching: bool) -> PoolResult<GenerationDir> {
        GenerationDir::create(&self.root, number, user_switching)
    }
}

pub struct GenerationDir {
    root: PathBuf,
}

impl GenerationDir {
    fn create(parent: &Path, number: u32, user_switching: bool) -> PoolResult<Self> {
        let root = parent.join(format!("generation-{number}"));
        std::fs::create_dir_all(&root).map_err(|e| PoolError::file_system(&root, e))?;
        // Owner rwx, group x, other x.
        set_mode(&root, 0o711)?;

        let backends = root.join("backends");
        std::fs::create_dir_all(&backends).map_err(|e| PoolError::file_system(&backends, e))?;
        // Backends hold per-app listener sockets; tighten further when
        // privilege separation between apps is in effect.
        set_mode(&backends, if user_switching { 0o700 } else { 0o711 })?;

        let uploads = root.join("buffered_uploads");
        std::fs::create_dir_all(&uploads).map_err(|e| PoolError::file_system(&uploads, e))?;
        set_mode(&uploads, 0o700)?;

        let dir = GenerationDir { root };
        dir.write_structure_version()?;
        Ok(dir)
    }

    fn write_structure_version(&self) -> PoolResult<()> {
        let path = self.root.join("structure_version.txt");
        std::fs::write(
            &path,
            format!("{STRUCTURE_VERSION_MAJOR}.{STRUCTURE_VERSION_MINOR}"),
        )
        .map_err(|e| PoolError::file_system(&path, e))
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root.join("socket")
    }

    pub fn helper_pid_path(&self) -> PathBuf {
        self.root.join("helper_server.pid")
    }

    pub fn backends_path(&self) -> PathBuf {
        self.root.join("backends")
    }

    pub fn buffered_uploads_path(&self) -> PathBuf {
        self.root.join("buffered_uploads")
    }

    pub fn logging_socket_path(&self) -> PathBuf {
        self.root.join("logging.socket")
    }

    /// Parse `structure_version.txt` in an existing generation directory and
    /// refuse to attach if its major version is newer than this crate's.
    pub fn check_structure_version(path: &Path) -> PoolResult<(u32, u32)> {
        let version_file = path.join("structure_version.txt");
        let contents = std::fs::read_to_string(&version_file)
            .map_err(|e| PoolError::file_system(&version_file, e))?;
        let (major, minor) = contents
            .trim()
            .split_once('.')
            .and_then(|(a, b)| Some((a.parse().ok()?, b.parse().ok()?)))
            .ok_or_else(|| {
                PoolError::Io(format!("malformed structure_version.txt: {contents:?}"))
            })?;
        if major > STRUCTURE_VERSION_MAJOR {
            return Err(PoolError::Io(format!(
                "generation directory structure version {major}.{minor} is newer than \
                 the version this binary understands ({STRUCTURE_VERSION_MAJOR}.{STRUCTURE_VERSION_MINOR})"
            )));
        }
        Ok((major, minor))
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> PoolResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| PoolError::file_system(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> PoolResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_fixed_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let instance_dir = ServerInstanceDir::create(tmp.path(), 1234).unwrap();
        let gen = instance_dir.generation(0, true).unwrap();

        assert!(gen.backends_path().is_dir());
        assert!(gen.buffered_uploads_path().is_dir());
        assert!(gen.path().join("structure_version.txt").is_file());

        let (major, minor) = GenerationDir::check_structure_version(gen.path()).unwrap();
        assert_eq!((major, minor), (STRUCTURE_VERSION_MAJOR, STRUCTURE_VERSION_MINOR));
    }

    #[test]
    fn refuses_newer_major_version() {
        let tmp = tempfile::tempdir().unwrap();
        let instance_dir = ServerInstanceDir::create(tmp.path(), 1).unwrap();
        let gen = instance_dir.generation(0, false).unwrap();
        std::fs::write(gen.path().join("structure_version.txt"), "99.0").unwrap();
        assert!(GenerationDir::check_structure_version(gen.path()).is_err());
    }
}
