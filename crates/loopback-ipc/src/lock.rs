//! Single-instance guard backed by an OS file lock.
//!
//! One lock file per server identity lives in a shared directory. The exclusive
//! lock on the open handle is the mutual-exclusion primitive; the file's
//! contents (the owner's process id) are diagnostic only. `fs2` locks belong to
//! the open handle rather than to a thread, so acquire and release may run on
//! any worker.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{IpcError, Result};
use crate::identity::ServerIdentity;

/// Holds the exclusive lock for one server identity until released or dropped.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: Option<File>,
}

const ACQUIRE_ATTEMPTS: u32 = 3;

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn write_owner_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    write!(file, "{}", std::process::id())?;
    file.flush()
}

/// Whether `file` is still the file linked at `path`.
#[cfg(unix)]
fn is_current(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(linked) => Ok(held.dev() == linked.dev() && held.ino() == linked.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

// Windows refuses to delete a file with an open handle, so the locked handle
// is always the linked one.
#[cfg(not(unix))]
fn is_current(_file: &File, _path: &Path) -> io::Result<bool> {
    Ok(true)
}

impl InstanceLock {
    /// Lock file path for `identity` inside `dir`.
    pub fn path_for(dir: &Path, identity: &ServerIdentity) -> PathBuf {
        dir.join(identity.lock_file_name())
    }

    /// Take the lock, creating the directory and file as needed.
    ///
    /// Fails with `ServerAlreadyExists` if another handle holds it.
    pub fn acquire(dir: &Path, identity: &ServerIdentity) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| IpcError::io_with_path(e, dir))?;

        let path = Self::path_for(dir, identity);
        for attempt in 1..=ACQUIRE_ATTEMPTS {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| IpcError::io_with_path(e, &path))?;

            if let Some(file) = Self::lock_opened(file, &path, identity)? {
                debug!("Acquired instance lock {}", path.display());
                return Ok(Self {
                    path,
                    file: Some(file),
                });
            }
            debug!(
                "Lock file {} was replaced while locking (attempt {})",
                path.display(),
                attempt
            );
        }

        Err(IpcError::io_with_path(
            io::Error::other("lock file kept changing while acquiring"),
            &path,
        ))
    }

    /// Lock an already opened handle to `path`.
    ///
    /// Returns `None` when the handle no longer refers to the file at `path`:
    /// the previous owner unlinked it between our open and our lock, so the
    /// lock we hold guards nothing.
    fn lock_opened(
        mut file: File,
        path: &Path,
        identity: &ServerIdentity,
    ) -> Result<Option<File>> {
        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if is_contended(&e) {
                debug!("Lock {} is held by another instance", path.display());
                return Err(IpcError::ServerAlreadyExists {
                    name: identity.unique_name.clone(),
                    protocol_revision: identity.protocol_revision,
                });
            }
            return Err(IpcError::io_with_path(e, path));
        }

        if !is_current(&file, path).map_err(|e| IpcError::io_with_path(e, path))? {
            let _ = FileExt::unlock(&file);
            return Ok(None);
        }

        // Owner pid, for humans inspecting the lock directory.
        if let Err(e) = write_owner_pid(&mut file) {
            warn!("Failed to write owner pid to {}: {}", path.display(), e);
        }
        Ok(Some(file))
    }

    /// Whether some handle currently holds the lock for `identity`.
    ///
    /// A missing file means not taken. Probing briefly takes and drops the lock.
    pub fn is_taken(dir: &Path, identity: &ServerIdentity) -> Result<bool> {
        let path = Self::path_for(dir, identity);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(IpcError::io_with_path(e, &path)),
        };

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                Ok(false)
            }
            Err(e) if is_contended(&e) => Ok(true),
            Err(e) => Err(IpcError::io_with_path(e, &path)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Drop the lock and delete the file. Deletion failures are ignored.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };

        // Unlink while still holding the lock so no other process can lock the
        // old inode after we let go.
        let removed = fs::remove_file(&self.path).is_ok();
        let _ = FileExt::unlock(&file);
        drop(file);
        if !removed {
            let _ = fs::remove_file(&self.path);
        }
        debug!("Released instance lock {}", self.path.display());
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity() -> ServerIdentity {
        ServerIdentity::new("lock-test", 1)
    }

    #[test]
    fn test_acquire_creates_file_with_pid() {
        let dir = TempDir::new().unwrap();
        let lock = InstanceLock::acquire(dir.path(), &identity()).unwrap();

        assert!(lock.path().ends_with("lock-test.1.lock"));
        let contents = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }

    #[test]
    fn test_second_acquire_fails() {
        let dir = TempDir::new().unwrap();
        let _first = InstanceLock::acquire(dir.path(), &identity()).unwrap();

        let second = InstanceLock::acquire(dir.path(), &identity());
        assert!(matches!(
            second,
            Err(IpcError::ServerAlreadyExists {
                protocol_revision: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_is_taken() {
        let dir = TempDir::new().unwrap();
        assert!(!InstanceLock::is_taken(dir.path(), &identity()).unwrap());

        let lock = InstanceLock::acquire(dir.path(), &identity()).unwrap();
        assert!(InstanceLock::is_taken(dir.path(), &identity()).unwrap());

        lock.release();
        assert!(!InstanceLock::is_taken(dir.path(), &identity()).unwrap());
    }

    #[test]
    fn test_stale_file_is_not_taken() {
        let dir = TempDir::new().unwrap();
        fs::write(InstanceLock::path_for(dir.path(), &identity()), "12345").unwrap();

        assert!(!InstanceLock::is_taken(dir.path(), &identity()).unwrap());
        let lock = InstanceLock::acquire(dir.path(), &identity()).unwrap();
        assert!(lock.is_held());
    }

    #[test]
    fn test_release_deletes_file_and_allows_reacquire() {
        let dir = TempDir::new().unwrap();
        let lock = InstanceLock::acquire(dir.path(), &identity()).unwrap();
        let path = lock.path().to_path_buf();
        lock.release();
        assert!(!path.exists());

        let again = InstanceLock::acquire(dir.path(), &identity()).unwrap();
        drop(again);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_handle_to_released_file_is_not_locked() {
        let dir = TempDir::new().unwrap();
        let first = InstanceLock::acquire(dir.path(), &identity()).unwrap();
        let path = first.path().to_path_buf();

        // Opened before the owner lets go, locked after.
        let late = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        first.release();

        let locked = InstanceLock::lock_opened(late, &path, &identity()).unwrap();
        assert!(locked.is_none());

        let second = InstanceLock::acquire(dir.path(), &identity()).unwrap();
        assert!(second.is_held());
        assert!(InstanceLock::is_taken(dir.path(), &identity()).unwrap());
    }

    #[test]
    fn test_distinct_revisions_do_not_conflict() {
        let dir = TempDir::new().unwrap();
        let _a = InstanceLock::acquire(dir.path(), &ServerIdentity::new("svc", 0)).unwrap();
        let _b = InstanceLock::acquire(dir.path(), &ServerIdentity::new("svc", 1)).unwrap();
    }
}
