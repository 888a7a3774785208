//! Cross-process lock files.
//!
//! A lock is an exclusively-created `<path>.lock` file (0644, contents
//! unused). Liveness is judged by mtime: a lock older than the TTL is
//! presumed abandoned by a dead process and may be removed by the next
//! acquirer. Holders of long critical sections call [`PathLock::refresh`] to
//! bump the mtime.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use filetime::FileTime;
use log::warn;

use crate::error::{Error, Result};

/// Age past which a lock is presumed stale.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

/// The lock-file path guarding `path`.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

pub struct PathLock {
    lock_path: PathBuf,
    released: bool,
}

impl PathLock {
    /// Acquires the lock guarding `path` with the default TTL. Fails with
    /// [`Error::LockAlreadyHeld`] when a live lock exists.
    pub fn acquire(path: &Path) -> Result<PathLock> {
        Self::acquire_with_ttl(path, DEFAULT_LOCK_TTL)
    }

    pub fn acquire_with_ttl(path: &Path, ttl: Duration) -> Result<PathLock> {
        let lock_path = lock_path_for(path);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // One stale-removal retry: create, inspect, maybe remove, create.
        for _ in 0..2 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o644)
                .open(&lock_path)
            {
                Ok(_) => {
                    return Ok(PathLock {
                        lock_path,
                        released: false,
                    })
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !Self::is_stale(&lock_path, ttl)? {
                        return Err(Error::LockAlreadyHeld(lock_path));
                    }
                    warn!("removing stale lock {}", lock_path.display());
                    match fs::remove_file(&lock_path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::LockAlreadyHeld(lock_path))
    }

    fn is_stale(lock_path: &Path, ttl: Duration) -> Result<bool> {
        match fs::metadata(lock_path) {
            Ok(meta) => {
                let mtime = meta.modified()?;
                Ok(mtime.elapsed().map(|age| age > ttl).unwrap_or(false))
            }
            // Raced with a release: the next create attempt decides.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Bumps the lock mtime so a long-running holder is not presumed dead.
    pub fn refresh(&self) -> Result<()> {
        filetime::set_file_mtime(&self.lock_path, FileTime::now())?;
        Ok(())
    }

    /// Releases the lock by deleting the file.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}
