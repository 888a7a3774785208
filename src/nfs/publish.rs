//! Atomic file publication.
//!
//! A writer produces `<dir>/.temp.<uuid>`, then hard-links it to the final
//! name. The link either installs the complete file or fails with `EEXIST`
//! because another writer won the race, which is success too: cache
//! contents for a given name are deterministic. The temp file is always
//! unlinked. Readers therefore observe either nothing or a complete file,
//! never a partial write.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Error, Result};

fn temp_path(dir: &Path) -> PathBuf {
    dir.join(format!(".temp.{}", Uuid::new_v4()))
}

/// Publishes `dest` with the contents produced by `write`. `dest`'s parent
/// directory is created as needed.
pub fn publish_with<F>(dest: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    let dir = dest.parent().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            ErrorKind::InvalidInput,
            "publish destination has no parent directory",
        ))
    })?;
    fs::create_dir_all(dir)?;

    let temp = temp_path(dir);
    let result = (|| -> Result<()> {
        let mut file = File::create(&temp)?;
        write(&mut file)?;
        file.sync_data()?;
        match fs::hard_link(&temp, dest) {
            Ok(()) => Ok(()),
            // Another writer won; their complete file is already in place.
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    })();
    let _ = fs::remove_file(&temp);
    result
}

/// Publishes `dest` holding exactly `bytes`.
pub fn publish_bytes(dest: &Path, bytes: &[u8]) -> Result<()> {
    publish_with(dest, |file| {
        file.write_all(bytes)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    fn no_temp_files(dir: &Path) -> bool {
        fs::read_dir(dir).unwrap().all(|e| {
            !e.unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with(".temp.")
        })
    }

    #[test]
    fn publishes_contents() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("x").join("y.bin");
        publish_bytes(&dest, b"hello").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"hello");
        assert!(no_temp_files(dest.parent().unwrap()));
    }

    #[test]
    fn existing_file_is_kept() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("y.bin");
        publish_bytes(&dest, b"first").unwrap();
        // Second publish is a success but the first contents win.
        publish_bytes(&dest, b"second").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"first");
        assert!(no_temp_files(dir.path()));
    }

    #[test]
    fn racing_writers_produce_one_complete_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("x").join("y.bin");

        let contents: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 4096]).collect();
        let handles: Vec<_> = contents
            .iter()
            .cloned()
            .map(|data| {
                let dest = dest.clone();
                thread::spawn(move || publish_bytes(&dest, &data))
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }

        let got = fs::read(&dest).unwrap();
        assert_eq!(got.len(), 4096);
        // Exactly one writer's contents, not an interleaving.
        assert!(got.iter().all(|&b| b == got[0]));
        assert!(contents.iter().any(|c| c == &got));
        assert!(no_temp_files(dest.parent().unwrap()));
    }

    #[test]
    fn failed_write_leaves_no_debris() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("y.bin");
        let res = publish_with(&dest, |_| Err(Error::BytesNotAvailable));
        assert!(res.is_err());
        assert!(!dest.exists());
        assert!(no_temp_files(dir.path()));
    }
}
