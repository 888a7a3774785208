//! Local-filesystem storage provider.
//!
//! Objects are plain files under a root directory. Used directly in tests
//! and as the inner provider beneath the NFS cache; the object-store backend
//! implements the same trait out of process.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use log::trace;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::frame::codec;
use crate::frame::{CompressionType, FrameTable};
use crate::storage::{ObjectSize, StorageProvider, StoreOptions};
use crate::sync::cancel::CancelToken;

pub struct LocalBackend {
    root: PathBuf,
    /// Uncompressed size per compressed object, recorded at upload. For
    /// uncompressed objects the file length is authoritative.
    virtual_sizes: DashMap<String, u64>,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(LocalBackend {
            root,
            virtual_sizes: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, object: &str) -> PathBuf {
        self.root.join(object)
    }

    fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

impl StorageProvider for LocalBackend {
    fn size(&self, object: &str, token: &CancelToken) -> Result<ObjectSize> {
        token.check()?;
        let raw_size = fs::metadata(self.object_path(object))?.len();
        let virtual_size = self
            .virtual_sizes
            .get(object)
            .map(|v| *v)
            .unwrap_or(raw_size);
        Ok(ObjectSize {
            virtual_size,
            raw_size,
        })
    }

    fn get_frame(
        &self,
        object: &str,
        offset: u64,
        frames: Option<&FrameTable>,
        decompress: bool,
        buf: &mut [u8],
        token: &CancelToken,
    ) -> Result<usize> {
        token.check()?;
        let file = File::open(self.object_path(object))?;
        match frames {
            None => Self::read_full_at(&file, buf, offset),
            Some(table) => {
                let loc = table.locate(offset)?;
                let c_len = loc.size.compressed as usize;
                let u_len = loc.size.uncompressed as usize;

                let mut compressed = vec![0u8; c_len];
                let n = Self::read_full_at(&file, &mut compressed, loc.compressed_offset)?;
                if n != c_len {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("frame at {offset} truncated: {n} of {c_len} bytes"),
                    )));
                }

                if decompress {
                    if buf.len() < u_len {
                        return Err(Error::BufferTooSmall {
                            got: buf.len(),
                            need: u_len,
                        });
                    }
                    codec::decompress_frame_into(
                        table.compression(),
                        &compressed,
                        &mut buf[..u_len],
                    )?;
                    Ok(u_len)
                } else {
                    if buf.len() < c_len {
                        return Err(Error::BufferTooSmall {
                            got: buf.len(),
                            need: c_len,
                        });
                    }
                    buf[..c_len].copy_from_slice(&compressed);
                    Ok(c_len)
                }
            }
        }
    }

    fn store_file(
        &self,
        src: &Path,
        object: &str,
        opts: &StoreOptions,
        token: &CancelToken,
    ) -> Result<Option<FrameTable>> {
        token.check()?;
        let dest = self.object_path(object);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if opts.compression == CompressionType::None {
            fs::copy(src, &dest)?;
            self.virtual_sizes.remove(object);
            trace!("stored {object} uncompressed");
            return Ok(None);
        }

        let data = fs::read(src)?;
        let artifact =
            codec::compress_frames(&data, opts.compression, opts.frame_size as usize, opts.level)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&dest)?;
        file.write_all(&artifact.data)?;
        file.sync_data()?;
        self.virtual_sizes
            .insert(object.to_string(), data.len() as u64);
        trace!(
            "stored {object}: {} -> {} bytes in {} frames",
            data.len(),
            artifact.data.len(),
            artifact.table.frame_count()
        );
        Ok(Some(artifact.table))
    }

    fn delete_with_prefix(&self, prefix: &str, token: &CancelToken) -> Result<()> {
        token.check()?;
        let mut dirs = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .expect("walkdir stays under root");
            if !rel.to_string_lossy().starts_with(prefix) {
                continue;
            }
            if entry.file_type().is_dir() {
                dirs.push(entry.path().to_path_buf());
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        for dir in dirs.iter().rev() {
            let _ = fs::remove_dir_all(dir);
        }
        self.virtual_sizes
            .retain(|object, _| !object.starts_with(prefix));
        Ok(())
    }

    fn public_upload_url(&self, object: &str) -> Result<String> {
        Ok(format!("file://{}", self.object_path(object).display()))
    }
}
