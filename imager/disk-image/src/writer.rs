use crate::DiskImageError;
use log::{debug, warn};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// An in-progress output artifact: a zero-filled byte store of a computed
/// size, written to at planned offsets and finalized to a file exactly once.
pub struct DiskImage {
    buf: Vec<u8>,
    sector_size: u32,
}

impl DiskImage {
    /// Allocate a zero-filled image of `len` bytes.
    ///
    /// # Errors
    ///
    /// [`DiskImageError::LengthOverflow`] when `len` does not fit the host
    /// address width.
    pub fn new(len: u64, sector_size: u32) -> Result<Self, DiskImageError> {
        let size = usize::try_from(len).map_err(|_| DiskImageError::LengthOverflow { len })?;
        debug!("allocating disk image store of {len:#x} bytes");
        Ok(Self {
            buf: vec![0u8; size],
            sector_size,
        })
    }

    /// Total image length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Sector size the image was planned with.
    #[must_use]
    pub const fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Copy `bytes` into the image at `offset`.
    ///
    /// # Errors
    ///
    /// [`DiskImageError::WriteOutOfBounds`] when `offset + bytes.len()`
    /// crosses the image end. The store is left untouched in that case;
    /// an out-of-bounds write means the layout plan and the write pass
    /// disagree and the image must not be finalized.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), DiskImageError> {
        let len = bytes.len() as u64;
        let end = offset.checked_add(len).filter(|&end| end <= self.len());
        let Some(end) = end else {
            return Err(DiskImageError::WriteOutOfBounds {
                offset,
                len,
                image_len: self.len(),
            });
        };

        // end <= self.len() <= usize::MAX, so both casts fit.
        self.buf[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy `bytes` into the image starting at sector `lba`.
    ///
    /// # Errors
    ///
    /// Same contract as [`write_at`](Self::write_at).
    pub fn write_lba(&mut self, lba: u64, bytes: &[u8]) -> Result<(), DiskImageError> {
        let offset = lba
            .checked_mul(u64::from(self.sector_size))
            .ok_or(DiskImageError::WriteOutOfBounds {
                offset: u64::MAX,
                len: bytes.len() as u64,
                image_len: self.len(),
            })?;
        self.write_at(offset, bytes)
    }

    /// Read back a slice of the store (layout verification, tests).
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Write the complete image to `path` and commit it.
    ///
    /// The destination is created fresh, written and synced through a
    /// [`PendingFile`] guard: if any step fails, or the guard is dropped by
    /// an unwind, the partial file is removed rather than left half-written.
    ///
    /// # Errors
    ///
    /// [`DiskImageError::Io`] with the destination path attached.
    pub fn finalize(self, path: &Path) -> Result<(), DiskImageError> {
        let mut pending = PendingFile::create(path)?;
        pending.write_all(&self.buf)?;
        pending.commit()?;
        debug!("finalized {} ({:#x} bytes)", path.display(), self.buf.len());
        Ok(())
    }
}

/// Scoped acquisition of a destination file: deletes the file on drop unless
/// [`commit`](Self::commit) ran to completion.
struct PendingFile {
    path: PathBuf,
    file: Option<File>,
    committed: bool,
}

impl PendingFile {
    fn create(path: &Path) -> Result<Self, DiskImageError> {
        let file = File::create(path).map_err(|source| DiskImageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            committed: false,
        })
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), DiskImageError> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(bytes).map_err(|source| DiskImageError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn commit(mut self) -> Result<(), DiskImageError> {
        if let Some(file) = self.file.take() {
            file.sync_all().map_err(|source| DiskImageError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Close before unlinking; a partial image must not survive.
        drop(self.file.take());
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("could not remove partial image {}: {err}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PendingFile;
    use std::fs;

    #[test]
    fn dropped_guard_removes_partial_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("partial.img");

        {
            let mut pending = PendingFile::create(&path).expect("create");
            pending.write_all(&[0xAB; 64]).expect("write");
            // No commit; the guard must clean up.
        }

        assert!(!path.exists(), "partial image must be deleted on drop");
    }

    #[test]
    fn committed_guard_keeps_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("full.img");

        let mut pending = PendingFile::create(&path).expect("create");
        pending.write_all(&[0xCD; 64]).expect("write");
        pending.commit().expect("commit");

        assert_eq!(fs::read(&path).expect("read back"), vec![0xCD; 64]);
    }
}
