//! Piece-aligned random-access file
//!
//! The download target is a single file written at computed offsets, one
//! piece at a time. A pre-existing file of the right size is reused so
//! valid pieces survive across runs; the engine re-verifies them on disk
//! instead of fetching them again.

use crate::digest::{Digest, DigestAlgorithm, DigestState};
use crate::error::{DownloadError, Result, StorageErrorKind};

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// Read buffer for hashing passes
const HASH_BUF_SIZE: usize = 64 * 1024;

/// Random-access download target split into fixed-size pieces
pub struct PieceFile {
    path: PathBuf,
    file: File,
    size: u64,
    piece_size: u64,
    is_new: bool,
}

impl PieceFile {
    /// Open or create the target file.
    ///
    /// An existing file whose length equals `size` is reused (resumption);
    /// anything else is recreated and, when the size is known, pre-allocated.
    /// `size == 0` means the length is unknown (single-shot transfers).
    pub async fn open(path: impl Into<PathBuf>, size: u64, piece_size: u64) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    DownloadError::storage(
                        StorageErrorKind::Io,
                        parent,
                        format!("Failed to create directory: {e}"),
                    )
                })?;
            }
        }

        let existing_len = match tokio::fs::metadata(&path).await {
            Ok(meta) => Some(meta.len()),
            Err(_) => None,
        };

        // Same length means pieces may be reusable. Unknown length (0) keeps
        // whatever exists so a conditional GET can report it up to date.
        let reuse = match existing_len {
            Some(len) => size == 0 || len == size,
            None => false,
        };
        let file = if reuse {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .await
                .map_err(|e| {
                    DownloadError::storage(
                        StorageErrorKind::Io,
                        &path,
                        format!("Failed to open file: {e}"),
                    )
                })?
        } else {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .await
                .map_err(|e| {
                    DownloadError::storage(
                        StorageErrorKind::Io,
                        &path,
                        format!("Failed to create file: {e}"),
                    )
                })?;
            if size > 0 {
                file.set_len(size).await.map_err(|e| {
                    DownloadError::storage(
                        StorageErrorKind::Io,
                        &path,
                        format!("Failed to pre-allocate {size} bytes: {e}"),
                    )
                })?;
            }
            file
        };

        Ok(Self {
            path,
            file,
            size,
            piece_size,
            is_new: !reuse,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// False when a same-size file pre-existed and its pieces may be reusable
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn piece_size(&self) -> u64 {
        self.piece_size
    }

    /// Number of pieces, counting the short tail
    pub fn piece_count(&self) -> u32 {
        if self.piece_size == 0 || self.size == 0 {
            return 0;
        }
        self.size.div_ceil(self.piece_size) as u32
    }

    /// Effective size of piece `index`; the last piece may be shorter
    pub fn piece_size_of(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_size;
        if start >= self.size {
            return 0;
        }
        (self.size - start).min(self.piece_size)
    }

    /// Total byte size of a contiguous piece run
    pub fn range_byte_size(&self, pieces: &[u32]) -> u64 {
        pieces.iter().map(|&i| self.piece_size_of(i)).sum()
    }

    /// Write `buf` at an absolute byte offset
    pub async fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| {
                DownloadError::storage(StorageErrorKind::Io, &self.path, format!("Seek failed: {e}"))
            })?;
        self.file.write_all(buf).await.map_err(|e| {
            DownloadError::storage(
                StorageErrorKind::ShortWrite,
                &self.path,
                format!("Write failed at offset {offset}: {e}"),
            )
        })?;
        Ok(buf.len())
    }

    /// Stream piece `index` through a hasher
    pub async fn hash_piece(&mut self, algorithm: DigestAlgorithm, index: u32) -> Result<Digest> {
        let start = index as u64 * self.piece_size;
        let len = self.piece_size_of(index);
        self.hash_span(algorithm, start, len).await
    }

    /// Stream the whole file through a hasher
    pub async fn hash_whole(&mut self, algorithm: DigestAlgorithm) -> Result<Digest> {
        let len = if self.size > 0 {
            self.size
        } else {
            tokio::fs::metadata(&self.path)
                .await
                .map(|m| m.len())
                .unwrap_or(0)
        };
        self.hash_span(algorithm, 0, len).await
    }

    async fn hash_span(
        &mut self,
        algorithm: DigestAlgorithm,
        start: u64,
        len: u64,
    ) -> Result<Digest> {
        self.file.seek(SeekFrom::Start(start)).await.map_err(|e| {
            DownloadError::storage(StorageErrorKind::Io, &self.path, format!("Seek failed: {e}"))
        })?;

        let mut state = DigestState::new(algorithm);
        let mut buf = vec![0u8; HASH_BUF_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = (remaining as usize).min(buf.len());
            let n = self.file.read(&mut buf[..want]).await.map_err(|e| {
                DownloadError::storage(
                    StorageErrorKind::Io,
                    &self.path,
                    format!("Read failed while hashing: {e}"),
                )
            })?;
            if n == 0 {
                break;
            }
            state.update(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(state.finalize())
    }

    /// Truncate or extend the file; used when a transfer of unknown size
    /// replaces a longer pre-existing body
    pub async fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len).await.map_err(|e| {
            DownloadError::storage(
                StorageErrorKind::Io,
                &self.path,
                format!("Failed to set length to {len}: {e}"),
            )
        })
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await.map_err(|e| {
            DownloadError::storage(StorageErrorKind::Io, &self.path, format!("Flush failed: {e}"))
        })?;
        self.file.sync_all().await.map_err(|e| {
            DownloadError::storage(StorageErrorKind::Io, &self.path, format!("Sync failed: {e}"))
        })?;
        Ok(())
    }

    /// Current mtime of the file, if available
    pub fn timestamp(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).ok()?.modified().ok()
    }

    /// Set the file mtime
    pub fn set_timestamp(&self, when: SystemTime) -> Result<()> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                DownloadError::storage(
                    StorageErrorKind::Io,
                    &self.path,
                    format!("Failed to open for mtime update: {e}"),
                )
            })?;
        file.set_modified(when).map_err(|e| {
            DownloadError::storage(
                StorageErrorKind::Io,
                &self.path,
                format!("Failed to set mtime: {e}"),
            )
        })
    }

    /// Move the mtime one second behind `reference`, or behind the current
    /// mtime when no reference is given, forcing a re-fetch on the next run
    pub fn rewind_timestamp(&self, reference: Option<SystemTime>) -> Result<()> {
        if let Some(from) = reference.or_else(|| self.timestamp()) {
            self.set_timestamp(from - Duration::from_secs(1))?;
        }
        Ok(())
    }
}
