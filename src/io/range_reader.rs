use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::IoError;

/// Trait for reading byte ranges from one instance stream.
///
/// Frames are fetched by byte range so that opening a slide never pulls
/// pixel data into memory. Implementations must be thread-safe; reads may
/// be issued concurrently from many tile fetches.
#[async_trait]
pub trait RangeReader: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Returns an error if the range is out of bounds or if the read fails.
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError>;

    /// Get the total size of the resource in bytes.
    fn size(&self) -> u64;

    /// Get a unique identifier for this resource (for logging and error messages).
    fn identifier(&self) -> &str;
}

/// Check that `[offset, offset + len)` lies within a resource of `size` bytes.
pub(crate) fn check_range(offset: u64, len: usize, size: u64) -> Result<(), IoError> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= size => Ok(()),
        _ => Err(IoError::RangeOutOfBounds {
            offset,
            requested: len as u64,
            size,
        }),
    }
}

// =============================================================================
// FileRangeReader
// =============================================================================

/// Range reader over a local file.
///
/// Reads are positional and run on the blocking pool. On unix this uses
/// `pread`, so concurrent reads never contend; elsewhere reads on one file
/// are serialized around a seek.
pub struct FileRangeReader {
    file: Arc<std::fs::File>,
    #[cfg(not(unix))]
    lock: Arc<std::sync::Mutex<()>>,
    path: PathBuf,
    identifier: String,
    size: u64,
}

impl FileRangeReader {
    /// Open a file for range reads.
    ///
    /// # Errors
    /// Returns `IoError::NotFound` if the file does not exist, or
    /// `IoError::Io` for any other failure.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref().to_path_buf();
        let identifier = path.display().to_string();

        let open_path = path.clone();
        let (file, size) = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&open_path)?;
            let size = file.metadata()?.len();
            Ok::<_, std::io::Error>((file, size))
        })
        .await
        .map_err(|e| IoError::Io {
            identifier: identifier.clone(),
            message: e.to_string(),
        })?
        .map_err(|e| IoError::from_std(identifier.clone(), e))?;

        Ok(Self {
            file: Arc::new(file),
            #[cfg(not(unix))]
            lock: Arc::new(std::sync::Mutex::new(())),
            path,
            identifier,
            size,
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RangeReader for FileRangeReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        check_range(offset, len, self.size)?;
        if len == 0 {
            return Ok(Bytes::new());
        }

        let file = self.file.clone();
        #[cfg(not(unix))]
        let lock = self.lock.clone();
        let identifier = self.identifier.clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];

            #[cfg(unix)]
            {
                use std::os::unix::fs::FileExt;
                file.read_exact_at(&mut buf, offset)?;
            }

            #[cfg(not(unix))]
            {
                use std::io::{Read, Seek, SeekFrom};
                let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let mut handle = &*file;
                handle.seek(SeekFrom::Start(offset))?;
                handle.read_exact(&mut buf)?;
            }

            Ok::<_, std::io::Error>(Bytes::from(buf))
        })
        .await
        .map_err(|e| IoError::Io {
            identifier: identifier.clone(),
            message: e.to_string(),
        })?;

        result.map_err(|e| IoError::from_std(identifier, e))
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

// =============================================================================
// MemoryRangeReader
// =============================================================================

/// Range reader over an in-memory buffer.
#[derive(Clone)]
pub struct MemoryRangeReader {
    data: Bytes,
    identifier: String,
}

impl MemoryRangeReader {
    pub fn new(identifier: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            identifier: identifier.into(),
        }
    }
}

#[async_trait]
impl RangeReader for MemoryRangeReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        check_range(offset, len, self.data.len() as u64)?;
        let start = offset as usize;
        Ok(self.data.slice(start..start + len))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
