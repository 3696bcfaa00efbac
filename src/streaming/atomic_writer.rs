//! Atomic file writer with automatic cleanup on failure.
//!
//! Writes to a temporary file in the same directory as the destination,
//! then atomically replaces the destination on `finish()`. If dropped
//! before finishing, the temporary file is automatically cleaned up.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

/// An atomic writer that ensures readers never observe a partial file.
pub struct AtomicFileWriter {
    temp: NamedTempFile,
    file: File,
    final_path: PathBuf,
    written: u64,
}

impl AtomicFileWriter {
    /// Creates a writer targeting `final_path`, creating its parent directory
    /// if needed.
    ///
    /// The temporary file lives next to `final_path` so the final rename
    /// stays on one filesystem.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the parent directory cannot be determined or
    /// created, or the temporary file cannot be opened.
    pub async fn create(final_path: impl AsRef<Path>) -> Result<Self> {
        let final_path = final_path.as_ref().to_path_buf();

        let parent_dir = match final_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            Some(_) => PathBuf::from("."),
            None => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Cannot determine parent directory for: {}", final_path.display()),
                )))
            }
        };

        tokio::fs::create_dir_all(&parent_dir).await?;

        let temp = NamedTempFile::new_in(&parent_dir)?;
        let file = File::from_std(temp.reopen()?);

        Ok(Self {
            temp,
            file,
            final_path,
            written: 0,
        })
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes, syncs and atomically persists the file to its final path.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if flushing or persisting fails. The temporary
    /// file is removed on error.
    pub async fn finish(self) -> Result<PathBuf> {
        let Self {
            temp,
            mut file,
            final_path,
            ..
        } = self;

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        temp.persist(&final_path).map_err(|e| Error::Io(e.error))?;

        Ok(final_path)
    }
}

/// Writes `contents` to `path` atomically.
pub async fn write_atomic(path: impl AsRef<Path>, contents: &[u8]) -> Result<PathBuf> {
    let mut writer = AtomicFileWriter::create(path).await?;
    writer.write(contents).await?;
    writer.finish().await
}

/// Streams a response body to `path` atomically, returning the byte count.
pub async fn stream_to_file(response: reqwest::Response, path: impl AsRef<Path>) -> Result<u64> {
    let mut writer = AtomicFileWriter::create(path).await?;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        writer.write(&chunk?).await?;
    }

    let total = writer.written();
    writer.finish().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn successful_write_persists_content() {
        let temp_dir = TempDir::new().unwrap();
        let final_path = temp_dir.path().join("page.json");

        let mut writer = AtomicFileWriter::create(&final_path).await.unwrap();
        writer.write(b"{\"records\":").await.unwrap();
        writer.write(b"[]}").await.unwrap();
        assert_eq!(writer.written(), 14);

        let result_path = writer.finish().await.unwrap();

        assert_eq!(result_path, final_path);
        assert_eq!(fs::read_to_string(&final_path).unwrap(), "{\"records\":[]}");
    }

    #[tokio::test]
    async fn dropped_writer_leaves_nothing_behind() {
        let temp_dir = TempDir::new().unwrap();
        let final_path = temp_dir.path().join("partial.csv");

        {
            let mut writer = AtomicFileWriter::create(&final_path).await.unwrap();
            writer.write(b"Id\n001\n").await.unwrap();
        }

        let entries: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().collect();
        assert!(entries.is_empty(), "temp file should be removed on drop");
        assert!(!final_path.exists());
    }

    #[tokio::test]
    async fn overwrites_existing_destination() {
        let temp_dir = TempDir::new().unwrap();
        let final_path = temp_dir.path().join("results.csv");
        fs::write(&final_path, "OLD_CONTENT").unwrap();

        write_atomic(&final_path, b"NEW").await.unwrap();

        assert_eq!(fs::read_to_string(&final_path).unwrap(), "NEW");
    }

    #[tokio::test]
    async fn creates_missing_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let final_path = temp_dir.path().join("nested").join("deeper").join("out.json");

        write_atomic(&final_path, b"[]").await.unwrap();

        assert!(final_path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn root_has_no_parent() {
        assert!(AtomicFileWriter::create("/").await.is_err());
    }
}
