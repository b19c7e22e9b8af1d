//! Builds one zip archive on disk from streamed entries.
//!
//! Each entry is spooled to its own temporary file first, since the archive
//! writer needs seekable input. The archive is removed unless [`ZipBuilder::finish`]
//! succeeds; dropping an unfinished builder aborts it.

use crate::{
    errors::{FileError, FileResult},
    services::storage::ByteStream,
};
use futures::StreamExt;
use std::{
    collections::HashSet,
    fs::File,
    io::{self, ErrorKind, Seek, SeekFrom},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Finished,
    Aborted,
}

pub struct ZipBuilder {
    archive_path: PathBuf,
    spool_dir: PathBuf,
    writer: Option<ZipWriter<File>>,
    names: HashSet<String>,
    state: State,
}

impl ZipBuilder {
    /// Create an empty archive in `dir`. Entry spools go to the same directory.
    pub async fn create(dir: &Path) -> FileResult<Self> {
        let spool_dir = dir.to_path_buf();
        let target = spool_dir.clone();
        let (file, archive_path) = tokio::task::spawn_blocking(move || -> FileResult<_> {
            std::fs::create_dir_all(&target)?;
            tempfile::Builder::new()
                .prefix("vault-zip-")
                .suffix(".zip")
                .tempfile_in(&target)?
                .keep()
                .map_err(|err| FileError::Io(err.error))
        })
        .await
        .map_err(|err| FileError::Io(io::Error::other(err)))??;
        debug!("created archive {}", archive_path.display());
        Ok(Self {
            archive_path,
            spool_dir,
            writer: Some(ZipWriter::new(file)),
            names: HashSet::new(),
            state: State::Open,
        })
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.archive_path
    }

    /// Append `stream` at `entry_path`. The path must be relative and must not
    /// contain `..` segments.
    pub async fn add_stream(&mut self, mut stream: ByteStream, entry_path: &str) -> FileResult<()> {
        if self.state != State::Open {
            return Err(FileError::Validation("archive is already closed".into()));
        }
        let name = normalize_entry_path(entry_path)?;
        if self.names.contains(&name) {
            return Err(FileError::Conflict(format!("duplicate archive entry `{}`", name)));
        }

        let spool = NamedTempFile::new_in(&self.spool_dir)?;
        let mut out = tokio::fs::File::from_std(spool.reopen()?);
        let mut len = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            len += chunk.len() as u64;
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        drop(out);

        let writer = self
            .writer
            .take()
            .ok_or_else(|| FileError::Validation("archive writer is unavailable".into()))?;
        let entry_name = name.clone();
        let (writer, result) = tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            let result = copy_into(&mut writer, spool, &entry_name, len);
            (writer, result)
        })
        .await
        .map_err(|err| FileError::Io(io::Error::other(err)))?;
        self.writer = Some(writer);
        result?;

        self.names.insert(name);
        Ok(())
    }

    /// Write the central directory and keep the archive.
    pub async fn finish(mut self) -> FileResult<PathBuf> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| FileError::Validation("archive writer is unavailable".into()))?;
        let finished = tokio::task::spawn_blocking(move || -> FileResult<()> {
            let file = writer.finish()?;
            file.sync_all()?;
            Ok(())
        })
        .await
        .map_err(|err| FileError::Io(io::Error::other(err)))?;

        match finished {
            Ok(()) => {
                self.state = State::Finished;
                debug!(
                    "finished archive {} with {} entries",
                    self.archive_path.display(),
                    self.names.len()
                );
                Ok(self.archive_path.clone())
            }
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    /// Close and delete the partial archive. Safe to call more than once.
    pub fn abort(&mut self) {
        if self.state != State::Open {
            return;
        }
        self.state = State::Aborted;
        self.writer = None;
        match std::fs::remove_file(&self.archive_path) {
            Ok(()) => debug!("removed partial archive {}", self.archive_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                "failed to remove partial archive {}: {}",
                self.archive_path.display(),
                err
            ),
        }
    }
}

impl Drop for ZipBuilder {
    fn drop(&mut self) {
        self.abort();
    }
}

fn copy_into(
    writer: &mut ZipWriter<File>,
    spool: NamedTempFile,
    name: &str,
    len: u64,
) -> FileResult<()> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(len > u32::MAX as u64);
    writer.start_file(name, options)?;
    let mut file = spool.reopen()?;
    file.seek(SeekFrom::Start(0))?;
    io::copy(&mut file, writer)?;
    Ok(())
}

/// Slash-joined entry path with empty and `.` segments removed.
pub fn normalize_entry_path(raw: &str) -> FileResult<String> {
    let mut segments = Vec::new();
    for segment in raw.replace('\\', "/").split('/') {
        match segment.trim() {
            "" | "." => continue,
            ".." => {
                return Err(FileError::Validation(format!(
                    "archive entry `{}` escapes its folder",
                    raw
                )));
            }
            other => segments.push(other.to_string()),
        }
    }
    if segments.is_empty() {
        return Err(FileError::Validation("archive entry name is empty".into()));
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use std::io::Read;
    use tempfile::TempDir;

    fn body(chunks: &[&'static [u8]]) -> ByteStream {
        stream::iter(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<io::Result<Bytes>>>(),
        )
        .boxed()
    }

    fn failing() -> ByteStream {
        stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "reset")),
        ])
        .boxed()
    }

    fn files_in(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    #[tokio::test]
    async fn test_finish_keeps_archive_with_entries() {
        let dir = TempDir::new().unwrap();
        let mut builder = ZipBuilder::create(dir.path()).await.unwrap();
        builder
            .add_stream(body(&[b"hello ", b"world"]), "root/a.txt")
            .await
            .unwrap();
        builder
            .add_stream(body(&[b"nested"]), "root/sub/b.txt")
            .await
            .unwrap();

        let path = builder.finish().await.unwrap();
        assert!(path.exists());
        assert_eq!(files_in(&dir), 1);

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut text = String::new();
        archive
            .by_name("root/a.txt")
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "hello world");
        assert!(archive.by_name("root/sub/b.txt").is_ok());
    }

    #[tokio::test]
    async fn test_abort_is_idempotent_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let mut builder = ZipBuilder::create(dir.path()).await.unwrap();
        builder.add_stream(body(&[b"x"]), "a.txt").await.unwrap();
        let path = builder.path().to_path_buf();

        builder.abort();
        builder.abort();
        assert!(!path.exists());
        assert_eq!(files_in(&dir), 0);
        assert!(builder.add_stream(body(&[b"y"]), "b.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_drop_without_finish_removes_archive() {
        let dir = TempDir::new().unwrap();
        let path = {
            let mut builder = ZipBuilder::create(dir.path()).await.unwrap();
            builder.add_stream(body(&[b"x"]), "a.txt").await.unwrap();
            builder.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(files_in(&dir), 0);
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_no_spool() {
        let dir = TempDir::new().unwrap();
        let mut builder = ZipBuilder::create(dir.path()).await.unwrap();
        assert!(builder.add_stream(failing(), "a.txt").await.is_err());
        // only the archive itself remains until abort
        assert_eq!(files_in(&dir), 1);
        drop(builder);
        assert_eq!(files_in(&dir), 0);
    }

    #[tokio::test]
    async fn test_rejects_escaping_and_duplicate_entries() {
        let dir = TempDir::new().unwrap();
        let mut builder = ZipBuilder::create(dir.path()).await.unwrap();
        assert!(builder.add_stream(body(&[b"x"]), "../evil").await.is_err());
        assert!(builder.add_stream(body(&[b"x"]), "/").await.is_err());
        builder.add_stream(body(&[b"x"]), "./a//b.txt").await.unwrap();
        assert!(matches!(
            builder.add_stream(body(&[b"x"]), "a/b.txt").await,
            Err(FileError::Conflict(_))
        ));
    }

    #[test]
    fn test_normalize_entry_path() {
        assert_eq!(normalize_entry_path("r\\s/./t.txt").unwrap(), "r/s/t.txt");
        assert!(normalize_entry_path("a/../b").is_err());
    }
}
