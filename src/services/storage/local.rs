//! Filesystem backend. Keys resolve to paths beneath `root`.

use super::{ByteStream, StorageError, StorageResult};
use crate::models::object::StoredObject;
use futures::StreamExt;
use serde_json::json;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::debug;

const MAX_KEY_LEN: usize = 1024;

#[derive(Clone, Debug)]
pub struct LocalStorage {
    root: PathBuf,
    base_url: Option<String>,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            base_url,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to an absolute path, refusing anything that could climb
    /// out of the root.
    pub fn absolute_path(&self, key: &str) -> StorageResult<PathBuf> {
        let key = key.trim_start_matches('/');
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(StorageError::InvalidRequest(format!("invalid key `{}`", key)));
        }
        if key.split('/').any(|segment| segment == "..")
            || key.bytes().any(|b| b.is_ascii_control() || b == b'\\')
        {
            return Err(StorageError::InvalidRequest(format!("invalid key `{}`", key)));
        }
        Ok(self.root.join(key))
    }

    /// Move `source` into place. Falls back to copy + unlink when a rename is
    /// not possible (e.g. across filesystems).
    pub async fn put(&self, key: &str, source: &Path) -> StorageResult<StoredObject> {
        let target = self.absolute_path(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        if let Err(err) = fs::rename(source, &target).await {
            debug!(
                "rename {} -> {} failed ({}), copying instead",
                source.display(),
                target.display(),
                err
            );
            fs::copy(source, &target).await?;
            if let Err(err) = fs::remove_file(source).await {
                if err.kind() != ErrorKind::NotFound {
                    debug!("could not remove upload source {}: {}", source.display(), err);
                }
            }
        }

        let bytes = fs::metadata(&target).await?.len();
        Ok(StoredObject {
            disk: "local".into(),
            key: key.to_string(),
            bytes,
            extra: json!({ "path": target.display().to_string() }),
        })
    }

    pub async fn read_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let path = self.absolute_path(key)?;
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(err)
            }
        })?;
        Ok(ReaderStream::new(file).boxed())
    }

    /// Deleting a key that is already gone counts as success.
    pub async fn delete(&self, key: &str) -> StorageResult<bool> {
        let path = self.absolute_path(key)?;
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(true)
    }

    pub async fn copy(&self, src_key: &str, dst_key: &str) -> StorageResult<bool> {
        let source = self.absolute_path(src_key)?;
        let target = self.absolute_path(dst_key)?;
        if !fs::try_exists(&source).await? {
            return Ok(false);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&source, &target).await?;
        Ok(true)
    }

    /// In-place move used by renames.
    pub async fn rename(&self, src_key: &str, dst_key: &str) -> StorageResult<()> {
        let source = self.absolute_path(src_key)?;
        let target = self.absolute_path(dst_key)?;
        if !fs::try_exists(&source).await? {
            return Err(StorageError::NotFound(src_key.to_string()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&source, &target).await?;
        if let Some(parent) = source.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    /// `base_url/key` when a public base is configured.
    pub fn public_url(&self, key: &str) -> Option<String> {
        self.base_url.as_ref().map(|base| {
            format!(
                "{}/{}",
                base.trim_end_matches('/'),
                key.trim_start_matches('/')
            )
        })
    }

    /// Remove empty directories from `start` upwards, stopping at the root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Drain a stream into memory.
#[cfg(test)]
pub async fn collect_stream(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
