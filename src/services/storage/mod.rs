//! Storage backends behind one capability surface.
//!
//! The backend is chosen once from configuration. Everything above this
//! module talks to [`StorageProvider`] and never inspects which variant it got,
//! except through the explicit [`StorageProvider::local_root`] and
//! [`StorageProvider::s3_client`] accessors.

pub mod local;
pub mod s3;
pub mod signer;

#[cfg(test)]
pub mod fake_s3;

use crate::{
    config::{Settings, StorageDriver},
    models::object::{PutOptions, StoredObject},
};
use bytes::Bytes;
use futures::stream::BoxStream;
use std::{io, path::Path, sync::Arc};
use thiserror::Error;

pub use local::LocalStorage;
pub use s3::{S3Client, S3Storage};

/// Streamed object body.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("storage backend returned {status}: {code}: {message}")]
    Backend {
        status: u16,
        code: String,
        message: String,
    },
    #[error("storage request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request signing failed: {0}")]
    Signing(String),
    #[error("invalid storage request: {0}")]
    InvalidRequest(String),
    #[error("{0} is not supported by this storage backend")]
    Unsupported(&'static str),
    #[error("storage misconfigured: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Clone)]
enum Backend {
    Local(LocalStorage),
    S3(S3Storage),
}

/// The storage capability used by the rest of the service.
#[derive(Clone)]
pub struct StorageProvider {
    backend: Backend,
    preview_mimes: Arc<Vec<String>>,
}

impl StorageProvider {
    pub fn local(storage: LocalStorage, preview_mimes: Vec<String>) -> Self {
        Self {
            backend: Backend::Local(storage),
            preview_mimes: Arc::new(preview_mimes),
        }
    }

    pub fn s3(storage: S3Storage, preview_mimes: Vec<String>) -> Self {
        Self {
            backend: Backend::S3(storage),
            preview_mimes: Arc::new(preview_mimes),
        }
    }

    /// Build the configured backend.
    pub fn from_settings(settings: &Settings) -> StorageResult<Self> {
        let mimes = settings.limits.preview_mimes.clone();
        match settings.storage.driver {
            StorageDriver::Local => {
                let local = &settings.storage.local;
                Ok(Self::local(
                    LocalStorage::new(&local.root, local.base_url.clone()),
                    mimes,
                ))
            }
            StorageDriver::S3 => {
                let client = S3Client::new(settings.storage.s3.clone())?;
                Ok(Self::s3(S3Storage::new(Arc::new(client)), mimes))
            }
        }
    }

    /// Identifier recorded with every stored file.
    pub fn disk(&self) -> &'static str {
        match &self.backend {
            Backend::Local(_) => "local",
            Backend::S3(_) => "s3",
        }
    }

    /// Filesystem root for the local backend; `None` for remote backends.
    pub fn local_root(&self) -> Option<&Path> {
        match &self.backend {
            Backend::Local(local) => Some(local.root()),
            Backend::S3(_) => None,
        }
    }

    /// Signed HTTP client for the S3-compatible backend.
    pub fn s3_client(&self) -> Option<&Arc<S3Client>> {
        match &self.backend {
            Backend::Local(_) => None,
            Backend::S3(s3) => Some(s3.client()),
        }
    }

    /// Store the file at `source` under `key`. The source file is consumed.
    pub async fn put(
        &self,
        key: &str,
        source: &Path,
        opts: &PutOptions,
    ) -> StorageResult<StoredObject> {
        match &self.backend {
            Backend::Local(local) => local.put(key, source).await,
            Backend::S3(s3) => s3.put(key, source, opts).await,
        }
    }

    pub async fn read_stream(&self, key: &str) -> StorageResult<ByteStream> {
        match &self.backend {
            Backend::Local(local) => local.read_stream(key).await,
            Backend::S3(s3) => s3.read_stream(key).await,
        }
    }

    pub async fn delete(&self, key: &str) -> StorageResult<bool> {
        match &self.backend {
            Backend::Local(local) => local.delete(key).await,
            Backend::S3(s3) => s3.delete(key).await,
        }
    }

    /// Returns `false` when the source does not exist.
    pub async fn copy(&self, src_key: &str, dst_key: &str) -> StorageResult<bool> {
        match &self.backend {
            Backend::Local(local) => local.copy(src_key, dst_key).await,
            Backend::S3(s3) => s3.copy(src_key, dst_key).await,
        }
    }

    /// Move an object to a new key. The local backend renames in place; S3
    /// has no rename, so the object is copied and the source deleted.
    pub async fn rename(&self, src_key: &str, dst_key: &str) -> StorageResult<()> {
        if src_key == dst_key {
            return Ok(());
        }
        match &self.backend {
            Backend::Local(local) => local.rename(src_key, dst_key).await,
            Backend::S3(s3) => {
                if !s3.copy(src_key, dst_key).await? {
                    return Err(StorageError::NotFound(src_key.to_string()));
                }
                s3.delete(src_key).await?;
                Ok(())
            }
        }
    }

    /// Time-limited download URL, if the backend can produce one.
    pub fn presign(&self, key: &str, ttl_secs: u64) -> StorageResult<Option<String>> {
        match &self.backend {
            Backend::Local(local) => Ok(local.public_url(key)),
            Backend::S3(s3) => s3.presign(key, ttl_secs).map(Some),
        }
    }

    pub fn supports_preview(&self, mime: &str) -> bool {
        let mime = mime.trim();
        !mime.is_empty()
            && self
                .preview_mimes
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(mime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_supports_preview_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let provider = StorageProvider::local(
            LocalStorage::new(dir.path(), None),
            vec!["image/png".into(), "application/pdf".into()],
        );
        assert!(provider.supports_preview("IMAGE/PNG"));
        assert!(provider.supports_preview("application/pdf"));
        assert!(!provider.supports_preview("application/zip"));
        assert!(!provider.supports_preview(""));
    }

    #[test]
    fn test_from_settings_selects_backend() {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.storage.local.root = dir.path().to_path_buf();
        let provider = StorageProvider::from_settings(&settings).unwrap();
        assert_eq!(provider.disk(), "local");
        assert_eq!(provider.local_root(), Some(dir.path()));
        assert!(provider.s3_client().is_none());

        settings.storage.driver = StorageDriver::S3;
        settings.storage.s3.bucket = "vault".into();
        settings.storage.s3.access_key = "ak".into();
        settings.storage.s3.secret_key = "sk".into();
        settings.storage.s3.endpoint = Some("http://127.0.0.1:9000".into());
        let provider = StorageProvider::from_settings(&settings).unwrap();
        assert_eq!(provider.disk(), "s3");
        assert!(provider.local_root().is_none());
        assert!(provider.s3_client().is_some());
    }

    #[test]
    fn test_s3_requires_bucket_and_keys() {
        let mut settings = Settings::default();
        settings.storage.driver = StorageDriver::S3;
        assert!(matches!(
            StorageProvider::from_settings(&settings),
            Err(StorageError::Config(_))
        ));
    }
}
