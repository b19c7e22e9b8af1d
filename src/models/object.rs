//! Describes an object as seen by a storage backend.

use serde::{Deserialize, Serialize};

/// Result of storing bytes under a key.
///
/// The backend has no folder entities; folders are only key prefixes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoredObject {
    /// Backend identifier (`local` or `s3`).
    pub disk: String,

    /// Storage key, without any backend-level prefix.
    pub key: String,

    /// Size in bytes.
    pub bytes: u64,

    /// Backend-specific details, e.g. the ETag returned by S3.
    pub extra: serde_json::Value,
}

/// Options accepted by `put`.
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
}
