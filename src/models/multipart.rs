//! Multipart upload sessions and folder upload plans.

use serde::{Deserialize, Serialize};

/// A multipart session opened against the object store.
///
/// Parts are transferred by the client straight to presigned URLs; the
/// service only sees the session at initiate and complete time.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UploadSession {
    pub storage_key: String,

    /// Identifier assigned by the backend.
    pub upload_id: String,

    pub content_type: String,

    pub part_size: u64,

    /// `ceil(size / part_size)`, at least 1.
    pub total_parts: u32,
}

/// A part the client reports as uploaded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: u32,

    /// ETag the backend returned for the part PUT.
    pub etag: String,
}

/// Outcome of a successful CompleteMultipartUpload.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CompletedUpload {
    pub etag: String,
    pub location: Option<String>,
}

/// How a single file of a folder upload should be transferred.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TransferPlan {
    Multipart {
        upload_id: String,
        part_size: u64,
        total_parts: u32,
    },
    Single {
        url: String,
    },
}

/// One entry of a planned folder upload.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PlannedFile {
    /// Position of the file in the request.
    pub index: usize,
    pub rel_path: String,
    pub filename: String,
    pub storage_key: String,
    #[serde(flatten)]
    pub transfer: TransferPlan,
}

/// All sessions opened for one folder upload request.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FolderUploadPlan {
    pub total_files: usize,
    pub group_code: String,
    pub sessions: Vec<PlannedFile>,
}
