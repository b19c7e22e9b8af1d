//! A stored file as tracked by the file management service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The two fixed buckets every owner's files fall into.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Category {
    /// Material supplied by the customer.
    #[default]
    ClientMaterial,
    /// Solutions and documents produced internally.
    InternalSolution,
}

impl Category {
    /// Accepts the canonical names plus the short `customer` / `company` aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "client_material" | "customer" => Some(Self::ClientMaterial),
            "internal_solution" | "company" => Some(Self::InternalSolution),
            _ => None,
        }
    }

    /// Like [`Category::parse`], falling back to client material.
    pub fn normalize(raw: &str) -> Self {
        Self::parse(raw).unwrap_or_default()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientMaterial => "client_material",
            Self::InternalSolution => "internal_solution",
        }
    }

    /// Folder segment used in storage keys.
    pub fn storage_dir(self) -> &'static str {
        match self {
            Self::ClientMaterial => "customer-files",
            Self::InternalSolution => "company-files",
        }
    }

    /// Human label, also the name of the folder tree root.
    pub fn label(self) -> &'static str {
        match self {
            Self::ClientMaterial => "Customer Files",
            Self::InternalSolution => "Company Files",
        }
    }
}

/// Persisted metadata for one uploaded file.
///
/// `(owner_id, category, folder_path, filename)` is unique among rows whose
/// `deleted_at` is unset.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    pub id: i64,

    /// Customer the file belongs to.
    pub owner_id: i64,

    pub category: Category,

    /// Slash-separated virtual folder, empty for the category root.
    pub folder_path: String,

    /// Final (sanitized, de-duplicated) file name.
    pub filename: String,

    /// Backend that holds the bytes (`local` or `s3`).
    pub storage_disk: String,

    pub storage_key: String,

    pub byte_size: i64,

    pub mime_type: String,

    /// Lower-case extension without the dot.
    pub file_ext: String,

    /// MD5 of the bytes as received, before any transcoding.
    pub checksum_md5: String,

    pub preview_supported: bool,

    pub uploaded_by: i64,

    pub uploaded_at: DateTime<Utc>,

    pub notes: String,

    /// JSON document with provider-specific extras.
    pub extra: Option<String>,

    /// Upload batch the record was created by.
    pub batch_id: Option<Uuid>,

    pub deleted_at: Option<DateTime<Utc>>,

    pub deleted_by: Option<i64>,
}

impl FileRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A record as returned by listings, decorated with a preview link.
#[derive(Serialize, Clone, Debug)]
pub struct FileView {
    #[serde(flatten)]
    pub record: FileRecord,

    /// Folder shown to users, the category label for root files.
    pub display_folder: String,

    pub preview_url: Option<String>,
}
