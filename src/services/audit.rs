//! File activity log, persisted to `file_logs` and mirrored to tracing.

use crate::services::access::Actor;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditAction {
    FileUploaded,
    FileDeleted,
    FileRestored,
    FileDownloaded,
    FileRenamed,
    FolderRenamed,
    FolderUpload,
    FolderDownload,
    BatchPartialFailure,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileUploaded => "file_uploaded",
            Self::FileDeleted => "file_deleted",
            Self::FileRestored => "file_restored",
            Self::FileDownloaded => "file_downloaded",
            Self::FileRenamed => "file_renamed",
            Self::FolderRenamed => "folder_renamed",
            Self::FolderUpload => "folder_upload",
            Self::FolderDownload => "folder_download",
            Self::BatchPartialFailure => "batch_partial_failure",
        }
    }
}

#[derive(Clone)]
pub struct AuditLog {
    db: Arc<SqlitePool>,
}

impl AuditLog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Write one entry. A failed insert is logged and otherwise ignored, so it
    /// never undoes an operation that already happened.
    pub async fn record(
        &self,
        owner_id: i64,
        file_id: Option<i64>,
        actor: &Actor,
        action: AuditAction,
        extra: Value,
    ) {
        info!(
            owner_id,
            file_id,
            actor_id = actor.id,
            action = action.as_str(),
            extra = %extra,
            "file activity"
        );

        let extra = if extra.is_null() { None } else { Some(extra.to_string()) };
        let result = sqlx::query(
            "INSERT INTO file_logs (owner_id, file_id, actor_id, action, extra, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(owner_id)
        .bind(file_id)
        .bind(actor.id)
        .bind(action.as_str())
        .bind(extra)
        .bind(Utc::now())
        .execute(&*self.db)
        .await;

        if let Err(err) = result {
            warn!("failed to persist {} log entry: {}", action.as_str(), err);
        }
    }
}
