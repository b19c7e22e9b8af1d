//! Upload batch bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Completed,
    /// Some files were stored before a failure; their records remain.
    Partial,
    /// Nothing was stored.
    Failed,
}

/// One upload request. Records created by it carry its id, so a partial
/// failure leaves an auditable trail instead of silent orphans.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadBatch {
    pub id: Uuid,
    pub owner_id: i64,
    pub actor_id: i64,
    pub file_count: i64,
    pub stored_count: i64,
    pub status: BatchStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A batch that stopped part-way, with the records it did create.
#[derive(Serialize, Clone, Debug)]
pub struct PartialBatch {
    #[serde(flatten)]
    pub batch: UploadBatch,
    pub file_ids: Vec<i64>,
}
