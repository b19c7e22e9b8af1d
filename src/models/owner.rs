//! Rows owned by the surrounding CRM that this service only reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A customer that files are attached to.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Owner {
    pub id: i64,
    pub name: String,
    /// Sequence code assigned on first use, e.g. `Q2025010301`.
    pub group_code: Option<String>,
    pub group_name: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A project that scopes group uploads.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Project {
    pub id: i64,
    pub owner_id: i64,
    pub name: Option<String>,
    pub code: Option<String>,
}

impl Project {
    /// Name used as a storage folder, falling back to the project code.
    pub fn folder_name(&self) -> Option<&str> {
        [self.name.as_deref(), self.code.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|value| !value.is_empty())
    }
}
