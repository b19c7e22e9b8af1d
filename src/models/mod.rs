//! Core data models.
//!
//! Persisted entities map to SQLite tables via `sqlx::FromRow` and serialize
//! as JSON via `serde`. Folder nodes and upload plans are derived values.

pub mod batch;
pub mod file;
pub mod folder;
pub mod multipart;
pub mod object;
pub mod owner;
