//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity and the storage backend

use super::AppState;
use crate::{models::object::PutOptions, services::storage::StorageProvider};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, io::Write, path::Path};
use uuid::Uuid;

/// `GET /healthz`
///
/// Very small liveness check; always returns 200 OK and never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness check that:
/// 1. Runs a lightweight query against SQLite (`SELECT 1`).
/// 2. Stores and deletes a small check object through the configured backend.
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };

    let storage_check = check_storage(state.files.storage(), state.files.work_dir()).await;

    let overall_ok = sqlite_check.ok && storage_check.ok;
    let mut checks = HashMap::new();
    checks.insert("sqlite", sqlite_check);
    checks.insert("storage", storage_check);

    let body = ReadyResponse {
        status: if overall_ok { "ok".into() } else { "error".into() },
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Put then delete `.readyz/{uuid}`.
async fn check_storage(storage: &StorageProvider, work_dir: &Path) -> CheckStatus {
    let source = match std::fs::create_dir_all(work_dir)
        .and_then(|_| tempfile::NamedTempFile::new_in(work_dir))
        .and_then(|mut file| file.write_all(b"readyz").map(|_| file))
    {
        Ok(file) => file,
        Err(e) => return CheckStatus::failed(format!("could not create check file: {}", e)),
    };

    let key = format!(".readyz/{}", Uuid::new_v4());
    let opts = PutOptions {
        content_type: Some("text/plain".into()),
    };
    match storage.put(&key, source.path(), &opts).await {
        Ok(object) if object.bytes == 6 => match storage.delete(&key).await {
            Ok(_) => CheckStatus::ok(),
            Err(e) => CheckStatus::failed(format!("could not delete check object: {}", e)),
        },
        Ok(object) => {
            let _ = storage.delete(&key).await;
            CheckStatus::failed(format!("check object has {} bytes, expected 6", object.bytes))
        }
        Err(e) => CheckStatus::failed(format!("could not store check object: {}", e)),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::LocalStorage;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_storage_check_leaves_nothing_behind() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let storage = StorageProvider::local(LocalStorage::new(root.path(), None), Vec::new());

        let status = check_storage(&storage, work.path()).await;
        assert!(status.ok, "{:?}", status.error);
        assert!(!root.path().join(".readyz").exists());
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_storage_check_reports_unwritable_root() {
        let root = TempDir::new().unwrap();
        let blocker = root.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let work = TempDir::new().unwrap();
        let storage = StorageProvider::local(LocalStorage::new(&blocker, None), Vec::new());

        let status = check_storage(&storage, work.path()).await;
        assert!(!status.ok);
        assert!(status.error.unwrap().contains("could not store"));
    }
}
