//! Direct-to-storage uploads: multipart sessions, folder upload plans and
//! sequence codes. Only the S3 backend can serve the multipart routes.
//! Clients name the owner, group and relative path; keys are built here.

use super::AppState;
use crate::{
    errors::AppError,
    models::multipart::CompletedPart,
    services::{
        access::Actor,
        folder_upload::{DirectUploadTarget, FolderUploadRequest},
        multipart::MultipartUploader,
    },
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct InitiateBody {
    #[serde(flatten)]
    pub target: DirectUploadTarget,
    pub content_type: Option<String>,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub struct PartUrlBody {
    #[serde(flatten)]
    pub target: DirectUploadTarget,
    pub upload_id: String,
    pub part_number: u32,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    #[serde(flatten)]
    pub target: DirectUploadTarget,
    pub upload_id: String,
    pub parts: Vec<CompletedPart>,
    pub total_parts: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AbortBody {
    #[serde(flatten)]
    pub target: DirectUploadTarget,
    pub upload_id: String,
}

fn uploader(state: &AppState) -> Result<&MultipartUploader, AppError> {
    state.folders.uploader().ok_or_else(|| {
        AppError::new(
            StatusCode::NOT_IMPLEMENTED,
            "multipart uploads need an S3-compatible storage backend",
        )
    })
}

/// Storage key for `target`, checked against the caller's access.
async fn storage_key(
    state: &AppState,
    actor: &Actor,
    target: &DirectUploadTarget,
) -> Result<String, AppError> {
    Ok(state.folders.direct_key(actor, target).await?)
}

/// `POST /uploads/multipart/initiate`
pub async fn initiate(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<InitiateBody>,
) -> Result<impl IntoResponse, AppError> {
    let uploader = uploader(&state)?;
    let key = storage_key(&state, &actor, &body.target).await?;
    let content_type = body
        .content_type
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or("application/octet-stream");
    let session = uploader
        .open_session(&key, content_type, body.size, state.upload.part_size)
        .await?;
    info!(
        "actor {} opened multipart upload {} for {}",
        actor.id, session.upload_id, session.storage_key
    );
    Ok((StatusCode::CREATED, Json(session)))
}

/// `POST /uploads/multipart/part-url`
pub async fn part_url(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<PartUrlBody>,
) -> Result<impl IntoResponse, AppError> {
    let uploader = uploader(&state)?;
    let key = storage_key(&state, &actor, &body.target).await?;
    let url = uploader.part_url(&key, &body.upload_id, body.part_number, body.ttl_secs)?;
    Ok(Json(json!({ "part_number": body.part_number, "url": url })))
}

/// `POST /uploads/multipart/complete`
pub async fn complete(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<CompleteBody>,
) -> Result<impl IntoResponse, AppError> {
    let uploader = uploader(&state)?;
    let key = storage_key(&state, &actor, &body.target).await?;
    let completed = uploader
        .complete(&key, &body.upload_id, body.parts, body.total_parts)
        .await?;
    info!("actor {} completed multipart upload {} for {}", actor.id, body.upload_id, key);
    Ok(Json(completed))
}

/// `POST /uploads/multipart/abort`
pub async fn abort(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<AbortBody>,
) -> Result<impl IntoResponse, AppError> {
    let uploader = uploader(&state)?;
    let key = storage_key(&state, &actor, &body.target).await?;
    uploader.abort(&key, &body.upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /uploads/folder/init`: open one transfer per file of a folder.
pub async fn folder_init(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<FolderUploadRequest>,
) -> Result<impl IntoResponse, AppError> {
    let plan = state.folders.plan(&actor, &request).await?;
    Ok(Json(plan))
}

/// `POST /sequence-codes`
pub async fn sequence_code(
    State(state): State<AppState>,
    _actor: Actor,
) -> Result<impl IntoResponse, AppError> {
    let code = state.sequences.generate_today().await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "code": code.to_string(), "date": code.date, "seq": code.seq })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::folder_upload::AssetType;

    #[test]
    fn test_bodies_take_target_parts_not_keys() {
        let body: PartUrlBody = serde_json::from_value(json!({
            "owner_id": 3,
            "group_code": "Q2025010301",
            "asset_type": "models",
            "rel_path": "scene/a.blend",
            "upload_id": "u-1",
            "part_number": 2
        }))
        .unwrap();
        assert_eq!(body.target.owner_id, 3);
        assert_eq!(body.target.asset_type, AssetType::Models);
        assert_eq!(body.target.project_id, None);
        assert_eq!(body.part_number, 2);

        let missing_owner = serde_json::from_value::<AbortBody>(json!({
            "key": "customer/1/x.bin",
            "upload_id": "u-1"
        }));
        assert!(missing_owner.is_err());
    }
}
