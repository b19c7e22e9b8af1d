//! HTTP handlers for owner files: upload, listing, folders, zip downloads,
//! streaming and the admin views.

use super::AppState;
use crate::{
    errors::{AppError, UploadFailure},
    models::file::Category,
    services::{
        access::Actor,
        file_service::{
            DeletedFilter, IncomingFile, ListFilter, StreamAccess, UploadRequest, ZipRequest,
        },
        naming::{self, UploadSource},
        preview::RequestOrigin,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State, multipart::MultipartError},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use std::{
    io,
    path::{Path as FsPath, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};
use tempfile::NamedTempFile;
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct TreeQuery {
    pub category: Option<String>,
    pub parent: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameFolderBody {
    pub folder_path: String,
    pub new_name: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameFileBody {
    pub filename: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub mode: Option<String>,
    pub token: Option<String>,
}

/// `POST /owners/{owner_id}/files`: multipart form upload.
///
/// File parts are named `files` (or `files[]`); `folder_paths` repeats once
/// per file, in the same order.
pub async fn upload_files(
    State(state): State<AppState>,
    Path(owner_id): Path<i64>,
    actor: Actor,
    mut form: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let work_dir = state.files.work_dir().to_path_buf();
    let mut files: Vec<IncomingFile> = Vec::new();
    let mut request = UploadRequest::default();

    loop {
        let mut field = match form.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!("multipart stream ended early: {}", err);
                if files.is_empty() {
                    return Err(AppError::bad_request(UploadFailure::Interrupted.message()));
                }
                if let Some(last) = files.last_mut() {
                    last.data = Err(failure_from(&err, UploadFailure::Interrupted));
                }
                break;
            }
        };
        let name = field.name().unwrap_or_default().trim_end_matches("[]").to_string();

        if name == "files" {
            let original_name = field.file_name().unwrap_or_default().to_string();
            let content_type = field.content_type().map(String::from);
            if original_name.trim().is_empty() {
                continue;
            }
            let (size, data) = spool_field(&mut field, &work_dir).await;
            files.push(IncomingFile {
                original_name,
                size,
                content_type,
                data,
            });
            continue;
        }

        let value = field.text().await.map_err(|err| {
            AppError::bad_request(format!("reading form field `{}`: {}", name, err))
        })?;
        match name.as_str() {
            "category" => request.category = Category::normalize(&value),
            "folder_root" => request.folder_root = value,
            "folder_paths" => request.folder_paths.push(value),
            "upload_mode" => request.upload_mode = Some(value),
            "source" => request.source = UploadSource::parse(Some(value.as_str())),
            "notes" => request.notes = value,
            other => debug!("ignoring form field `{}`", other),
        }
    }

    let outcome = state.files.upload(owner_id, &actor, files, request).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// Copy one file part to a temp file in `work_dir`. Transfer problems are
/// returned as the part's [`UploadFailure`] so the whole batch is rejected
/// before anything is stored.
async fn spool_field(
    field: &mut axum::extract::multipart::Field<'_>,
    work_dir: &FsPath,
) -> (u64, Result<NamedTempFile, UploadFailure>) {
    let temp = match tokio::fs::create_dir_all(work_dir).await.and_then(|_| {
        tempfile::Builder::new()
            .prefix("vault-upload-")
            .tempfile_in(work_dir)
    }) {
        Ok(temp) => temp,
        Err(err) => {
            warn!("cannot create upload spool in {}: {}", work_dir.display(), err);
            return (0, Err(UploadFailure::MissingTempStorage));
        }
    };
    let mut out = match temp.reopen() {
        Ok(file) => File::from_std(file),
        Err(err) => {
            warn!("cannot open upload spool: {}", err);
            return (0, Err(UploadFailure::MissingTempStorage));
        }
    };

    let mut size = 0u64;
    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                size += chunk.len() as u64;
                if let Err(err) = out.write_all(&chunk).await {
                    warn!("writing upload spool failed: {}", err);
                    return (size, Err(UploadFailure::WriteFailure));
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!("upload part ended early: {}", err);
                return (size, Err(failure_from(&err, UploadFailure::PartialTransfer)));
            }
        }
    }
    if let Err(err) = out.flush().await {
        warn!("flushing upload spool failed: {}", err);
        return (size, Err(UploadFailure::WriteFailure));
    }
    (size, Ok(temp))
}

fn failure_from(err: &MultipartError, fallback: UploadFailure) -> UploadFailure {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadFailure::SizeLimit
    } else {
        fallback
    }
}

/// `GET /owners/{owner_id}/files`
pub async fn list_files(
    State(state): State<AppState>,
    Path(owner_id): Path<i64>,
    actor: Actor,
    origin: RequestOrigin,
    Query(filter): Query<ListFilter>,
) -> Result<impl IntoResponse, AppError> {
    let listing = state.files.list(owner_id, &actor, &filter, &origin).await?;
    Ok(Json(listing))
}

/// `GET /owners/{owner_id}/folders/tree?category=&parent=`
pub async fn folder_tree(
    State(state): State<AppState>,
    Path(owner_id): Path<i64>,
    actor: Actor,
    Query(q): Query<TreeQuery>,
) -> Result<impl IntoResponse, AppError> {
    let category = q.category.as_deref().map(Category::normalize).unwrap_or_default();
    let tree = state
        .files
        .folder_tree(owner_id, &actor, category, q.parent.as_deref())
        .await?;
    Ok(Json(tree))
}

/// `POST /owners/{owner_id}/folders/rename`
pub async fn rename_folder(
    State(state): State<AppState>,
    Path(owner_id): Path<i64>,
    actor: Actor,
    Json(body): Json<RenameFolderBody>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .files
        .rename_folder(owner_id, &body.folder_path, &body.new_name, &actor)
        .await?;
    Ok(Json(outcome))
}

/// `POST /owners/{owner_id}/files/zip`: builds the archive, streams it and
/// removes it once the body is dropped.
pub async fn download_zip(
    State(state): State<AppState>,
    Path(owner_id): Path<i64>,
    actor: Actor,
    Json(request): Json<ZipRequest>,
) -> Result<Response, AppError> {
    let zip = state.files.create_zip(owner_id, &actor, &request).await?;
    let file = match File::open(&zip.path).await {
        Ok(file) => file,
        Err(err) => {
            remove_quietly(&zip.path);
            return Err(AppError::internal(format!("opening archive: {}", err)));
        }
    };
    let length = file.metadata().await.map(|m| m.len()).ok();
    let body = Body::from_stream(RemoveOnDrop {
        inner: ReaderStream::new(file),
        path: zip.path,
    });

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    set_disposition(headers, "attachment", &zip.download_name);
    if let Some(length) = length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    Ok(response)
}

/// `POST /owners/{owner_id}/group-code`
pub async fn ensure_group_code(
    State(state): State<AppState>,
    Path(owner_id): Path<i64>,
    _actor: Actor,
) -> Result<impl IntoResponse, AppError> {
    let code = state.sequences.ensure_group_code(owner_id).await?;
    Ok(Json(json!({ "owner_id": owner_id, "group_code": code })))
}

/// `PATCH /files/{id}`
pub async fn rename_file(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
    actor: Actor,
    Json(body): Json<RenameFileBody>,
) -> Result<impl IntoResponse, AppError> {
    let record = state.files.rename_file(file_id, &body.filename, &actor).await?;
    Ok(Json(record))
}

/// `DELETE /files/{id}`: soft delete.
pub async fn delete_file(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
    actor: Actor,
) -> Result<impl IntoResponse, AppError> {
    let record = state.files.soft_delete(file_id, &actor).await?;
    Ok(Json(record))
}

/// `POST /files/{id}/restore`: admin only.
pub async fn restore_file(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
    actor: Actor,
) -> Result<impl IntoResponse, AppError> {
    let record = state.files.restore_file(file_id, &actor).await?;
    Ok(Json(record))
}

/// `GET /files/{id}/stream?mode=preview&token=…`
///
/// A valid preview token stands in for the caller headers, so browser
/// elements can load previews directly.
pub async fn stream_file(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
    headers: HeaderMap,
    Query(q): Query<StreamQuery>,
) -> Result<Response, AppError> {
    let token = q.token.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let (record, stream) = match token {
        Some(token) => {
            state
                .files
                .stream_file(file_id, StreamAccess::PreviewToken(token))
                .await?
        }
        None => {
            let actor = super::actor_from_headers(&headers)?;
            state.files.stream_file(file_id, StreamAccess::Actor(&actor)).await?
        }
    };

    let mut response = Response::new(Body::from_stream(stream));
    let out = response.headers_mut();
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&record.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(record.byte_size.max(0)));
    let disposition = if q.mode.as_deref() == Some("preview") {
        "inline"
    } else {
        "attachment"
    };
    set_disposition(out, disposition, &record.filename);
    Ok(response)
}

/// `GET /files/{id}/preview-url`
pub async fn preview_url(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
    actor: Actor,
    origin: RequestOrigin,
) -> Result<impl IntoResponse, AppError> {
    let url = state.files.preview_url(file_id, &actor, &origin).await?;
    Ok(Json(json!({ "file_id": file_id, "preview_url": url })))
}

/// `GET /admin/deleted-files`
pub async fn list_deleted(
    State(state): State<AppState>,
    actor: Actor,
    Query(filter): Query<DeletedFilter>,
) -> Result<impl IntoResponse, AppError> {
    let page = state.files.list_deleted(&actor, &filter).await?;
    Ok(Json(page))
}

/// `GET /admin/partial-batches`
pub async fn partial_batches(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<impl IntoResponse, AppError> {
    let batches = state.files.partial_batches(&actor).await?;
    Ok(Json(batches))
}

/// `{kind}; filename="ascii"; filename*=UTF-8''encoded`
fn set_disposition(headers: &mut HeaderMap, kind: &str, filename: &str) {
    let fallback: String = naming::replace_reserved(filename)
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '_' })
        .collect();
    let value = format!(
        "{}; filename=\"{}\"; filename*=UTF-8''{}",
        kind,
        fallback,
        urlencoding::encode(filename)
    );
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}

fn remove_quietly(path: &FsPath) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!("could not remove {}: {}", path.display(), err);
        }
    }
}

/// A body stream that deletes its backing file when dropped, whether the
/// download finished or the client went away.
struct RemoveOnDrop {
    inner: ReaderStream<File>,
    path: PathBuf,
}

impl Stream for RemoveOnDrop {
    type Item = io::Result<bytes::Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        remove_quietly(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::TempDir;

    #[test]
    fn test_disposition_keeps_utf8_name() {
        let mut headers = HeaderMap::new();
        set_disposition(&mut headers, "attachment", "Café report.pdf");
        let value = headers.get(header::CONTENT_DISPOSITION).unwrap().to_str().unwrap();
        assert_eq!(
            value,
            "attachment; filename=\"Caf_ report.pdf\"; filename*=UTF-8''Caf%C3%A9%20report.pdf"
        );
    }

    #[tokio::test]
    async fn test_archive_removed_after_body_drops() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bundle.zip");
        tokio::fs::write(&path, b"zip-bytes").await.unwrap();

        let mut stream = RemoveOnDrop {
            inner: ReaderStream::new(File::open(&path).await.unwrap()),
            path: path.clone(),
        };
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"zip-bytes");
        drop(stream);
        assert!(!path.exists());
    }
}
