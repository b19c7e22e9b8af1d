//! Defines the HTTP surface of the file vault.
//!
//! ## Structure
//! - **Owner-scoped endpoints**
//!   - `GET    /owners/{owner_id}/files`: list live files (filters, paging)
//!   - `POST   /owners/{owner_id}/files`: multipart form upload
//!   - `POST   /owners/{owner_id}/files/zip`: download a selection or folder as zip
//!   - `GET    /owners/{owner_id}/folders/tree`: one level of the folder tree
//!   - `POST   /owners/{owner_id}/folders/rename`: rename a folder and its subtree
//!   - `POST   /owners/{owner_id}/group-code`: assign a group code if missing
//!
//! - **File endpoints**
//!   - `PATCH  /files/{id}`: rename
//!   - `DELETE /files/{id}`: soft delete
//!   - `POST   /files/{id}/restore`: undo a soft delete (admin)
//!   - `GET    /files/{id}/stream`: download or preview proxy
//!   - `GET    /files/{id}/preview-url`: signed preview link
//!
//! - **Direct uploads** under `/uploads/...`, the admin views under
//!   `/admin/...`, and `POST /sequence-codes`.

use crate::handlers::{
    AppState,
    file_handlers::{
        delete_file, download_zip, ensure_group_code, folder_tree, list_deleted, list_files,
        partial_batches, preview_url, rename_file, rename_folder, restore_file, stream_file,
        upload_files,
    },
    health_handlers::{healthz, readyz},
    upload_handlers::{abort, complete, folder_init, initiate, part_url, sequence_code},
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, patch, post},
};

/// Build the router. `upload_limit` caps the body of the form upload route;
/// every other route keeps axum's default limit.
pub fn routes(upload_limit: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Owner-scoped routes
        .route(
            "/owners/{owner_id}/files",
            get(list_files).post(upload_files).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/owners/{owner_id}/files/zip", post(download_zip))
        .route("/owners/{owner_id}/folders/tree", get(folder_tree))
        .route("/owners/{owner_id}/folders/rename", post(rename_folder))
        .route("/owners/{owner_id}/group-code", post(ensure_group_code))
        // File routes
        .route("/files/{id}", patch(rename_file).delete(delete_file))
        .route("/files/{id}/restore", post(restore_file))
        .route("/files/{id}/stream", get(stream_file))
        .route("/files/{id}/preview-url", get(preview_url))
        // Admin routes
        .route("/admin/deleted-files", get(list_deleted))
        .route("/admin/partial-batches", get(partial_batches))
        // Direct-to-storage uploads
        .route("/uploads/multipart/initiate", post(initiate))
        .route("/uploads/multipart/part-url", post(part_url))
        .route("/uploads/multipart/complete", post(complete))
        .route("/uploads/multipart/abort", post(abort))
        .route("/uploads/folder/init", post(folder_init))
        .route("/sequence-codes", post(sequence_code))
}
