//! Per-owner file management: uploads, listings, the folder tree, renames,
//! soft deletes, previews and zip bundles.
//!
//! Every operation that touches an owner's files first asks the configured
//! [`AccessPolicy`]. Object-store and database writes are not transactional
//! with each other: an object is always written before its record and moved
//! before its record is updated.

use crate::{
    config::{Limits, Settings},
    errors::{FileError, FileResult, UploadFailure},
    models::{
        batch::{BatchStatus, PartialBatch, UploadBatch},
        file::{Category, FileRecord, FileView},
        folder::FolderTree,
        object::PutOptions,
        owner::Owner,
    },
    services::{
        access::{AccessPolicy, Action, Actor},
        audit::{AuditAction, AuditLog},
        folder_tree::{FolderAggregate, build_tree},
        naming::{
            self, UploadSource, customer_storage_key, final_filename, numbered, owner_day_folder,
            sanitize_filename_base, sanitize_folder_path, short_name, split_extension,
        },
        preview::{PreviewSigner, RequestOrigin},
        storage::{ByteStream, StorageProvider},
        transcode::AudioTranscoder,
        zip_builder::ZipBuilder,
    },
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tempfile::NamedTempFile;
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

const FILE_COLUMNS: &str = "id, owner_id, category, folder_path, filename, storage_disk, \
     storage_key, byte_size, mime_type, file_ext, checksum_md5, preview_supported, \
     uploaded_by, uploaded_at, notes, extra, batch_id, deleted_at, deleted_by";

const DEFAULT_PAGE_SIZE: u32 = 50;
const MIN_PAGE_SIZE: u32 = 10;
const MAX_PAGE_SIZE: u32 = 100;
const SLOW_CHECKSUM: Duration = Duration::from_secs(2);
/// Upper bound on `(n)` suffixes tried for one name or storage key.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// One file received from a client, already spooled to disk.
pub struct IncomingFile {
    /// Name as sent by the client, possibly with a path.
    pub original_name: String,
    pub size: u64,
    /// Type declared by the client, used when the extension says nothing.
    pub content_type: Option<String>,
    /// The spooled bytes, or why the transfer never completed.
    pub data: Result<NamedTempFile, UploadFailure>,
}

/// Batch-level options of an upload.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub category: Category,
    /// Folder the whole batch goes into when no per-file path is given.
    pub folder_root: String,
    /// Per-file folder, matched to files by position.
    pub folder_paths: Vec<String>,
    /// `folder` marks a folder upload even without any paths.
    pub upload_mode: Option<String>,
    pub source: UploadSource,
    pub notes: String,
}

#[derive(Serialize, Debug)]
pub struct UploadOutcome {
    pub batch_id: Uuid,
    pub files: Vec<FileRecord>,
}

/// `true`/`false` as sent by JSON bodies, or the looser words query strings use.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum ChildrenFlag {
    Bool(bool),
    Text(String),
}

/// Missing means "include descendants".
pub fn include_children(flag: Option<&ChildrenFlag>) -> bool {
    match flag {
        None => true,
        Some(ChildrenFlag::Bool(value)) => *value,
        Some(ChildrenFlag::Text(text)) => !matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "current" | "single" | "only" | "none"
        ),
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ListFilter {
    pub category: Option<String>,
    pub folder_path: Option<String>,
    pub include_children: Option<ChildrenFlag>,
    pub keyword: Option<String>,
    pub uploader_id: Option<i64>,
    pub start_date: Option<NaiveDate>,
    /// Inclusive, up to 23:59:59 of that day.
    pub end_date: Option<NaiveDate>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct DeletedFilter {
    pub owner_id: Option<i64>,
    pub category: Option<String>,
    pub keyword: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Serialize, Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: i64,
}

#[derive(Serialize, Debug)]
pub struct FileListing {
    #[serde(flatten)]
    pub page: Page<FileView>,
    /// Everyone who has live files for this owner.
    pub uploaders: Vec<i64>,
    pub folder_path: Option<String>,
    pub include_children: bool,
    pub keyword: String,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct FolderRenameOutcome {
    pub old_folder_path: String,
    pub new_folder_path: String,
    pub file_count: usize,
}

/// Either explicit ids or a folder scope. Ids win when both are given.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ZipRequest {
    pub category: Option<String>,
    pub file_ids: Vec<i64>,
    pub folder_path: Option<String>,
    pub include_children: Option<ChildrenFlag>,
}

#[derive(Debug)]
pub struct ZipOutcome {
    pub path: PathBuf,
    pub download_name: String,
    pub file_count: usize,
}

/// How a stream request proves it may read the file.
pub enum StreamAccess<'a> {
    Actor(&'a Actor),
    /// Capability token from a preview URL.
    PreviewToken(&'a str),
}

/// Per-(owner, day) storage folder names. Entries from earlier days are
/// dropped on the next insert.
#[derive(Default)]
struct DayFolderCache {
    entries: Mutex<HashMap<(i64, NaiveDate), String>>,
}

impl DayFolderCache {
    fn get_or_insert_with(
        &self,
        owner_id: i64,
        day: NaiveDate,
        make: impl FnOnce() -> String,
    ) -> String {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.retain(|(_, cached_day), _| *cached_day == day);
        entries.entry((owner_id, day)).or_insert_with(make).clone()
    }
}

#[derive(Clone)]
pub struct FileService {
    db: Arc<SqlitePool>,
    storage: StorageProvider,
    policy: Arc<dyn AccessPolicy>,
    audit: AuditLog,
    preview: PreviewSigner,
    transcoder: AudioTranscoder,
    limits: Limits,
    work_dir: PathBuf,
    day_folders: Arc<DayFolderCache>,
}

impl FileService {
    /// `work_dir` holds spooled uploads, transcodes and zip archives.
    pub fn new(
        db: Arc<SqlitePool>,
        storage: StorageProvider,
        policy: Arc<dyn AccessPolicy>,
        settings: &Settings,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            audit: AuditLog::new(db.clone()),
            db,
            storage,
            policy,
            preview: PreviewSigner::new(
                settings.preview.secret.as_deref(),
                settings.preview.ttl_secs,
            ),
            transcoder: AudioTranscoder::new(&settings.audio),
            limits: settings.limits.clone(),
            work_dir: work_dir.into(),
            day_folders: Arc::new(DayFolderCache::default()),
        }
    }

    pub fn storage(&self) -> &StorageProvider {
        &self.storage
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    // --- Upload ---

    /// Store a batch of files for `owner_id`.
    ///
    /// Limits, quota, sizes and extensions are checked for the whole batch
    /// before anything is written. A failure after some files were stored
    /// keeps those files and returns [`FileError::PartialBatchFailure`].
    pub async fn upload(
        &self,
        owner_id: i64,
        actor: &Actor,
        files: Vec<IncomingFile>,
        request: UploadRequest,
    ) -> FileResult<UploadOutcome> {
        let owner = self.load_owner(owner_id).await?;
        self.authorize(actor, &owner, Action::Edit).await?;

        if files.is_empty() {
            return Err(FileError::Validation("select at least one file".into()));
        }
        let folder_limits = &self.limits.folder;
        if files.len() > folder_limits.max_files {
            return Err(FileError::Validation(format!(
                "a batch may contain at most {} files",
                folder_limits.max_files
            )));
        }
        let incoming: u64 = files.iter().map(|f| f.size).sum();
        if incoming > folder_limits.max_total_bytes {
            return Err(FileError::Validation(format!(
                "a batch may contain at most {} bytes",
                folder_limits.max_total_bytes
            )));
        }

        let folder_root = sanitize_folder_path(
            &request.folder_root,
            folder_limits.max_depth,
            folder_limits.max_segment_length,
        )?;
        let folder_paths = (0..files.len())
            .map(|i| {
                let raw = request.folder_paths.get(i).map(String::as_str).unwrap_or("");
                sanitize_folder_path(raw, folder_limits.max_depth, folder_limits.max_segment_length)
            })
            .collect::<FileResult<Vec<String>>>()?;
        let is_folder_upload = !folder_root.is_empty()
            || request.upload_mode.as_deref().map(str::trim) == Some("folder")
            || folder_paths.iter().any(|p| !p.is_empty());

        if self.limits.max_customer_total > 0 {
            let current = self.owner_usage(owner_id).await?;
            if current + incoming > self.limits.max_customer_total {
                return Err(FileError::QuotaExceeded {
                    current,
                    incoming,
                    limit: self.limits.max_customer_total,
                });
            }
        }

        for file in &files {
            self.preflight(file)?;
        }

        let batch_id = Uuid::new_v4();
        self.open_batch(batch_id, owner_id, actor, files.len()).await?;

        let started = Instant::now();
        let total = files.len();
        let mut stored: Vec<FileRecord> = Vec::with_capacity(total);
        let mut taken: HashSet<(Category, String, String)> = HashSet::new();

        for (index, file) in files.into_iter().enumerate() {
            let folder = match request.source.special_folder() {
                Some(special) => special.to_string(),
                None if !folder_paths[index].is_empty() => folder_paths[index].clone(),
                None => folder_root.clone(),
            };
            let result = self
                .store_one(
                    &owner,
                    actor,
                    file,
                    &request,
                    &folder,
                    is_folder_upload,
                    batch_id,
                    &mut taken,
                )
                .await;
            match result {
                Ok(record) => stored.push(record),
                Err(err) => {
                    let err = self.fail_batch(&owner, actor, batch_id, stored, total, err).await;
                    return Err(err);
                }
            }
        }

        self.close_batch(batch_id, BatchStatus::Completed, stored.len(), None).await;

        if is_folder_upload {
            let summary_path = if folder_root.is_empty() {
                folder_paths.iter().find(|p| !p.is_empty()).cloned().unwrap_or_default()
            } else {
                folder_root
            };
            let total_bytes: i64 = stored.iter().map(|r| r.byte_size).sum();
            self.audit
                .record(
                    owner_id,
                    None,
                    actor,
                    AuditAction::FolderUpload,
                    json!({
                        "folder_path": summary_path,
                        "file_count": stored.len(),
                        "total_bytes": total_bytes,
                        "duration_ms": started.elapsed().as_millis() as u64,
                        "category": request.category.as_str(),
                    }),
                )
                .await;
        }

        info!("stored {} files for owner {} in batch {}", stored.len(), owner_id, batch_id);
        Ok(UploadOutcome {
            batch_id,
            files: stored,
        })
    }

    fn preflight(&self, file: &IncomingFile) -> FileResult<()> {
        if let Err(failure) = &file.data {
            return Err(FileError::Upload(*failure));
        }
        if file.size > self.limits.max_single_size {
            return Err(FileError::Validation(format!(
                "`{}` exceeds the {} MB size limit",
                naming::base_name(&file.original_name),
                self.limits.max_single_size / (1024 * 1024)
            )));
        }
        let (_, ext) = split_extension(naming::base_name(&file.original_name));
        let allowed = &self.limits.allowed_extensions;
        if !allowed.is_empty() && !allowed.contains(&ext) {
            return Err(FileError::Validation(format!("file type `{}` is not allowed", ext)));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn store_one(
        &self,
        owner: &Owner,
        actor: &Actor,
        file: IncomingFile,
        request: &UploadRequest,
        folder: &str,
        is_folder_upload: bool,
        batch_id: Uuid,
        taken: &mut HashSet<(Category, String, String)>,
    ) -> FileResult<FileRecord> {
        let temp = file.data.map_err(FileError::Upload)?;
        let category = request.category;
        let now = Utc::now();

        let mut filename = final_filename(
            &file.original_name,
            category,
            is_folder_upload,
            request.source,
            now,
        );
        let (_, mut ext) = split_extension(&filename);
        let mut mime = mime_guess::from_ext(&ext)
            .first_raw()
            .map(String::from)
            .or_else(|| file.content_type.clone().filter(|m| !m.trim().is_empty()))
            .unwrap_or_else(|| "application/octet-stream".into());

        let checksum = checksum_md5(temp.path(), &filename).await?;

        let mut transcoded = None;
        if naming::is_recording(&file.original_name, request.source, &ext) {
            if ext == "webm" {
                mime = "audio/webm".into();
            }
            if let Some(mp3) = self.transcoder.to_mp3(temp.path(), &self.work_dir).await {
                filename = replace_extension(&filename, "mp3");
                ext = "mp3".into();
                mime = "audio/mpeg".into();
                transcoded = Some(mp3);
            }
        }
        let source = transcoded.as_ref().map(NamedTempFile::path).unwrap_or(temp.path());

        let filename = self.unique_filename(owner.id, category, folder, filename, taken).await?;
        let day_folder = self.day_folder(owner, now.date_naive());
        let key = self
            .free_storage_key(owner.id, &day_folder, category, folder, &filename)
            .await?;

        let object = self
            .storage
            .put(
                &key,
                source,
                &PutOptions {
                    content_type: Some(mime.clone()),
                },
            )
            .await?;

        let extra = if object.extra.is_null() {
            None
        } else {
            Some(object.extra.to_string())
        };
        let inserted = sqlx::query_as::<_, FileRecord>(&format!(
            "INSERT INTO files (owner_id, category, folder_path, filename, storage_disk, storage_key,
                byte_size, mime_type, file_ext, checksum_md5, preview_supported, uploaded_by,
                uploaded_at, notes, extra, batch_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(owner.id)
        .bind(category)
        .bind(folder)
        .bind(&filename)
        .bind(&object.disk)
        .bind(&object.key)
        .bind(object.bytes as i64)
        .bind(&mime)
        .bind(&ext)
        .bind(&checksum)
        .bind(self.storage.supports_preview(&mime))
        .bind(actor.id)
        .bind(now)
        .bind(request.notes.trim())
        .bind(extra)
        .bind(batch_id)
        .fetch_one(&*self.db)
        .await;

        let record = match inserted {
            Ok(record) => record,
            Err(err) => {
                // No record will ever point at this object.
                if let Err(cleanup) = self.storage.delete(&object.key).await {
                    warn!("failed to remove unrecorded object {}: {}", object.key, cleanup);
                }
                return Err(if is_unique_violation(&err) {
                    FileError::Conflict(format!("`{}` already exists in this folder", filename))
                } else {
                    err.into()
                });
            }
        };

        self.audit
            .record(
                owner.id,
                Some(record.id),
                actor,
                AuditAction::FileUploaded,
                json!({
                    "storage_key": record.storage_key,
                    "filename": record.filename,
                    "byte_size": record.byte_size,
                    "mime_type": record.mime_type,
                    "folder_path": record.folder_path,
                    "transcoded": transcoded.is_some(),
                    "batch_id": batch_id,
                }),
            )
            .await;
        Ok(record)
    }

    /// `filename`, or `stem(n).ext` with the smallest `n >= 2` that is free
    /// both in this batch and among live records.
    async fn unique_filename(
        &self,
        owner_id: i64,
        category: Category,
        folder: &str,
        filename: String,
        taken: &mut HashSet<(Category, String, String)>,
    ) -> FileResult<String> {
        let mut candidate = filename.clone();
        for n in 2..=MAX_NAME_ATTEMPTS {
            let slot = (category, folder.to_string(), candidate.clone());
            if !taken.contains(&slot)
                && !self
                    .filename_exists(owner_id, category, folder, &candidate)
                    .await?
            {
                taken.insert(slot);
                return Ok(candidate);
            }
            candidate = numbered(&filename, n);
        }
        Err(FileError::Conflict(format!(
            "no free name left for `{}` in this folder",
            filename
        )))
    }

    /// Storage key for `filename` that no record holds, deleted or not.
    /// Soft-deleted records keep their objects until the retention sweep,
    /// so reusing one of their keys would overwrite retained bytes.
    async fn free_storage_key(
        &self,
        owner_id: i64,
        day_folder: &str,
        category: Category,
        folder: &str,
        filename: &str,
    ) -> FileResult<String> {
        let mut key = customer_storage_key(owner_id, day_folder, category, folder, filename);
        for n in 2..=MAX_NAME_ATTEMPTS {
            if !self.storage_key_taken(&key).await? {
                return Ok(key);
            }
            let candidate = numbered(filename, n);
            key = customer_storage_key(owner_id, day_folder, category, folder, &candidate);
        }
        Err(FileError::Conflict(format!(
            "no free storage key left for `{}`",
            filename
        )))
    }

    async fn storage_key_taken(&self, key: &str) -> FileResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE storage_key = ?")
            .bind(key)
            .fetch_one(&*self.db)
            .await?;
        Ok(count > 0)
    }

    async fn open_batch(
        &self,
        id: Uuid,
        owner_id: i64,
        actor: &Actor,
        file_count: usize,
    ) -> FileResult<()> {
        sqlx::query(
            "INSERT INTO upload_batches (id, owner_id, actor_id, file_count, stored_count, status, started_at)
             VALUES (?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(id)
        .bind(owner_id)
        .bind(actor.id)
        .bind(file_count as i64)
        .bind(BatchStatus::Running)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn close_batch(
        &self,
        id: Uuid,
        status: BatchStatus,
        stored: usize,
        error: Option<String>,
    ) {
        let result = sqlx::query(
            "UPDATE upload_batches SET status = ?, stored_count = ?, error = ?, finished_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(stored as i64)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await;
        if let Err(err) = result {
            warn!("failed to close upload batch {}: {}", id, err);
        }
    }

    /// Record how far a batch got and shape the error for the caller.
    async fn fail_batch(
        &self,
        owner: &Owner,
        actor: &Actor,
        batch_id: Uuid,
        stored: Vec<FileRecord>,
        total: usize,
        err: FileError,
    ) -> FileError {
        if stored.is_empty() {
            self.close_batch(batch_id, BatchStatus::Failed, 0, Some(err.to_string())).await;
            return err;
        }

        let ids: Vec<i64> = stored.iter().map(|r| r.id).collect();
        warn!(
            "upload batch {} for owner {} stopped after {} of {} files: {}",
            batch_id,
            owner.id,
            ids.len(),
            total,
            err
        );
        self.close_batch(batch_id, BatchStatus::Partial, ids.len(), Some(err.to_string())).await;
        self.audit
            .record(
                owner.id,
                None,
                actor,
                AuditAction::BatchPartialFailure,
                json!({
                    "batch_id": batch_id,
                    "stored_ids": ids,
                    "total": total,
                    "error": err.to_string(),
                }),
            )
            .await;
        FileError::PartialBatchFailure {
            stored: ids,
            total,
            source: Box::new(err),
        }
    }

    /// Batches that stopped part-way, newest first, with the records they left.
    pub async fn partial_batches(&self, actor: &Actor) -> FileResult<Vec<PartialBatch>> {
        require_admin(actor, "inspect partial upload batches")?;
        let batches = sqlx::query_as::<_, UploadBatch>(
            "SELECT id, owner_id, actor_id, file_count, stored_count, status, error, started_at, finished_at
             FROM upload_batches WHERE status = ? ORDER BY started_at DESC",
        )
        .bind(BatchStatus::Partial)
        .fetch_all(&*self.db)
        .await?;

        let mut out = Vec::with_capacity(batches.len());
        for batch in batches {
            let file_ids: Vec<i64> =
                sqlx::query_scalar("SELECT id FROM files WHERE batch_id = ? ORDER BY id")
                    .bind(batch.id)
                    .fetch_all(&*self.db)
                    .await?;
            out.push(PartialBatch { batch, file_ids });
        }
        Ok(out)
    }

    // --- Listing ---

    pub async fn list(
        &self,
        owner_id: i64,
        actor: &Actor,
        filter: &ListFilter,
        origin: &RequestOrigin,
    ) -> FileResult<FileListing> {
        let owner = self.load_owner(owner_id).await?;
        self.authorize(actor, &owner, Action::View).await?;

        let (page, page_size, offset) = page_window(filter.page, filter.page_size);
        let folder = match filter.folder_path.as_deref().map(str::trim) {
            None => None,
            Some("") => Some(String::new()),
            Some(raw) => Some(self.sanitize_scope(raw)?),
        };
        let children = include_children(filter.include_children.as_ref());
        let keyword = filter.keyword.as_deref().unwrap_or("").trim().to_string();
        let scope = LiveScope {
            category: filter.category.as_deref().and_then(Category::parse),
            folder: folder.clone(),
            include_children: children,
            keyword: keyword.clone(),
            uploader_id: filter.uploader_id.filter(|id| *id > 0),
            start: filter.start_date.map(|d| d.and_time(NaiveTime::MIN).and_utc()),
            end: filter.end_date.and_then(|d| d.and_hms_opt(23, 59, 59)).map(|d| d.and_utc()),
        };

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM files WHERE ");
        scope.push_where(&mut count, owner_id);
        let total: i64 = count.build_query_scalar().fetch_one(&*self.db).await?;

        let sql = format!("SELECT {} FROM files WHERE ", FILE_COLUMNS);
        let mut select = QueryBuilder::<Sqlite>::new(sql);
        scope.push_where(&mut select, owner_id);
        select.push(" ORDER BY folder_path ASC, uploaded_at DESC LIMIT ");
        select.push_bind(page_size as i64);
        select.push(" OFFSET ");
        select.push_bind(offset);
        let rows: Vec<FileRecord> = select.build_query_as().fetch_all(&*self.db).await?;

        let uploaders: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT uploaded_by FROM files WHERE owner_id = ? AND deleted_at IS NULL ORDER BY uploaded_by",
        )
        .bind(owner_id)
        .fetch_all(&*self.db)
        .await?;

        let now = Utc::now();
        let items = rows
            .into_iter()
            .map(|record| self.view(record, origin, now))
            .collect();

        Ok(FileListing {
            page: Page {
                items,
                page,
                page_size,
                total,
            },
            uploaders,
            folder_path: folder,
            include_children: children,
            keyword,
        })
    }

    fn view(&self, record: FileRecord, origin: &RequestOrigin, now: DateTime<Utc>) -> FileView {
        let preview_url = self
            .storage
            .supports_preview(&record.mime_type)
            .then(|| self.preview.url(&origin.scheme, &origin.host, record.id, now));
        let display_folder = if record.folder_path.is_empty() {
            record.category.label().to_string()
        } else {
            record.folder_path.clone()
        };
        FileView {
            record,
            display_folder,
            preview_url,
        }
    }

    pub async fn folder_tree(
        &self,
        owner_id: i64,
        actor: &Actor,
        category: Category,
        parent: Option<&str>,
    ) -> FileResult<FolderTree> {
        let owner = self.load_owner(owner_id).await?;
        self.authorize(actor, &owner, Action::View).await?;
        let parent = match parent.map(str::trim).filter(|p| !p.is_empty()) {
            Some(raw) => self.sanitize_scope(raw)?,
            None => String::new(),
        };

        let rows = sqlx::query_as::<_, FolderAggregate>(
            "SELECT folder_path, COUNT(*) AS file_count, COALESCE(SUM(byte_size), 0) AS total_size
             FROM files
             WHERE owner_id = ? AND category = ? AND deleted_at IS NULL
             GROUP BY folder_path",
        )
        .bind(owner_id)
        .bind(category)
        .fetch_all(&*self.db)
        .await?;

        Ok(build_tree(category, &parent, &rows))
    }

    // --- Rename ---

    pub async fn rename_file(
        &self,
        file_id: i64,
        new_name: &str,
        actor: &Actor,
    ) -> FileResult<FileRecord> {
        let record = self.live_file(file_id).await?;
        let owner = self.load_owner(record.owner_id).await?;
        self.authorize(actor, &owner, Action::Edit).await?;

        let new_name = naming::validate_new_filename(new_name)?;
        if new_name == record.filename {
            return Ok(record);
        }
        if self
            .filename_exists(record.owner_id, record.category, &record.folder_path, &new_name)
            .await?
        {
            return Err(FileError::Conflict(format!(
                "`{}` already exists in this folder",
                new_name
            )));
        }

        let day_folder = self.day_folder(&owner, Utc::now().date_naive());
        let new_key = self
            .free_storage_key(
                owner.id,
                &day_folder,
                record.category,
                &record.folder_path,
                &new_name,
            )
            .await?;
        self.storage.rename(&record.storage_key, &new_key).await?;

        let (_, ext) = split_extension(&new_name);
        let updated = sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE files SET filename = ?, storage_key = ?, file_ext = ? WHERE id = ? RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(&new_name)
        .bind(&new_key)
        .bind(&ext)
        .bind(file_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                FileError::Conflict(format!("`{}` already exists in this folder", new_name))
            } else {
                err.into()
            }
        })?;

        self.audit
            .record(
                owner.id,
                Some(file_id),
                actor,
                AuditAction::FileRenamed,
                json!({
                    "old_filename": record.filename,
                    "new_filename": updated.filename,
                    "old_storage_key": record.storage_key,
                    "new_storage_key": updated.storage_key,
                }),
            )
            .await;
        Ok(updated)
    }

    /// Rename the last segment of `old_path`, moving every live file at or
    /// below it. Files are moved one by one; a failure part-way leaves the
    /// files already moved under the new path.
    pub async fn rename_folder(
        &self,
        owner_id: i64,
        old_path: &str,
        new_name: &str,
        actor: &Actor,
    ) -> FileResult<FolderRenameOutcome> {
        let owner = self.load_owner(owner_id).await?;
        self.authorize(actor, &owner, Action::Edit).await?;

        let new_name =
            naming::validate_folder_name(new_name, self.limits.folder.max_segment_length)?;
        let old_path = old_path.trim().trim_matches('/').to_string();
        if old_path.is_empty() {
            return Err(FileError::Validation("the category root cannot be renamed".into()));
        }
        let parent = naming::parent_path(&old_path);
        let new_path = if parent.is_empty() {
            new_name
        } else {
            format!("{}/{}", parent, new_name)
        };
        if new_path == old_path {
            return Ok(FolderRenameOutcome {
                old_folder_path: old_path,
                new_folder_path: new_path,
                file_count: 0,
            });
        }

        let mut exists =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM files WHERE owner_id = ");
        exists.push_bind(owner_id);
        exists.push(" AND deleted_at IS NULL AND ");
        push_folder_clause(&mut exists, &new_path, true);
        let clash: i64 = exists.build_query_scalar().fetch_one(&*self.db).await?;
        if clash > 0 {
            return Err(FileError::Conflict(format!("folder `{}` already exists", new_path)));
        }

        let mut select = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM files WHERE owner_id = ",
            FILE_COLUMNS
        ));
        select.push_bind(owner_id);
        select.push(" AND deleted_at IS NULL AND ");
        push_folder_clause(&mut select, &old_path, true);
        select.push(" ORDER BY id");
        let rows: Vec<FileRecord> = select.build_query_as().fetch_all(&*self.db).await?;
        if rows.is_empty() {
            return Err(FileError::NotFound(format!("folder `{}`", old_path)));
        }

        let day_folder = self.day_folder(&owner, Utc::now().date_naive());
        for row in &rows {
            let folder = format!("{}{}", new_path, &row.folder_path[old_path.len()..]);
            let key = self
                .free_storage_key(owner_id, &day_folder, row.category, &folder, &row.filename)
                .await?;
            self.storage.rename(&row.storage_key, &key).await?;
            sqlx::query("UPDATE files SET folder_path = ?, storage_key = ? WHERE id = ?")
                .bind(&folder)
                .bind(&key)
                .bind(row.id)
                .execute(&*self.db)
                .await?;
            debug!("moved file {} to {}", row.id, key);
        }

        self.audit
            .record(
                owner_id,
                None,
                actor,
                AuditAction::FolderRenamed,
                json!({
                    "old_folder_path": old_path,
                    "new_folder_path": new_path,
                    "file_count": rows.len(),
                }),
            )
            .await;
        Ok(FolderRenameOutcome {
            old_folder_path: old_path,
            new_folder_path: new_path,
            file_count: rows.len(),
        })
    }

    // --- Delete / restore ---

    /// Mark a file deleted. The object stays until the retention sweep.
    pub async fn soft_delete(&self, file_id: i64, actor: &Actor) -> FileResult<FileRecord> {
        let record = self.file(file_id).await?;
        let owner = self.load_owner(record.owner_id).await?;
        self.authorize(actor, &owner, Action::Edit).await?;
        if record.is_deleted() {
            return Ok(record);
        }

        let updated = sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE files SET deleted_at = ?, deleted_by = ? WHERE id = ? RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(Utc::now())
        .bind(actor.id)
        .bind(file_id)
        .fetch_one(&*self.db)
        .await?;

        self.audit
            .record(
                owner.id,
                Some(file_id),
                actor,
                AuditAction::FileDeleted,
                json!({
                    "storage_key": updated.storage_key,
                    "filename": updated.filename,
                    "folder_path": updated.folder_path,
                }),
            )
            .await;
        Ok(updated)
    }

    pub async fn restore_file(&self, file_id: i64, actor: &Actor) -> FileResult<FileRecord> {
        require_admin(actor, "restore deleted files")?;
        let record = self.file(file_id).await?;
        if !record.is_deleted() {
            return Ok(record);
        }
        if self
            .filename_exists(
                record.owner_id,
                record.category,
                &record.folder_path,
                &record.filename,
            )
            .await?
        {
            return Err(FileError::Conflict(format!(
                "a live file named `{}` already exists in this folder",
                record.filename
            )));
        }

        let restored = sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE files SET deleted_at = NULL, deleted_by = NULL WHERE id = ? RETURNING {}",
            FILE_COLUMNS
        ))
        .bind(file_id)
        .fetch_one(&*self.db)
        .await?;

        self.audit
            .record(
                restored.owner_id,
                Some(file_id),
                actor,
                AuditAction::FileRestored,
                json!({ "filename": restored.filename, "folder_path": restored.folder_path }),
            )
            .await;
        Ok(restored)
    }

    /// Soft-deleted files across owners, most recently deleted first.
    pub async fn list_deleted(
        &self,
        actor: &Actor,
        filter: &DeletedFilter,
    ) -> FileResult<Page<FileRecord>> {
        require_admin(actor, "list deleted files")?;
        let (page, page_size, offset) = page_window(filter.page, filter.page_size);
        let category = filter.category.as_deref().and_then(Category::parse);
        let keyword = filter.keyword.as_deref().unwrap_or("").trim().to_string();

        let scope = DeletedScope {
            owner_id: filter.owner_id,
            category,
            keyword,
        };

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM files WHERE ");
        scope.push_where(&mut count);
        let total: i64 = count.build_query_scalar().fetch_one(&*self.db).await?;

        let sql = format!("SELECT {} FROM files WHERE ", FILE_COLUMNS);
        let mut select = QueryBuilder::<Sqlite>::new(sql);
        scope.push_where(&mut select);
        select.push(" ORDER BY deleted_at DESC LIMIT ");
        select.push_bind(page_size as i64);
        select.push(" OFFSET ");
        select.push_bind(offset);
        let items: Vec<FileRecord> = select.build_query_as().fetch_all(&*self.db).await?;

        Ok(Page {
            items,
            page,
            page_size,
            total,
        })
    }

    // --- Streaming & previews ---

    /// Open a live file for download or preview.
    pub async fn stream_file(
        &self,
        file_id: i64,
        access: StreamAccess<'_>,
    ) -> FileResult<(FileRecord, ByteStream)> {
        let record = self.live_file(file_id).await?;
        let owner = self.load_owner(record.owner_id).await?;

        match access {
            StreamAccess::PreviewToken(token) => {
                if !self.preview.verify(file_id, token, Utc::now()) {
                    let reason = "preview link is invalid or expired";
                    return Err(FileError::PermissionDenied(reason.into()));
                }
                let stream = self.storage.read_stream(&record.storage_key).await?;
                debug!("serving preview of file {}", file_id);
                Ok((record, stream))
            }
            StreamAccess::Actor(actor) => {
                self.check_owner_visible(actor, &owner)?;
                self.authorize(actor, &owner, Action::View).await?;
                let stream = self.storage.read_stream(&record.storage_key).await?;
                self.audit
                    .record(
                        owner.id,
                        Some(file_id),
                        actor,
                        AuditAction::FileDownloaded,
                        json!({
                            "storage_key": record.storage_key,
                            "filename": record.filename,
                            "folder_path": record.folder_path,
                        }),
                    )
                    .await;
                Ok((record, stream))
            }
        }
    }

    /// Proxy URL for previewable files, `None` for anything else.
    pub async fn preview_url(
        &self,
        file_id: i64,
        actor: &Actor,
        origin: &RequestOrigin,
    ) -> FileResult<Option<String>> {
        let record = self.live_file(file_id).await?;
        let owner = self.load_owner(record.owner_id).await?;
        self.check_owner_visible(actor, &owner)?;
        self.authorize(actor, &owner, Action::View).await?;

        if !self.storage.supports_preview(&record.mime_type) {
            return Ok(None);
        }
        Ok(Some(self.preview.url(&origin.scheme, &origin.host, file_id, Utc::now())))
    }

    // --- Zip ---

    /// Bundle a selection into a zip archive under the work directory. The
    /// caller owns the returned file and removes it once sent.
    pub async fn create_zip(
        &self,
        owner_id: i64,
        actor: &Actor,
        request: &ZipRequest,
    ) -> FileResult<ZipOutcome> {
        let owner = self.load_owner(owner_id).await?;
        self.authorize(actor, &owner, Action::View).await?;

        let category = request
            .category
            .as_deref()
            .map(Category::normalize)
            .unwrap_or_default();
        let children = include_children(request.include_children.as_ref());
        let mut ids: Vec<i64> = request.file_ids.iter().copied().filter(|id| *id > 0).collect();
        ids.sort_unstable();
        ids.dedup();

        let mut select = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM files WHERE owner_id = ",
            FILE_COLUMNS
        ));
        select.push_bind(owner_id);
        select.push(" AND category = ");
        select.push_bind(category);
        select.push(" AND deleted_at IS NULL");

        let scope = if ids.is_empty() {
            let raw_scope = request.folder_path.as_deref().map(str::trim);
            let scope = match raw_scope.filter(|p| !p.is_empty()) {
                Some(raw) => self.sanitize_scope(raw)?,
                None => String::new(),
            };
            if !(scope.is_empty() && children) {
                select.push(" AND ");
                push_folder_clause(&mut select, &scope, children);
            }
            Some(scope)
        } else {
            select.push(" AND id IN (");
            let mut separated = select.separated(", ");
            for id in &ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            None
        };
        select.push(" ORDER BY folder_path ASC, filename ASC");
        let files: Vec<FileRecord> = select.build_query_as().fetch_all(&*self.db).await?;

        if files.is_empty() {
            return Err(FileError::Validation("nothing to download in the selected scope".into()));
        }
        let zip_limits = &self.limits.zip;
        if files.len() > zip_limits.max_files {
            return Err(FileError::Validation(format!(
                "a download may contain at most {} files",
                zip_limits.max_files
            )));
        }
        let total_bytes: u64 = files.iter().map(|f| f.byte_size.max(0) as u64).sum();
        if total_bytes > zip_limits.max_total_bytes {
            return Err(FileError::Validation(format!(
                "a download may contain at most {} bytes",
                zip_limits.max_total_bytes
            )));
        }

        let root = zip_root_name(&owner, category, scope.as_deref(), Utc::now().date_naive());
        let mut builder = ZipBuilder::create(&self.work_dir).await?;
        for file in &files {
            let relative = naming::relative_to(&file.folder_path, scope.as_deref());
            let entry = if relative.is_empty() {
                format!("{}/{}", root, file.filename)
            } else {
                format!("{}/{}/{}", root, relative, file.filename)
            };
            let stream = self.storage.read_stream(&file.storage_key).await?;
            builder.add_stream(stream, &entry).await?;
        }
        let path = builder.finish().await?;
        let download_name = format!("{}.zip", root);

        self.audit
            .record(
                owner_id,
                None,
                actor,
                AuditAction::FolderDownload,
                json!({
                    "category": category.as_str(),
                    "folder_path": scope,
                    "include_children": children,
                    "selection_type": if scope.is_some() { "tree_node" } else { "selection" },
                    "file_count": files.len(),
                    "file_ids": files.iter().map(|f| f.id).collect::<Vec<_>>(),
                    "download_name": download_name,
                }),
            )
            .await;

        Ok(ZipOutcome {
            path,
            download_name,
            file_count: files.len(),
        })
    }

    // --- Helpers ---

    async fn authorize(&self, actor: &Actor, owner: &Owner, action: Action) -> FileResult<()> {
        if self.policy.authorize(actor, owner, action).await {
            Ok(())
        } else {
            Err(FileError::PermissionDenied(format!(
                "{} files of owner {}",
                action.as_str(),
                owner.id
            )))
        }
    }

    /// Files of a deleted owner are visible to admins only.
    fn check_owner_visible(&self, actor: &Actor, owner: &Owner) -> FileResult<()> {
        if owner.deleted_at.is_some() && !actor.is_admin {
            return Err(FileError::PermissionDenied(format!(
                "owner {} was deleted; only admins may access its files",
                owner.id
            )));
        }
        Ok(())
    }

    async fn load_owner(&self, owner_id: i64) -> FileResult<Owner> {
        sqlx::query_as::<_, Owner>(
            "SELECT id, name, group_code, group_name, deleted_at FROM owners WHERE id = ?",
        )
        .bind(owner_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| FileError::NotFound(format!("owner {}", owner_id)))
    }

    async fn file(&self, file_id: i64) -> FileResult<FileRecord> {
        sqlx::query_as::<_, FileRecord>(&format!("SELECT {} FROM files WHERE id = ?", FILE_COLUMNS))
            .bind(file_id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| FileError::NotFound(format!("file {}", file_id)))
    }

    async fn live_file(&self, file_id: i64) -> FileResult<FileRecord> {
        let record = self.file(file_id).await?;
        if record.is_deleted() {
            return Err(FileError::NotFound(format!("file {}", file_id)));
        }
        Ok(record)
    }

    async fn filename_exists(
        &self,
        owner_id: i64,
        category: Category,
        folder: &str,
        filename: &str,
    ) -> FileResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM files
             WHERE owner_id = ? AND category = ? AND folder_path = ? AND filename = ? AND deleted_at IS NULL",
        )
        .bind(owner_id)
        .bind(category)
        .bind(folder)
        .bind(filename)
        .fetch_one(&*self.db)
        .await?;
        Ok(count > 0)
    }

    async fn owner_usage(&self, owner_id: i64) -> FileResult<u64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(byte_size), 0) FROM files WHERE owner_id = ? AND deleted_at IS NULL",
        )
        .bind(owner_id)
        .fetch_one(&*self.db)
        .await?;
        Ok(total.max(0) as u64)
    }

    fn day_folder(&self, owner: &Owner, day: NaiveDate) -> String {
        self.day_folders.get_or_insert_with(owner.id, day, || {
            owner_day_folder(&short_name(&owner.name, owner.id), day)
        })
    }

    fn sanitize_scope(&self, raw: &str) -> FileResult<String> {
        let folder = &self.limits.folder;
        sanitize_folder_path(raw, folder.max_depth, folder.max_segment_length)
    }
}

/// Normalized listing predicate over live files.
struct LiveScope {
    category: Option<Category>,
    folder: Option<String>,
    include_children: bool,
    keyword: String,
    uploader_id: Option<i64>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl LiveScope {
    fn push_where(&self, builder: &mut QueryBuilder<'_, Sqlite>, owner_id: i64) {
        builder.push("owner_id = ");
        builder.push_bind(owner_id);
        builder.push(" AND deleted_at IS NULL");
        if let Some(category) = self.category {
            builder.push(" AND category = ");
            builder.push_bind(category);
        }
        if let Some(folder) = &self.folder {
            if !(folder.is_empty() && self.include_children) {
                builder.push(" AND ");
                push_folder_clause(builder, folder, self.include_children);
            }
        }
        if !self.keyword.is_empty() {
            builder.push(" AND filename LIKE ");
            builder.push_bind(format!("%{}%", escape_like(&self.keyword)));
            builder.push(" ESCAPE '\\'");
        }
        if let Some(uploader) = self.uploader_id {
            builder.push(" AND uploaded_by = ");
            builder.push_bind(uploader);
        }
        if let Some(start) = self.start {
            builder.push(" AND uploaded_at >= ");
            builder.push_bind(start);
        }
        if let Some(end) = self.end {
            builder.push(" AND uploaded_at <= ");
            builder.push_bind(end);
        }
    }
}

struct DeletedScope {
    owner_id: Option<i64>,
    category: Option<Category>,
    keyword: String,
}

impl DeletedScope {
    fn push_where(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        builder.push("deleted_at IS NOT NULL");
        if let Some(owner_id) = self.owner_id {
            builder.push(" AND owner_id = ");
            builder.push_bind(owner_id);
        }
        if let Some(category) = self.category {
            builder.push(" AND category = ");
            builder.push_bind(category);
        }
        if !self.keyword.is_empty() {
            builder.push(" AND filename LIKE ");
            builder.push_bind(format!("%{}%", escape_like(&self.keyword)));
            builder.push(" ESCAPE '\\'");
        }
    }
}

/// `folder_path = ?`, or the folder plus everything below it.
fn push_folder_clause(
    builder: &mut QueryBuilder<'_, Sqlite>,
    folder: &str,
    include_children: bool,
) {
    if include_children && !folder.is_empty() {
        builder.push("(folder_path = ");
        builder.push_bind(folder.to_string());
        builder.push(" OR folder_path LIKE ");
        builder.push_bind(format!("{}/%", escape_like(folder)));
        builder.push(" ESCAPE '\\')");
    } else {
        builder.push("folder_path = ");
        builder.push_bind(folder.to_string());
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// `(page, page_size, offset)` with the page size clamped to 10..=100.
fn page_window(page: Option<u32>, page_size: Option<u32>) -> (u32, u32, i64) {
    let page = page.unwrap_or(1).max(1);
    let size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE);
    (page, size, (page as i64 - 1) * size as i64)
}

fn require_admin(actor: &Actor, what: &str) -> FileResult<()> {
    if actor.is_admin {
        Ok(())
    } else {
        Err(FileError::PermissionDenied(format!("only admins may {}", what)))
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

fn replace_extension(filename: &str, ext: &str) -> String {
    match filename.rfind('.') {
        Some(pos) => format!("{}.{}", &filename[..pos], ext),
        None => format!("{}.{}", filename, ext),
    }
}

/// `{short name}-{scope label}-{YYYYMMDD}`; explicit selections have no scope.
pub fn zip_root_name(
    owner: &Owner,
    category: Category,
    scope: Option<&str>,
    day: NaiveDate,
) -> String {
    let alias = match scope {
        None => "Selected Files",
        Some(path) => path
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(category.label()),
    };
    let mut alias = sanitize_filename_base(alias);
    if alias.is_empty() {
        alias = "Files".into();
    }
    format!("{}-{}-{}", short_name(&owner.name, owner.id), alias, day.format("%Y%m%d"))
}

async fn checksum_md5(path: &Path, label: &str) -> FileResult<String> {
    let started = Instant::now();
    let mut file = File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        total += read as u64;
        context.consume(&buf[..read]);
    }
    let elapsed = started.elapsed();
    if elapsed > SLOW_CHECKSUM {
        warn!("checksum of {} ({} bytes) took {:.2?}", label, total, elapsed);
    }
    Ok(format!("{:x}", context.compute()))
}
