//! Plans grouped folder uploads: one storage key per file, one multipart
//! session per large file, one presigned PUT per small file.

use crate::{
    config::UploadConfig,
    errors::{FileError, FileResult},
    models::{
        multipart::{FolderUploadPlan, PlannedFile, TransferPlan},
        owner::{Owner, Project},
    },
    services::{
        access::{AccessPolicy, Action, Actor},
        multipart::MultipartUploader,
        naming::replace_reserved,
        storage::StorageError,
    },
};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

/// Asset folders under a group namespace.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    #[default]
    Works,
    Models,
    Customer,
    Info,
    Company,
}

impl AssetType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "models" => Self::Models,
            "customer" => Self::Customer,
            "info" => Self::Info,
            "company" => Self::Company,
            _ => Self::Works,
        }
    }

    pub fn dir(self) -> &'static str {
        match self {
            Self::Works => "works",
            Self::Models => "models",
            Self::Customer => "customer-files",
            Self::Info => "info",
            Self::Company => "company-files",
        }
    }

    /// Only these asset types are filed under a project folder.
    pub fn uses_project_folder(self) -> bool {
        matches!(self, Self::Works | Self::Models | Self::Customer)
    }
}

/// A file the client intends to upload.
#[derive(Deserialize, Clone, Debug)]
pub struct FolderFileEntry {
    /// Path relative to the chosen folder, including the file name.
    #[serde(default)]
    pub rel_path: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub filesize: i64,
    pub mime_type: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct FolderUploadRequest {
    /// Owner whose group namespace receives the files.
    pub owner_id: i64,
    pub group_code: String,
    #[serde(default)]
    pub asset_type: AssetType,
    pub project_id: Option<i64>,
    pub files: Vec<FolderFileEntry>,
}

/// One object a client uploads straight to storage. The key is always
/// derived on the server from these parts.
#[derive(Deserialize, Clone, Debug)]
pub struct DirectUploadTarget {
    pub owner_id: i64,
    pub group_code: String,
    #[serde(default)]
    pub asset_type: AssetType,
    pub project_id: Option<i64>,
    pub rel_path: String,
}

/// Namespace a plan writes into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupTarget {
    pub group_code: String,
    pub project_name: Option<String>,
}

/// `P` followed by digits: a stand-in code minted before the owner had one.
pub fn is_placeholder_code(code: &str) -> bool {
    code.strip_prefix('P')
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

/// `groups/{group}/[{project}/]{asset dir}/{rel path}`.
pub fn group_storage_key(target: &GroupTarget, asset: AssetType, rel_path: &str) -> String {
    let mut segments = vec!["groups".to_string(), target.group_code.clone()];
    if let Some(project) = target.project_name.as_deref().filter(|_| asset.uses_project_folder()) {
        segments.push(project.to_string());
    }
    segments.push(asset.dir().to_string());
    segments.extend(
        rel_path
            .replace('\\', "/")
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|segment| match segment {
                "." | ".." => "_".to_string(),
                other => replace_reserved(other),
            }),
    );
    segments.join("/")
}

/// First non-empty of the owner's group code, group name and name.
fn owner_namespace(owner: &Owner) -> Option<String> {
    [owner.group_code.as_deref(), owner.group_name.as_deref(), Some(owner.name.as_str())]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Clone)]
pub struct FolderUploadPlanner {
    db: Arc<SqlitePool>,
    uploader: Option<MultipartUploader>,
    upload: UploadConfig,
    policy: Arc<dyn AccessPolicy>,
}

impl FolderUploadPlanner {
    /// `uploader` is `None` when the backend is not S3-compatible.
    pub fn new(
        db: Arc<SqlitePool>,
        uploader: Option<MultipartUploader>,
        upload: UploadConfig,
        policy: Arc<dyn AccessPolicy>,
    ) -> Self {
        Self {
            db,
            uploader,
            upload,
            policy,
        }
    }

    pub fn uploader(&self) -> Option<&MultipartUploader> {
        self.uploader.as_ref()
    }

    /// Resolve the project folder and, for placeholder codes, the owner's
    /// real group namespace.
    pub async fn resolve_target(
        &self,
        group_code: &str,
        project_id: Option<i64>,
    ) -> FileResult<GroupTarget> {
        let mut target = GroupTarget {
            group_code: replace_reserved(group_code.trim()),
            project_name: None,
        };
        let Some(project_id) = project_id.filter(|id| *id > 0) else {
            return Ok(target);
        };

        let project = sqlx::query_as::<_, Project>(
            "SELECT id, owner_id, name, code FROM projects WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(project_id)
        .fetch_optional(&*self.db)
        .await?;
        let Some(project) = project else {
            return Ok(target);
        };
        target.project_name = project.folder_name().map(replace_reserved);

        if is_placeholder_code(&target.group_code) {
            let owner = self.owner(project.owner_id).await?;
            if let Some(better) = owner.as_ref().and_then(owner_namespace) {
                info!("upgrading placeholder group code {} to {}", target.group_code, better);
                target.group_code = replace_reserved(&better);
            }
        }
        Ok(target)
    }

    /// Check that `actor` may write into the group namespace of `owner_id`
    /// and that `group_code` and `project_id` both belong to that owner.
    /// A placeholder code resolves to the owner's own namespace.
    pub async fn authorize_group(
        &self,
        actor: &Actor,
        owner_id: i64,
        group_code: &str,
        project_id: Option<i64>,
    ) -> FileResult<GroupTarget> {
        let owner = self
            .owner(owner_id)
            .await?
            .filter(|owner| owner.deleted_at.is_none())
            .ok_or_else(|| FileError::NotFound(format!("owner {}", owner_id)))?;
        if !self.policy.authorize(actor, &owner, Action::Edit).await {
            return Err(FileError::PermissionDenied(format!(
                "upload into the group of owner {}",
                owner_id
            )));
        }

        if let Some(project_id) = project_id.filter(|id| *id > 0) {
            let project_owner: Option<i64> = sqlx::query_scalar(
                "SELECT owner_id FROM projects WHERE id = ? AND deleted_at IS NULL",
            )
            .bind(project_id)
            .fetch_optional(&*self.db)
            .await?;
            if project_owner.is_some_and(|id| id != owner_id) {
                return Err(FileError::PermissionDenied(format!(
                    "project {} does not belong to owner {}",
                    project_id, owner_id
                )));
            }
        }

        let mut target = self.resolve_target(group_code, project_id).await?;
        let namespace = owner_namespace(&owner).map(|ns| replace_reserved(&ns));
        if is_placeholder_code(&target.group_code) {
            if let Some(namespace) = &namespace {
                target.group_code = namespace.clone();
            }
        }
        if namespace.as_ref() != Some(&target.group_code) {
            return Err(FileError::PermissionDenied(format!(
                "group `{}` does not belong to owner {}",
                target.group_code, owner_id
            )));
        }
        Ok(target)
    }

    /// Storage key for a single direct upload, after the same checks a
    /// folder plan runs.
    pub async fn direct_key(
        &self,
        actor: &Actor,
        target: &DirectUploadTarget,
    ) -> FileResult<String> {
        if target.group_code.trim().is_empty() {
            return Err(FileError::Validation("group code is required".into()));
        }
        if target
            .rel_path
            .replace('\\', "/")
            .split('/')
            .all(|segment| segment.trim().is_empty())
        {
            return Err(FileError::Validation("relative path is required".into()));
        }
        let group = self
            .authorize_group(actor, target.owner_id, &target.group_code, target.project_id)
            .await?;
        Ok(group_storage_key(&group, target.asset_type, &target.rel_path))
    }

    async fn owner(&self, owner_id: i64) -> FileResult<Option<Owner>> {
        Ok(sqlx::query_as::<_, Owner>(
            "SELECT id, name, group_code, group_name, deleted_at FROM owners WHERE id = ?",
        )
        .bind(owner_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Open every session the request needs. If one fails, sessions already
    /// opened for this request are aborted before the error is returned.
    pub async fn plan(
        &self,
        actor: &Actor,
        request: &FolderUploadRequest,
    ) -> FileResult<FolderUploadPlan> {
        if request.group_code.trim().is_empty() {
            return Err(FileError::Validation("group code is required".into()));
        }
        if request.files.is_empty() {
            return Err(FileError::Validation("no files to upload".into()));
        }
        let uploader = self
            .uploader
            .as_ref()
            .ok_or(FileError::Storage(StorageError::Unsupported("multipart upload")))?;

        let target = self
            .authorize_group(actor, request.owner_id, &request.group_code, request.project_id)
            .await?;
        let mut sessions: Vec<PlannedFile> = Vec::new();

        for (index, entry) in request.files.iter().enumerate() {
            if entry.filename.trim().is_empty() || entry.filesize <= 0 {
                continue;
            }
            let rel_path = if entry.rel_path.trim().is_empty() {
                entry.filename.as_str()
            } else {
                entry.rel_path.as_str()
            };
            let storage_key = group_storage_key(&target, request.asset_type, rel_path);
            let size = entry.filesize as u64;
            let content_type = entry
                .mime_type
                .as_deref()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or("application/octet-stream");

            let transfer = if size > self.upload.multipart_threshold {
                uploader
                    .open_session(&storage_key, content_type, size, self.upload.part_size)
                    .await
                    .map(|session| TransferPlan::Multipart {
                        upload_id: session.upload_id,
                        part_size: session.part_size,
                        total_parts: session.total_parts,
                    })
            } else {
                uploader
                    .single_put_url(&storage_key, None)
                    .map(|url| TransferPlan::Single { url })
            };

            match transfer {
                Ok(transfer) => sessions.push(PlannedFile {
                    index,
                    rel_path: entry.rel_path.clone(),
                    filename: entry.filename.clone(),
                    storage_key,
                    transfer,
                }),
                Err(err) => {
                    self.abort_opened(uploader, &sessions).await;
                    return Err(err.into());
                }
            }
        }

        info!(
            "planned folder upload into {} with {} files",
            target.group_code,
            sessions.len()
        );
        Ok(FolderUploadPlan {
            total_files: sessions.len(),
            group_code: target.group_code,
            sessions,
        })
    }

    async fn abort_opened(&self, uploader: &MultipartUploader, sessions: &[PlannedFile]) {
        for planned in sessions {
            if let TransferPlan::Multipart { upload_id, .. } = &planned.transfer {
                if let Err(err) = uploader.abort(&planned.storage_key, upload_id).await {
                    warn!(
                        "failed to abort upload {} for {}: {}",
                        upload_id, planned.storage_key, err
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        services::{
            access::AllowAll,
            storage::{S3Client, fake_s3::FakeS3},
        },
    };
    use async_trait::async_trait;

    /// Lets each actor write only into the owner with the same id.
    struct OwnerOnly;

    #[async_trait]
    impl AccessPolicy for OwnerOnly {
        async fn authorize(&self, actor: &Actor, owner: &Owner, _action: Action) -> bool {
            actor.id == owner.id
        }
    }

    fn entry(rel_path: &str, filename: &str, filesize: i64) -> FolderFileEntry {
        FolderFileEntry {
            rel_path: rel_path.into(),
            filename: filename.into(),
            filesize,
            mime_type: None,
        }
    }

    async fn setup_planner(fake: Option<&FakeS3>) -> FolderUploadPlanner {
        setup_planner_with(fake, Arc::new(AllowAll)).await
    }

    async fn setup_planner_with(
        fake: Option<&FakeS3>,
        policy: Arc<dyn AccessPolicy>,
    ) -> FolderUploadPlanner {
        let pool = db::test_pool().await;
        sqlx::query("INSERT INTO owners (id, name, group_code) VALUES (1, 'Acme', 'Q2025010301')")
            .execute(&*pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO owners (id, name) VALUES (2, 'Bare Owner')")
            .execute(&*pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO projects (id, owner_id, name, code)
             VALUES (10, 1, 'Spring: Launch', 'PRJ-10'), (11, 2, NULL, 'PRJ-11')",
        )
        .execute(&*pool)
        .await
        .unwrap();

        let uploader = fake.map(|fake| {
            MultipartUploader::new(Arc::new(S3Client::new(fake.config()).unwrap()), 600)
        });
        FolderUploadPlanner::new(
            pool,
            uploader,
            UploadConfig {
                part_size: 4,
                multipart_threshold: 5,
                part_url_ttl_secs: 600,
            },
            policy,
        )
    }

    fn direct(
        owner_id: i64,
        group_code: &str,
        project_id: Option<i64>,
        rel_path: &str,
    ) -> DirectUploadTarget {
        DirectUploadTarget {
            owner_id,
            group_code: group_code.into(),
            asset_type: AssetType::Works,
            project_id,
            rel_path: rel_path.into(),
        }
    }

    #[test]
    fn test_group_storage_key_layout() {
        let target = GroupTarget {
            group_code: "Q2025010301".into(),
            project_name: Some("Launch".into()),
        };
        assert_eq!(
            group_storage_key(&target, AssetType::Works, "/shots/a.png"),
            "groups/Q2025010301/Launch/works/shots/a.png"
        );
        assert_eq!(
            group_storage_key(&target, AssetType::Info, "a.png"),
            "groups/Q2025010301/info/a.png"
        );
        assert_eq!(
            group_storage_key(&target, AssetType::Customer, "x\\..\\b?.txt"),
            "groups/Q2025010301/Launch/customer-files/x/_/b_.txt"
        );
    }

    #[test]
    fn test_placeholder_detection() {
        assert!(is_placeholder_code("P123"));
        assert!(!is_placeholder_code("P"));
        assert!(!is_placeholder_code("Q2025010301"));
        assert!(!is_placeholder_code("P12a"));
        assert_eq!(AssetType::parse("unknown"), AssetType::Works);
    }

    #[tokio::test]
    async fn test_resolve_target_upgrades_placeholder() {
        let planner = setup_planner(None).await;

        let target = planner.resolve_target("P77", Some(10)).await.unwrap();
        assert_eq!(target.group_code, "Q2025010301");
        assert_eq!(target.project_name.as_deref(), Some("Spring_ Launch"));

        // owner without a group code falls back to its name; project to its code
        let target = planner.resolve_target("P78", Some(11)).await.unwrap();
        assert_eq!(target.group_code, "Bare Owner");
        assert_eq!(target.project_name.as_deref(), Some("PRJ-11"));

        // real codes are never replaced
        let target = planner.resolve_target("Q2024123101", Some(10)).await.unwrap();
        assert_eq!(target.group_code, "Q2024123101");

        let target = planner.resolve_target("P79", Some(999)).await.unwrap();
        assert_eq!(target.group_code, "P79");
        assert_eq!(target.project_name, None);
    }

    #[tokio::test]
    async fn test_plan_mixes_multipart_and_single() {
        let fake = FakeS3::spawn().await;
        let planner = setup_planner(Some(&fake)).await;

        let request = FolderUploadRequest {
            owner_id: 1,
            group_code: "P1".into(),
            asset_type: AssetType::Models,
            project_id: Some(10),
            files: vec![
                entry("scene/big.blend", "big.blend", 11),
                entry("", "small.txt", 3),
                entry("scene/empty.bin", "empty.bin", 0),
                entry("scene/noname", "", 9),
            ],
        };
        let plan = planner.plan(&Actor::new(7), &request).await.unwrap();

        assert_eq!(plan.group_code, "Q2025010301");
        assert_eq!(plan.total_files, 2);

        let big = &plan.sessions[0];
        assert_eq!(big.index, 0);
        assert_eq!(big.storage_key, "groups/Q2025010301/Spring_ Launch/models/scene/big.blend");
        match &big.transfer {
            TransferPlan::Multipart {
                upload_id,
                part_size,
                total_parts,
            } => {
                assert_eq!(*part_size, 4);
                assert_eq!(*total_parts, 3);
                assert!(fake.has_upload(upload_id));
            }
            other => panic!("expected multipart, got {other:?}"),
        }

        let small = &plan.sessions[1];
        assert_eq!(small.index, 1);
        assert_eq!(small.storage_key, "groups/Q2025010301/Spring_ Launch/models/small.txt");
        match &small.transfer {
            TransferPlan::Single { url } => assert!(url.contains("X-Amz-Signature=")),
            other => panic!("expected single, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_plan_requires_s3_and_input() {
        let planner = setup_planner(None).await;
        let actor = Actor::new(7);
        let request = FolderUploadRequest {
            owner_id: 1,
            group_code: "Q2025010301".into(),
            asset_type: AssetType::Works,
            project_id: None,
            files: vec![entry("a.txt", "a.txt", 1)],
        };
        assert!(matches!(
            planner.plan(&actor, &request).await,
            Err(FileError::Storage(StorageError::Unsupported(_)))
        ));

        let empty = FolderUploadRequest {
            files: Vec::new(),
            ..request.clone()
        };
        assert!(matches!(planner.plan(&actor, &empty).await, Err(FileError::Validation(_))));
    }

    #[tokio::test]
    async fn test_plan_rejects_foreign_group() {
        let fake = FakeS3::spawn().await;
        let planner = setup_planner(Some(&fake)).await;
        let request = FolderUploadRequest {
            owner_id: 2,
            group_code: "Q2025010301".into(),
            asset_type: AssetType::Works,
            project_id: None,
            files: vec![entry("big.bin", "big.bin", 11)],
        };
        assert!(matches!(
            planner.plan(&Actor::new(7), &request).await,
            Err(FileError::PermissionDenied(_))
        ));
        assert!(fake.requests().is_empty());
    }

    #[tokio::test]
    async fn test_direct_key_is_derived_and_bound_to_owner() {
        let planner = setup_planner_with(None, Arc::new(OwnerOnly)).await;
        let owner_one = Actor::new(1);

        assert_eq!(
            planner
                .direct_key(&owner_one, &direct(1, "Q2025010301", Some(10), "shots/../a.png"))
                .await
                .unwrap(),
            "groups/Q2025010301/Spring_ Launch/works/shots/_/a.png"
        );
        // a placeholder resolves to the owner's own namespace
        assert_eq!(
            planner.direct_key(&owner_one, &direct(1, "P5", None, "a.png")).await.unwrap(),
            "groups/Q2025010301/works/a.png"
        );
        let owner_two = Actor::new(2);
        assert_eq!(
            planner.direct_key(&owner_two, &direct(2, "P6", None, "a.png")).await.unwrap(),
            "groups/Bare Owner/works/a.png"
        );

        // another owner's group code, project or files
        assert!(matches!(
            planner.direct_key(&owner_two, &direct(2, "Q2025010301", None, "a.png")).await,
            Err(FileError::PermissionDenied(_))
        ));
        assert!(matches!(
            planner.direct_key(&owner_two, &direct(2, "P6", Some(10), "a.png")).await,
            Err(FileError::PermissionDenied(_))
        ));
        assert!(matches!(
            planner.direct_key(&owner_two, &direct(1, "Q2025010301", None, "a.png")).await,
            Err(FileError::PermissionDenied(_))
        ));

        assert!(matches!(
            planner.direct_key(&owner_one, &direct(99, "Q1", None, "a.png")).await,
            Err(FileError::NotFound(_))
        ));
        assert!(matches!(
            planner.direct_key(&owner_one, &direct(1, "Q2025010301", None, " / ")).await,
            Err(FileError::Validation(_))
        ));
    }
}
