use anyhow::Result;
use axum::Router;
use std::{env, fs, io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use handlers::AppState;
use services::{
    access::{AccessPolicy, AllowAll},
    file_service::FileService,
    folder_upload::FolderUploadPlanner,
    multipart::MultipartUploader,
    sequence::SequenceGenerator,
    storage::StorageProvider,
};

/// Slack on top of the batch byte limit for multipart form framing and text fields.
const FORM_OVERHEAD: u64 = 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting file-vault with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url, 5).await?;

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Storage backend ---
    let storage = StorageProvider::from_settings(&cfg.settings)?;
    if let Some(root) = storage.local_root() {
        if !root.exists() {
            fs::create_dir_all(root)?;
            tracing::info!("Created storage directory at {}", root.display());
        }
    }
    tracing::info!("Using {} storage backend", storage.disk());

    let work_dir = env::temp_dir().join("file-vault");
    fs::create_dir_all(&work_dir)?;

    // --- Initialize services ---
    let policy: Arc<dyn AccessPolicy> = Arc::new(AllowAll);
    let part_url_ttl = cfg.settings.upload.part_url_ttl_secs;
    let uploader = storage
        .s3_client()
        .map(|client| MultipartUploader::new(client.clone(), part_url_ttl));
    let files = FileService::new(db.clone(), storage, policy.clone(), &cfg.settings, work_dir);
    let state = AppState {
        db: db.clone(),
        files,
        folders: FolderUploadPlanner::new(
            db.clone(),
            uploader,
            cfg.settings.upload.clone(),
            policy,
        ),
        sequences: SequenceGenerator::new(db.clone()),
        upload: cfg.settings.upload.clone(),
    };

    // --- Build router ---
    let form_limit = cfg.settings.limits.folder.max_total_bytes.saturating_add(FORM_OVERHEAD);
    let upload_limit = usize::try_from(form_limit).unwrap_or(usize::MAX);
    let app: Router = routes::routes::routes(upload_limit).with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
