use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::{env, fmt, fs, path::PathBuf, str::FromStr};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Centralized application configuration.
/// Combines an optional TOML file, environment variables and CLI arguments,
/// in increasing order of precedence.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub settings: Settings,
}

/// Everything below the bind address: storage backend, limits and upload tuning.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageConfig,
    pub limits: Limits,
    pub upload: UploadConfig,
    pub preview: PreviewConfig,
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    #[default]
    Local,
    S3,
}

impl FromStr for StorageDriver {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            other => anyhow::bail!("unknown storage driver `{}` (expected local or s3)", other),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub driver: StorageDriver,
    pub local: LocalConfig,
    pub s3: S3Config,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory that stored objects are resolved under.
    pub root: PathBuf,
    /// Public base URL the root is served from, if any.
    pub base_url: Option<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/storage"),
            base_url: None,
        }
    }
}

/// Connection settings for an S3-compatible endpoint.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// `scheme://host[:port][/base]`. Absent means AWS virtual hosting.
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    /// Prefix applied to every storage key, without surrounding slashes.
    pub prefix: String,
    /// Explicit scheme choice; falls back to the endpoint's scheme.
    pub use_https: Option<bool>,
    pub use_path_style: bool,
    pub timeout_secs: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".into(),
            bucket: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            session_token: None,
            prefix: String::new(),
            use_https: None,
            use_path_style: true,
            timeout_secs: 60,
        }
    }
}

impl S3Config {
    pub fn use_https(&self) -> bool {
        match (self.use_https, self.endpoint.as_deref()) {
            (Some(explicit), _) => explicit,
            (None, Some(endpoint)) => !endpoint.trim().starts_with("http://"),
            (None, None) => true,
        }
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("prefix", &self.prefix)
            .field("use_https", &self.use_https())
            .field("use_path_style", &self.use_path_style)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Upload, folder and zip limits. A zero `max_customer_total` disables the quota.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_single_size: u64,
    pub max_customer_total: u64,
    /// Lower-case extensions without dot. Empty allows everything.
    pub allowed_extensions: Vec<String>,
    pub preview_mimes: Vec<String>,
    pub folder: FolderLimits,
    pub zip: ZipLimits,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_single_size: 2 * GIB,
            max_customer_total: 10 * GIB,
            allowed_extensions: Vec::new(),
            preview_mimes: [
                "image/jpeg",
                "image/png",
                "image/gif",
                "image/webp",
                "image/bmp",
                "application/pdf",
                "video/mp4",
                "video/quicktime",
                "video/x-msvideo",
                "video/webm",
                "audio/mpeg",
                "audio/mp3",
                "audio/wav",
                "audio/ogg",
                "audio/webm",
                "audio/x-m4a",
                "audio/mp4",
                "audio/aac",
                "audio/flac",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            folder: FolderLimits::default(),
            zip: ZipLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FolderLimits {
    pub max_files: usize,
    pub max_total_bytes: u64,
    pub max_depth: usize,
    pub max_segment_length: usize,
}

impl Default for FolderLimits {
    fn default() -> Self {
        Self {
            max_files: 500,
            max_total_bytes: 2 * GIB,
            max_depth: 5,
            max_segment_length: 40,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ZipLimits {
    pub max_files: usize,
    pub max_total_bytes: u64,
}

impl Default for ZipLimits {
    fn default() -> Self {
        Self {
            max_files: 800,
            max_total_bytes: 5 * GIB,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub part_size: u64,
    /// Files strictly larger than this get a multipart session.
    pub multipart_threshold: u64,
    pub part_url_ttl_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: 50 * MIB,
            multipart_threshold: 5 * MIB,
            part_url_ttl_secs: 3600,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Key for preview capability tokens. Generated per process when unset.
    pub secret: Option<String>,
    pub ttl_secs: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ttl_secs: 300,
        }
    }
}

impl fmt::Debug for PreviewConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub ffmpeg_path: String,
    pub transcode: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".into(),
            transcode: true,
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "File vault: storage abstraction and file management API")]
pub struct Args {
    /// Host to bind to (overrides FILE_VAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_VAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides FILE_VAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage backend, `local` or `s3` (overrides STORAGE_DRIVER)
    #[arg(long)]
    pub storage_driver: Option<String>,

    /// TOML settings file (overrides FILE_VAULT_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        Self::from_sources(args, |key| env::var(key).ok())
    }

    /// Merge CLI args over a variable lookup. The lookup stands in for the
    /// process environment so tests can drive it without mutating globals.
    pub fn from_sources(
        args: Args,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, bool)> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // --- TOML base ---
        let config_path = args
            .config
            .clone()
            .or_else(|| var("FILE_VAULT_CONFIG").map(PathBuf::from));
        let mut settings = match config_path {
            Some(path) => {
                let raw = fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str::<Settings>(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Settings::default(),
        };

        // --- Environment overrides ---
        if let Some(driver) = var("STORAGE_DRIVER") {
            settings.storage.driver = driver.parse()?;
        }
        if let Some(root) = var("FILE_VAULT_LOCAL_ROOT") {
            settings.storage.local.root = PathBuf::from(root);
        }
        if let Some(base_url) = var("FILE_VAULT_LOCAL_BASE_URL") {
            settings.storage.local.base_url = Some(base_url);
        }

        let s3 = &mut settings.storage.s3;
        if let Some(endpoint) = var("S3_ENDPOINT") {
            s3.endpoint = Some(endpoint);
        }
        if let Some(region) = var("S3_REGION") {
            s3.region = region;
        }
        if let Some(bucket) = var("S3_BUCKET") {
            s3.bucket = bucket;
        }
        if let Some(access_key) = var("S3_ACCESS_KEY") {
            s3.access_key = access_key;
        }
        if let Some(secret_key) = var("S3_SECRET_KEY") {
            s3.secret_key = secret_key;
        }
        if let Some(token) = var("S3_SESSION_TOKEN") {
            s3.session_token = Some(token);
        }
        if let Some(prefix) = lookup("S3_PREFIX") {
            s3.prefix = prefix.trim().trim_matches('/').to_string();
        }
        if let Some(flag) = var("S3_USE_HTTPS") {
            s3.use_https = Some(flag.trim() == "1");
        }
        if let Some(flag) = var("S3_USE_PATH_STYLE") {
            s3.use_path_style = flag.trim() != "0";
        }
        if let Some(timeout) = var("S3_TIMEOUT") {
            s3.timeout_secs = parse_var("S3_TIMEOUT", &timeout)?;
        }

        if let Some(value) = var("FILE_VAULT_MAX_SINGLE_SIZE") {
            settings.limits.max_single_size = parse_var("FILE_VAULT_MAX_SINGLE_SIZE", &value)?;
        }
        if let Some(value) = var("FILE_VAULT_MAX_CUSTOMER_TOTAL") {
            settings.limits.max_customer_total =
                parse_var("FILE_VAULT_MAX_CUSTOMER_TOTAL", &value)?;
        }
        if let Some(value) = var("FILE_VAULT_ALLOWED_EXTENSIONS") {
            settings.limits.allowed_extensions = value
                .split(',')
                .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect();
        }
        if let Some(secret) = var("FILE_VAULT_PREVIEW_SECRET") {
            settings.preview.secret = Some(secret);
        }
        if let Some(path) = var("FILE_VAULT_FFMPEG") {
            settings.audio.ffmpeg_path = path;
        }

        // --- CLI overrides ---
        if let Some(driver) = args.storage_driver.as_deref() {
            settings.storage.driver = driver.parse()?;
        }

        let env_port = match var("FILE_VAULT_PORT") {
            Some(value) => parse_var("FILE_VAULT_PORT", &value)?,
            None => 3000,
        };

        let cfg = Self {
            host: args
                .host
                .or_else(|| var("FILE_VAULT_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: args.port.unwrap_or(env_port),
            database_url: args
                .database_url
                .or_else(|| var("FILE_VAULT_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/file_vault.db".into()),
            settings,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("parsing {} value `{}`", name, value))
}
