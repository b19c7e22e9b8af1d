//! Name, folder-path and storage-key rules.

use crate::{
    errors::{FileError, FileResult},
    models::file::Category,
};
use chrono::{DateTime, NaiveDate, Utc};

pub const MAX_FILENAME_CHARS: usize = 120;
const MAX_FOLDER_PATH_CHARS: usize = 255;
const MAX_SHORT_NAME_CHARS: usize = 20;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "heic", "heif", "tif", "tiff",
];
const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "avi", "mkv", "flv", "wmv", "m4v", "mpeg", "mpg", "ts",
];
pub const RECORDING_EXTENSIONS: &[&str] = &["webm", "wav", "ogg", "m4a", "aac"];

/// Coarse content class, used to prefix ordinary customer uploads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentKind {
    Image,
    Video,
    Other,
}

impl ContentKind {
    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Self::Image
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Self::Video
        } else {
            Self::Other
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Other => "file",
        }
    }
}

/// Where an upload came from. Two sources get a fixed folder and prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum UploadSource {
    #[default]
    Standard,
    FirstContact,
    Objection,
}

impl UploadSource {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("first_contact") | Some("first-contact") => Self::FirstContact,
            Some("objection") => Self::Objection,
            _ => Self::Standard,
        }
    }

    /// Folder that uploads from this source are forced into, also used as
    /// the filename prefix.
    pub fn special_folder(self) -> Option<&'static str> {
        match self {
            Self::Standard => None,
            Self::FirstContact => Some("first-contact"),
            Self::Objection => Some("objection"),
        }
    }
}

/// Last component of a client-supplied name, whichever separator it used.
pub fn base_name(raw: &str) -> &str {
    raw.rsplit(['/', '\\']).next().unwrap_or(raw)
}

/// `(stem, lower-case extension)`. The extension is empty when there is no dot.
pub fn split_extension(name: &str) -> (&str, String) {
    match name.rfind('.') {
        Some(pos) => (&name[..pos], name[pos + 1..].to_ascii_lowercase()),
        None => (name, String::new()),
    }
}

/// Replace separators and reserved characters with `-`, drop control characters.
pub fn sanitize_filename_base(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*' => '-',
            other => other,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Make a segment safe to embed in a storage key.
pub fn sanitize_key_segment(segment: &str) -> String {
    segment
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .replace("..", "-")
        .replace(['/', '\\'], "-")
}

/// Replace characters that are reserved on common filesystems with `_`.
pub fn replace_reserved(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}

/// Cut a filename to `limit` characters, keeping its extension.
pub fn ensure_filename_length(filename: &str, limit: usize) -> String {
    if filename.chars().count() <= limit {
        return filename.to_string();
    }
    match filename.rfind('.') {
        None => filename.chars().take(limit).collect(),
        Some(pos) => {
            let ext = &filename[pos..];
            let base_limit = limit.saturating_sub(ext.chars().count()).max(1);
            let base: String = filename[..pos].chars().take(base_limit).collect();
            format!("{}{}", base, ext)
        }
    }
}

/// Normalize a client folder path: `\` becomes `/`, empty segments vanish,
/// each segment is sanitized and `..` is neutralized.
pub fn sanitize_folder_path(
    raw: &str,
    max_depth: usize,
    max_segment_len: usize,
) -> FileResult<String> {
    let raw = raw.trim().replace('\\', "/");
    let segments: Vec<&str> = raw
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if segments.is_empty() {
        return Ok(String::new());
    }
    if segments.len() > max_depth {
        return Err(FileError::Validation(format!(
            "folder `{}` is nested deeper than {} levels",
            raw, max_depth
        )));
    }

    let mut normalized = Vec::with_capacity(segments.len());
    for segment in segments {
        let mut clean = sanitize_filename_base(segment).replace("..", "-");
        if clean.is_empty() || clean == "." {
            clean = "-".into();
        }
        if clean.chars().count() > max_segment_len {
            return Err(FileError::Validation(format!(
                "folder name `{}` is longer than {} characters",
                segment, max_segment_len
            )));
        }
        normalized.push(clean);
    }

    let path = normalized.join("/");
    if path.chars().count() > MAX_FOLDER_PATH_CHARS {
        return Err(FileError::Validation(format!(
            "folder path is longer than {} characters",
            MAX_FOLDER_PATH_CHARS
        )));
    }
    Ok(path)
}

/// Final stored name for an upload, before de-duplication.
///
/// Special sources prefix their folder name; ordinary customer-material
/// uploads get a content prefix; folder uploads keep the name verbatim.
pub fn final_filename(
    original: &str,
    category: Category,
    is_folder_upload: bool,
    source: UploadSource,
    now: DateTime<Utc>,
) -> String {
    let (stem, ext) = split_extension(base_name(original));
    let mut base = sanitize_filename_base(stem);

    if let Some(folder) = source.special_folder() {
        base = format!("{}-{}", folder, base);
    } else if category == Category::ClientMaterial && !is_folder_upload {
        base = format!("{}-{}", ContentKind::from_extension(&ext).prefix(), base);
    }
    if base.is_empty() {
        base = format!("file-{}", now.format("%H%M%S"));
    }

    let name = if ext.is_empty() {
        base
    } else {
        format!("{}.{}", base, ext)
    };
    ensure_filename_length(&name, MAX_FILENAME_CHARS)
}

/// `stem(n).ext`. The stem is shortened first so the counter and the
/// extension always survive the length cap.
pub fn numbered(filename: &str, n: u32) -> String {
    let (stem, ext) = match filename.rfind('.') {
        Some(pos) => (&filename[..pos], &filename[pos..]),
        None => (filename, ""),
    };
    let suffix = format!("({})", n);
    let stem_limit = MAX_FILENAME_CHARS
        .saturating_sub(suffix.chars().count() + ext.chars().count())
        .max(1);
    let stem: String = stem.chars().take(stem_limit).collect();
    format!("{}{}{}", stem, suffix, ext)
}

/// Check a user-chosen filename for a rename.
pub fn validate_new_filename(raw: &str) -> FileResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(FileError::Validation("filename must not be empty".into()));
    }
    if name == "." || name == ".." {
        return Err(FileError::Validation(format!("`{}` is not a valid filename", name)));
    }
    let illegal = |c: char| {
        c.is_control() || matches!(c, '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*')
    };
    if name.chars().any(illegal) {
        return Err(FileError::Validation("filename contains illegal characters".into()));
    }
    Ok(ensure_filename_length(name, MAX_FILENAME_CHARS))
}

/// Check a new folder name (a single segment).
pub fn validate_folder_name(raw: &str, max_segment_len: usize) -> FileResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(FileError::Validation("folder name must not be empty".into()));
    }
    if sanitize_key_segment(name) != name
        || sanitize_filename_base(name) != name
        || name == "."
    {
        return Err(FileError::Validation("folder name contains illegal characters".into()));
    }
    if name.chars().count() > max_segment_len {
        return Err(FileError::Validation(format!(
            "folder name is longer than {} characters",
            max_segment_len
        )));
    }
    Ok(name.to_string())
}

/// Owner name reduced to letters, digits and `-`, at most 20 characters.
pub fn short_name(name: &str, owner_id: i64) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .take(MAX_SHORT_NAME_CHARS)
        .collect();
    if cleaned.is_empty() {
        format!("customer-{}", owner_id)
            .chars()
            .take(MAX_SHORT_NAME_CHARS)
            .collect()
    } else {
        cleaned
    }
}

/// Per-day owner folder, `MMDD-shortname`.
pub fn owner_day_folder(short: &str, day: NaiveDate) -> String {
    format!("{}-{}", day.format("%m%d"), short)
}

/// `customer/{owner}/{day folder}/{category dir}/{folder...}/{filename}`.
pub fn customer_storage_key(
    owner_id: i64,
    day_folder: &str,
    category: Category,
    folder_path: &str,
    filename: &str,
) -> String {
    let mut segments = vec![
        "customer".to_string(),
        owner_id.to_string(),
        day_folder.to_string(),
        category.storage_dir().to_string(),
    ];
    segments.extend(
        folder_path
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(sanitize_key_segment),
    );
    segments.push(sanitize_key_segment(filename));
    segments.join("/")
}

/// Voice recordings from the first-contact source.
pub fn is_recording(original: &str, source: UploadSource, ext: &str) -> bool {
    if source != UploadSource::FirstContact || !RECORDING_EXTENSIONS.contains(&ext) {
        return false;
    }
    let name = base_name(original).to_lowercase();
    name.starts_with("recording") || name.starts_with("first-contact-recording")
}

/// `path` relative to `scope`; paths outside the scope are returned whole.
pub fn relative_to(path: &str, scope: Option<&str>) -> String {
    let path = path.trim_matches('/');
    let scope = scope.map(|s| s.trim_matches('/')).unwrap_or_default();
    if scope.is_empty() {
        return path.to_string();
    }
    if path == scope || path.is_empty() {
        return String::new();
    }
    match path.strip_prefix(scope).and_then(|rest| rest.strip_prefix('/')) {
        Some(rest) => rest.to_string(),
        None => path.to_string(),
    }
}

/// Parent of a slash path, empty at the top.
pub fn parent_path(path: &str) -> &str {
    path.trim_matches('/')
        .rsplit_once('/')
        .map(|(parent, _)| parent)
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 3, 12, 34, 56).unwrap()
    }

    #[test]
    fn test_final_filename_prefixes() {
        let cm = Category::ClientMaterial;
        assert_eq!(
            final_filename("IMG_1.JPG", cm, false, UploadSource::Standard, noon()),
            "image-IMG_1.jpg"
        );
        assert_eq!(
            final_filename("clip.mov", cm, false, UploadSource::Standard, noon()),
            "video-clip.mov"
        );
        assert_eq!(
            final_filename("notes.txt", cm, false, UploadSource::Standard, noon()),
            "file-notes.txt"
        );
        // folder uploads and internal files keep their names
        assert_eq!(
            final_filename("dir/IMG_1.jpg", cm, true, UploadSource::Standard, noon()),
            "IMG_1.jpg"
        );
        assert_eq!(
            final_filename(
                "plan.pdf",
                Category::InternalSolution,
                false,
                UploadSource::Standard,
                noon()
            ),
            "plan.pdf"
        );
        assert_eq!(
            final_filename("call.webm", cm, true, UploadSource::FirstContact, noon()),
            "first-contact-call.webm"
        );
        assert_eq!(
            final_filename("x.doc", cm, false, UploadSource::Objection, noon()),
            "objection-x.doc"
        );
    }

    #[test]
    fn test_final_filename_empty_and_reserved() {
        let internal = Category::InternalSolution;
        assert_eq!(
            final_filename(".png", internal, false, UploadSource::Standard, noon()),
            "file-123456.png"
        );
        assert_eq!(
            final_filename("a:b*c?.txt", internal, false, UploadSource::Standard, noon()),
            "a-b-c-.txt"
        );
    }

    #[test]
    fn test_length_cap_keeps_extension() {
        let long = format!("{}.jpeg", "x".repeat(200));
        let capped = ensure_filename_length(&long, MAX_FILENAME_CHARS);
        assert_eq!(capped.chars().count(), MAX_FILENAME_CHARS);
        assert!(capped.ends_with(".jpeg"));

        let numbered_name = numbered(&capped, 12);
        assert_eq!(numbered_name.chars().count(), MAX_FILENAME_CHARS);
        assert!(numbered_name.ends_with("(12).jpeg"));
        assert_eq!(numbered("a.jpg", 2), "a(2).jpg");
        assert_eq!(numbered("README", 3), "README(3)");

        let bare = "y".repeat(MAX_FILENAME_CHARS);
        let bare_numbered = numbered(&bare, 2);
        assert_eq!(bare_numbered.chars().count(), MAX_FILENAME_CHARS);
        assert!(bare_numbered.ends_with("(2)"));
    }

    #[test]
    fn test_numbered_always_differs_from_capped_name() {
        let long = format!("{}.jpeg", "x".repeat(300));
        let capped = ensure_filename_length(&long, MAX_FILENAME_CHARS);
        for n in [2, 3, 99, 1000] {
            assert_ne!(numbered(&capped, n), capped);
        }
        assert_ne!(numbered(&capped, 2), numbered(&capped, 3));
    }

    #[test]
    fn test_sanitize_folder_path() {
        assert_eq!(sanitize_folder_path(" a\\b//c/ ", 5, 40).unwrap(), "a/b/c");
        assert_eq!(sanitize_folder_path("", 5, 40).unwrap(), "");
        assert_eq!(sanitize_folder_path("../x/..", 5, 40).unwrap(), "-/x/-");
        assert!(sanitize_folder_path("1/2/3/4/5/6", 5, 40).is_err());
        assert!(sanitize_folder_path(&"y".repeat(41), 5, 40).is_err());
    }

    #[test]
    fn test_validate_names() {
        assert_eq!(validate_new_filename("  report.pdf ").unwrap(), "report.pdf");
        assert!(validate_new_filename("").is_err());
        assert!(validate_new_filename("a/b.pdf").is_err());
        assert!(validate_new_filename("..").is_err());

        assert_eq!(validate_folder_name("Drafts", 40).unwrap(), "Drafts");
        assert!(validate_folder_name("a/b", 40).is_err());
        assert!(validate_folder_name("a..b", 40).is_err());
        assert!(validate_folder_name("x".repeat(41).as_str(), 40).is_err());
    }

    #[test]
    fn test_short_name_and_day_folder() {
        assert_eq!(short_name("Acme Trading Co.", 7), "AcmeTradingCo");
        assert_eq!(short_name("  ", 7), "customer-7");
        assert_eq!(short_name("北京 设计-工作室", 1), "北京设计-工作室");
        assert_eq!(short_name(&"z".repeat(50), 1).chars().count(), 20);

        let day = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        assert_eq!(owner_day_folder("Acme", day), "0309-Acme");
    }

    #[test]
    fn test_customer_storage_key() {
        assert_eq!(
            customer_storage_key(42, "0309-Acme", Category::ClientMaterial, "", "a.jpg"),
            "customer/42/0309-Acme/customer-files/a.jpg"
        );
        assert_eq!(
            customer_storage_key(42, "0309-Acme", Category::InternalSolution, "x/../y", "b.txt"),
            "customer/42/0309-Acme/company-files/x/-/y/b.txt"
        );
    }

    #[test]
    fn test_recording_detection() {
        assert!(is_recording("recording-001.webm", UploadSource::FirstContact, "webm"));
        assert!(is_recording("Recording.wav", UploadSource::FirstContact, "wav"));
        assert!(!is_recording("recording.webm", UploadSource::Standard, "webm"));
        assert!(!is_recording("memo.webm", UploadSource::FirstContact, "webm"));
        assert!(!is_recording("recording.mp3", UploadSource::FirstContact, "mp3"));
    }

    #[test]
    fn test_scope_helpers() {
        assert_eq!(relative_to("a/b/c", Some("a")), "b/c");
        assert_eq!(relative_to("a", Some("a")), "");
        assert_eq!(relative_to("a/b", None), "a/b");
        assert_eq!(relative_to("z/b", Some("a")), "z/b");

        assert_eq!(parent_path("a/b/c"), "a/b");
        assert_eq!(parent_path("a"), "");
    }
}
