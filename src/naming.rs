use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

pub const FALLBACK_CATEGORY: &str = "Other";
const MAX_FILENAME_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Overrides `<download dir>/<name>`.
    #[serde(default)]
    pub save_path: Option<PathBuf>,
}

impl Category {
    fn new(name: &str, extensions: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            save_path: None,
        }
    }
}

pub fn default_categories() -> Vec<Category> {
    vec![
        Category::new(
            "Videos",
            &[
                "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v", "ts", "mpeg", "mpg", "3gp",
                "vob", "rmvb", "divx", "m2ts",
            ],
        ),
        Category::new(
            "Music",
            &["mp3", "flac", "aac", "ogg", "wav", "wma", "m4a", "opus", "alac", "aiff"],
        ),
        Category::new(
            "Documents",
            &[
                "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "txt", "epub", "odt", "csv",
                "rtf", "md",
            ],
        ),
        Category::new(
            "Programs",
            &["exe", "msi", "dmg", "pkg", "deb", "rpm", "apk", "iso", "img", "bin", "run"],
        ),
        Category::new(
            "Archives",
            &["zip", "rar", "7z", "tar", "gz", "bz2", "xz", "cab"],
        ),
        Category::new(FALLBACK_CATEGORY, &[]),
    ]
}

/// Picks a name from `Content-Disposition` (`filename*` first), then the last
/// URL path segment when it has an extension, then a random fallback.
pub fn filename_from(url: &str, content_disposition: Option<&str>) -> String {
    if let Some(name) = content_disposition.and_then(disposition_filename) {
        let name = sanitize_filename(&name);
        if !name.is_empty() {
            return name;
        }
    }

    if let Ok(parsed) = Url::parse(url) {
        if let Some(segment) = parsed.path_segments().and_then(|s| s.filter(|s| !s.is_empty()).last()) {
            let decoded = urlencoding::decode(segment)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| segment.to_string());
            if decoded.contains('.') {
                return sanitize_filename(&decoded);
            }
        }
    }

    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("download_{}", &id[..8])
}

fn disposition_filename(header: &str) -> Option<String> {
    let mut plain = None;
    for param in header.split(';') {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                // charset'language'percent-encoded
                let encoded = value.splitn(3, '\'').nth(2).unwrap_or(value);
                if let Ok(decoded) = urlencoding::decode(encoded.trim_matches('"')) {
                    return Some(decoded.into_owned());
                }
            }
            "filename" => {
                let name = value.trim_matches(|c: char| c == '"' || c == '\'').trim();
                if !name.is_empty() {
                    plain = Some(name.to_string());
                }
            }
            _ => {}
        }
    }
    plain
}

/// Replaces characters no common filesystem accepts and trims leading and
/// trailing dots and spaces.
pub fn sanitize_filename(filename: &str) -> String {
    let replaced = filename.replace(
        |c: char| matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c.is_control(),
        "_",
    );
    let trimmed = replaced.trim_matches(|c: char| c == '.' || c == ' ');
    if trimmed.is_empty() {
        return "download".to_string();
    }
    trimmed.chars().take(MAX_FILENAME_CHARS).collect()
}

pub fn category_for(filename: &str, categories: &[Category]) -> String {
    let Some(ext) = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
    else {
        return FALLBACK_CATEGORY.to_string();
    };
    categories
        .iter()
        .find(|c| c.extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
        .map(|c| c.name.clone())
        .unwrap_or_else(|| FALLBACK_CATEGORY.to_string())
}

/// `<category save_path or download_dir/category>/<filename>`, not yet unique.
pub fn save_path_for(filename: &str, category: &str, categories: &[Category], download_dir: &Path) -> PathBuf {
    let folder = categories
        .iter()
        .find(|c| c.name == category)
        .and_then(|c| c.save_path.clone())
        .unwrap_or_else(|| download_dir.join(category));
    folder.join(filename)
}

/// Appends ` (1)`, ` (2)`, ... before the extension until the path is free on
/// disk and not `taken` by another task.
pub fn unique_filepath(path: &Path, taken: impl Fn(&Path) -> bool) -> PathBuf {
    let free = |p: &Path| !p.exists() && !taken(p);
    if free(path) {
        return path.to_path_buf();
    }

    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut counter = 1;
    loop {
        let name = match &extension {
            Some(ext) => format!("{} ({}).{}", stem, counter, ext),
            None => format!("{} ({})", stem, counter),
        };
        let candidate = dir.join(name);
        if free(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}
