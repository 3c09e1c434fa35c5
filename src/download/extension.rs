//! File extension resolution for finished downloads.
//!
//! Order: the source URL's path, then the response content type, then
//! [`DEFAULT_EXTENSION`].

/// Used when neither the URL nor the content type identifies the format.
pub const DEFAULT_EXTENSION: &str = "mp4";

/// Container extensions accepted from a URL path.
const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "m4v", "ts", "m2ts", "webm", "flv", "wmv", "mpg", "mpeg", "3gp",
    "ogv", "mp3", "m4a", "aac", "flac", "ogg", "opus", "wav",
];

/// Content types whose registered extension lists are unhelpful or absent.
const CONTENT_TYPES: &[(&str, &str)] = &[
    ("video/mp4", "mp4"),
    ("video/x-matroska", "mkv"),
    ("video/webm", "webm"),
    ("video/mp2t", "ts"),
    ("video/x-msvideo", "avi"),
    ("video/quicktime", "mov"),
    ("video/x-flv", "flv"),
    ("video/x-ms-wmv", "wmv"),
    ("video/mpeg", "mpg"),
    ("video/3gpp", "3gp"),
    ("video/x-m4v", "m4v"),
    ("audio/mpeg", "mp3"),
    ("audio/mp4", "m4a"),
    ("audio/aac", "aac"),
    ("audio/flac", "flac"),
    ("audio/ogg", "ogg"),
];

/// Extension from the last path segment of `url`, if it is a known
/// media container.
pub fn from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    let (_, ext) = segment.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    MEDIA_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Extension for a `Content-Type` header value.
pub fn from_content_type(content_type: &str) -> Option<String> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if essence.is_empty() {
        return None;
    }

    if let Some((_, ext)) = CONTENT_TYPES.iter().find(|(ct, _)| *ct == essence) {
        return Some((*ext).to_string());
    }

    if !(essence.starts_with("video/") || essence.starts_with("audio/")) {
        return None;
    }
    mime_guess::get_mime_extensions_str(&essence)
        .and_then(|exts| exts.first())
        .map(|ext| ext.to_string())
}

/// Resolve the extension for a finished download.
pub fn resolve(url: &str, content_type: Option<&str>) -> String {
    from_url(url)
        .or_else(|| content_type.and_then(from_content_type))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}
