use mime::Mime;

// First entry per media type is its canonical extension.
const MEDIA_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("bmp", "image/bmp"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("mp4", "video/mp4"),
    ("mpeg", "video/mpeg"),
    ("mov", "video/quicktime"),
    ("avi", "video/x-msvideo"),
    ("webm", "video/webm"),
    ("flv", "video/x-flv"),
    ("3gp", "video/3gpp"),
    ("wmv", "video/x-ms-wmv"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("m4a", "audio/mp4"),
    ("aac", "audio/aac"),
    ("weba", "audio/webm"),
    ("flac", "audio/flac"),
    ("wma", "audio/x-ms-wma"),
    ("txt", "text/plain"),
    ("html", "text/html"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("csv", "text/csv"),
    ("xml", "application/xml"),
    ("json", "application/json"),
    ("pdf", "application/pdf"),
    ("doc", "application/msword"),
    (
        "docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    ("xls", "application/vnd.ms-excel"),
    (
        "xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ),
    ("ppt", "application/vnd.ms-powerpoint"),
    (
        "pptx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    ),
    ("zip", "application/zip"),
    ("rar", "application/x-rar-compressed"),
    ("7z", "application/x-7z-compressed"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("so", "application/x-sharedlib"),
    ("deb", "application/x-deb"),
    ("rpm", "application/x-rpm"),
    ("apk", "application/vnd.android.package-archive"),
    ("exe", "application/x-msdownload"),
    ("dmg", "application/x-apple-diskimage"),
    ("bin", "application/octet-stream"),
];

/// Lower-cased extension without the dot, if the name has one.
pub fn extension_of(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_ascii_lowercase()),
        _ => None,
    }
}

/// Best-effort media type from a file name; unknown names map to
/// `application/octet-stream`.
pub fn mime_for_name(name: &str) -> Mime {
    extension_of(name)
        .and_then(|ext| {
            MEDIA_TYPES
                .iter()
                .find(|(known, _)| *known == ext)
                .and_then(|(_, media_type)| media_type.parse().ok())
        })
        .unwrap_or(mime::APPLICATION_OCTET_STREAM)
}

pub fn extension_for(media_type: &Mime) -> &'static str {
    let essence = media_type.essence_str();
    MEDIA_TYPES
        .iter()
        .find(|(_, known)| known.eq_ignore_ascii_case(essence))
        .map(|(ext, _)| *ext)
        .unwrap_or("bin")
}

/// Leading bytes handed to [`sniff`]; enough for every signature it knows.
pub const SNIFF_LEN: usize = 8192;

// Detector names that differ from the ones used in allowlists.
const SNIFF_ALIASES: &[(&str, &str)] = &[
    ("audio/x-wav", "audio/wav"),
    ("audio/x-flac", "audio/flac"),
    ("audio/m4a", "audio/mp4"),
    ("application/vnd.rar", "application/x-rar-compressed"),
    ("application/vnd.microsoft.portable-executable", "application/x-msdownload"),
];

/// Media type and extension recognized from content signatures, if any.
pub fn sniff(head: &[u8]) -> Option<(Mime, &'static str)> {
    let kind = infer::get(head)?;
    let detected = kind.mime_type();
    let canonical = SNIFF_ALIASES
        .iter()
        .find(|(from, _)| *from == detected)
        .map(|(_, to)| *to)
        .unwrap_or(detected);
    let media_type = canonical.parse().ok()?;
    Some((media_type, kind.extension()))
}

/// Text formats have no signature to sniff, so their declared type stands.
pub fn is_signatureless(media_type: &Mime) -> bool {
    media_type.type_() == mime::TEXT
        || matches!(
            media_type.essence_str(),
            "application/json" | "application/xml" | "image/svg+xml"
        )
}
