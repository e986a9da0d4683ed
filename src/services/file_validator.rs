//! Declared-type, extension and magic-number checks for inbound files.
//!
//! [`validate`] is pure: it looks at the declared MIME type, the declared
//! filename and a bounded preview of the content, and either accepts the
//! file or names the first gate it failed.

use crate::services::error_translator::PipelineError;
use mime::Mime;
use tracing::warn;

/// Upper bound on bytes held purely for validation.
pub const MAX_PREVIEW_BYTES: usize = 50 * 1024 * 1024;

/// Longest extension carried over into generated names.
const MAX_EXTENSION_LEN: usize = 10;

const ALLOWED_MIME_TYPES: &[&str] = &[
    // images
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/bmp",
    "image/tiff",
    // audio
    "audio/mpeg",
    "audio/wav",
    "audio/x-wav",
    "audio/ogg",
    "audio/webm",
    "audio/mp4",
    "audio/aac",
    "audio/flac",
    // documents
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "text/plain",
    "text/csv",
    // archives
    "application/zip",
    "application/x-zip-compressed",
    "application/vnd.rar",
    "application/x-rar-compressed",
];

const BLOCKED_EXTENSIONS: &[&str] = &[
    // executables and installers
    "exe", "com", "scr", "pif", "msi", "msp", "app", "deb", "rpm", "apk", "dmg", "pkg",
    // scripts
    "bat", "cmd", "sh", "bash", "ps1", "psm1", "vbs", "vbe", "js", "jse", "wsf", "wsh", "hta",
    "jar", "py", "pl", "php",
    // shared libraries and control panel items
    "dll", "so", "dylib", "sys", "cpl", "ocx",
];

/// Fixed headers for formats that have one. Types absent from this table
/// (plain text, CSV, office XML containers) skip the signature gate.
const SIGNATURES: &[(&str, &[&[u8]])] = &[
    ("image/png", &[b"\x89PNG\r\n\x1a\n"]),
    ("image/jpeg", &[b"\xFF\xD8\xFF"]),
    ("image/gif", &[b"GIF87a", b"GIF89a"]),
    ("image/webp", &[b"RIFF"]),
    ("image/bmp", &[b"BM"]),
    ("image/tiff", &[b"II*\x00", b"MM\x00*"]),
    ("application/pdf", &[b"%PDF"]),
    ("application/zip", &[b"PK\x03\x04", b"PK\x05\x06"]),
    ("application/x-zip-compressed", &[b"PK\x03\x04", b"PK\x05\x06"]),
    ("application/vnd.rar", &[b"Rar!\x1a\x07"]),
    ("application/x-rar-compressed", &[b"Rar!\x1a\x07"]),
    ("application/msword", &[b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1"]),
    ("application/vnd.ms-excel", &[b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1"]),
    ("application/vnd.ms-powerpoint", &[b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1"]),
    ("audio/mpeg", &[b"ID3", b"\xFF\xFB", b"\xFF\xF3", b"\xFF\xF2"]),
    ("audio/wav", &[b"RIFF"]),
    ("audio/x-wav", &[b"RIFF"]),
    ("audio/ogg", &[b"OggS"]),
    ("audio/flac", &[b"fLaC"]),
    ("audio/webm", &[b"\x1A\x45\xDF\xA3"]),
];

/// A file that passed every gate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accepted {
    /// Normalized MIME type (lowercase essence, parameters dropped).
    pub mime: String,

    /// Extension safe to embed in a generated name, if any.
    pub extension: Option<String>,

    /// Whether a registered signature was checked.
    pub signature_checked: bool,
}

/// Run the four gates in order, failing fast.
///
/// 1. the declared MIME type is on the allow-list
/// 2. the filename extension is not on the deny-list
/// 3. the preview starts with a registered signature for the type, if any
/// 4. the preview fits within [`MAX_PREVIEW_BYTES`]
pub fn validate(
    declared_mime: &str,
    declared_filename: &str,
    preview: &[u8],
) -> Result<Accepted, PipelineError> {
    let mime = normalize_mime(declared_mime)
        .filter(|mime| ALLOWED_MIME_TYPES.contains(&mime.as_str()))
        .ok_or_else(|| {
            warn!(declared_mime, "rejected unsupported content type");
            PipelineError::UnsupportedType {
                mime: declared_mime.to_string(),
            }
        })?;

    if let Some(extension) = raw_extension(declared_filename) {
        if BLOCKED_EXTENSIONS.contains(&extension.as_str()) {
            warn!(declared_filename, %extension, "rejected blocked extension");
            return Err(PipelineError::BlockedExtension { extension });
        }
    }

    let signature_checked = match signatures_for(&mime) {
        Some(signatures) => {
            if !signatures.iter().any(|magic| preview.starts_with(magic)) {
                warn!(%mime, preview_len = preview.len(), "content does not match declared type");
                return Err(PipelineError::SignatureMismatch { mime });
            }
            true
        }
        None => false,
    };

    if preview.len() > MAX_PREVIEW_BYTES {
        return Err(PipelineError::size_exceeded(MAX_PREVIEW_BYTES as u64));
    }

    Ok(Accepted {
        extension: extension_of(declared_filename),
        mime,
        signature_checked,
    })
}

/// Parse a declared content type and reduce it to its lowercase essence.
pub fn normalize_mime(declared: &str) -> Option<String> {
    let parsed: Mime = declared.trim().parse().ok()?;
    Some(parsed.essence_str().to_ascii_lowercase())
}

/// Extension safe to embed in a key: lowercase ASCII alphanumeric, at most
/// ten characters.
pub fn extension_of(filename: &str) -> Option<String> {
    raw_extension(filename).filter(|ext| {
        ext.len() <= MAX_EXTENSION_LEN && ext.chars().all(|c| c.is_ascii_alphanumeric())
    })
}

/// Lowercased final extension of the basename. Trailing dots and spaces
/// are ignored so `evil.exe.` is still seen as `exe`.
fn raw_extension(filename: &str) -> Option<String> {
    let basename = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let trimmed = basename.trim_end_matches(['.', ' ']);
    let (stem, ext) = trimmed.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn signatures_for(mime: &str) -> Option<&'static [&'static [u8]]> {
    SIGNATURES
        .iter()
        .find(|(candidate, _)| *candidate == mime)
        .map(|(_, signatures)| *signatures)
}

/// Longest registered signature; the preview window must cover it.
pub fn longest_signature() -> usize {
    SIGNATURES
        .iter()
        .flat_map(|(_, signatures)| signatures.iter())
        .map(|magic| magic.len())
        .max()
        .unwrap_or(0)
}

/// Namespace an accepted file lands in when the caller gives no folder.
pub fn namespace_for(mime: &str) -> &'static str {
    match mime {
        m if m.starts_with("image/") => "images",
        m if m.starts_with("audio/") => "recordings",
        "application/zip"
        | "application/x-zip-compressed"
        | "application/vnd.rar"
        | "application/x-rar-compressed" => "archives",
        _ => "documents",
    }
}
