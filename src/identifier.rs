//! Resource identifiers and reference classification.
//!
//! A [`ResourceIdentifier`] names a source document or image independently of
//! its content: a local path or a remote URL. Local paths are normalized
//! lexically (`./` and `../` collapsed, no filesystem access) so the same file
//! reached through different relative links has a single identity. That
//! identity string feeds [`ResourceHash`], which is why normalization has to
//! be deterministic.

use crate::hashing::ResourceHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Extensions treated as documents whose references are followed.
const DOCUMENT_EXTENSIONS: &[&str] = &["md", "markdown"];

/// Extensions treated as images and expanded into variants.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "tif", "tiff", "bmp"];

/// Image formats with no decoder compiled in.
const UNSUPPORTED_IMAGE_EXTENSIONS: &[&str] = &["avif", "svg"];

/// What a reference points at, decided from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Document,
    Pdf,
    Image,
    /// An image format that cannot be decoded. Referenced but never processed.
    Unsupported,
    /// Anything else: web pages, archives, fragments. Not a resource.
    Other,
}

impl ReferenceKind {
    /// Classify a path or URL path by its extension (case-insensitive).
    pub fn from_path(path: &str) -> Self {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some(e) if DOCUMENT_EXTENSIONS.contains(&e) => Self::Document,
            Some("pdf") => Self::Pdf,
            Some(e) if IMAGE_EXTENSIONS.contains(&e) => Self::Image,
            Some(e) if UNSUPPORTED_IMAGE_EXTENSIONS.contains(&e) => Self::Unsupported,
            _ => Self::Other,
        }
    }
}

/// Where the bytes of a resource come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Local,
    Remote,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// A local path or remote URL naming a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "location", rename_all = "lowercase")]
pub enum ResourceIdentifier {
    Local(PathBuf),
    Remote(String),
}

impl ResourceIdentifier {
    /// A local identifier with a normalized path.
    pub fn local(path: impl AsRef<Path>) -> Self {
        Self::Local(normalize_path(path.as_ref()))
    }

    /// Parse a command-line style input: `http(s)://` URLs are remote,
    /// everything else is a local path. Returns `None` for empty input.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if is_remote(raw) {
            Some(Self::Remote(raw.to_string()))
        } else {
            Some(Self::local(raw))
        }
    }

    /// Identity string: the normalized path with `/` separators, or the URL.
    pub fn key(&self) -> String {
        match self {
            Self::Local(path) => path.to_string_lossy().replace('\\', "/"),
            Self::Remote(url) => url.clone(),
        }
    }

    pub fn resource_hash(&self) -> ResourceHash {
        ResourceHash::of_identifier(&self.key())
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            Self::Local(_) => SourceType::Local,
            Self::Remote(_) => SourceType::Remote,
        }
    }

    pub fn kind(&self) -> ReferenceKind {
        match self {
            Self::Local(path) => ReferenceKind::from_path(&path.to_string_lossy()),
            Self::Remote(url) => ReferenceKind::from_path(strip_suffixes(url)),
        }
    }

    /// Directory that relative references inside this resource resolve
    /// against. Remote resources have none.
    pub fn base_dir(&self) -> Option<&Path> {
        match self {
            Self::Local(path) => Some(path.parent().unwrap_or(Path::new(""))),
            Self::Remote(_) => None,
        }
    }

    /// Resolve a raw reference target found inside this resource.
    ///
    /// Returns `None` when the target is not a resource at all: in-page
    /// fragments, `mailto:` and other schemes, or a relative target inside a
    /// remote resource.
    pub fn resolve_reference(&self, target: &str) -> Option<Self> {
        let target = target.trim();
        if target.is_empty() || target.starts_with('#') {
            return None;
        }
        if is_remote(target) {
            return Some(Self::Remote(target.to_string()));
        }
        let target = match target.strip_prefix("file://") {
            Some(rest) => rest,
            None if has_scheme(target) => return None,
            None => target,
        };
        let decoded = percent_decode(strip_suffixes(target));
        let path = Path::new(&decoded);
        if path.is_absolute() {
            return Some(Self::local(path));
        }
        let base = self.base_dir()?;
        Some(Self::local(base.join(path)))
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

fn is_remote(target: &str) -> bool {
    let lower = target.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// `scheme:` prefix such as `mailto:` or `ftp:`. Single letters are Windows
/// drive letters, not schemes.
fn has_scheme(target: &str) -> bool {
    match target.find(':') {
        Some(pos) if pos > 1 => target[..pos]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')),
        _ => false,
    }
}

/// Drop `?query` and `#fragment` suffixes.
fn strip_suffixes(target: &str) -> &str {
    let end = target.find(['?', '#']).unwrap_or(target.len());
    &target[..end]
}

/// Decode `%XX` escapes. Invalid escapes are kept verbatim.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2]))
        {
            out.push(hi << 4 | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().collect()
}
