//! Media type lookup by file extension.
//!
//! Every plain extension `.x` has an encrypted twin `.ex` (`.mp4` / `.emp4`)
//! with the same MIME type; the twin marks the file as needing decryption.

use std::collections::HashMap;
use std::path::Path;

/// What the server needs to know about a file before streaming it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    /// Value sent as `Content-Type`.
    pub mime: String,
    /// Whether the file must be decrypted while streaming.
    pub encrypted: bool,
}

/// Maps a file path to its media type. `None` means "do not serve".
pub trait MimeResolver: Send + Sync {
    fn resolve(&self, path: &Path) -> Option<MediaType>;
}

/// Built-in plain extensions.
const DEFAULT_TYPES: &[(&str, &str)] = &[
    ("asf", "video/x-ms-asf"),
    ("asx", "video/x-ms-asf"),
    ("avi", "video/x-msvideo"),
    ("flv", "video/x-flv"),
    ("gif", "image/gif"),
    ("jng", "image/x-jng"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("m4v", "audio/mpeg"),
    ("mng", "video/x-mng"),
    ("mov", "video/quicktime"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mpeg"),
    ("mkv", "video/mpeg"),
    ("mpeg", "video/mpeg"),
    ("mpg", "video/mpeg"),
    ("png", "image/png"),
    ("ra", "audio/x-realaudio"),
    ("swf", "application/x-shockwave-flash"),
    ("wbmp", "image/vnd.wap.wbmp"),
    ("wmv", "video/x-ms-wmv"),
    ("xml", "text/xml"),
    ("zip", "application/zip"),
    ("html", "text/html"),
];

/// Case-insensitive extension table.
#[derive(Debug, Clone)]
pub struct ExtensionTable {
    types: HashMap<String, MediaType>,
}

impl ExtensionTable {
    pub fn empty() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    /// Register `ext` (without the dot) and its encrypted twin `e{ext}`.
    /// An existing plain entry is never shadowed by a twin.
    pub fn insert(&mut self, ext: &str, mime: &str) {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        self.types.insert(
            ext.clone(),
            MediaType {
                mime: mime.to_string(),
                encrypted: false,
            },
        );
        self.types.entry(format!("e{}", ext)).or_insert(MediaType {
            mime: mime.to_string(),
            encrypted: true,
        });
    }

    pub fn with_type(mut self, ext: &str, mime: &str) -> Self {
        self.insert(ext, mime);
        self
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for ExtensionTable {
    fn default() -> Self {
        DEFAULT_TYPES
            .iter()
            .fold(Self::empty(), |table, (ext, mime)| table.with_type(ext, mime))
    }
}

impl MimeResolver for ExtensionTable {
    fn resolve(&self, path: &Path) -> Option<MediaType> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.types.get(&ext).cloned()
    }
}
