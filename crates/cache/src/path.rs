//! Entry filename policy
//!
//! Maps a `(hash, extension)` pair to its filename relative to the cache
//! root. Under server-delegated gzip every entry is a `.php` container at the
//! root; under self-managed gzip `js` and `css` entries live in their own zone
//! and everything else sits at the root with its real extension.

use crate::config::GzipMode;
use std::fmt;
use std::path::{Path, PathBuf};

/// Suffix of the raw payload sidecar next to a container
pub const PAYLOAD_SUFFIX: &str = ".none";

/// Suffix of the precompressed sibling under self-managed gzip
pub const GZIP_SUFFIX: &str = ".gz";

/// One of the three cache directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Zone {
    /// The cache root itself
    Root,
    /// `js/`
    Js,
    /// `css/`
    Css,
}

impl Zone {
    /// Every zone, root first
    pub const ALL: [Self; 3] = [Self::Root, Self::Js, Self::Css];

    /// Directory name relative to the root (empty for the root)
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Root => "",
            Self::Js => "js",
            Self::Css => "css",
        }
    }

    /// Absolute directory of this zone under `root`
    #[must_use]
    pub fn path(self, root: &Path) -> PathBuf {
        match self {
            Self::Root => root.to_path_buf(),
            Self::Js | Self::Css => root.join(self.dir_name()),
        }
    }

    fn for_extension(extension: &str) -> Option<Self> {
        match extension {
            "js" => Some(Self::Js),
            "css" => Some(Self::Css),
            _ => None,
        }
    }
}

/// Filename of an entry relative to the cache root, e.g. `css/ao_abc.css`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryName(String);

impl EntryName {
    /// Wrap an already-resolved relative filename.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The relative filename
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Absolute path of the entry under `root`
    #[must_use]
    pub fn path_in(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }

    /// Absolute path of a sidecar (`.none`, `.gz`) of the entry under `root`
    #[must_use]
    pub fn sidecar_in(&self, root: &Path, suffix: &str) -> PathBuf {
        root.join(format!("{}{suffix}", self.0))
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntryName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Resolve the filename of an entry. Pure; inputs are trusted.
#[must_use]
pub fn resolve_filename(prefix: &str, hash: &str, extension: &str, mode: GzipMode) -> EntryName {
    match mode {
        GzipMode::ServerDelegated => EntryName(format!("{prefix}{hash}.php")),
        GzipMode::SelfManaged => match Zone::for_extension(extension) {
            Some(zone) => EntryName(format!(
                "{}/{prefix}{hash}.{extension}",
                zone.dir_name()
            )),
            None => EntryName(format!("{prefix}{hash}.{extension}")),
        },
    }
}

/// Filename policy bound to a prefix and gzip mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPolicy {
    prefix: String,
    mode: GzipMode,
}

impl PathPolicy {
    /// Policy for the given prefix and mode
    #[must_use]
    pub fn new(prefix: impl Into<String>, mode: GzipMode) -> Self {
        Self {
            prefix: prefix.into(),
            mode,
        }
    }

    /// Resolve the filename of `(hash, extension)`.
    #[must_use]
    pub fn resolve(&self, hash: &str, extension: &str) -> EntryName {
        resolve_filename(&self.prefix, hash, extension, self.mode)
    }

    /// Active gzip mode
    #[must_use]
    pub const fn mode(&self) -> GzipMode {
        self.mode
    }

    /// Active prefix
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Check that a hash or extension is safe to embed in a filename.
///
/// Upstream producers hand in hex digests and short extensions; anything with
/// path separators or dots would escape the flat namespace.
#[must_use]
pub fn is_safe_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
