//! Cache directory bootstrap and protection
//!
//! Before any entry is read or written the cache root and its `js/` and `css/`
//! zones must exist and be writable. Each zone gets a `noindex` page so the
//! directory is never browsable, and the root gets an access-policy file
//! (`.htaccess`) telling the web server how to treat cached files.

use crate::config::CacheConfig;
use crate::path::Zone;
use std::borrow::Cow;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Access-policy marker at the cache root
pub const ACCESS_POLICY_FILE: &str = ".htaccess";

/// No-index marker in every zone
pub const NO_INDEX_FILE: &str = "index.html";

const NO_INDEX_PAGE: &str = include_str!("../templates/index.html");
const PERMISSIVE_POLICY: &str = include_str!("../templates/access_permissive.htaccess");
const RESTRICTIVE_POLICY: &str = include_str!("../templates/access_restrictive.htaccess");

/// Ensures the cache directories are usable.
#[derive(Debug, Clone)]
pub struct DirectoryGuard {
    config: Arc<CacheConfig>,
}

impl DirectoryGuard {
    /// Guard over the configured cache root
    #[must_use]
    pub fn new(config: Arc<CacheConfig>) -> Self {
        Self { config }
    }

    /// Configured cache root, if any
    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.config.root.as_deref()
    }

    /// Make sure every zone exists and is writable, and that the markers are in place.
    ///
    /// Returns `false` without touching the filesystem when no root is
    /// configured, and `false` as soon as a zone cannot be created or written.
    /// Marker write failures are logged and do not affect the result.
    pub fn ensure_available(&self) -> bool {
        let Some(root) = self.root() else {
            debug!("No cache root configured; cache unavailable");
            return false;
        };

        for zone in Zone::ALL {
            if !check_zone_dir(&zone.path(root)) {
                return false;
            }
        }

        let policy_path = root.join(ACCESS_POLICY_FILE);
        if !policy_path.is_file() {
            let policy = self.access_policy();
            match fs::write(&policy_path, policy.as_bytes()) {
                Ok(()) => debug!(path = %policy_path.display(), "Wrote access policy"),
                Err(e) => warn!(
                    path = %policy_path.display(),
                    "Failed to write access policy: {e}"
                ),
            }
        }

        true
    }

    /// Contents for a freshly generated access-policy file.
    ///
    /// A user template wins. Otherwise multi-site installs and container
    /// storage get the policy that lets the web server execute `.php` stubs;
    /// everything else denies them.
    #[must_use]
    pub fn access_policy(&self) -> Cow<'static, str> {
        if let Some(template) = self.config.access_template.as_deref()
            && template.is_file()
        {
            match fs::read_to_string(template) {
                Ok(contents) => return Cow::Owned(contents),
                Err(e) => warn!(
                    path = %template.display(),
                    "Failed to read access policy template, using built-in policy: {e}"
                ),
            }
        }

        if self.config.multisite || self.config.gzip_mode.uses_container() {
            Cow::Borrowed(PERMISSIVE_POLICY)
        } else {
            Cow::Borrowed(RESTRICTIVE_POLICY)
        }
    }
}

fn check_zone_dir(dir: &Path) -> bool {
    if !dir.is_dir() {
        if let Err(e) = create_dir(dir) {
            warn!(dir = %dir.display(), "Failed to create cache directory: {e}");
            return false;
        }
        if !dir.is_dir() {
            return false;
        }
    }

    if !is_writable(dir) {
        warn!(dir = %dir.display(), "Cache directory is not writable");
        return false;
    }

    let index = dir.join(NO_INDEX_FILE);
    if !index.is_file()
        && let Err(e) = fs::write(&index, NO_INDEX_PAGE)
    {
        debug!(path = %index.display(), "Failed to write no-index marker: {e}");
    }

    true
}

#[cfg(unix)]
fn create_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o775).create(dir)
}

#[cfg(not(unix))]
fn create_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

// Permission bits are not authoritative under root or ACLs.
fn is_writable(dir: &Path) -> bool {
    tempfile::tempfile_in(dir).is_ok()
}
