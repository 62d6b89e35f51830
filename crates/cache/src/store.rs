//! Reading and writing single cache entries

use crate::config::CacheConfig;
use crate::hooks::Hooks;
use crate::path::{EntryName, GZIP_SUFFIX, PAYLOAD_SUFFIX};
use crate::{Error, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use fs4::fs_std::FileExt;
use std::borrow::Cow;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// File name of the container template inside `templateDir`
pub const CONTAINER_TEMPLATE_FILE: &str = "default.php";

/// Lock file serializing writers within one zone directory
pub const WRITE_LOCK_FILE: &str = ".assetcache.lock";

const BUILTIN_CONTAINER: &str = include_str!("../templates/default.php");
const MIME_PLACEHOLDER: &str = "%%CONTENT%%";
const EARLY_EXIT_MARKER: &str = "exit;";

/// Existence checks, reads and writes of cache entries
#[derive(Debug, Clone)]
pub struct EntryStore {
    config: Arc<CacheConfig>,
    hooks: Arc<Hooks>,
}

impl EntryStore {
    /// Store over the configured cache root
    #[must_use]
    pub fn new(config: Arc<CacheConfig>, hooks: Arc<Hooks>) -> Self {
        Self { config, hooks }
    }

    fn root(&self) -> Result<&Path> {
        self.config.root.as_deref().ok_or(Error::Unavailable)
    }

    /// Whether the entry file exists.
    #[must_use]
    pub fn exists(&self, name: &EntryName) -> bool {
        self.root().is_ok_and(|root| name.path_in(root).exists())
    }

    /// Read an entry's payload; `Ok(None)` when it is not cached.
    ///
    /// Under server-delegated gzip the payload lives in the `.none` sidecar of
    /// the container, so both must be present.
    pub fn retrieve(&self, name: &EntryName) -> Result<Option<Vec<u8>>> {
        let root = self.root()?;
        if !name.path_in(root).exists() {
            return Ok(None);
        }

        let payload_path = if self.config.gzip_mode.uses_container() {
            name.sidecar_in(root, PAYLOAD_SUFFIX)
        } else {
            name.path_in(root)
        };

        match fs::read(&payload_path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(e, &payload_path, "read")),
        }
    }

    /// Write an entry, asking the gzip-sibling hook whether to add a `.gz` file.
    pub fn store(&self, name: &EntryName, payload: &[u8], mime: &str) -> Result<()> {
        let sibling = self
            .hooks
            .create_gzip_sibling(name.as_str(), self.config.create_gzip_sibling);
        self.write(name, payload, mime, sibling)
    }

    /// Write an entry.
    ///
    /// Server-delegated gzip writes the raw payload to the `.none` sidecar and
    /// a rendered container stub to the entry itself. Self-managed gzip writes
    /// the payload directly and, when `create_gzip_sibling` is set, a
    /// maximally compressed `.gz` copy. Only a failure on the primary file is
    /// returned; the `.gz` sibling is best-effort.
    pub fn write(
        &self,
        name: &EntryName,
        payload: &[u8],
        mime: &str,
        create_gzip_sibling: bool,
    ) -> Result<()> {
        let root = self.root()?;
        let path = name.path_in(root);

        if self.config.gzip_mode.uses_container() {
            // Payload first so a visible container always has its sidecar.
            write_locked(&name.sidecar_in(root, PAYLOAD_SUFFIX), payload)?;
            let container = self.render_container(mime);
            write_locked(&path, container.as_bytes())?;
        } else {
            write_locked(&path, payload)?;
            if create_gzip_sibling {
                let gz_path = name.sidecar_in(root, GZIP_SUFFIX);
                if let Err(e) = gzip(payload).and_then(|bytes| write_locked(&gz_path, &bytes)) {
                    warn!(path = %gz_path.display(), "Skipping gzip sibling: {e}");
                }
            }
        }

        debug!(entry = %name, bytes = payload.len(), mime, "Cached entry");
        Ok(())
    }

    /// Public URL of an entry after the served-URL hook.
    #[must_use]
    pub fn url_for(&self, name: &EntryName) -> String {
        self.hooks
            .served_url(format!("{}{}", self.config.url_base, name))
    }

    /// Container stub for `mime`: the template with the MIME placeholder
    /// filled in and its early-exit guard removed.
    #[must_use]
    pub fn render_container(&self, mime: &str) -> String {
        self.container_template()
            .replace(MIME_PLACEHOLDER, mime)
            .replace(EARLY_EXIT_MARKER, "")
    }

    fn container_template(&self) -> Cow<'static, str> {
        if let Some(dir) = self.config.template_dir.as_deref() {
            let path = dir.join(CONTAINER_TEMPLATE_FILE);
            match fs::read_to_string(&path) {
                Ok(template) => return Cow::Owned(template),
                Err(e) => warn!(
                    path = %path.display(),
                    "Failed to read container template, using built-in: {e}"
                ),
            }
        }
        Cow::Borrowed(BUILTIN_CONTAINER)
    }
}

/// Replace `path` with `contents` in one step.
///
/// Writers in the same directory hold an exclusive lock on its
/// [`WRITE_LOCK_FILE`] for the whole write. The bytes go to a uniquely named
/// temp file, are synced, then renamed over the target, so readers see either
/// the previous file or the complete new one.
fn write_locked(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::configuration(format!("{} has no parent", path.display())))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let lock_path = dir.join(WRITE_LOCK_FILE);
    let lock = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|e| Error::io(e, &lock_path, "open_lock"))?;
    FileExt::lock_exclusive(&lock).map_err(|e| Error::io(e, &lock_path, "lock"))?;

    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| Error::io(e, dir, "create_temp"))?;
    temp.write_all(contents)
        .map_err(|e| Error::io(e, temp.path(), "write"))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| Error::io(e, temp.path(), "sync_all"))?;
    temp.persist(path)
        .map_err(|e| Error::io(e.error, path, "persist"))?;

    // Released when `lock` is dropped.
    drop(lock);
    Ok(())
}

fn gzip(payload: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(payload)
        .map_err(|e| Error::io_no_path(e, "gzip"))?;
    encoder.finish().map_err(|e| Error::io_no_path(e, "gzip"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GzipMode;
    use crate::guard::DirectoryGuard;
    use crate::path::PathPolicy;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn setup(mode: GzipMode, hooks: Hooks) -> (TempDir, Arc<CacheConfig>, EntryStore) {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(CacheConfig {
            gzip_mode: mode,
            url_base: "https://example.com/cache/".into(),
            ..CacheConfig::for_root(temp.path())
        });
        assert!(DirectoryGuard::new(config.clone()).ensure_available());
        let store = EntryStore::new(config.clone(), Arc::new(hooks));
        (temp, config, store)
    }

    #[test]
    fn test_self_managed_round_trip() {
        let (temp, _, store) = setup(GzipMode::SelfManaged, Hooks::new());
        let name = PathPolicy::new("ao_", GzipMode::SelfManaged).resolve("abc123", "css");

        assert!(!store.exists(&name));
        assert_eq!(store.retrieve(&name).unwrap(), None);

        store
            .write(&name, b"body{color:red}", "text/css", false)
            .unwrap();

        let on_disk = temp.path().join("css").join("ao_abc123.css");
        assert_eq!(fs::read(&on_disk).unwrap(), b"body{color:red}");
        assert!(store.exists(&name));
        assert_eq!(
            store.retrieve(&name).unwrap().as_deref(),
            Some(&b"body{color:red}"[..])
        );
        assert!(!temp.path().join("css").join("ao_abc123.css.gz").exists());
    }

    #[test]
    fn test_self_managed_gzip_sibling() {
        let (temp, _, store) = setup(GzipMode::SelfManaged, Hooks::new());
        let name = PathPolicy::new("ao_", GzipMode::SelfManaged).resolve("abc", "js");
        let payload = b"console.log('hello');".repeat(20);

        store
            .write(&name, &payload, "application/javascript", true)
            .unwrap();

        let gz = fs::read(temp.path().join("js").join("ao_abc.js.gz")).unwrap();
        let mut decoded = Vec::new();
        GzDecoder::new(&gz[..]).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(store.retrieve(&name).unwrap(), Some(payload));
    }

    #[test]
    fn test_store_consults_gzip_hook() {
        let hooks = Hooks::new().with_create_gzip_sibling(|name, _| name.starts_with("css/"));
        let (temp, _, store) = setup(GzipMode::SelfManaged, hooks);
        let policy = PathPolicy::new("ao_", GzipMode::SelfManaged);

        store
            .store(&policy.resolve("a", "css"), b"a{}", "text/css")
            .unwrap();
        store
            .store(&policy.resolve("b", "js"), b"b()", "application/javascript")
            .unwrap();

        assert!(temp.path().join("css/ao_a.css.gz").exists());
        assert!(!temp.path().join("js/ao_b.js.gz").exists());
    }

    #[test]
    fn test_server_delegated_round_trip() {
        let (temp, _, store) = setup(GzipMode::ServerDelegated, Hooks::new());
        let name = PathPolicy::new("ao_", GzipMode::ServerDelegated).resolve("xyz", "js");

        store
            .write(&name, b"alert(1)", "application/javascript", true)
            .unwrap();

        let container = fs::read_to_string(temp.path().join("ao_xyz.php")).unwrap();
        assert!(container.contains("Content-Type: application/javascript"));
        assert!(!container.contains("%%CONTENT%%"));
        assert!(!container.contains("exit;"));
        assert_eq!(
            fs::read(temp.path().join("ao_xyz.php.none")).unwrap(),
            b"alert(1)"
        );
        assert!(!temp.path().join("ao_xyz.php.gz").exists());
        assert_eq!(
            store.retrieve(&name).unwrap().as_deref(),
            Some(&b"alert(1)"[..])
        );
    }

    #[test]
    fn test_server_delegated_missing_sidecar_is_not_found() {
        let (temp, _, store) = setup(GzipMode::ServerDelegated, Hooks::new());
        let name = EntryName::new("ao_orphan.php");
        fs::write(temp.path().join("ao_orphan.php"), "<?php").unwrap();

        assert!(store.exists(&name));
        assert_eq!(store.retrieve(&name).unwrap(), None);
    }

    #[test]
    fn test_empty_payload_is_distinct_from_missing() {
        let (_temp, _, store) = setup(GzipMode::SelfManaged, Hooks::new());
        let name = EntryName::new("ao_empty.txt");
        store.write(&name, b"", "text/plain", false).unwrap();
        assert_eq!(store.retrieve(&name).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let (temp, _, store) = setup(GzipMode::SelfManaged, Hooks::new());
        let name = EntryName::new("css/ao_same.css");
        store.write(&name, b"a{}", "text/css", true).unwrap();
        store.write(&name, b"a{}", "text/css", true).unwrap();

        assert_eq!(store.retrieve(&name).unwrap().as_deref(), Some(&b"a{}"[..]));
        let leftovers: Vec<_> = fs::read_dir(temp.path().join("css"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_write_waits_for_zone_lock() {
        let (temp, _, store) = setup(GzipMode::SelfManaged, Hooks::new());
        let lock_path = temp.path().join("css").join(WRITE_LOCK_FILE);
        let held = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .unwrap();
        FileExt::lock_exclusive(&held).unwrap();

        let name = EntryName::new("css/ao_locked.css");
        let target = temp.path().join("css/ao_locked.css");
        std::thread::scope(|s| {
            let writer = s.spawn(|| store.write(&name, b"a{}", "text/css", false));
            std::thread::sleep(std::time::Duration::from_millis(200));
            assert!(!target.exists());

            drop(held);
            writer.join().unwrap().unwrap();
        });
        assert_eq!(fs::read(&target).unwrap(), b"a{}");
    }

    #[test]
    fn test_zone_lock_is_not_a_cache_entry() {
        let (temp, _, store) = setup(GzipMode::SelfManaged, Hooks::new());
        store
            .write(&EntryName::new("js/ao_a.js"), b"1", "application/javascript", false)
            .unwrap();

        let zone = temp.path().join("js");
        assert!(zone.join(WRITE_LOCK_FILE).is_file());
        assert!(!crate::stats::is_valid_entry(&zone, WRITE_LOCK_FILE, "ao_"));
    }

    #[test]
    fn test_concurrent_writers_never_tear() {
        let (_temp, _, store) = setup(GzipMode::SelfManaged, Hooks::new());
        let name = EntryName::new("js/ao_race.js");
        let payload = b"x".repeat(256 * 1024);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| store.write(&name, &payload, "application/javascript", false).unwrap());
            }
        });

        assert_eq!(store.retrieve(&name).unwrap(), Some(payload));
    }

    #[test]
    fn test_missing_zone_propagates_error() {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(CacheConfig::for_root(temp.path()));
        let store = EntryStore::new(config, Arc::new(Hooks::new()));

        let err = store
            .write(&EntryName::new("css/ao_a.css"), b"a{}", "text/css", false)
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_unconfigured_store() {
        let store = EntryStore::new(Arc::new(CacheConfig::default()), Arc::new(Hooks::new()));
        let name = EntryName::new("ao_a.txt");
        assert!(!store.exists(&name));
        assert!(matches!(store.retrieve(&name), Err(Error::Unavailable)));
        assert!(matches!(
            store.write(&name, b"a", "text/plain", false),
            Err(Error::Unavailable)
        ));
    }

    #[test]
    fn test_url_for_applies_hook() {
        let hooks = Hooks::new().with_served_url(|url| format!("{url}?v=1"));
        let (_temp, _, store) = setup(GzipMode::SelfManaged, hooks);
        assert_eq!(
            store.url_for(&EntryName::new("css/ao_a.css")),
            "https://example.com/cache/css/ao_a.css?v=1"
        );
    }

    #[test]
    fn test_template_dir_override() {
        let (temp, config, _) = setup(GzipMode::ServerDelegated, Hooks::new());
        let tmpl_dir = temp.path().join("tmpl");
        fs::create_dir_all(&tmpl_dir).unwrap();
        fs::write(
            tmpl_dir.join(CONTAINER_TEMPLATE_FILE),
            "<?php exit; header('Content-Type: %%CONTENT%%');",
        )
        .unwrap();
        let config = Arc::new(CacheConfig {
            template_dir: Some(tmpl_dir),
            ..(*config).clone()
        });
        let store = EntryStore::new(config, Arc::new(Hooks::new()));

        assert_eq!(
            store.render_container("text/css"),
            "<?php  header('Content-Type: text/css');"
        );
    }
}
