//! Subcommand implementations
//!
//! Each command builds an [`AssetCache`] from the layered configuration and
//! writes its result to the given writer, so tests can capture output.

use crate::cli::{CliError, Command, guess_mime};
use assetcache::path::is_safe_component;
use assetcache::{AssetCache, CacheConfig, StatsSnapshot};
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::{debug, instrument};

/// Run `command` against a cache built from `config`.
#[instrument(skip(config, out), fields(root = ?config.root))]
pub async fn execute(
    command: &Command,
    config: CacheConfig,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let cache = AssetCache::from_config(config)?;

    if let Command::Put { hash, extension, .. }
    | Command::Get { hash, extension }
    | Command::Path { hash, extension } = command
    {
        check_key(hash, extension)?;
    }

    match command {
        Command::Init => init(&cache, out),
        Command::Put {
            hash,
            extension,
            mime,
            file,
        } => {
            let payload = read_payload(file.as_deref())?;
            let mime = mime.as_deref().unwrap_or_else(|| guess_mime(extension));
            put(&cache, hash, extension, mime, &payload, out)
        }
        Command::Get { hash, extension } => get(&cache, hash, extension, out),
        Command::Path { hash, extension } => path(&cache, hash, extension, out),
        Command::Stats { json } => stats(&cache, *json, out),
        Command::Clear => clear(&cache, out).await,
    }
}

fn check_key(hash: &str, extension: &str) -> Result<(), CliError> {
    for (label, value) in [("hash", hash), ("extension", extension)] {
        if !is_safe_component(value) {
            return Err(CliError::config_with_help(
                format!("invalid {label} '{value}'"),
                "use ASCII letters, digits, '-' and '_' only",
            ));
        }
    }
    Ok(())
}

fn require_available(cache: &AssetCache) -> Result<(), CliError> {
    if cache.guard().ensure_available() {
        Ok(())
    } else {
        Err(assetcache::Error::Unavailable.into())
    }
}

fn write_out(out: &mut impl Write, bytes: &[u8]) -> Result<(), CliError> {
    out.write_all(bytes)
        .and_then(|()| out.flush())
        .map_err(|e| CliError::operation(format!("Failed to write output: {e}")))
}

fn read_payload(file: Option<&Path>) -> Result<Vec<u8>, CliError> {
    match file {
        Some(path) => std::fs::read(path).map_err(|e| {
            CliError::operation(format!("Failed to read {}: {e}", path.display()))
        }),
        None => {
            let mut buf = Vec::new();
            io::stdin()
                .lock()
                .read_to_end(&mut buf)
                .map_err(|e| CliError::operation(format!("Failed to read stdin: {e}")))?;
            Ok(buf)
        }
    }
}

fn init(cache: &AssetCache, out: &mut impl Write) -> Result<(), CliError> {
    require_available(cache)?;
    let root = cache.guard().root().map(Path::display);
    let line = match root {
        Some(root) => format!("Cache ready at {root}\n"),
        None => "Cache ready\n".to_string(),
    };
    write_out(out, line.as_bytes())
}

fn put(
    cache: &AssetCache,
    hash: &str,
    extension: &str,
    mime: &str,
    payload: &[u8],
    out: &mut impl Write,
) -> Result<(), CliError> {
    require_available(cache)?;
    let name = cache.paths().resolve(hash, extension);
    cache.store().store(&name, payload, mime)?;
    debug!(entry = %name, mime, "Stored entry from CLI");
    write_out(out, format!("{}\n", cache.store().url_for(&name)).as_bytes())
}

fn get(
    cache: &AssetCache,
    hash: &str,
    extension: &str,
    out: &mut impl Write,
) -> Result<(), CliError> {
    require_available(cache)?;
    let name = cache.paths().resolve(hash, extension);
    match cache.store().retrieve(&name)? {
        Some(payload) => write_out(out, &payload),
        None => Err(CliError::operation(format!("{name} is not cached"))),
    }
}

fn path(
    cache: &AssetCache,
    hash: &str,
    extension: &str,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let name = cache.paths().resolve(hash, extension);
    let url = cache.store().url_for(&name);
    write_out(out, format!("{name}\n{url}\n").as_bytes())
}

fn stats(cache: &AssetCache, json: bool, out: &mut impl Write) -> Result<(), CliError> {
    let snapshot = cache
        .stats()
        .stats()
        .ok_or_else(|| CliError::from(assetcache::Error::Unavailable))?;
    let rendered = if json {
        serde_json::to_string_pretty(&snapshot)
            .map_err(|e| CliError::operation(format!("Failed to serialize stats: {e}")))?
    } else {
        render_stats(&snapshot)
    };
    write_out(out, format!("{rendered}\n").as_bytes())
}

fn render_stats(snapshot: &StatsSnapshot) -> String {
    format!(
        "Entries:    {}\nTotal size: {}\nScanned at: {}",
        snapshot.count,
        human_bytes(snapshot.total_bytes),
        snapshot.scanned_at.to_rfc3339()
    )
}

#[expect(
    clippy::cast_precision_loss,
    reason = "Display only, precision loss above 2^52 bytes is irrelevant"
)]
fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = UNITS[0];
    for next in UNITS.into_iter().skip(1) {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.1} {unit}")
}

async fn clear(cache: &AssetCache, out: &mut impl Write) -> Result<(), CliError> {
    if !cache.purge().clear_all_and_wait().await {
        return Err(assetcache::Error::Unavailable.into());
    }
    write_out(out, b"Cache cleared\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetcache::GzipMode;
    use tempfile::TempDir;

    async fn run(command: Command, config: CacheConfig) -> (Result<(), CliError>, String) {
        let mut out = Vec::new();
        let result = execute(&command, config, &mut out).await;
        (result, String::from_utf8_lossy(&out).into_owned())
    }

    #[tokio::test]
    async fn test_init_creates_layout() {
        let temp = TempDir::new().unwrap();
        let (result, output) = run(Command::Init, CacheConfig::for_root(temp.path())).await;
        result.unwrap();
        assert!(output.starts_with("Cache ready at "));
        assert!(temp.path().join("js").is_dir());
        assert!(temp.path().join("css").is_dir());
        assert!(temp.path().join(".htaccess").is_file());
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let temp = TempDir::new().unwrap();
        let payload_file = temp.path().join("bundle.js");
        std::fs::write(&payload_file, "var a=1;").unwrap();
        let config = CacheConfig {
            url_base: "/assets/".into(),
            ..CacheConfig::for_root(temp.path().join("cache"))
        };

        let (result, output) = run(
            Command::Put {
                hash: "abc".into(),
                extension: "js".into(),
                mime: None,
                file: Some(payload_file),
            },
            config.clone(),
        )
        .await;
        result.unwrap();
        assert_eq!(output, "/assets/js/ao_abc.js\n");

        let (result, output) = run(
            Command::Get {
                hash: "abc".into(),
                extension: "js".into(),
            },
            config,
        )
        .await;
        result.unwrap();
        assert_eq!(output, "var a=1;");
    }

    #[tokio::test]
    async fn test_get_missing_entry_fails() {
        let temp = TempDir::new().unwrap();
        let (result, _) = run(
            Command::Get {
                hash: "nope".into(),
                extension: "css".into(),
            },
            CacheConfig::for_root(temp.path()),
        )
        .await;
        assert!(matches!(result, Err(CliError::Operation { .. })));
    }

    #[tokio::test]
    async fn test_path_under_server_delegated_mode() {
        let config = CacheConfig {
            gzip_mode: GzipMode::ServerDelegated,
            ..CacheConfig::for_root("/srv/cache")
        };
        let (result, output) = run(
            Command::Path {
                hash: "xyz".into(),
                extension: "js".into(),
            },
            config,
        )
        .await;
        result.unwrap();
        assert_eq!(output.lines().next(), Some("ao_xyz.php"));
    }

    #[tokio::test]
    async fn test_rejects_path_escaping_hash() {
        let temp = TempDir::new().unwrap();
        let (result, _) = run(
            Command::Path {
                hash: "../../etc/passwd".into(),
                extension: "js".into(),
            },
            CacheConfig::for_root(temp.path()),
        )
        .await;
        assert!(matches!(result, Err(CliError::Config { .. })));
    }

    #[tokio::test]
    async fn test_stats_json() {
        let temp = TempDir::new().unwrap();
        let (result, output) = run(
            Command::Stats { json: true },
            CacheConfig::for_root(temp.path()),
        )
        .await;
        result.unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["count"], 0);
        assert_eq!(value["totalBytes"], 0);
    }

    #[tokio::test]
    async fn test_clear_removes_entries() {
        let temp = TempDir::new().unwrap();
        let config = CacheConfig::for_root(temp.path());
        let cache = AssetCache::from_config(config.clone()).unwrap();
        cache
            .get_or_insert_with("abc", "css", "text/css", || Ok(b"a{}".to_vec()))
            .unwrap();

        let (result, output) = run(Command::Clear, config).await;
        result.unwrap();
        assert_eq!(output, "Cache cleared\n");
        assert!(!temp.path().join("css/ao_abc.css").exists());
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(1023), "1023 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
