//! Cache configuration
//!
//! A single immutable [`CacheConfig`] value is built once at startup and shared
//! by every component. It is usually deserialized from a TOML file:
//!
//! ```toml
//! root = "/var/www/site/cache/assets"
//! urlBase = "https://example.com/cache/assets/"
//! gzipMode = "selfManaged"
//! prefix = "ao_"
//!
//! [stats]
//! ttlSecs = 3600
//!
//! [purge]
//! siteUrl = "https://example.com"
//!
//! [[purge.integrations]]
//! kind = "http"
//! name = "varnish"
//! url = "http://127.0.0.1:6081/"
//! ```

use crate::stats::CountingRules;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default cache-file prefix
pub const DEFAULT_PREFIX: &str = "ao_";

/// Default stats memo lifetime (one hour)
pub const DEFAULT_STATS_TTL_SECS: u64 = 3600;

/// Scans at or below this many entries are never memoized
pub const DEFAULT_STATS_MIN_COUNT: u64 = 100;

/// Who produces the compressed representation of an entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum GzipMode {
    /// Entries are stored as a `.php` container stub plus a `.none` raw payload sidecar
    ServerDelegated,
    /// Entries are stored as final bytes, optionally with a `.gz` sibling
    #[default]
    SelfManaged,
}

impl GzipMode {
    /// Whether entries are written as an executable container plus payload sidecar.
    #[must_use]
    pub const fn uses_container(self) -> bool {
        matches!(self, Self::ServerDelegated)
    }
}

impl fmt::Display for GzipMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerDelegated => write!(f, "server-delegated"),
            Self::SelfManaged => write!(f, "self-managed"),
        }
    }
}

impl FromStr for GzipMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "server-delegated" | "serverDelegated" | "server" => Ok(Self::ServerDelegated),
            "self-managed" | "selfManaged" | "self" => Ok(Self::SelfManaged),
            other => Err(Error::configuration(format!(
                "unknown gzip mode '{other}' (expected 'server-delegated' or 'self-managed')"
            ))),
        }
    }
}

/// Stats memo settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsConfig {
    /// Memo lifetime in seconds, before the TTL hook is applied
    pub ttl_secs: u64,
    /// A scan is memoized only when its count is strictly greater than this
    pub min_count: u64,
    /// Persist the memo as JSON at this path instead of in process memory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo_file: Option<PathBuf>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_STATS_TTL_SECS,
            min_count: DEFAULT_STATS_MIN_COUNT,
            memo_file: None,
        }
    }
}

impl StatsConfig {
    /// Memo lifetime as a [`Duration`]
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Purge fan-out settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PurgeConfig {
    /// Whether third-party page caches are notified after a purge
    pub flush_page_caches: bool,
    /// Whether aggressive-only purge actions run
    pub aggressive: bool,
    /// Whether a warming request is issued after a purge
    pub warm: bool,
    /// Site root used for the warming request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_url: Option<String>,
    /// Ordered third-party page-cache integrations
    pub integrations: Vec<IntegrationConfig>,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            flush_page_caches: true,
            aggressive: false,
            warm: true,
            site_url: None,
            integrations: Vec::new(),
        }
    }
}

fn default_purge_method() -> String {
    "PURGE".to_string()
}

/// Declarative third-party page-cache integration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum IntegrationConfig {
    /// A page cache stored in a directory; present when `marker` (or `dir`) exists
    #[serde(rename_all = "camelCase")]
    Directory {
        /// Integration name
        name: String,
        /// File whose existence signals the page cache is installed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        marker: Option<PathBuf>,
        /// Directory whose contents are removed on purge
        dir: PathBuf,
    },
    /// A page cache flushed by running a program; present when the program is on `PATH`
    #[serde(rename_all = "camelCase")]
    Command {
        /// Integration name
        name: String,
        /// Program to execute
        program: String,
        /// Program arguments
        #[serde(default)]
        args: Vec<String>,
    },
    /// A caching proxy flushed over HTTP; always considered present
    #[serde(rename_all = "camelCase")]
    Http {
        /// Integration name
        name: String,
        /// URL receiving the purge request
        url: String,
        /// HTTP method, `PURGE` by default
        #[serde(default = "default_purge_method")]
        method: String,
        /// Extra URLs purged only in aggressive mode
        #[serde(default)]
        aggressive_urls: Vec<String>,
    },
}

impl IntegrationConfig {
    /// Integration name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Directory { name, .. } | Self::Command { name, .. } | Self::Http { name, .. } => {
                name
            }
        }
    }
}

/// Main configuration for the asset cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Cache root; `None` means no cache is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    /// Public URL prefix under which entries are served
    pub url_base: String,
    /// Storage format policy
    pub gzip_mode: GzipMode,
    /// Prefix carried by every cache file
    pub prefix: String,
    /// Directory holding an override `default.php` container template
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,
    /// User-supplied access policy file copied verbatim into the cache root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_template: Option<PathBuf>,
    /// Multi-site installs need the permissive access policy
    pub multisite: bool,
    /// Default answer for creating `.gz` siblings under self-managed gzip
    pub create_gzip_sibling: bool,
    /// Stats memo settings
    pub stats: StatsConfig,
    /// Which files count as entries in stats
    pub counting: CountingRules,
    /// Purge fan-out settings
    pub purge: PurgeConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            url_base: String::new(),
            gzip_mode: GzipMode::default(),
            prefix: DEFAULT_PREFIX.to_string(),
            template_dir: None,
            access_template: None,
            multisite: false,
            create_gzip_sibling: false,
            stats: StatsConfig::default(),
            counting: CountingRules::default(),
            purge: PurgeConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Configuration rooted at `root` with every other setting defaulted.
    #[must_use]
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::configuration(format!("Failed to parse cache config: {e}")))
    }

    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io(e, path, "read"))?;
        let config = Self::from_toml_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that deserialization cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.prefix.contains(['/', '\\']) {
            return Err(Error::configuration(format!(
                "prefix '{}' must not contain a path separator",
                self.prefix
            )));
        }
        if let Some(root) = &self.root
            && !root.is_absolute()
        {
            return Err(Error::configuration(format!(
                "cache root {} must be an absolute path",
                root.display()
            )));
        }
        if let Some(site_url) = &self.purge.site_url {
            let url = reqwest::Url::parse(site_url)
                .map_err(|e| Error::configuration(format!("invalid siteUrl '{site_url}': {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::configuration(format!(
                    "siteUrl '{site_url}' must use http or https"
                )));
            }
        }
        Ok(())
    }
}
