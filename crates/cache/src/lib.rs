//! Disk-backed cache for precomputed web assets
//!
//! This crate stores optimized assets (concatenated or minified CSS and JS,
//! and other derived content) keyed by a content hash:
//! - Deterministic filenames per `(hash, extension)` and gzip mode
//! - Self-protecting cache directories (`js/`, `css/`, no-index pages, access policy)
//! - Atomic, locked entry writes with optional precompressed siblings
//! - Memoized aggregate statistics
//! - Full purge with fan-out to third-party page caches
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   .htaccess              access policy, regenerated when missing
//!   index.html             no-index page (one per zone)
//!   ao_<hash>.php          container stub      (server-delegated gzip)
//!   ao_<hash>.php.none     raw payload         (server-delegated gzip)
//!   ao_<hash>.txt          other assets        (self-managed gzip)
//!   js/ao_<hash>.js        script assets       (self-managed gzip)
//!   css/ao_<hash>.css      stylesheet assets   (self-managed gzip)
//!   css/ao_<hash>.css.gz   optional precompressed sibling
//! ```
//!
//! Entries are immutable: a hash always maps to the same bytes, so concurrent
//! writers of one key are harmless, and entries only disappear through a full
//! purge.

#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

pub mod config;
mod error;
pub mod events;
pub mod guard;
pub mod hooks;
pub mod path;
pub mod purge;
pub mod stats;
pub mod store;

pub use config::{CacheConfig, GzipMode, IntegrationConfig};
pub use error::{Error, Result};
pub use events::{CacheEvent, CacheEvents};
pub use guard::DirectoryGuard;
pub use hooks::Hooks;
pub use path::{EntryName, PathPolicy, Zone, resolve_filename};
pub use purge::{PageCacheIntegration, PurgeCoordinator, PurgeTable};
pub use stats::{CountingRules, StatsEngine, StatsSnapshot, is_valid_entry};
pub use store::EntryStore;

use std::sync::Arc;
use tracing::debug;

/// An entry served from, or freshly written to, the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAsset {
    /// Filename relative to the cache root
    pub name: EntryName,
    /// Public URL after the served-URL hook
    pub url: String,
    /// The payload bytes
    pub payload: Vec<u8>,
    /// Whether the payload came from disk
    pub hit: bool,
}

/// All cache components wired over one configuration
#[derive(Debug, Clone)]
pub struct AssetCache {
    config: Arc<CacheConfig>,
    paths: PathPolicy,
    guard: DirectoryGuard,
    store: EntryStore,
    stats: StatsEngine,
    purge: PurgeCoordinator,
}

impl AssetCache {
    /// Validate `config` and build every component.
    ///
    /// The stats engine and the purge coordinator share one memo, so a purge
    /// always invalidates the statistics it made stale.
    pub fn new(config: CacheConfig, hooks: Hooks, table: PurgeTable) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let hooks = Arc::new(hooks);
        let memo = stats::memo_from_config(&config.stats);
        let guard = DirectoryGuard::new(config.clone());

        Ok(Self {
            paths: PathPolicy::new(config.prefix.clone(), config.gzip_mode),
            store: EntryStore::new(config.clone(), hooks.clone()),
            stats: StatsEngine::new(config.clone(), guard.clone(), hooks.clone(), memo.clone()),
            purge: PurgeCoordinator::new(config.clone(), guard.clone(), memo, hooks, table),
            guard,
            config,
        })
    }

    /// Build from configuration alone, with the purge table it declares.
    pub fn from_config(config: CacheConfig) -> Result<Self> {
        let table = PurgeTable::from_config(&config.purge.integrations)?;
        Self::new(config, Hooks::new(), table)
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Filename policy
    #[must_use]
    pub fn paths(&self) -> &PathPolicy {
        &self.paths
    }

    /// Directory guard
    #[must_use]
    pub fn guard(&self) -> &DirectoryGuard {
        &self.guard
    }

    /// Entry store
    #[must_use]
    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    /// Stats engine
    #[must_use]
    pub fn stats(&self) -> &StatsEngine {
        &self.stats
    }

    /// Purge coordinator
    #[must_use]
    pub fn purge(&self) -> &PurgeCoordinator {
        &self.purge
    }

    /// Serve `(hash, extension)` from the cache, producing and caching it on a miss.
    ///
    /// A failure to write the produced payload is returned, since the caller
    /// would otherwise believe the entry is cached.
    pub fn get_or_insert_with<F>(
        &self,
        hash: &str,
        extension: &str,
        mime: &str,
        produce: F,
    ) -> Result<CachedAsset>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        if !self.guard.ensure_available() {
            return Err(Error::Unavailable);
        }
        let name = self.paths.resolve(hash, extension);
        let url = self.store.url_for(&name);

        if let Some(payload) = self.store.retrieve(&name)? {
            debug!(entry = %name, "Cache hit");
            return Ok(CachedAsset {
                name,
                url,
                payload,
                hit: true,
            });
        }

        debug!(entry = %name, "Cache miss");
        let payload = produce()?;
        self.store.store(&name, &payload, mime)?;
        Ok(CachedAsset {
            name,
            url,
            payload,
            hit: false,
        })
    }
}
