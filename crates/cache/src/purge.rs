//! Full cache invalidation and downstream fan-out
//!
//! A purge deletes every valid cache file, the access-policy marker and the
//! stats memo. Then, detached from the caller, it broadcasts a
//! [`CacheEvent::Purged`], flushes the first third-party page cache found in
//! the [`PurgeTable`], and sends one warming request to the site root. None
//! of the downstream steps can change the purge result.

use crate::config::{CacheConfig, IntegrationConfig};
use crate::events::{CacheEvent, CacheEvents};
use crate::guard::{ACCESS_POLICY_FILE, DirectoryGuard};
use crate::hooks::Hooks;
use crate::stats::{StatsMemo, valid_cache_files};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeout applied to every outbound HTTP request
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Query parameter that makes the warming request bypass page caches
const CACHEBUSTER_PARAM: &str = "ao_speedup_cachebuster";

/// Detects whether a third-party page cache is installed.
pub trait Probe: Send + Sync {
    /// Whether the page cache is present
    fn is_present(&self) -> bool;
}

impl<F> Probe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_present(&self) -> bool {
        self()
    }
}

/// Present when a file or directory exists
#[derive(Debug, Clone)]
pub struct PathExists(pub PathBuf);

impl Probe for PathExists {
    fn is_present(&self) -> bool {
        self.0.exists()
    }
}

/// Present when a program can be found on `PATH`
#[derive(Debug, Clone)]
pub struct OnPath(pub String);

impl Probe for OnPath {
    fn is_present(&self) -> bool {
        let program = Path::new(&self.0);
        if program.components().count() > 1 {
            return program.is_file();
        }
        std::env::var_os("PATH").is_some_and(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
        })
    }
}

/// Flushes one third-party page cache.
#[async_trait]
pub trait Purger: Send + Sync {
    /// Run the flush
    async fn purge(&self) -> Result<()>;
}

/// Adapts a synchronous closure into a [`Purger`]
pub struct FnPurger<F>(pub F);

#[async_trait]
impl<F> Purger for FnPurger<F>
where
    F: Fn() -> Result<()> + Send + Sync,
{
    async fn purge(&self) -> Result<()> {
        (self.0)()
    }
}

/// Sends an HTTP request, `PURGE` to a caching proxy for example
#[derive(Debug, Clone)]
pub struct HttpPurger {
    client: reqwest::Client,
    method: reqwest::Method,
    url: String,
}

impl HttpPurger {
    /// Purger sending `method` to `url`
    pub fn new(client: reqwest::Client, method: &str, url: impl Into<String>) -> Result<Self> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| Error::configuration(format!("invalid HTTP method '{method}': {e}")))?;
        Ok(Self {
            client,
            method,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Purger for HttpPurger {
    async fn purge(&self) -> Result<()> {
        debug!(method = %self.method, url = %self.url, "Sending page cache purge");
        let response = self
            .client
            .request(self.method.clone(), &self.url)
            .send()
            .await
            .map_err(|e| Error::purge(format!("{} {}: {e}", self.method, self.url)))?;
        if !response.status().is_success() {
            return Err(Error::purge(format!(
                "{} {} returned HTTP {}",
                self.method,
                self.url,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Runs a program, such as a page-cache CLI
#[derive(Debug, Clone)]
pub struct CommandPurger {
    program: String,
    args: Vec<String>,
}

impl CommandPurger {
    /// Purger running `program args...`
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Purger for CommandPurger {
    async fn purge(&self) -> Result<()> {
        debug!(program = %self.program, args = ?self.args, "Running page cache purge");
        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map_err(|e| Error::purge(format!("failed to run {}: {e}", self.program)))?;
        if !status.success() {
            return Err(Error::purge(format!("{} exited with {status}", self.program)));
        }
        Ok(())
    }
}

/// Empties a page cache that lives in a directory
#[derive(Debug, Clone)]
pub struct DirectoryPurger {
    dir: PathBuf,
}

impl DirectoryPurger {
    /// Purger removing everything inside `dir`
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Purger for DirectoryPurger {
    async fn purge(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::io(e, &self.dir, "read_dir"))?;
        let mut failed = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(e, &self.dir, "read_dir_entry"))?
        {
            let path = entry.path();
            let removed = match entry.file_type().await {
                Ok(kind) if kind.is_dir() => tokio::fs::remove_dir_all(&path).await,
                _ => tokio::fs::remove_file(&path).await,
            };
            if let Err(e) = removed {
                debug!(path = %path.display(), "Failed to remove page cache item: {e}");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(Error::purge(format!(
                "{failed} item(s) left in {}",
                self.dir.display()
            )));
        }
        Ok(())
    }
}

/// One named flush operation of an integration
#[derive(Clone)]
pub struct PurgeAction {
    name: String,
    aggressive_only: bool,
    purger: Arc<dyn Purger>,
}

impl fmt::Debug for PurgeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PurgeAction")
            .field("name", &self.name)
            .field("aggressive_only", &self.aggressive_only)
            .finish_non_exhaustive()
    }
}

/// A third-party page cache: how to detect it and how to flush it
#[derive(Clone)]
pub struct PageCacheIntegration {
    name: String,
    probe: Arc<dyn Probe>,
    actions: Vec<PurgeAction>,
}

impl fmt::Debug for PageCacheIntegration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCacheIntegration")
            .field("name", &self.name)
            .field("actions", &self.actions)
            .finish_non_exhaustive()
    }
}

impl PageCacheIntegration {
    /// Integration detected by `probe`, with no actions yet
    #[must_use]
    pub fn new(name: impl Into<String>, probe: impl Probe + 'static) -> Self {
        Self {
            name: name.into(),
            probe: Arc::new(probe),
            actions: Vec::new(),
        }
    }

    /// Add an action that always runs.
    #[must_use]
    pub fn action(mut self, name: impl Into<String>, purger: impl Purger + 'static) -> Self {
        self.actions.push(PurgeAction {
            name: name.into(),
            aggressive_only: false,
            purger: Arc::new(purger),
        });
        self
    }

    /// Add an action that runs only in aggressive mode.
    #[must_use]
    pub fn aggressive_action(
        mut self,
        name: impl Into<String>,
        purger: impl Purger + 'static,
    ) -> Self {
        self.actions.push(PurgeAction {
            name: name.into(),
            aggressive_only: true,
            purger: Arc::new(purger),
        });
        self
    }

    /// Integration name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_present(&self) -> bool {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.probe.is_present())) {
            Ok(present) => present,
            Err(_) => {
                warn!(integration = %self.name, "Page cache probe panicked; treating as absent");
                false
            }
        }
    }

    fn from_config(config: &IntegrationConfig, client: &reqwest::Client) -> Result<Self> {
        let integration = match config {
            IntegrationConfig::Directory { name, marker, dir } => {
                let marker = marker.clone().unwrap_or_else(|| dir.clone());
                Self::new(name.clone(), PathExists(marker))
                    .action("purge_directory", DirectoryPurger::new(dir.clone()))
            }
            IntegrationConfig::Command {
                name,
                program,
                args,
            } => Self::new(name.clone(), OnPath(program.clone()))
                .action("run", CommandPurger::new(program.clone(), args.clone())),
            IntegrationConfig::Http {
                name,
                url,
                method,
                aggressive_urls,
            } => {
                let mut integration = Self::new(name.clone(), || true)
                    .action("purge", HttpPurger::new(client.clone(), method, url.clone())?);
                for extra in aggressive_urls {
                    integration = integration.aggressive_action(
                        extra.clone(),
                        HttpPurger::new(client.clone(), method, extra.clone())?,
                    );
                }
                integration
            }
        };
        Ok(integration)
    }
}

/// Ordered list of page-cache integrations; the first present one is flushed.
#[derive(Debug, Clone, Default)]
pub struct PurgeTable {
    integrations: Vec<PageCacheIntegration>,
}

impl PurgeTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an integration at the lowest priority.
    #[must_use]
    pub fn with(mut self, integration: PageCacheIntegration) -> Self {
        self.integrations.push(integration);
        self
    }

    /// Build the table declared in configuration, preserving its order.
    pub fn from_config(configs: &[IntegrationConfig]) -> Result<Self> {
        if configs.is_empty() {
            return Ok(Self::new());
        }
        let client = http_client()?;
        configs
            .iter()
            .map(|c| PageCacheIntegration::from_config(c, &client))
            .collect::<Result<Vec<_>>>()
            .map(|integrations| Self { integrations })
    }

    /// Number of integrations
    #[must_use]
    pub fn len(&self) -> usize {
        self.integrations.len()
    }

    /// Whether the table has no integrations
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.integrations.is_empty()
    }

    /// Flush the first present integration; returns its name.
    ///
    /// A probe that panics counts as absent. Every selected action runs even
    /// if an earlier one fails or panics.
    pub async fn flush(&self, hooks: &Hooks, aggressive_default: bool) -> Option<&str> {
        let integration = self.integrations.iter().find(|i| i.is_present())?;
        let aggressive = hooks.aggressive_purge(&integration.name, aggressive_default);

        let selected: Vec<String> = integration
            .actions
            .iter()
            .filter(|a| aggressive || !a.aggressive_only)
            .map(|a| a.name.clone())
            .collect();
        let selected = hooks.purge_actions(&integration.name, selected);

        for action_name in &selected {
            let Some(action) = integration.actions.iter().find(|a| &a.name == action_name) else {
                debug!(
                    integration = %integration.name,
                    action = %action_name,
                    "Unknown purge action; skipping"
                );
                continue;
            };
            match AssertUnwindSafe(action.purger.purge()).catch_unwind().await {
                Ok(Ok(())) => debug!(
                    integration = %integration.name,
                    action = %action.name,
                    "Flushed page cache"
                ),
                Ok(Err(e)) => warn!(
                    integration = %integration.name,
                    action = %action.name,
                    "Page cache purge failed: {e}"
                ),
                Err(_) => warn!(
                    integration = %integration.name,
                    action = %action.name,
                    "Page cache purge panicked"
                ),
            }
        }
        Some(&integration.name)
    }
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("assetcache/", env!("CARGO_PKG_VERSION")))
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::configuration(format!("Failed to create HTTP client: {e}")))
}

/// Everything the detached part of a purge needs
#[derive(Clone)]
struct Downstream {
    config: Arc<CacheConfig>,
    hooks: Arc<Hooks>,
    events: CacheEvents,
    table: Arc<PurgeTable>,
    client: Option<reqwest::Client>,
}

impl Downstream {
    async fn run(&self, entries_removed: usize) {
        self.events.emit(CacheEvent::Purged {
            entries_removed,
            at: Utc::now(),
        });

        if self.hooks.flush_page_caches(self.config.purge.flush_page_caches) {
            match self.table.flush(&self.hooks, self.config.purge.aggressive).await {
                Some(name) => info!(integration = name, "Flushed third-party page cache"),
                None => debug!("No third-party page cache detected"),
            }
        }

        if self.hooks.warm_cache(self.config.purge.warm)
            && let (Some(site_url), Some(client)) =
                (self.config.purge.site_url.as_deref(), self.client.as_ref())
        {
            warm(client, site_url).await;
        }
    }
}

async fn warm(client: &reqwest::Client, site_url: &str) {
    let url = format!(
        "{}/?{CACHEBUSTER_PARAM}={}",
        site_url.trim_end_matches('/'),
        rand::random_range(1..=100_000u32)
    );
    match client.get(&url).send().await {
        Ok(response) => debug!(%url, status = %response.status(), "Sent warming request"),
        Err(e) => debug!(%url, "Warming request failed: {e}"),
    }
}

fn spawn_detached<F>(task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(task);
        return;
    }

    let spawned = std::thread::Builder::new()
        .name("assetcache-purge".into())
        .spawn(move || {
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(task),
                Err(e) => warn!("Failed to start purge runtime: {e}"),
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to spawn purge thread: {e}");
    }
}

/// Deletes all entries and notifies everything downstream
#[derive(Clone)]
pub struct PurgeCoordinator {
    config: Arc<CacheConfig>,
    guard: DirectoryGuard,
    memo: Arc<dyn StatsMemo>,
    downstream: Downstream,
}

impl fmt::Debug for PurgeCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PurgeCoordinator")
            .field("root", &self.config.root)
            .field("integrations", &self.downstream.table.len())
            .finish_non_exhaustive()
    }
}

impl PurgeCoordinator {
    /// Coordinator sharing `memo` with the stats engine
    #[must_use]
    pub fn new(
        config: Arc<CacheConfig>,
        guard: DirectoryGuard,
        memo: Arc<dyn StatsMemo>,
        hooks: Arc<Hooks>,
        table: PurgeTable,
    ) -> Self {
        let client = if config.purge.site_url.is_some() {
            http_client()
                .inspect_err(|e| warn!("Cache warming disabled: {e}"))
                .ok()
        } else {
            None
        };
        Self {
            downstream: Downstream {
                config: config.clone(),
                hooks,
                events: CacheEvents::new(),
                table: Arc::new(table),
                client,
            },
            config,
            guard,
            memo,
        }
    }

    /// Event bus that receives [`CacheEvent::Purged`]
    #[must_use]
    pub fn events(&self) -> &CacheEvents {
        &self.downstream.events
    }

    /// Purge, then run the downstream fan-out detached.
    ///
    /// Returns `false` only when the cache is unavailable, in which case
    /// nothing is touched.
    pub fn clear_all(&self) -> bool {
        let Some(removed) = self.purge_local() else {
            return false;
        };
        let downstream = self.downstream.clone();
        spawn_detached(async move { downstream.run(removed).await });
        true
    }

    /// Purge and wait for the downstream fan-out to finish.
    ///
    /// For short-lived processes that would otherwise exit before the
    /// detached work completes.
    pub async fn clear_all_and_wait(&self) -> bool {
        let Some(removed) = self.purge_local() else {
            return false;
        };
        self.run_downstream(removed).await;
        true
    }

    /// Delete every valid cache file, the access-policy marker and the memo.
    ///
    /// Returns the number of files deleted, or `None` when the cache is
    /// unavailable. Individual deletion failures are logged and skipped.
    pub fn purge_local(&self) -> Option<usize> {
        if !self.guard.ensure_available() {
            return None;
        }
        let root = self.guard.root()?;

        let mut removed = 0usize;
        for file in valid_cache_files(root, &self.config.prefix) {
            match std::fs::remove_file(&file.path) {
                Ok(()) => removed += 1,
                Err(e) => debug!(path = %file.path.display(), "Failed to delete cache file: {e}"),
            }
        }

        let policy = root.join(ACCESS_POLICY_FILE);
        if let Err(e) = std::fs::remove_file(&policy) {
            debug!(path = %policy.display(), "Failed to delete access policy: {e}");
        }
        self.memo.clear();

        info!(removed, root = %root.display(), "Purged asset cache");
        Some(removed)
    }

    /// Broadcast the purge, flush page caches and warm the site.
    pub async fn run_downstream(&self, entries_removed: usize) {
        self.downstream.run(entries_removed).await;
    }
}
