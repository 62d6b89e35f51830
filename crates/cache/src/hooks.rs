//! Filter-style extension points
//!
//! Each hook receives the value the cache would otherwise use and returns the
//! value to use instead. Unset hooks pass the default through unchanged.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type UrlFilter = Arc<dyn Fn(&str) -> String + Send + Sync>;
type GzipSiblingFilter = Arc<dyn Fn(&str, bool) -> bool + Send + Sync>;
type TtlFilter = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;
type SwitchFilter = Arc<dyn Fn(bool) -> bool + Send + Sync>;
type IntegrationSwitchFilter = Arc<dyn Fn(&str, bool) -> bool + Send + Sync>;
type ActionsFilter = Arc<dyn Fn(&str, Vec<String>) -> Vec<String> + Send + Sync>;

/// Registry of optional filter callbacks
#[derive(Clone, Default)]
pub struct Hooks {
    served_url: Option<UrlFilter>,
    create_gzip_sibling: Option<GzipSiblingFilter>,
    stats_ttl: Option<TtlFilter>,
    flush_page_caches: Option<SwitchFilter>,
    aggressive_purge: Option<IntegrationSwitchFilter>,
    purge_actions: Option<ActionsFilter>,
    warm_cache: Option<SwitchFilter>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("served_url", &self.served_url.is_some())
            .field("create_gzip_sibling", &self.create_gzip_sibling.is_some())
            .field("stats_ttl", &self.stats_ttl.is_some())
            .field("flush_page_caches", &self.flush_page_caches.is_some())
            .field("aggressive_purge", &self.aggressive_purge.is_some())
            .field("purge_actions", &self.purge_actions.is_some())
            .field("warm_cache", &self.warm_cache.is_some())
            .finish()
    }
}

impl Hooks {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transform the public URL of a resolved entry.
    #[must_use]
    pub fn with_served_url(mut self, f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.served_url = Some(Arc::new(f));
        self
    }

    /// Decide per filename whether a `.gz` sibling is written.
    #[must_use]
    pub fn with_create_gzip_sibling(
        mut self,
        f: impl Fn(&str, bool) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.create_gzip_sibling = Some(Arc::new(f));
        self
    }

    /// Override the stats memo lifetime.
    #[must_use]
    pub fn with_stats_ttl(
        mut self,
        f: impl Fn(Duration) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.stats_ttl = Some(Arc::new(f));
        self
    }

    /// Decide whether third-party page caches are flushed after a purge.
    #[must_use]
    pub fn with_flush_page_caches(
        mut self,
        f: impl Fn(bool) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.flush_page_caches = Some(Arc::new(f));
        self
    }

    /// Decide per integration whether aggressive-only actions run.
    #[must_use]
    pub fn with_aggressive_purge(
        mut self,
        f: impl Fn(&str, bool) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.aggressive_purge = Some(Arc::new(f));
        self
    }

    /// Rewrite the list of action names run for an integration.
    #[must_use]
    pub fn with_purge_actions(
        mut self,
        f: impl Fn(&str, Vec<String>) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.purge_actions = Some(Arc::new(f));
        self
    }

    /// Decide whether the warming request is sent after a purge.
    #[must_use]
    pub fn with_warm_cache(mut self, f: impl Fn(bool) -> bool + Send + Sync + 'static) -> Self {
        self.warm_cache = Some(Arc::new(f));
        self
    }

    pub(crate) fn served_url(&self, url: String) -> String {
        match &self.served_url {
            Some(f) => f(&url),
            None => url,
        }
    }

    pub(crate) fn create_gzip_sibling(&self, filename: &str, default: bool) -> bool {
        self.create_gzip_sibling
            .as_ref()
            .map_or(default, |f| f(filename, default))
    }

    pub(crate) fn stats_ttl(&self, default: Duration) -> Duration {
        self.stats_ttl.as_ref().map_or(default, |f| f(default))
    }

    pub(crate) fn flush_page_caches(&self, default: bool) -> bool {
        self.flush_page_caches.as_ref().map_or(default, |f| f(default))
    }

    pub(crate) fn aggressive_purge(&self, integration: &str, default: bool) -> bool {
        self.aggressive_purge
            .as_ref()
            .map_or(default, |f| f(integration, default))
    }

    pub(crate) fn purge_actions(&self, integration: &str, names: Vec<String>) -> Vec<String> {
        match &self.purge_actions {
            Some(f) => f(integration, names),
            None => names,
        }
    }

    pub(crate) fn warm_cache(&self, default: bool) -> bool {
        self.warm_cache.as_ref().map_or(default, |f| f(default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_hooks_pass_defaults_through() {
        let hooks = Hooks::new();
        assert_eq!(hooks.served_url("https://a/x.css".into()), "https://a/x.css");
        assert!(hooks.create_gzip_sibling("x.css", true));
        assert!(!hooks.create_gzip_sibling("x.css", false));
        assert_eq!(
            hooks.stats_ttl(Duration::from_secs(3600)),
            Duration::from_secs(3600)
        );
        assert!(hooks.flush_page_caches(true));
        assert!(!hooks.aggressive_purge("wpengine", false));
        assert_eq!(
            hooks.purge_actions("wpengine", vec!["varnish".into()]),
            vec!["varnish".to_string()]
        );
        assert!(hooks.warm_cache(true));
    }

    #[test]
    fn test_set_hooks_override() {
        let hooks = Hooks::new()
            .with_served_url(|url| url.replace("https://a/", "https://cdn/"))
            .with_create_gzip_sibling(|name, _| name.ends_with(".css"))
            .with_stats_ttl(|ttl| ttl / 2)
            .with_flush_page_caches(|_| false)
            .with_aggressive_purge(|name, default| default || name == "wpengine")
            .with_purge_actions(|_, mut names| {
                names.retain(|n| n != "memcached");
                names
            })
            .with_warm_cache(|_| false);

        assert_eq!(hooks.served_url("https://a/x.css".into()), "https://cdn/x.css");
        assert!(hooks.create_gzip_sibling("css/ao_1.css", false));
        assert!(!hooks.create_gzip_sibling("js/ao_1.js", true));
        assert_eq!(
            hooks.stats_ttl(Duration::from_secs(3600)),
            Duration::from_secs(1800)
        );
        assert!(!hooks.flush_page_caches(true));
        assert!(hooks.aggressive_purge("wpengine", false));
        assert!(!hooks.aggressive_purge("varnish", false));
        assert_eq!(
            hooks.purge_actions("wpengine", vec!["varnish".into(), "memcached".into()]),
            vec!["varnish".to_string()]
        );
        assert!(!hooks.warm_cache(true));
    }

    #[test]
    fn test_debug_reports_registered_hooks() {
        let hooks = Hooks::new().with_warm_cache(|_| false);
        let rendered = format!("{hooks:?}");
        assert!(rendered.contains("warm_cache: true"));
        assert!(rendered.contains("served_url: false"));
    }
}
