//! Embedded analytics pages
//!
//! Each [`Dashboard`] is mounted at `{url_base}{slug}/` behind the access
//! gate and loads its data when a page is requested.

mod cluster;
mod dataset;
mod kmeans;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{Error, Result};

pub use cluster::{ClusterDashboard, ClusterOptions};
pub use dataset::Dataset;
pub use kmeans::{KMeans, KMeansFit};

/// Query string of a dashboard request
pub type DashboardQuery = HashMap<String, String>;

/// A dashboard page
#[async_trait]
pub trait Dashboard: Send + Sync {
    /// URL segment, unique within the registry
    fn slug(&self) -> &str;

    /// Menu title
    fn title(&self) -> &str;

    /// Page body (HTML fragment) for the given controls
    async fn render(&self, query: &DashboardQuery) -> Result<String>;

    /// Figure data (JSON) for the given controls
    async fn figure(&self, query: &DashboardQuery) -> Result<Value>;
}

/// Registered dashboards under a shared URL prefix
#[derive(Clone)]
pub struct DashboardRegistry {
    url_base: String,
    dashboards: Vec<Arc<dyn Dashboard>>,
}

impl std::fmt::Debug for DashboardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DashboardRegistry")
            .field("url_base", &self.url_base)
            .field(
                "dashboards",
                &self.dashboards.iter().map(|d| d.slug()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

impl DashboardRegistry {
    /// Empty registry mounted at `url_base` (starts and ends with `/`)
    #[must_use]
    pub fn new(url_base: impl Into<String>) -> Self {
        Self {
            url_base: url_base.into(),
            dashboards: Vec::new(),
        }
    }

    /// Add a dashboard; slugs must be unique lowercase URL segments
    pub fn register(&mut self, dashboard: Arc<dyn Dashboard>) -> Result<()> {
        let slug = dashboard.slug();
        if !is_valid_slug(slug) {
            return Err(Error::Config(format!("Invalid dashboard slug '{slug}'")));
        }
        if self.get(slug).is_some() {
            return Err(Error::Config(format!("Duplicate dashboard slug '{slug}'")));
        }
        self.dashboards.push(dashboard);
        Ok(())
    }

    /// URL prefix
    #[must_use]
    pub fn url_base(&self) -> &str {
        &self.url_base
    }

    /// Dashboard by slug
    #[must_use]
    pub fn get(&self, slug: &str) -> Option<&Arc<dyn Dashboard>> {
        self.dashboards.iter().find(|d| d.slug() == slug)
    }

    /// Dashboards in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Dashboard>> {
        self.dashboards.iter()
    }

    /// Number of dashboards
    #[must_use]
    pub fn len(&self) -> usize {
        self.dashboards.len()
    }

    /// Whether no dashboard is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dashboards.is_empty()
    }

    /// Page URL of a dashboard
    #[must_use]
    pub fn url_for(&self, dashboard: &dyn Dashboard) -> String {
        format!("{}{}/", self.url_base, dashboard.slug())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Static(&'static str);

    #[async_trait]
    impl Dashboard for Static {
        fn slug(&self) -> &str {
            self.0
        }

        fn title(&self) -> &str {
            "Static"
        }

        async fn render(&self, _query: &DashboardQuery) -> Result<String> {
            Ok("<p>static</p>".to_string())
        }

        async fn figure(&self, _query: &DashboardQuery) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn registry_mounts_under_base() {
        let mut registry = DashboardRegistry::new("/views/");
        registry.register(Arc::new(Static("iris-example"))).unwrap();

        let dashboard = registry.get("iris-example").unwrap();
        assert_eq!(registry.url_for(dashboard.as_ref()), "/views/iris-example/");
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_and_invalid_slugs_are_rejected() {
        let mut registry = DashboardRegistry::new("/views/");
        registry.register(Arc::new(Static("a"))).unwrap();
        assert!(registry.register(Arc::new(Static("a"))).is_err());
        assert!(registry.register(Arc::new(Static("../x"))).is_err());
        assert!(registry.register(Arc::new(Static(""))).is_err());
    }
}
