//! Application records from the platform's primary store
//!
//! The primary datastore itself is an external collaborator; this core only
//! needs a bulk read of the records behind the [`AppStore`] trait. Records
//! are never mutated here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// A managed application as recorded in the primary store
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct App {
    /// Unique application name
    pub name: String,
    /// Pool the application is assigned to
    pub pool: String,
    /// Teams owning the application
    #[serde(default)]
    pub teams: Vec<String>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl App {
    /// Create an application record assigned to the given pool
    pub fn new(name: impl Into<String>, pool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: pool.into(),
            teams: Vec::new(),
            description: None,
        }
    }
}

/// Bulk, read-only access to application records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppStore: Send + Sync {
    /// List all application records in a single round trip
    ///
    /// The returned order is whatever the store yields; callers must not
    /// depend on it beyond being deterministic per read.
    async fn list(&self) -> Result<Vec<App>>;
}

/// In-memory app store for tests and embedding
#[derive(Clone, Debug, Default)]
pub struct StaticAppStore {
    apps: Vec<App>,
}

impl StaticAppStore {
    /// Build a store holding the given records
    pub fn new(apps: impl IntoIterator<Item = App>) -> Self {
        Self {
            apps: apps.into_iter().collect(),
        }
    }
}

#[async_trait]
impl AppStore for StaticAppStore {
    async fn list(&self) -> Result<Vec<App>> {
        Ok(self.apps.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_store_preserves_insertion_order() {
        let store = StaticAppStore::new([App::new("b", "kube"), App::new("a", "kube")]);
        let apps = store.list().await.unwrap();
        assert_eq!(apps[0].name, "b");
        assert_eq!(apps[1].name, "a");
    }
}
