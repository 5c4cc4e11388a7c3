//! Pool and cluster registries
//!
//! Pools and clusters are administered outside this core; here they are
//! read-only lookups behind the [`PoolRegistry`] and [`ClusterRegistry`]
//! traits. Registry handles are passed explicitly through construction —
//! there is no ambient global state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// A named logical grouping of applications bound to one provisioner-type
///
/// Every pool has exactly one provisioner-type at any time. Pools are
/// created and removed by administrative tooling; this core only reads them.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Pool {
    /// Unique, non-empty pool name
    pub name: String,
    /// Provisioner-type serving this pool (e.g. "kubernetes")
    pub provisioner: String,
    /// Teams allowed to deploy into this pool; empty means unrestricted
    #[serde(default)]
    pub teams: Vec<String>,
}

impl Pool {
    /// Create a pool bound to the given provisioner-type
    pub fn new(name: impl Into<String>, provisioner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provisioner: provisioner.into(),
            teams: Vec::new(),
        }
    }
}

/// Credential material for reaching a cluster's API
///
/// Either a bearer token or a client certificate/key pair, optionally with
/// a CA bundle for server verification. All PEM/base64 fields are carried
/// as the administrative registry stored them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterAuth {
    /// Bearer token, if token auth is configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Client certificate PEM, base64-encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<String>,
    /// Client private key PEM, base64-encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    /// CA certificate PEM, base64-encoded; absent means system roots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
}

/// A remote execution backend serving one or more pools
///
/// Read by the resolver on every resolution; only derived client handles
/// are cached, never the cluster records themselves.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Cluster {
    /// Unique cluster name
    pub name: String,
    /// Provisioner-type this cluster backs
    pub provisioner: String,
    /// One or more API server addresses; must be non-empty
    pub addresses: Vec<String>,
    /// Credential material for the cluster API
    #[serde(default)]
    pub auth: ClusterAuth,
    /// Pool names this cluster serves
    #[serde(default)]
    pub pools: Vec<String>,
    /// Fallback cluster for its provisioner-type when no pool matches
    #[serde(default)]
    pub default: bool,
}

impl Cluster {
    /// Create a cluster definition with a single address and no credentials
    pub fn new(
        name: impl Into<String>,
        provisioner: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provisioner: provisioner.into(),
            addresses: vec![address.into()],
            auth: ClusterAuth::default(),
            pools: Vec::new(),
            default: false,
        }
    }

    /// Add a pool this cluster serves
    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pools.push(pool.into());
        self
    }

    /// Mark this cluster as the default for its provisioner-type
    pub fn with_default(mut self, default: bool) -> Self {
        self.default = default;
        self
    }

    /// Set the credential material for the cluster API
    pub fn with_auth(mut self, auth: ClusterAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Returns true if this cluster serves the given pool explicitly
    pub fn serves_pool(&self, pool: &str) -> bool {
        self.pools.iter().any(|p| p == pool)
    }

    /// Deterministic digest of the connection attributes
    ///
    /// Cached client handles store this digest; a changed address or
    /// credential changes the digest and forces a handle rebuild. Uses
    /// truncated SHA-256 so the value is stable across toolchain versions.
    pub fn connection_hash(&self) -> String {
        use aws_lc_rs::digest;

        let mut input = String::new();
        for addr in &self.addresses {
            input.push_str(addr);
            input.push('\n');
        }
        for field in [
            &self.auth.token,
            &self.auth.client_cert,
            &self.auth.client_key,
            &self.auth.ca_cert,
        ] {
            input.push_str(field.as_deref().unwrap_or(""));
            input.push('\n');
        }

        let hash = digest::digest(&digest::SHA256, input.as_bytes());
        hash.as_ref()[..8]
            .iter()
            .fold(String::with_capacity(16), |mut s, b| {
                use std::fmt::Write;
                let _ = write!(s, "{:02x}", b);
                s
            })
    }
}

/// Read-only lookup of pool definitions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PoolRegistry: Send + Sync {
    /// Get a pool by name, or None if no such pool exists
    async fn get(&self, name: &str) -> Result<Option<Pool>>;

    /// List all pools
    async fn list(&self) -> Result<Vec<Pool>>;
}

/// Read-only lookup of cluster definitions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    /// Get a cluster by name, or None if no such cluster exists
    async fn get(&self, name: &str) -> Result<Option<Cluster>>;

    /// List all clusters backing the given provisioner-type
    async fn list_by_provisioner(&self, provisioner: &str) -> Result<Vec<Cluster>>;
}

/// In-memory pool registry
///
/// Backs embedded deployments where pools come from static configuration,
/// and the test suites. Lookups never fail.
#[derive(Clone, Debug, Default)]
pub struct StaticPoolRegistry {
    pools: HashMap<String, Pool>,
}

impl StaticPoolRegistry {
    /// Build a registry from the given pools
    pub fn new(pools: impl IntoIterator<Item = Pool>) -> Self {
        Self {
            pools: pools.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }
}

#[async_trait]
impl PoolRegistry for StaticPoolRegistry {
    async fn get(&self, name: &str) -> Result<Option<Pool>> {
        Ok(self.pools.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Pool>> {
        let mut pools: Vec<Pool> = self.pools.values().cloned().collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pools)
    }
}

/// In-memory cluster registry
///
/// Counterpart of [`StaticPoolRegistry`] for cluster definitions.
#[derive(Clone, Debug, Default)]
pub struct StaticClusterRegistry {
    clusters: Vec<Cluster>,
}

impl StaticClusterRegistry {
    /// Build a registry from the given clusters
    ///
    /// Returns an error if any cluster has an empty address set; the address
    /// invariant is enforced at the write boundary so resolution can rely
    /// on it.
    pub fn new(clusters: impl IntoIterator<Item = Cluster>) -> Result<Self> {
        let clusters: Vec<Cluster> = clusters.into_iter().collect();
        for c in &clusters {
            if c.addresses.is_empty() {
                return Err(Error::client_construction(
                    &c.name,
                    "cluster has no API addresses",
                ));
            }
        }
        Ok(Self { clusters })
    }
}

#[async_trait]
impl ClusterRegistry for StaticClusterRegistry {
    async fn get(&self, name: &str) -> Result<Option<Cluster>> {
        Ok(self.clusters.iter().find(|c| c.name == name).cloned())
    }

    async fn list_by_provisioner(&self, provisioner: &str) -> Result<Vec<Cluster>> {
        Ok(self
            .clusters
            .iter()
            .filter(|c| c.provisioner == provisioner)
            .cloned()
            .collect())
    }
}

/// Shared pool registry handle
pub type SharedPoolRegistry = Arc<dyn PoolRegistry>;

/// Shared cluster registry handle
pub type SharedClusterRegistry = Arc<dyn ClusterRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with_auth(token: Option<&str>) -> Cluster {
        Cluster::new("c1", "kubernetes", "https://192.0.2.10:6443").with_auth(ClusterAuth {
            token: token.map(String::from),
            ..Default::default()
        })
    }

    #[test]
    fn test_connection_hash_is_stable_for_equal_definitions() {
        let a = cluster_with_auth(Some("tok"));
        let b = cluster_with_auth(Some("tok"));
        assert_eq!(a.connection_hash(), b.connection_hash());
        assert_eq!(a.connection_hash().len(), 16);
    }

    #[test]
    fn test_connection_hash_changes_with_credentials_and_addresses() {
        let base = cluster_with_auth(Some("tok"));

        let rotated = cluster_with_auth(Some("tok2"));
        assert_ne!(base.connection_hash(), rotated.connection_hash());

        let mut moved = cluster_with_auth(Some("tok"));
        moved.addresses = vec!["https://192.0.2.11:6443".to_string()];
        assert_ne!(base.connection_hash(), moved.connection_hash());
    }

    #[test]
    fn test_connection_hash_ignores_pool_membership() {
        // Pool membership routes work, it does not affect how we connect.
        let plain = cluster_with_auth(Some("tok"));
        let pooled = cluster_with_auth(Some("tok")).with_pool("kube");
        assert_eq!(plain.connection_hash(), pooled.connection_hash());
    }

    #[tokio::test]
    async fn test_static_registries_lookup() {
        let pools = StaticPoolRegistry::new([
            Pool::new("kube", "kubernetes"),
            Pool::new("docker", "local"),
        ]);
        assert_eq!(
            pools.get("kube").await.unwrap().unwrap().provisioner,
            "kubernetes"
        );
        assert!(pools.get("missing").await.unwrap().is_none());
        assert_eq!(pools.list().await.unwrap().len(), 2);

        let clusters = StaticClusterRegistry::new([
            Cluster::new("c1", "kubernetes", "https://192.0.2.10:6443").with_pool("kube"),
            Cluster::new("d1", "local", "ssh://203.0.113.5"),
        ])
        .unwrap();
        let kube = clusters.list_by_provisioner("kubernetes").await.unwrap();
        assert_eq!(kube.len(), 1);
        assert_eq!(kube[0].name, "c1");
        assert!(clusters.get("d1").await.unwrap().is_some());
    }

    #[test]
    fn test_empty_address_set_rejected_at_write_boundary() {
        let mut bad = Cluster::new("c1", "kubernetes", "https://192.0.2.10:6443");
        bad.addresses.clear();
        let err = StaticClusterRegistry::new([bad]).unwrap_err();
        assert!(matches!(err, Error::ClientConstruction { .. }));
    }
}
