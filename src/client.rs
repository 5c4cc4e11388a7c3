//! Per-cluster API clients and the process-wide client cache
//!
//! A [`ClusterHandle`] bundles the typed clients a resolved cluster needs:
//! workload API access (Deployments, Pods), the platform's own
//! custom-resource API ([`CaravelApp`]), and the schema-registration API for
//! creating the CRD when absent. Handles are expensive to build (TLS setup,
//! kubeconfig assembly), so [`ClientCache`] caches them per cluster name and
//! rebuilds only when the cluster's connection attributes change.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::CustomResourceExt;
use kube::{Client, Config};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::app::App;
use crate::crd::CaravelApp;
use crate::registry::Cluster;
use crate::{Error, Result, CARAVEL_NAMESPACE};

/// Default connect timeout for cluster API clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout for cluster API clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of creating the cluster-native app resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppCreate {
    /// The object was created by this call
    Created,
    /// The object already existed (a concurrent creator won the race)
    AlreadyExists,
}

/// Custom-resource operations against one cluster
///
/// This trait is the seam between the migration engine and the cluster API,
/// allowing tests to mock cluster interactions while production code goes
/// through a real [`ClusterHandle`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppCrClient: Send + Sync {
    /// Register the CaravelApp CRD if it is not present yet
    async fn ensure_app_crd(&self) -> Result<()>;

    /// Fetch the cluster-native app object by name, or None if absent
    async fn get_app(&self, name: &str) -> Result<Option<CaravelApp>>;

    /// Create the cluster-native app object from a primary-store record
    ///
    /// A create conflict is reported as [`AppCreate::AlreadyExists`], not as
    /// an error; duplicate names mean the object is already there.
    async fn create_app(&self, app: &App) -> Result<AppCreate>;
}

/// Hands out cluster clients for resolved clusters
///
/// Implemented by [`ClientCache`]; mocked in migration tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Get (or build) the custom-resource client for the given cluster
    async fn app_client_for(&self, cluster: &Cluster) -> Result<Arc<dyn AppCrClient>>;
}

/// A lazily constructed, shared handle to one cluster's APIs
///
/// Construction is deterministic from the cluster's addresses and
/// credentials. The handle is immutable once built; the cache replaces the
/// whole entry when the cluster definition changes.
pub struct ClusterHandle {
    name: String,
    connection_hash: String,
    client: Client,
}

impl std::fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("name", &self.name)
            .field("connection_hash", &self.connection_hash)
            .finish_non_exhaustive()
    }
}

impl ClusterHandle {
    /// Build a handle from a cluster definition
    ///
    /// Fails with [`Error::ClientConstruction`] when addresses or credential
    /// material are malformed. That error is fatal to the calling operation;
    /// no retry will succeed until the cluster definition is fixed.
    pub async fn connect(cluster: &Cluster) -> Result<Self> {
        let kubeconfig = build_kubeconfig(cluster)?;

        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                Error::client_construction(&cluster.name, format!("invalid cluster config: {}", e))
            })?;
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

        let client = Client::try_from(config).map_err(|e| {
            Error::client_construction(&cluster.name, format!("failed to build client: {}", e))
        })?;

        debug!(cluster = %cluster.name, "built cluster client");

        Ok(Self {
            name: cluster.name.clone(),
            connection_hash: cluster.connection_hash(),
            client,
        })
    }

    /// Name of the cluster this handle talks to
    pub fn cluster_name(&self) -> &str {
        &self.name
    }

    /// Digest of the connection attributes this handle was built from
    pub fn connection_hash(&self) -> &str {
        &self.connection_hash
    }

    /// The underlying kube client, for operations not covered by the
    /// typed accessors
    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }

    /// Workload API: Deployments in the platform namespace
    pub fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), CARAVEL_NAMESPACE)
    }

    /// Workload API: Pods in the platform namespace
    pub fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), CARAVEL_NAMESPACE)
    }

    /// Custom-resource API: CaravelApp objects in the platform namespace
    pub fn apps(&self) -> Api<CaravelApp> {
        Api::namespaced(self.client.clone(), CARAVEL_NAMESPACE)
    }

    /// Schema-registration API: CustomResourceDefinitions (cluster-scoped)
    pub fn crds(&self) -> Api<CustomResourceDefinition> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl AppCrClient for ClusterHandle {
    async fn ensure_app_crd(&self) -> Result<()> {
        match self
            .crds()
            .create(&PostParams::default(), &CaravelApp::crd())
            .await
        {
            Ok(_) => {
                info!(cluster = %self.name, "registered CaravelApp CRD");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_app(&self, name: &str) -> Result<Option<CaravelApp>> {
        Ok(self.apps().get_opt(name).await?)
    }

    async fn create_app(&self, app: &App) -> Result<AppCreate> {
        let obj = CaravelApp::from_record(app);
        match self.apps().create(&PostParams::default(), &obj).await {
            Ok(_) => Ok(AppCreate::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(AppCreate::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }
}

/// Assemble an in-memory kubeconfig for the cluster definition
///
/// Client-side failover across multiple addresses is the transport's
/// concern; the handle connects to the first configured address so
/// construction stays deterministic.
fn build_kubeconfig(cluster: &Cluster) -> Result<Kubeconfig> {
    let Some(server) = cluster.addresses.first() else {
        return Err(Error::client_construction(
            &cluster.name,
            "cluster has no API addresses",
        ));
    };
    if !server.starts_with("https://") && !server.starts_with("http://") {
        return Err(Error::client_construction(
            &cluster.name,
            format!("address {:?} is not an http(s) URL", server),
        ));
    }

    let mut cluster_block = serde_json::json!({ "server": server });
    match &cluster.auth.ca_cert {
        Some(ca) => cluster_block["certificate-authority-data"] = serde_json::json!(ca),
        None => cluster_block["insecure-skip-tls-verify"] = serde_json::json!(true),
    }

    let mut user_block = serde_json::json!({});
    if let Some(token) = &cluster.auth.token {
        user_block["token"] = serde_json::json!(token);
    }
    if let (Some(cert), Some(key)) = (&cluster.auth.client_cert, &cluster.auth.client_key) {
        user_block["client-certificate-data"] = serde_json::json!(cert);
        user_block["client-key-data"] = serde_json::json!(key);
    }

    let doc = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": cluster.name, "cluster": cluster_block }],
        "users": [{ "name": cluster.name, "user": user_block }],
        "contexts": [{
            "name": cluster.name,
            "context": {
                "cluster": cluster.name,
                "user": cluster.name,
                "namespace": CARAVEL_NAMESPACE,
            },
        }],
        "current-context": cluster.name,
    });

    let yaml = serde_yaml::to_string(&doc).map_err(|e| {
        Error::client_construction(&cluster.name, format!("kubeconfig serialization: {}", e))
    })?;
    Kubeconfig::from_yaml(&yaml).map_err(|e| {
        Error::client_construction(&cluster.name, format!("kubeconfig assembly: {}", e))
    })
}

/// Process-wide cache of cluster handles
///
/// Keyed by cluster name, with the connection hash stored inside each
/// handle. The hot path is a shared read; construction of a missing or
/// stale handle is serialized per cluster so concurrent resolutions of the
/// same cluster trigger at most one connection setup. Entry replacement is
/// atomic — readers either see the old handle or the new one, never a
/// partially built state.
#[derive(Default)]
pub struct ClientCache {
    entries: RwLock<HashMap<String, Arc<ClusterHandle>>>,
    building: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ClientCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached handle for the cluster, building it if missing or if
    /// the cluster's connection attributes changed since it was built
    pub async fn client_for(&self, cluster: &Cluster) -> Result<Arc<ClusterHandle>> {
        let wanted_hash = cluster.connection_hash();

        if let Some(handle) = self.lookup(&cluster.name, &wanted_hash) {
            return Ok(handle);
        }

        // Serialize construction per cluster identity (single-flight).
        let key_lock = {
            let mut building = self.building.lock().await;
            building
                .entry(cluster.name.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = key_lock.lock().await;

        // Another resolution may have built the handle while we waited.
        if let Some(handle) = self.lookup(&cluster.name, &wanted_hash) {
            return Ok(handle);
        }

        let handle = Arc::new(ClusterHandle::connect(cluster).await?);
        self.entries
            .write()
            .expect("client cache lock poisoned")
            .insert(cluster.name.clone(), handle.clone());
        info!(cluster = %cluster.name, "cached cluster client");
        Ok(handle)
    }

    fn lookup(&self, name: &str, wanted_hash: &str) -> Option<Arc<ClusterHandle>> {
        let entries = self.entries.read().expect("client cache lock poisoned");
        entries
            .get(name)
            .filter(|h| h.connection_hash() == wanted_hash)
            .cloned()
    }
}

#[async_trait]
impl ClientProvider for ClientCache {
    async fn app_client_for(&self, cluster: &Cluster) -> Result<Arc<dyn AppCrClient>> {
        let handle = self.client_for(cluster).await?;
        Ok(handle as Arc<dyn AppCrClient>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClusterAuth;

    fn cluster(name: &str, addr: &str) -> Cluster {
        Cluster::new(name, "kubernetes", addr)
    }

    #[tokio::test]
    async fn test_same_cluster_shares_one_handle() {
        let cache = ClientCache::new();
        let c = cluster("c1", "https://192.0.2.10:6443");
        let a = cache.client_for(&c).await.unwrap();
        let b = cache.client_for(&c).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_distinct_clusters_get_distinct_handles() {
        let cache = ClientCache::new();
        let a = cache
            .client_for(&cluster("c1", "https://192.0.2.10:6443"))
            .await
            .unwrap();
        let b = cache
            .client_for(&cluster("c2", "https://192.0.2.11:6443"))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.cluster_name(), "c1");
        assert_eq!(b.cluster_name(), "c2");
    }

    #[tokio::test]
    async fn test_changed_connection_attributes_rebuild_handle() {
        let cache = ClientCache::new();
        let before = cache
            .client_for(&cluster("c1", "https://192.0.2.10:6443"))
            .await
            .unwrap();

        // Same cluster name, new API address: entry must be replaced.
        let moved = cluster("c1", "https://192.0.2.99:6443");
        let after = cache.client_for(&moved).await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.connection_hash(), moved.connection_hash());

        // And the replacement is itself cached.
        let again = cache.client_for(&moved).await.unwrap();
        assert!(Arc::ptr_eq(&after, &again));
    }

    #[tokio::test]
    async fn test_concurrent_resolutions_share_one_handle() {
        let cache = Arc::new(ClientCache::new());
        let c = cluster("c1", "https://192.0.2.10:6443");

        let (a, b) = tokio::join!(
            {
                let cache = cache.clone();
                let c = c.clone();
                async move { cache.client_for(&c).await.unwrap() }
            },
            {
                let cache = cache.clone();
                let c = c.clone();
                async move { cache.client_for(&c).await.unwrap() }
            }
        );
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_malformed_address_is_construction_error() {
        let cache = ClientCache::new();
        let err = cache
            .client_for(&cluster("bad", "ssh://203.0.113.5"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClientConstruction { .. }));
        assert_eq!(err.cluster(), Some("bad"));
    }

    #[tokio::test]
    async fn test_malformed_credentials_are_construction_errors() {
        let cache = ClientCache::new();
        let bad = cluster("c1", "https://192.0.2.10:6443").with_auth(ClusterAuth {
            ca_cert: Some("not valid base64!!!".to_string()),
            ..Default::default()
        });
        let err = cache.client_for(&bad).await.unwrap_err();
        assert!(matches!(err, Error::ClientConstruction { .. }));
    }
}
