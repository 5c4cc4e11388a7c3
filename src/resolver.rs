//! Cluster resolution
//!
//! Maps a (provisioner-type, pool) pair to the cluster responsible for
//! executing applications in that pool. Resolution is a pure lookup against
//! the injected registries; it never creates anything and never caches
//! cluster records.

use tracing::debug;

use crate::registry::{Cluster, SharedClusterRegistry, SharedPoolRegistry};
use crate::{Error, Result};

/// Resolves pools to clusters for a given provisioner-type
///
/// Resolution rules, in order:
/// 1. The pool must exist and be bound to the requested provisioner-type;
///    a mismatched or missing pool is a [`Error::NoCluster`] outcome.
/// 2. Clusters of the provisioner-type whose pool set contains the pool
///    name match explicitly. Write-time validation is supposed to keep
///    explicit matches unique; if that invariant is ever violated the
///    resolver picks the first match by cluster name ascending so behavior
///    stays reproducible.
/// 3. With no explicit match, the cluster flagged default for the
///    provisioner-type wins.
/// 4. Otherwise resolution fails with [`Error::NoCluster`], a routine
///    outcome for unconfigured pools.
#[derive(Clone)]
pub struct ClusterResolver {
    pools: SharedPoolRegistry,
    clusters: SharedClusterRegistry,
}

impl ClusterResolver {
    /// Create a resolver over the given registries
    pub fn new(pools: SharedPoolRegistry, clusters: SharedClusterRegistry) -> Self {
        Self { pools, clusters }
    }

    /// Resolve the cluster bound to (provisioner-type, pool)
    pub async fn resolve(&self, provisioner: &str, pool: &str) -> Result<Cluster> {
        let Some(pool_rec) = self.pools.get(pool).await? else {
            debug!(pool = %pool, "pool not found during resolution");
            return Err(Error::no_cluster(provisioner, pool));
        };
        if pool_rec.provisioner != provisioner {
            // A pool cannot be served by a mismatched provisioner.
            debug!(
                pool = %pool,
                bound = %pool_rec.provisioner,
                requested = %provisioner,
                "pool bound to different provisioner-type"
            );
            return Err(Error::no_cluster(provisioner, pool));
        }

        let mut candidates = self.clusters.list_by_provisioner(provisioner).await?;
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        if let Some(cluster) = candidates.iter().find(|c| c.serves_pool(pool)) {
            debug!(pool = %pool, cluster = %cluster.name, "resolved explicit pool binding");
            return Ok(cluster.clone());
        }

        if let Some(cluster) = candidates.iter().find(|c| c.default) {
            debug!(pool = %pool, cluster = %cluster.name, "resolved via default cluster");
            return Ok(cluster.clone());
        }

        Err(Error::no_cluster(provisioner, pool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Cluster, Pool, StaticClusterRegistry, StaticPoolRegistry};
    use std::sync::Arc;

    fn resolver(pools: Vec<Pool>, clusters: Vec<Cluster>) -> ClusterResolver {
        ClusterResolver::new(
            Arc::new(StaticPoolRegistry::new(pools)),
            Arc::new(StaticClusterRegistry::new(clusters).unwrap()),
        )
    }

    fn kube_pool(name: &str) -> Pool {
        Pool::new(name, "kubernetes")
    }

    #[tokio::test]
    async fn test_resolves_explicit_pool_binding() {
        let r = resolver(
            vec![kube_pool("kube")],
            vec![Cluster::new("c1", "kubernetes", "https://192.0.2.10:6443").with_pool("kube")],
        );
        let cluster = r.resolve("kubernetes", "kube").await.unwrap();
        assert_eq!(cluster.name, "c1");
    }

    #[tokio::test]
    async fn test_unbound_pool_is_no_cluster() {
        let r = resolver(
            vec![kube_pool("kube-failed")],
            vec![Cluster::new("c1", "kubernetes", "https://192.0.2.10:6443").with_pool("kube")],
        );
        let err = r.resolve("kubernetes", "kube-failed").await.unwrap_err();
        assert!(err.is_no_cluster());
    }

    #[tokio::test]
    async fn test_missing_pool_is_no_cluster() {
        let r = resolver(vec![], vec![]);
        let err = r.resolve("kubernetes", "ghost").await.unwrap_err();
        assert!(err.is_no_cluster());
    }

    #[tokio::test]
    async fn test_provisioner_mismatch_is_no_cluster() {
        // Pool "docker" is bound to the local provisioner; asking the
        // kubernetes provisioner for it must not resolve, even though a
        // kubernetes default cluster exists.
        let r = resolver(
            vec![Pool::new("docker", "local")],
            vec![
                Cluster::new("c1", "kubernetes", "https://192.0.2.10:6443").with_default(true),
            ],
        );
        let err = r.resolve("kubernetes", "docker").await.unwrap_err();
        assert!(err.is_no_cluster());
    }

    #[tokio::test]
    async fn test_falls_back_to_default_cluster() {
        let r = resolver(
            vec![kube_pool("kube")],
            vec![
                Cluster::new("other", "kubernetes", "https://192.0.2.11:6443").with_pool("prod"),
                Cluster::new("fallback", "kubernetes", "https://192.0.2.10:6443")
                    .with_default(true),
            ],
        );
        let cluster = r.resolve("kubernetes", "kube").await.unwrap();
        assert_eq!(cluster.name, "fallback");
    }

    #[tokio::test]
    async fn test_explicit_binding_beats_default() {
        let r = resolver(
            vec![kube_pool("kube")],
            vec![
                Cluster::new("fallback", "kubernetes", "https://192.0.2.10:6443")
                    .with_default(true),
                Cluster::new("pinned", "kubernetes", "https://192.0.2.11:6443").with_pool("kube"),
            ],
        );
        let cluster = r.resolve("kubernetes", "kube").await.unwrap();
        assert_eq!(cluster.name, "pinned");
    }

    #[tokio::test]
    async fn test_duplicate_explicit_matches_pick_first_by_name() {
        // Write-time validation should prevent this; if it happens anyway
        // the resolver must stay deterministic rather than silently correct.
        let r = resolver(
            vec![kube_pool("kube")],
            vec![
                Cluster::new("zeta", "kubernetes", "https://192.0.2.11:6443").with_pool("kube"),
                Cluster::new("alpha", "kubernetes", "https://192.0.2.10:6443").with_pool("kube"),
            ],
        );
        let cluster = r.resolve("kubernetes", "kube").await.unwrap();
        assert_eq!(cluster.name, "alpha");
    }

    #[tokio::test]
    async fn test_default_of_other_provisioner_is_ignored() {
        let r = resolver(
            vec![kube_pool("kube")],
            vec![Cluster::new("d1", "local", "ssh://203.0.113.5").with_default(true)],
        );
        let err = r.resolve("kubernetes", "kube").await.unwrap_err();
        assert!(err.is_no_cluster());
    }
}
