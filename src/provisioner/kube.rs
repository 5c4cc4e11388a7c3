//! Cluster-backed provisioner
//!
//! Routes every operation through the cluster resolver: the app's pool
//! picks the cluster, the client cache supplies the handle, and the
//! operation talks to that cluster's APIs. Units are the pods of the app's
//! Deployment in the platform namespace.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{AttachParams, DeleteParams, ListParams, Patch, PatchParams};
use tracing::{debug, info, warn};

use crate::app::App;
use crate::client::{AppCrClient, ClientCache, ClusterHandle};
use crate::provisioner::{OutputSink, Provisioner, Unit};
use crate::resolver::ClusterResolver;
use crate::{Error, Result, APP_LABEL_KEY, FIELD_MANAGER, KUBERNETES_PROVISIONER};

/// Provisioner executing applications on resolved Kubernetes clusters
pub struct KubeProvisioner {
    resolver: ClusterResolver,
    clients: Arc<ClientCache>,
}

impl KubeProvisioner {
    /// Create a provisioner over the given resolver and client cache
    pub fn new(resolver: ClusterResolver, clients: Arc<ClientCache>) -> Self {
        Self { resolver, clients }
    }

    /// Resolve the app's pool to a cluster and return its client handle
    async fn handle_for(&self, app: &App) -> Result<Arc<ClusterHandle>> {
        let cluster = self
            .resolver
            .resolve(KUBERNETES_PROVISIONER, &app.pool)
            .await?;
        self.clients.client_for(&cluster).await
    }

    /// List the app's pods, ordered by name for stable unit reporting
    async fn list_units(&self, handle: &ClusterHandle, app: &App) -> Result<Vec<Unit>> {
        let params = ListParams::default().labels(&app_selector(app));
        let pods = handle.pods().list(&params).await?;
        let mut units: Vec<Unit> = pods.iter().map(|p| unit_from_pod(app, p)).collect();
        units.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(units)
    }
}

#[async_trait]
impl Provisioner for KubeProvisioner {
    fn kind(&self) -> &str {
        KUBERNETES_PROVISIONER
    }

    async fn provision(&self, app: &App) -> Result<()> {
        let handle = self.handle_for(app).await?;
        handle.ensure_app_crd().await?;
        // AlreadyExists means a previous provision (or the migration
        // engine) created the object; provisioning is idempotent.
        let outcome = handle.create_app(app).await?;
        info!(app = %app.name, cluster = %handle.cluster_name(), outcome = ?outcome, "provisioned app");
        Ok(())
    }

    async fn destroy(&self, app: &App) -> Result<()> {
        let handle = self.handle_for(app).await?;
        match handle
            .apps()
            .delete(&app.name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!(app = %app.name, cluster = %handle.cluster_name(), "destroyed app");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn add_units(&self, app: &App, count: u32) -> Result<Vec<Unit>> {
        let handle = self.handle_for(app).await?;
        let deployments = handle.deployments();

        let deployment = deployments.get_opt(&app.name).await?.ok_or_else(|| {
            Error::provision_for(&app.name, "app has no workload deployment to scale")
        })?;
        let current = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        let desired = desired_replicas(current, count).ok_or_else(|| {
            Error::provision_for(&app.name, format!("cannot add {} units", count))
        })?;

        let patch = serde_json::json!({ "spec": { "replicas": desired } });
        deployments
            .patch(
                &app.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        debug!(app = %app.name, from = current, to = desired, "scaled workload");

        // Inventory as of the scale request; pods the controller has not
        // created yet are absent until they are scheduled.
        self.list_units(&handle, app).await
    }

    async fn remove_unit(&self, app: &App, unit_name: &str) -> Result<()> {
        let handle = self.handle_for(app).await?;
        remove_unit_via(handle.as_ref(), app, unit_name).await
    }

    async fn execute_command(
        &self,
        app: &App,
        command: &str,
        args: &[String],
        stdout: OutputSink<'_>,
        stderr: OutputSink<'_>,
    ) -> Result<()> {
        let handle = self.handle_for(app).await?;
        let units = self.list_units(&handle, app).await?;
        let target = units
            .iter()
            .find(|u| u.status == "running")
            .ok_or_else(|| Error::no_unit(&app.name))?;

        let mut cmd: Vec<String> = Vec::with_capacity(1 + args.len());
        cmd.push(command.to_string());
        cmd.extend(args.iter().cloned());

        let mut attached = handle
            .pods()
            .exec(
                &target.name,
                cmd,
                &AttachParams::default().stdout(true).stderr(true),
            )
            .await?;

        let mut out = attached
            .stdout()
            .ok_or_else(|| Error::internal_with_context("exec", "missing stdout stream"))?;
        let mut err = attached
            .stderr()
            .ok_or_else(|| Error::internal_with_context("exec", "missing stderr stream"))?;

        let (out_res, err_res) = tokio::join!(
            tokio::io::copy(&mut out, stdout),
            tokio::io::copy(&mut err, stderr),
        );
        out_res.map_err(|e| Error::provision_for(&app.name, format!("stdout stream: {}", e)))?;
        err_res.map_err(|e| Error::provision_for(&app.name, format!("stderr stream: {}", e)))?;

        attached
            .join()
            .await
            .map_err(|e| Error::provision_for(&app.name, format!("command failed: {}", e)))?;
        Ok(())
    }

    async fn address(&self, app: &App) -> Result<String> {
        let handle = self.handle_for(app).await?;
        let units = self.list_units(&handle, app).await?;
        units
            .iter()
            .find(|u| u.status == "running")
            .and_then(|u| u.address.clone())
            .ok_or_else(|| Error::no_unit(&app.name))
    }
}

/// Deployment and pod operations needed to remove one unit
///
/// Seam so the removal sequence can be exercised without a live cluster.
#[async_trait]
trait UnitScaleOps: Send + Sync {
    async fn pod_exists(&self, name: &str) -> Result<bool>;
    async fn replicas(&self, app: &str) -> Result<Option<i32>>;
    async fn set_replicas(&self, app: &str, replicas: i32) -> Result<()>;
    async fn delete_pod(&self, name: &str) -> Result<()>;
}

#[async_trait]
impl UnitScaleOps for ClusterHandle {
    async fn pod_exists(&self, name: &str) -> Result<bool> {
        Ok(self.pods().get_opt(name).await?.is_some())
    }

    async fn replicas(&self, app: &str) -> Result<Option<i32>> {
        Ok(self
            .deployments()
            .get_opt(app)
            .await?
            .and_then(|d| d.spec.as_ref().and_then(|s| s.replicas)))
    }

    async fn set_replicas(&self, app: &str, replicas: i32) -> Result<()> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.deployments()
            .patch(
                app,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        match self.pods().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Gone between the existence check and the delete; removed
            // either way.
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Remove one unit: verify it exists, shrink the workload, delete the pod
///
/// The replica count is patched only after the pod is confirmed to exist,
/// and restored if the delete then fails, so a failed removal never leaves
/// the deployment shrunk while the named unit keeps running.
async fn remove_unit_via(ops: &dyn UnitScaleOps, app: &App, unit_name: &str) -> Result<()> {
    if !ops.pod_exists(unit_name).await? {
        return Err(Error::provision_for(
            &app.name,
            format!("no unit {:?} running", unit_name),
        ));
    }

    let current = ops.replicas(&app.name).await?.unwrap_or(0);
    if current > 0 {
        ops.set_replicas(&app.name, current - 1).await?;
    }

    if let Err(e) = ops.delete_pod(unit_name).await {
        if current > 0 {
            if let Err(restore) = ops.set_replicas(&app.name, current).await {
                warn!(app = %app.name, error = %restore, "failed to restore replica count");
            }
        }
        return Err(e);
    }
    Ok(())
}

/// Replica target for a scale-up request, or None when it does not fit i32
fn desired_replicas(current: i32, count: u32) -> Option<i32> {
    i32::try_from(count).ok().and_then(|c| current.checked_add(c))
}

/// Label selector matching all of an app's workload pods
fn app_selector(app: &App) -> String {
    format!("{}={}", APP_LABEL_KEY, app.name)
}

/// Map a pod to the platform's unit representation
fn unit_from_pod(app: &App, pod: &Pod) -> Unit {
    let status = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("unknown")
        .to_lowercase();
    Unit {
        name: pod.metadata.name.clone().unwrap_or_default(),
        app: app.name.clone(),
        address: pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
        status,
    }
}
