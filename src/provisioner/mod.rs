//! Provisioner capability set and dispatch
//!
//! A provisioner is the backend-specific implementation that provisions,
//! destroys and scales an application's workload. The [`Dispatcher`] maps
//! provisioner-type names to implementations and routes "act on app" calls
//! via the app's pool. It only routes; operation failures surface to the
//! caller unchanged.

pub mod kube;
pub mod local;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tracing::debug;

use crate::app::App;
use crate::registry::SharedPoolRegistry;
use crate::{Error, Result};

pub use kube::KubeProvisioner;
pub use local::LocalProvisioner;

/// A running unit (instance) of an application
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Unit {
    /// Unit name, unique within the application
    pub name: String,
    /// Owning application name
    pub app: String,
    /// Network address of the unit, if known
    pub address: Option<String>,
    /// Backend-specific status string (e.g. "running", "pending")
    pub status: String,
}

/// Writable sink for command output streamed from a unit
///
/// Boxed trait object so [`Provisioner`] stays object-safe while callers
/// pass arbitrary `AsyncWrite` destinations.
pub type OutputSink<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

/// The capability set every provisioner backend implements
///
/// Known variants: the cluster-backed [`KubeProvisioner`] and the legacy
/// single-host [`LocalProvisioner`]. Adding a backend means adding an
/// implementation, not touching the dispatcher's routing.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provisioner-type name this implementation registers under
    fn kind(&self) -> &str;

    /// Create the backing workload for the application
    async fn provision(&self, app: &App) -> Result<()>;

    /// Tear down the application's workload
    async fn destroy(&self, app: &App) -> Result<()>;

    /// Add `count` units to the application
    ///
    /// Returns the app's unit inventory as of the scale request; units the
    /// backend has accepted but not yet started may be absent.
    async fn add_units(&self, app: &App, count: u32) -> Result<Vec<Unit>>;

    /// Remove one unit by name
    async fn remove_unit(&self, app: &App, unit_name: &str) -> Result<()>;

    /// Run a command on one of the application's units, streaming output
    /// into the provided sinks
    async fn execute_command(
        &self,
        app: &App,
        command: &str,
        args: &[String],
        stdout: OutputSink<'_>,
        stderr: OutputSink<'_>,
    ) -> Result<()>;

    /// Network address callers use to reach the application
    ///
    /// Fails with [`Error::NoUnit`] when the application has no running
    /// unit; implementations must guard this explicitly.
    async fn address(&self, app: &App) -> Result<String>;
}

impl std::fmt::Debug for dyn Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Routes applications to provisioner implementations
///
/// Holds the name → implementation registry and the pool registry needed
/// to resolve an app's provisioner-type from its pool.
pub struct Dispatcher {
    provisioners: HashMap<String, Arc<dyn Provisioner>>,
    pools: SharedPoolRegistry,
}

impl Dispatcher {
    /// Create a dispatcher with an empty provisioner registry
    pub fn new(pools: SharedPoolRegistry) -> Self {
        Self {
            provisioners: HashMap::new(),
            pools,
        }
    }

    /// Register a provisioner under its [`Provisioner::kind`] name
    ///
    /// Re-registering a name replaces the previous implementation.
    pub fn register(&mut self, provisioner: Arc<dyn Provisioner>) -> &mut Self {
        self.provisioners
            .insert(provisioner.kind().to_string(), provisioner);
        self
    }

    /// Get the provisioner registered under the given type name
    pub fn dispatch(&self, provisioner_type: &str) -> Result<Arc<dyn Provisioner>> {
        self.provisioners
            .get(provisioner_type)
            .cloned()
            .ok_or_else(|| Error::unknown_provisioner(provisioner_type))
    }

    /// Resolve the provisioner responsible for the given application
    ///
    /// Follows app → pool → provisioner-type → implementation. A dangling
    /// pool reference is a configuration error, not a routing miss.
    pub async fn for_app(&self, app: &App) -> Result<Arc<dyn Provisioner>> {
        let pool = self
            .pools
            .get(&app.pool)
            .await?
            .ok_or_else(|| Error::pool_not_found(&app.name, &app.pool))?;
        debug!(app = %app.name, pool = %pool.name, provisioner = %pool.provisioner, "dispatching");
        self.dispatch(&pool.provisioner)
    }
}
