//! Orchestration core for the Caravel multi-tenant application platform
//!
//! This crate decides, for every managed application, which infrastructure
//! provisioner and which remote Kubernetes cluster runs its workload, and it
//! keeps the platform's primary-store view of an application consistent with
//! the cluster-native `CaravelApp` custom resource.
//!
//! The main pieces:
//! - [`registry`] — pool and cluster registries (read-only to this core)
//! - [`resolver`] — routes a (provisioner-type, pool) pair to a cluster
//! - [`client`] — per-cluster API client handles with a process-wide cache
//! - [`provisioner`] — the provisioner capability set and dispatcher
//! - [`migrate`] — bulk migration of app records into custom resources

#![deny(missing_docs)]

pub mod app;
pub mod client;
pub mod crd;
pub mod error;
pub mod migrate;
pub mod provisioner;
pub mod registry;
pub mod resolver;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace in which Caravel keeps its cluster-native app resources
pub const CARAVEL_NAMESPACE: &str = "caravel-system";

/// Field manager name used for API writes issued by this core
pub const FIELD_MANAGER: &str = "caravel-core";

/// Provisioner-type name for the cluster-backed (Kubernetes) provisioner
pub const KUBERNETES_PROVISIONER: &str = "kubernetes";

/// Provisioner-type name for the legacy single-host provisioner
pub const LOCAL_PROVISIONER: &str = "local";

/// Label key identifying the owning application on workload resources
pub const APP_LABEL_KEY: &str = "caravel.dev/app";
