//! CaravelApp Custom Resource Definition
//!
//! The CaravelApp CRD is the cluster-native representation of a managed
//! application. One object exists per application per cluster, named after
//! the application and living in the platform namespace. It is created by
//! normal provisioning or by the migration engine, never implicitly by
//! resolution.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::app::App;

/// Specification for a CaravelApp
///
/// Carries the primary-store fields the execution backend needs. The object
/// name (equal to the application name) is the identity; the spec is the
/// payload.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "caravel.dev",
    version = "v1alpha1",
    kind = "CaravelApp",
    plural = "caravelapps",
    shortname = "capp",
    namespaced,
    printcolumn = r#"{"name":"Pool","type":"string","jsonPath":".spec.pool"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CaravelAppSpec {
    /// Pool the application is assigned to
    pub pool: String,

    /// Teams owning the application
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teams: Vec<String>,

    /// Free-form description from the platform record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CaravelApp {
    /// Build the cluster-native representation of a primary-store app record
    pub fn from_record(app: &App) -> Self {
        let mut obj = CaravelApp::new(
            &app.name,
            CaravelAppSpec {
                pool: app.pool.clone(),
                teams: app.teams.clone(),
                description: app.description.clone(),
            },
        );
        obj.metadata.namespace = Some(crate::CARAVEL_NAMESPACE.to_string());
        obj
    }
}
