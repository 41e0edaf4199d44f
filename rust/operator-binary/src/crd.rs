use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::{api::apps::v1::DeploymentSpec, apimachinery::pkg::apis::meta::v1::Time},
    kube::{CustomResource, ResourceExt},
    schemars::{self, JsonSchema},
};
use strum::Display;
use time::OffsetDateTime;

use crate::utils::k8s_time_to_offsetdatetime;

/// Port used by the aggregated API server when the description does not name one.
pub const DEFAULT_CONTAINER_PORT: i32 = 443;

/// Describes an installed operator, the workloads it runs, and the aggregated API services it owns.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "operators.coreos.com",
    version = "v1alpha1",
    kind = "ClusterServiceVersion",
    shortname = "csv",
    namespaced,
    status = "ClusterServiceVersionStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceVersionSpec {
    /// Name of the ClusterServiceVersion (in the same namespace) that this one supersedes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,

    #[serde(default)]
    pub apiservicedefinitions: ApiServiceDefinitions,

    #[serde(default)]
    pub install: NamedInstallStrategy,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiServiceDefinitions {
    /// API services that are served by one of this operator's own deployments.
    #[serde(default)]
    pub owned: Vec<ApiServiceDescription>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiServiceDescription {
    #[serde(default)]
    pub name: String,
    pub group: String,
    pub version: String,
    pub kind: String,
    /// The deployment (declared in the install strategy) that runs the extension API server.
    pub deployment_name: String,
    /// Port the extension API server listens on, defaults to 443 when unset or zero.
    #[serde(default)]
    pub container_port: i32,
}

impl ApiServiceDescription {
    /// Name of the cluster-scoped `APIService` object, `<version>.<group>`.
    pub fn api_service_name(&self) -> String {
        format!("{}.{}", self.version, self.group)
    }

    pub fn port(&self) -> i32 {
        if self.container_port > 0 {
            self.container_port
        } else {
            DEFAULT_CONTAINER_PORT
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamedInstallStrategy {
    #[serde(rename = "strategy", default)]
    pub strategy_name: String,
    #[serde(rename = "spec", default)]
    pub strategy_spec: StrategyDetailsDeployment,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDetailsDeployment {
    #[serde(rename = "deployments", default)]
    pub deployment_specs: Vec<StrategyDeploymentSpec>,
}

impl StrategyDetailsDeployment {
    pub fn deployment(&self, name: &str) -> Option<&StrategyDeploymentSpec> {
        self.deployment_specs.iter().find(|dep| dep.name == name)
    }

    pub fn deployment_mut(&mut self, name: &str) -> Option<&mut StrategyDeploymentSpec> {
        self.deployment_specs.iter_mut().find(|dep| dep.name == name)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDeploymentSpec {
    pub name: String,
    pub spec: DeploymentSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<BTreeMap<String, String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceVersionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<CsvPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last time the serving certificates of the owned API services were (re)issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certs_last_updated: Option<Time>,
    /// Time at which the serving certificates must be reissued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certs_rotate_at: Option<Time>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Display)]
pub enum CsvPhase {
    Pending,
    InstallReady,
    Installing,
    Succeeded,
    Failed,
    Replacing,
    Deleting,
    Unknown,
}

impl ClusterServiceVersion {
    pub fn owned_api_services(&self) -> &[ApiServiceDescription] {
        &self.spec.apiservicedefinitions.owned
    }

    pub fn phase(&self) -> Option<CsvPhase> {
        self.status.as_ref().and_then(|status| status.phase)
    }

    /// Whether this descriptor is on its way out, either superseded by a newer descriptor or being deleted.
    pub fn is_being_replaced(&self) -> bool {
        matches!(
            self.phase(),
            Some(CsvPhase::Replacing) | Some(CsvPhase::Deleting)
        )
    }

    /// The name of the descriptor this one replaces, if any.
    pub fn replaces(&self) -> Option<&str> {
        self.spec.replaces.as_deref().filter(|name| !name.is_empty())
    }

    pub fn certs_last_updated(&self) -> Option<OffsetDateTime> {
        self.status
            .as_ref()?
            .certs_last_updated
            .as_ref()
            .and_then(|t| k8s_time_to_offsetdatetime(t).ok())
    }

    pub fn certs_rotate_at(&self) -> Option<OffsetDateTime> {
        self.status
            .as_ref()?
            .certs_rotate_at
            .as_ref()
            .and_then(|t| k8s_time_to_offsetdatetime(t).ok())
    }

    /// Namespace of the descriptor, all namespaced resources owned through it are created here.
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }
}
