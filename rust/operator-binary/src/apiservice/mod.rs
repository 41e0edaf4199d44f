//! Provisioning, verification and cleanup of the objects that back an aggregated API service
//!
//! Every object kind has one pure function describing its desired state and one function merging the
//! fields owned here into an observed object, so that installation and verification can never disagree
//! about what "correct" looks like.

use std::collections::BTreeMap;

use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::DeploymentSpec,
            core::v1::{
                KeyToPath, PodTemplateSpec, Secret, SecretVolumeSource, Service, ServicePort,
                ServiceSpec, Volume, VolumeMount,
            },
            rbac::v1::{ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject},
        },
        apimachinery::pkg::util::intstr::IntOrString,
        kube_aggregator::pkg::apis::apiregistration::v1::{
            APIService, APIServiceSpec, ServiceReference,
        },
        ByteString,
    },
    kube::api::ObjectMeta,
};

use crate::crd::ApiServiceDescription;

pub mod cleanup;
pub mod install;
pub mod legacy;
pub mod verify;

/// Pod template (and Secret) annotation holding the SHA-256 of the CA certificate in use.
pub const CA_HASH_ANNOTATION: &str = "olmcahash";

pub const SECRET_CERT_KEY: &str = "tls.crt";
pub const SECRET_KEY_KEY: &str = "tls.key";
pub const SECRET_CA_KEY: &str = "olmCAKey";
const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";

pub const CERT_VOLUME_NAME: &str = "apiservice-cert";
/// Where extension API servers conventionally look for their serving certificate.
pub const CERT_MOUNT_PATH: &str = "/apiserver.local.config/certificates";
const CERT_FILE_NAME: &str = "apiserver.crt";
const KEY_FILE_NAME: &str = "apiserver.key";

pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";
pub const AUTH_READER_ROLE: &str = "extension-apiserver-authentication-reader";
pub const AUTH_DELEGATOR_CLUSTER_ROLE: &str = "system:auth-delegator";
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
const GROUP_PRIORITY_MINIMUM: i32 = 2000;
const VERSION_PRIORITY: i32 = 15;

/// Names of every object created for a single backing Service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceNames {
    pub service: String,
    pub secret: String,
    pub role: String,
    pub role_binding: String,
    pub cluster_role_binding: String,
    pub auth_reader_role_binding: String,
}

impl ResourceNames {
    pub fn for_service(service: &str) -> Self {
        let secret = format!("{service}-cert");
        Self {
            service: service.to_string(),
            role: secret.clone(),
            role_binding: secret.clone(),
            secret,
            cluster_role_binding: format!("{service}-{AUTH_DELEGATOR_CLUSTER_ROLE}"),
            auth_reader_role_binding: format!("{service}-auth-reader"),
        }
    }

    pub fn for_deployment(deployment: &str) -> Self {
        Self::for_service(&service_name(deployment))
    }

    /// Names used before objects were named after their deployment, derived from the API service name.
    pub fn legacy(description: &ApiServiceDescription) -> Self {
        Self::for_service(&description.api_service_name().replace('.', "-"))
    }
}

pub fn service_name(deployment: &str) -> String {
    format!("{deployment}-service")
}

/// DNS names that the serving certificate of `service` must be valid for.
pub fn serving_hosts(service: &str, namespace: &str) -> Vec<String> {
    vec![
        format!("{service}.{namespace}"),
        format!("{service}.{namespace}.svc"),
    ]
}

fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..ObjectMeta::default()
    }
}

/// The Service account a deployment runs as.
pub fn service_account_of(spec: &DeploymentSpec) -> &str {
    spec.template
        .spec
        .as_ref()
        .and_then(|pod| pod.service_account_name.as_deref())
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_SERVICE_ACCOUNT)
}

/// De-duplicated ports of all `descriptions`, in declaration order.
pub fn service_ports<'a>(
    descriptions: impl IntoIterator<Item = &'a ApiServiceDescription>,
) -> Vec<ServicePort> {
    let mut ports = Vec::<ServicePort>::new();
    for port in descriptions.into_iter().map(ApiServiceDescription::port) {
        if ports.iter().any(|existing| existing.port == port) {
            continue;
        }
        ports.push(ServicePort {
            name: Some(port.to_string()),
            port,
            target_port: Some(IntOrString::Int(port)),
            protocol: Some("TCP".to_string()),
            ..ServicePort::default()
        });
    }
    ports
}

pub fn desired_service(
    names: &ResourceNames,
    namespace: &str,
    deployment: &DeploymentSpec,
    ports: Vec<ServicePort>,
) -> Service {
    Service {
        metadata: meta(&names.service, Some(namespace)),
        spec: Some(ServiceSpec {
            selector: deployment.selector.match_labels.clone(),
            ports: Some(ports),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

pub fn merge_service(observed: &mut Service, desired: Service) {
    let desired = desired.spec.unwrap_or_default();
    let spec = observed.spec.get_or_insert_with(Default::default);
    spec.selector = desired.selector;
    spec.ports = desired.ports;
}

/// PEM material persisted in the serving certificate Secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub ca_pem: Vec<u8>,
    pub ca_hash: String,
}

pub fn desired_secret(names: &ResourceNames, namespace: &str, material: &SecretMaterial) -> Secret {
    let mut metadata = meta(&names.secret, Some(namespace));
    metadata.annotations = Some(BTreeMap::from([(
        CA_HASH_ANNOTATION.to_string(),
        material.ca_hash.clone(),
    )]));
    Secret {
        metadata,
        data: Some(BTreeMap::from([
            (
                SECRET_CERT_KEY.to_string(),
                ByteString(material.cert_pem.clone()),
            ),
            (
                SECRET_KEY_KEY.to_string(),
                ByteString(material.key_pem.clone()),
            ),
            (
                SECRET_CA_KEY.to_string(),
                ByteString(material.ca_pem.clone()),
            ),
        ])),
        type_: Some(SECRET_TYPE_TLS.to_string()),
        ..Secret::default()
    }
}

pub fn merge_secret(observed: &mut Secret, desired: Secret) {
    observed.data = desired.data;
    observed.string_data = None;
    observed.type_ = desired.type_;
    let annotations = observed.metadata.annotations.get_or_insert_with(Default::default);
    annotations.extend(desired.metadata.annotations.unwrap_or_default());
}

/// The rule allowing a workload to read its own serving certificate Secret.
pub fn secret_get_rule(secret: &str) -> PolicyRule {
    PolicyRule {
        verbs: vec!["get".to_string()],
        api_groups: Some(vec![String::new()]),
        resources: Some(vec!["secrets".to_string()]),
        resource_names: Some(vec![secret.to_string()]),
        ..PolicyRule::default()
    }
}

pub fn desired_role(names: &ResourceNames, namespace: &str) -> Role {
    Role {
        metadata: meta(&names.role, Some(namespace)),
        rules: Some(vec![secret_get_rule(&names.secret)]),
    }
}

pub fn merge_role(observed: &mut Role, desired: Role) {
    observed.rules = desired.rules;
}

fn service_account_subject(service_account: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: service_account.to_string(),
        namespace: Some(namespace.to_string()),
        api_group: None,
    }
}

fn role_ref(kind: &str, name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

/// Grants the workload's Service account the Secret reader [`Role`].
pub fn desired_role_binding(
    names: &ResourceNames,
    namespace: &str,
    service_account: &str,
) -> RoleBinding {
    RoleBinding {
        metadata: meta(&names.role_binding, Some(namespace)),
        role_ref: role_ref("Role", &names.role),
        subjects: Some(vec![service_account_subject(service_account, namespace)]),
    }
}

/// Allows the workload to read the client CA used for delegated authentication.
pub fn desired_auth_reader_role_binding(
    names: &ResourceNames,
    namespace: &str,
    service_account: &str,
) -> RoleBinding {
    RoleBinding {
        metadata: meta(&names.auth_reader_role_binding, Some(KUBE_SYSTEM_NAMESPACE)),
        role_ref: role_ref("Role", AUTH_READER_ROLE),
        subjects: Some(vec![service_account_subject(service_account, namespace)]),
    }
}

pub fn merge_role_binding(observed: &mut RoleBinding, desired: RoleBinding) {
    observed.role_ref = desired.role_ref;
    observed.subjects = desired.subjects;
}

/// Allows the workload to delegate authentication and authorization decisions to the API server.
pub fn desired_cluster_role_binding(
    names: &ResourceNames,
    namespace: &str,
    service_account: &str,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: meta(&names.cluster_role_binding, None),
        role_ref: role_ref("ClusterRole", AUTH_DELEGATOR_CLUSTER_ROLE),
        subjects: Some(vec![service_account_subject(service_account, namespace)]),
    }
}

pub fn merge_cluster_role_binding(observed: &mut ClusterRoleBinding, desired: ClusterRoleBinding) {
    observed.role_ref = desired.role_ref;
    observed.subjects = desired.subjects;
}

pub fn desired_api_service(
    description: &ApiServiceDescription,
    service: &str,
    namespace: &str,
    ca_pem: &[u8],
) -> APIService {
    APIService {
        metadata: meta(&description.api_service_name(), None),
        spec: Some(APIServiceSpec {
            group: Some(description.group.clone()),
            version: Some(description.version.clone()),
            group_priority_minimum: GROUP_PRIORITY_MINIMUM,
            version_priority: VERSION_PRIORITY,
            service: Some(ServiceReference {
                namespace: Some(namespace.to_string()),
                name: Some(service.to_string()),
                port: Some(description.port()),
            }),
            ca_bundle: Some(ByteString(ca_pem.to_vec())),
            insecure_skip_tls_verify: None,
        }),
        status: None,
    }
}

pub fn merge_api_service(observed: &mut APIService, desired: APIService) {
    observed.spec = desired.spec;
}

fn cert_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            items: Some(vec![
                KeyToPath {
                    key: SECRET_CERT_KEY.to_string(),
                    path: CERT_FILE_NAME.to_string(),
                    mode: None,
                },
                KeyToPath {
                    key: SECRET_KEY_KEY.to_string(),
                    path: KEY_FILE_NAME.to_string(),
                    mode: None,
                },
            ]),
            ..SecretVolumeSource::default()
        }),
        ..Volume::default()
    }
}

/// Mounts the serving certificate `secret` into every container of `deployment` and stamps the pod
/// template with `ca_hash`, forcing a rollout whenever the CA changes.
///
/// A volume already named [`CERT_VOLUME_NAME`] is replaced in place. Failing that, a volume that some
/// container already mounts at [`CERT_MOUNT_PATH`] is repointed at `secret` under its existing name.
pub fn apply_cert_volume(deployment: &mut DeploymentSpec, secret: &str, ca_hash: &str) {
    let template = &mut deployment.template;
    template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(Default::default)
        .insert(CA_HASH_ANNOTATION.to_string(), ca_hash.to_string());

    let pod = template.spec.get_or_insert_with(Default::default);
    let mounted_at_cert_path = pod
        .containers
        .iter()
        .flat_map(|container| container.volume_mounts.iter().flatten())
        .find(|mount| mount.mount_path == CERT_MOUNT_PATH)
        .map(|mount| mount.name.clone());
    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    let volume_name = if volumes.iter().any(|v| v.name == CERT_VOLUME_NAME) {
        CERT_VOLUME_NAME.to_string()
    } else {
        mounted_at_cert_path
            .filter(|name| volumes.iter().any(|v| &v.name == name))
            .unwrap_or_else(|| CERT_VOLUME_NAME.to_string())
    };
    let volume = cert_volume(&volume_name, secret);
    match volumes.iter_mut().find(|v| v.name == volume_name) {
        Some(existing) => *existing = volume,
        None => volumes.push(volume),
    }

    for container in &mut pod.containers {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        if !mounts.iter().any(|mount| mount.mount_path == CERT_MOUNT_PATH) {
            mounts.push(VolumeMount {
                name: volume_name.clone(),
                mount_path: CERT_MOUNT_PATH.to_string(),
                ..VolumeMount::default()
            });
        }
    }
}

/// Whether the certificate fields of `deployment` already match what [`apply_cert_volume`] would
/// write, ignoring anything else the API server may have defaulted.
pub fn cert_volume_applied(deployment: &DeploymentSpec, secret: &str, ca_hash: &str) -> bool {
    let template = &deployment.template;
    let Some(pod) = &template.spec else {
        return false;
    };
    if pod_template_ca_hash(template) != Some(ca_hash) {
        return false;
    }
    let Some(expected) = cert_volume(CERT_VOLUME_NAME, secret).secret else {
        return false;
    };
    let cert_volumes = pod
        .volumes
        .iter()
        .flatten()
        .filter(|volume| {
            volume.secret.as_ref().is_some_and(|source| {
                source.secret_name == expected.secret_name && source.items == expected.items
            })
        })
        .map(|volume| volume.name.as_str())
        .collect::<Vec<_>>();
    pod.containers.iter().all(|container| {
        container
            .volume_mounts
            .iter()
            .flatten()
            .any(|mount| mount.mount_path == CERT_MOUNT_PATH && cert_volumes.contains(&mount.name.as_str()))
    })
}

pub fn pod_template_ca_hash(template: &PodTemplateSpec) -> Option<&str> {
    template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(CA_HASH_ANNOTATION)
        .map(String::as_str)
}

pub fn secret_ca_hash(secret: &Secret) -> Option<&str> {
    secret
        .metadata
        .annotations
        .as_ref()?
        .get(CA_HASH_ANNOTATION)
        .map(String::as_str)
}

pub fn secret_data<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()?
        .get(key)
        .map(|value| value.0.as_slice())
}
