//! Installs the objects backing every API service owned by a [`ClusterServiceVersion`]

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::{apps::v1::Deployment, core::v1::Secret},
    kube::{
        api::{DynamicObject, ObjectMeta},
        runtime::reflector::ObjectRef,
        Resource, ResourceExt,
    },
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::{
    apply_cert_volume, cert_volume_applied, desired_api_service, desired_auth_reader_role_binding,
    desired_cluster_role_binding, desired_role, desired_role_binding, desired_secret,
    desired_service, legacy, merge_api_service, merge_cluster_role_binding, merge_role,
    merge_role_binding, merge_secret, merge_service, pod_template_ca_hash, secret_ca_hash, secret_data,
    service_account_of, service_ports, serving_hosts, ResourceNames, SecretMaterial,
    SECRET_CA_KEY, SECRET_CERT_KEY, SECRET_KEY_KEY,
};
use crate::{
    certs::{self, active, pem_sha256, pem_to_cert, should_rotate_certs, verify_cert, Issuer},
    cluster::{self, object_ref_of, ApiObject, Cluster},
    crd::{ApiServiceDescription, ClusterServiceVersion, StrategyDetailsDeployment},
    ownership::{self, is_adoptable, Owner, OwnerSet},
    utils::{offsetdatetime_to_k8s_time, DateTimeOutOfBoundsError},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("deployment {deployment:?} is not part of the install strategy"))]
    DeploymentNotFound { deployment: String },

    #[snafu(display("failed to issue certificates"))]
    IssueCertificates { source: certs::Error },

    #[snafu(display("failed to read existing object"))]
    Get { source: cluster::Error },

    #[snafu(display("failed to create object"))]
    Create { source: cluster::Error },

    #[snafu(display("failed to update object"))]
    Update { source: cluster::Error },

    #[snafu(display("failed to check whether {object} can be adopted"))]
    AdoptionCheck {
        source: ownership::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("{object} is owned by another ClusterServiceVersion and cannot be adopted"))]
    NotAdoptable { object: ObjectRef<DynamicObject> },

    #[snafu(display("failed to remove legacy resources of API service {api_service:?}"))]
    DeleteLegacyResources {
        source: legacy::Error,
        api_service: String,
    },

    #[snafu(display("failed to record certificate timestamps"))]
    RecordTimestamps { source: DateTimeOutOfBoundsError },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the install failed because of conflicting ownership, which reinstalling cannot fix.
    pub fn is_adoption_failure(&self) -> bool {
        matches!(self, Error::NotAdoptable { .. } | Error::AdoptionCheck { .. })
    }
}

/// The owned API services served by a single deployment, which share one Service and Secret.
struct DeploymentGroup<'a> {
    deployment: &'a str,
    names: ResourceNames,
    descriptions: Vec<&'a ApiServiceDescription>,
}

fn group_by_deployment(descriptions: &[ApiServiceDescription]) -> Vec<DeploymentGroup<'_>> {
    let mut groups = Vec::<DeploymentGroup>::new();
    for description in descriptions {
        match groups
            .iter_mut()
            .find(|group| group.deployment == description.deployment_name)
        {
            Some(group) => group.descriptions.push(description),
            None => groups.push(DeploymentGroup {
                deployment: &description.deployment_name,
                names: ResourceNames::for_deployment(&description.deployment_name),
                descriptions: vec![description],
            }),
        }
    }
    groups
}

/// Freshly issued certificate lifetimes that must be recorded on the descriptor.
struct Issued {
    at: OffsetDateTime,
    rotate_at: OffsetDateTime,
}

/// Provisions Services, Secrets, RBAC and APIServices on behalf of descriptors.
pub struct Installer<C> {
    cluster: C,
    issuer: Issuer,
}

impl<C: Cluster> Installer<C> {
    pub fn new(cluster: C, issuer: Issuer) -> Self {
        Self { cluster, issuer }
    }

    /// Makes sure every API service owned by `csv` is backed by the objects it needs, returning
    /// `strategy` with the deployments patched to mount their serving certificates.
    ///
    /// Certificate material is only (re)issued when `csv` is due for rotation or the existing Secrets
    /// are inconsistent, in which case the new timestamps are recorded on the status of `csv`.
    pub async fn install_owned_api_service_requirements(
        &self,
        csv: &mut ClusterServiceVersion,
        strategy: &StrategyDetailsDeployment,
    ) -> Result<StrategyDetailsDeployment> {
        let mut strategy = strategy.clone();
        let descriptions = csv.owned_api_services().to_vec();
        if descriptions.is_empty() {
            return Ok(strategy);
        }
        let namespace = csv.namespace_or_default();
        let groups = group_by_deployment(&descriptions);
        for group in &groups {
            strategy
                .deployment(group.deployment)
                .context(DeploymentNotFoundSnafu {
                    deployment: group.deployment,
                })?;
        }

        let reused = if should_rotate_certs(csv, self.issuer.now()) {
            None
        } else {
            self.reusable_material(&namespace, &groups).await?
        };
        let (materials, issued) = match reused {
            Some(materials) => {
                debug!(csv = %csv.name_any(), "reusing existing certificate material");
                (materials, None)
            }
            None => {
                let (materials, issued) = self.issue_material(&namespace, &groups)?;
                (materials, Some(issued))
            }
        };

        for (group, material) in groups.iter().zip(&materials) {
            let names = &group.names;
            let deployment = strategy
                .deployment_mut(group.deployment)
                .context(DeploymentNotFoundSnafu {
                    deployment: group.deployment,
                })?;
            let service_account = service_account_of(&deployment.spec).to_string();
            let ports = service_ports(group.descriptions.iter().copied());
            let service = desired_service(names, &namespace, &deployment.spec, ports);
            apply_cert_volume(&mut deployment.spec, &names.secret, &material.ca_hash);

            self.upsert(csv, service, merge_service).await?;
            self.upsert(csv, desired_secret(names, &namespace, material), merge_secret)
                .await?;
            self.upsert(csv, desired_role(names, &namespace), merge_role)
                .await?;
            self.upsert(
                csv,
                desired_role_binding(names, &namespace, &service_account),
                merge_role_binding,
            )
            .await?;
            self.upsert(
                csv,
                desired_cluster_role_binding(names, &namespace, &service_account),
                merge_cluster_role_binding,
            )
            .await?;
            self.upsert(
                csv,
                desired_auth_reader_role_binding(names, &namespace, &service_account),
                merge_role_binding,
            )
            .await?;

            for description in &group.descriptions {
                let api_service =
                    desired_api_service(description, &names.service, &namespace, &material.ca_pem);
                self.upsert(csv, api_service, merge_api_service).await?;
                legacy::delete_legacy_api_service_resources(&self.cluster, csv, description)
                    .await
                    .with_context(|_| DeleteLegacyResourcesSnafu {
                        api_service: description.api_service_name(),
                    })?;
            }
        }

        if let Some(issued) = issued {
            let status = csv.status.get_or_insert_with(Default::default);
            status.certs_last_updated =
                Some(offsetdatetime_to_k8s_time(issued.at).context(RecordTimestampsSnafu)?);
            status.certs_rotate_at =
                Some(offsetdatetime_to_k8s_time(issued.rotate_at).context(RecordTimestampsSnafu)?);
            info!(
                csv = %csv.name_any(),
                rotate_at = %issued.rotate_at,
                "issued new certificates for owned API services"
            );
        }
        Ok(strategy)
    }

    /// Writes the (patched) deployments of `strategy` to the cluster.
    pub async fn apply_deployments(
        &self,
        csv: &ClusterServiceVersion,
        strategy: &StrategyDetailsDeployment,
    ) -> Result<()> {
        let namespace = csv.namespace_or_default();
        for deployment in &strategy.deployment_specs {
            let desired = Deployment {
                metadata: ObjectMeta {
                    name: Some(deployment.name.clone()),
                    namespace: Some(namespace.clone()),
                    labels: deployment.label.clone(),
                    ..ObjectMeta::default()
                },
                spec: Some(deployment.spec.clone()),
                status: None,
            };
            self.upsert(csv, desired, merge_deployment).await?;
        }
        Ok(())
    }

    fn issue_material(
        &self,
        namespace: &str,
        groups: &[DeploymentGroup<'_>],
    ) -> Result<(Vec<SecretMaterial>, Issued)> {
        let at = self.issuer.now();
        let expiration = self.issuer.expiration();
        let rotate_at = self.issuer.rotates_at(expiration);
        let ca = self
            .issuer
            .generate_ca(expiration)
            .context(IssueCertificatesSnafu)?;
        let (ca_pem, _) = ca.to_pem().context(IssueCertificatesSnafu)?;
        let ca_hash = pem_sha256(&ca_pem);
        let materials = groups
            .iter()
            .map(|group| -> Result<SecretMaterial> {
                let hosts = serving_hosts(&group.names.service, namespace);
                let (cert_pem, key_pem) = self
                    .issuer
                    .create_signed_serving_pair(rotate_at, &ca, &hosts)
                    .and_then(|pair| pair.to_pem())
                    .context(IssueCertificatesSnafu)?;
                Ok(SecretMaterial {
                    cert_pem,
                    key_pem,
                    ca_pem: ca_pem.clone(),
                    ca_hash: ca_hash.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((materials, Issued { at, rotate_at }))
    }

    /// Returns the material already stored in the Secrets of `groups`, if all of it is still usable
    /// and was issued by the same CA.
    async fn reusable_material(
        &self,
        namespace: &str,
        groups: &[DeploymentGroup<'_>],
    ) -> Result<Option<Vec<SecretMaterial>>> {
        let now = self.issuer.now();
        let mut materials = Vec::<SecretMaterial>::new();
        for group in groups {
            let secret = self
                .cluster
                .get_opt::<Secret>(&group.names.secret, Some(namespace))
                .await
                .context(GetSnafu)?;
            let Some(material) = secret
                .as_ref()
                .and_then(|secret| consistent_material(secret, &group.names, namespace, now))
            else {
                debug!(
                    secret = group.names.secret,
                    "stored certificate material is missing or inconsistent"
                );
                return Ok(None);
            };
            if materials
                .first()
                .is_some_and(|first| first.ca_pem != material.ca_pem)
            {
                debug!(
                    secret = group.names.secret,
                    "stored certificate material was issued by different CAs"
                );
                return Ok(None);
            }
            materials.push(material);
        }
        Ok(Some(materials))
    }

    async fn upsert<K>(
        &self,
        csv: &ClusterServiceVersion,
        desired: K,
        merge: fn(&mut K, K),
    ) -> Result<K>
    where
        K: ApiObject + PartialEq,
    {
        let object = object_ref_of(&desired);
        let owners = OwnerSet::single(Owner::of(csv));
        let observed = self
            .cluster
            .get_opt::<K>(&desired.name_any(), desired.meta().namespace.as_deref())
            .await
            .context(GetSnafu)?;
        let Some(observed) = observed else {
            let mut created = desired;
            owners.apply_to(created.meta_mut());
            info!(%object, "creating object");
            return self.cluster.create(&created).await.context(CreateSnafu);
        };

        let adoptable = is_adoptable(&self.cluster, csv, observed.meta())
            .await
            .with_context(|_| AdoptionCheckSnafu {
                object: object.clone(),
            })?;
        if !adoptable {
            warn!(%object, csv = %csv.name_any(), "refusing to adopt object owned by another ClusterServiceVersion");
            return NotAdoptableSnafu { object }.fail();
        }

        let mut updated = observed.clone();
        merge(&mut updated, desired);
        owners.apply_to(updated.meta_mut());
        if updated == observed {
            debug!(%object, "object is up to date");
            return Ok(observed);
        }
        info!(%object, "updating object");
        self.cluster.update(&updated).await.context(UpdateSnafu)
    }
}

/// Only the labels and the certificate fields are carried over to an existing Deployment, the rest
/// of its spec belongs to whoever created it (and to the API server's defaulting).
fn merge_deployment(observed: &mut Deployment, desired: Deployment) {
    if let Some(labels) = desired.metadata.labels {
        observed
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .extend(labels);
    }
    let Some(desired_spec) = desired.spec else {
        return;
    };
    let secret = ResourceNames::for_deployment(&observed.name_any()).secret;
    let ca_hash = pod_template_ca_hash(&desired_spec.template).map(str::to_string);
    match (&mut observed.spec, ca_hash) {
        (Some(spec), Some(ca_hash)) => {
            if !cert_volume_applied(spec, &secret, &ca_hash) {
                apply_cert_volume(spec, &secret, &ca_hash);
            }
        }
        (spec, _) => *spec = Some(desired_spec),
    }
}

/// Reads the material out of `secret`, provided it is complete, current and self-consistent.
fn consistent_material(
    secret: &Secret,
    names: &ResourceNames,
    namespace: &str,
    now: OffsetDateTime,
) -> Option<SecretMaterial> {
    let cert_pem = secret_data(secret, SECRET_CERT_KEY)?;
    let key_pem = secret_data(secret, SECRET_KEY_KEY)?;
    let ca_pem = secret_data(secret, SECRET_CA_KEY)?;
    let ca_hash = pem_sha256(ca_pem);
    if secret_ca_hash(secret) != Some(ca_hash.as_str()) {
        return None;
    }
    let ca = pem_to_cert(ca_pem).ok()?;
    let cert = pem_to_cert(cert_pem).ok()?;
    if !active(&ca, now) || !active(&cert, now) {
        return None;
    }
    serving_hosts(&names.service, namespace)
        .iter()
        .all(|host| verify_cert(&ca, &cert, host).is_ok())
        .then(|| SecretMaterial {
            cert_pem: cert_pem.to_vec(),
            key_pem: key_pem.to_vec(),
            ca_pem: ca_pem.to_vec(),
            ca_hash,
        })
}
