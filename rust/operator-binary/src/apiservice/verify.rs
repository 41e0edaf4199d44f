//! Checks that every object backing the API services of a [`ClusterServiceVersion`] is present and
//! consistent with the others

use std::{fmt::Display, sync::Arc};

use snafu::Snafu;
use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::Deployment,
            core::v1::{Secret, Service, ServiceAccount},
            rbac::v1::{ClusterRole, PolicyRule, Role},
        },
        kube_aggregator::pkg::apis::apiregistration::v1::APIService,
    },
    kube::ResourceExt,
};
use tracing::debug;

use super::{
    pod_template_ca_hash, secret_ca_hash, secret_data, secret_get_rule, service_account_of,
    serving_hosts, ResourceNames, AUTH_DELEGATOR_CLUSTER_ROLE, AUTH_READER_ROLE,
    DEFAULT_SERVICE_ACCOUNT, KUBE_SYSTEM_NAMESPACE, SECRET_CERT_KEY,
};
use crate::{
    certs::{self, active, pem_to_cert, verify_cert, Clock},
    cluster::{self, Cluster},
    crd::{ApiServiceDescription, ClusterServiceVersion},
    ownership::{self, is_adoptable},
    rbac::{self, RuleChecker},
};

/// A single broken link in the chain of objects backing an API service.
///
/// Faults can be repaired by installing the API service again.
#[derive(Debug, Snafu)]
pub enum Fault {
    #[snafu(display("failed to read cluster state"))]
    Lookup { source: cluster::Error },

    #[snafu(display("APIService {api_service:?} does not exist"))]
    ApiServiceMissing { api_service: String },

    #[snafu(display("Service {service:?} does not exist"))]
    ServiceMissing { service: String },

    #[snafu(display("APIService {api_service:?} points at Service {found:?} instead of {expected:?}"))]
    ServiceReferenceMismatch {
        api_service: String,
        expected: String,
        found: String,
    },

    #[snafu(display("APIService {api_service:?} has no CA bundle"))]
    CaBundleMissing { api_service: String },

    #[snafu(display("CA bundle of APIService {api_service:?} is invalid"))]
    InvalidCaBundle {
        source: certs::Error,
        api_service: String,
    },

    #[snafu(display("CA of APIService {api_service:?} is not currently valid"))]
    CaInactive { api_service: String },

    #[snafu(display("Secret {secret:?} does not exist"))]
    SecretMissing { secret: String },

    #[snafu(display("Secret {secret:?} holds no serving certificate"))]
    ServingCertMissing { secret: String },

    #[snafu(display("serving certificate in Secret {secret:?} is invalid"))]
    InvalidServingCert {
        source: certs::Error,
        secret: String,
    },

    #[snafu(display("serving certificate in Secret {secret:?} is not currently valid"))]
    ServingCertInactive { secret: String },

    #[snafu(display("CA hash of Secret {secret:?} does not match the CA bundle"))]
    SecretHashMismatch { secret: String },

    #[snafu(display("serving certificate in Secret {secret:?} is not trusted for {host:?}"))]
    ServingCertUntrusted {
        source: certs::Error,
        secret: String,
        host: String,
    },

    #[snafu(display("Deployment {deployment:?} does not exist"))]
    DeploymentMissing { deployment: String },

    #[snafu(display("CA hash of Deployment {deployment:?} does not match the CA bundle"))]
    DeploymentHashMismatch { deployment: String },

    #[snafu(display("ServiceAccount {service_account:?} does not exist"))]
    ServiceAccountMissing { service_account: String },

    #[snafu(display("{kind} {role:?} does not exist"))]
    RoleMissing { kind: String, role: String },

    #[snafu(display("ServiceAccount {service_account:?} is missing {rules} from {grant}"))]
    RuleNotSatisfied {
        service_account: String,
        grant: String,
        rules: String,
    },

    #[snafu(display("failed to check the permissions of ServiceAccount {service_account:?}"))]
    RuleCheck {
        source: rbac::Error,
        service_account: String,
    },
}

enum Lookup<K> {
    Found(K),
    Missing,
    /// The read failed and a [`Fault::Lookup`] has already been recorded.
    Failed,
}

/// Every [`Fault`] found in a single verification pass.
#[derive(Debug, Default)]
pub struct Faults(Vec<Fault>);

impl Faults {
    pub fn iter(&self) -> impl Iterator<Item = &Fault> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn push(&mut self, fault: Fault) {
        debug!(%fault, "found fault");
        self.0.push(fault);
    }
}

impl Display for Faults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, fault) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{fault}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("APIService {api_service:?} is owned by another ClusterServiceVersion"))]
    NotAdoptable { api_service: String },

    #[snafu(display("failed to check ownership of APIService {api_service:?}"))]
    AdoptionCheck {
        source: ownership::Error,
        api_service: String,
    },

    #[snafu(display("API service resources are unhealthy: {faults}"))]
    Unhealthy { faults: Faults },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether installing the API services again can plausibly fix the problem.
    ///
    /// Ownership conflicts need manual intervention.
    pub fn is_actionable(&self) -> bool {
        matches!(self, Error::Unhealthy { .. })
    }
}

fn describe_rule(rule: &PolicyRule) -> String {
    match &rule.non_resource_urls {
        Some(urls) if !urls.is_empty() => format!("{:?} on {urls:?}", rule.verbs),
        _ => format!(
            "{:?} on {:?} in groups {:?} named {:?}",
            rule.verbs,
            rule.resources.as_deref().unwrap_or_default(),
            rule.api_groups.as_deref().unwrap_or_default(),
            rule.resource_names.as_deref().unwrap_or_default(),
        ),
    }
}

/// Reads back the objects created by [`super::install::Installer`] and checks them for drift.
pub struct Verifier<C> {
    cluster: C,
    clock: Arc<dyn Clock>,
    rules: Arc<dyn RuleChecker>,
}

impl<C: Cluster> Verifier<C> {
    pub fn new(cluster: C, clock: Arc<dyn Clock>, rules: Arc<dyn RuleChecker>) -> Self {
        Self {
            cluster,
            clock,
            rules,
        }
    }

    /// Verifies every API service owned by `csv`, collecting all faults rather than stopping at the first.
    ///
    /// `hash` must be the function used to compute the CA hash annotations when installing.
    /// Stops early only if an APIService turns out to belong to another descriptor.
    pub async fn check_api_service_resources(
        &self,
        csv: &ClusterServiceVersion,
        hash: fn(&[u8]) -> String,
    ) -> Result<()> {
        let mut faults = Faults::default();
        for description in csv.owned_api_services() {
            self.check_api_service(csv, description, hash, &mut faults)
                .await?;
        }
        if faults.is_empty() {
            Ok(())
        } else {
            UnhealthySnafu { faults }.fail()
        }
    }

    /// Whether every APIService owned by `csv` exists and reports itself as available.
    pub async fn are_api_services_available(
        &self,
        csv: &ClusterServiceVersion,
    ) -> Result<bool, cluster::Error> {
        for description in csv.owned_api_services() {
            let name = description.api_service_name();
            let Some(api_service) = self.cluster.get_opt::<APIService>(&name, None).await? else {
                debug!(api_service = name, "APIService does not exist");
                return Ok(false);
            };
            let available = api_service
                .status
                .and_then(|status| status.conditions)
                .unwrap_or_default()
                .iter()
                .any(|condition| condition.type_ == "Available" && condition.status == "True");
            if !available {
                debug!(api_service = name, "APIService is not available");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Reads an object, recording a [`Fault::Lookup`] if that fails.
    async fn get<K: cluster::ApiObject>(
        &self,
        name: &str,
        namespace: Option<&str>,
        faults: &mut Faults,
    ) -> Lookup<K> {
        match self.cluster.get_opt::<K>(name, namespace).await {
            Ok(Some(obj)) => Lookup::Found(obj),
            Ok(None) => Lookup::Missing,
            Err(source) => {
                faults.push(Fault::Lookup { source });
                Lookup::Failed
            }
        }
    }

    async fn check_api_service(
        &self,
        csv: &ClusterServiceVersion,
        description: &ApiServiceDescription,
        hash: fn(&[u8]) -> String,
        faults: &mut Faults,
    ) -> Result<()> {
        let namespace = csv.namespace_or_default();
        let api_service_name = description.api_service_name();
        let names = ResourceNames::for_deployment(&description.deployment_name);
        let now = self.clock.now();

        let api_service = match self.get::<APIService>(&api_service_name, None, faults).await {
            Lookup::Found(api_service) => api_service,
            Lookup::Missing => {
                faults.push(Fault::ApiServiceMissing {
                    api_service: api_service_name,
                });
                return Ok(());
            }
            Lookup::Failed => return Ok(()),
        };
        match is_adoptable(&self.cluster, csv, &api_service.metadata).await {
            Ok(true) => {}
            Ok(false) => {
                return NotAdoptableSnafu {
                    api_service: api_service_name,
                }
                .fail()
            }
            Err(source) => {
                return Err(Error::AdoptionCheck {
                    source,
                    api_service: api_service_name,
                })
            }
        }

        match self
            .get::<Service>(&names.service, Some(&namespace), faults)
            .await
        {
            Lookup::Found(_) => {}
            Lookup::Missing => {
                faults.push(Fault::ServiceMissing {
                    service: names.service,
                });
                return Ok(());
            }
            Lookup::Failed => return Ok(()),
        }
        let spec = api_service.spec.unwrap_or_default();
        let reference = spec.service.unwrap_or_default();
        let found = format!(
            "{}/{}",
            reference.namespace.unwrap_or_default(),
            reference.name.unwrap_or_default()
        );
        let expected = format!("{namespace}/{}", names.service);
        if found != expected {
            faults.push(Fault::ServiceReferenceMismatch {
                api_service: api_service_name,
                expected,
                found,
            });
            return Ok(());
        }

        let Some(ca_pem) = spec.ca_bundle.map(|bundle| bundle.0).filter(|pem| !pem.is_empty())
        else {
            faults.push(Fault::CaBundleMissing {
                api_service: api_service_name,
            });
            return Ok(());
        };
        let ca = match pem_to_cert(&ca_pem) {
            Ok(ca) => ca,
            Err(source) => {
                faults.push(Fault::InvalidCaBundle {
                    source,
                    api_service: api_service_name,
                });
                return Ok(());
            }
        };
        if !active(&ca, now) {
            faults.push(Fault::CaInactive {
                api_service: api_service_name,
            });
            return Ok(());
        }
        let ca_hash = hash(&ca_pem);

        match self
            .get::<Secret>(&names.secret, Some(&namespace), faults)
            .await
        {
            Lookup::Failed => {}
            Lookup::Missing => faults.push(Fault::SecretMissing {
                secret: names.secret.clone(),
            }),
            Lookup::Found(secret) => {
                if secret_ca_hash(&secret) != Some(ca_hash.as_str()) {
                    faults.push(Fault::SecretHashMismatch {
                        secret: names.secret.clone(),
                    });
                }
                match secret_data(&secret, SECRET_CERT_KEY).map(pem_to_cert) {
                    None => faults.push(Fault::ServingCertMissing {
                        secret: names.secret.clone(),
                    }),
                    Some(Err(source)) => faults.push(Fault::InvalidServingCert {
                        source,
                        secret: names.secret.clone(),
                    }),
                    Some(Ok(cert)) => {
                        if !active(&cert, now) {
                            faults.push(Fault::ServingCertInactive {
                                secret: names.secret.clone(),
                            });
                        }
                        let untrusted = serving_hosts(&names.service, &namespace)
                            .into_iter()
                            .find_map(|host| verify_cert(&ca, &cert, &host).err().map(|err| (host, err)));
                        if let Some((host, source)) = untrusted {
                            faults.push(Fault::ServingCertUntrusted {
                                source,
                                secret: names.secret.clone(),
                                host,
                            });
                        }
                    }
                }
            }
        }

        let deployment = self
            .get::<Deployment>(&description.deployment_name, Some(&namespace), faults)
            .await;
        let deployment_spec = match &deployment {
            Lookup::Found(deployment) => {
                let spec = deployment.spec.as_ref();
                if spec.and_then(|spec| pod_template_ca_hash(&spec.template))
                    != Some(ca_hash.as_str())
                {
                    faults.push(Fault::DeploymentHashMismatch {
                        deployment: description.deployment_name.clone(),
                    });
                }
                spec
            }
            missing => {
                if let Lookup::Missing = missing {
                    faults.push(Fault::DeploymentMissing {
                        deployment: description.deployment_name.clone(),
                    });
                }
                csv.spec
                    .install
                    .strategy_spec
                    .deployment(&description.deployment_name)
                    .map(|deployment| &deployment.spec)
            }
        };
        let service_account_name = deployment_spec
            .map(service_account_of)
            .unwrap_or(DEFAULT_SERVICE_ACCOUNT);

        let service_account = match self
            .get::<ServiceAccount>(service_account_name, Some(&namespace), faults)
            .await
        {
            Lookup::Found(service_account) => service_account,
            Lookup::Missing => {
                faults.push(Fault::ServiceAccountMissing {
                    service_account: service_account_name.to_string(),
                });
                return Ok(());
            }
            Lookup::Failed => return Ok(()),
        };
        self.check_rules(
            &service_account,
            Some(&namespace),
            &format!("Role {}/{}", namespace, names.role),
            &[secret_get_rule(&names.secret)],
            faults,
        )
        .await;
        match self
            .get::<Role>(AUTH_READER_ROLE, Some(KUBE_SYSTEM_NAMESPACE), faults)
            .await
        {
            Lookup::Found(role) => {
                self.check_rules(
                    &service_account,
                    Some(KUBE_SYSTEM_NAMESPACE),
                    &format!("Role {KUBE_SYSTEM_NAMESPACE}/{AUTH_READER_ROLE}"),
                    role.rules.as_deref().unwrap_or_default(),
                    faults,
                )
                .await
            }
            Lookup::Missing => faults.push(Fault::RoleMissing {
                kind: "Role".to_string(),
                role: AUTH_READER_ROLE.to_string(),
            }),
            Lookup::Failed => {}
        }
        match self
            .get::<ClusterRole>(AUTH_DELEGATOR_CLUSTER_ROLE, None, faults)
            .await
        {
            Lookup::Found(role) => {
                self.check_rules(
                    &service_account,
                    None,
                    &format!("ClusterRole {AUTH_DELEGATOR_CLUSTER_ROLE}"),
                    role.rules.as_deref().unwrap_or_default(),
                    faults,
                )
                .await
            }
            Lookup::Missing => faults.push(Fault::RoleMissing {
                kind: "ClusterRole".to_string(),
                role: AUTH_DELEGATOR_CLUSTER_ROLE.to_string(),
            }),
            Lookup::Failed => {}
        }
        Ok(())
    }

    /// Checks that `service_account` holds every rule of `grant`, recording at most one fault.
    async fn check_rules(
        &self,
        service_account: &ServiceAccount,
        namespace: Option<&str>,
        grant: &str,
        rules: &[PolicyRule],
        faults: &mut Faults,
    ) {
        let mut unsatisfied = Vec::new();
        for rule in rules {
            match self
                .rules
                .rule_satisfied(service_account, namespace, rule)
                .await
            {
                Ok(true) => {}
                Ok(false) => unsatisfied.push(describe_rule(rule)),
                Err(source) => {
                    faults.push(Fault::RuleCheck {
                        source,
                        service_account: service_account.name_any(),
                    });
                    return;
                }
            }
        }
        if !unsatisfied.is_empty() {
            faults.push(Fault::RuleNotSatisfied {
                service_account: service_account.name_any(),
                grant: grant.to_string(),
                rules: unsatisfied.join(", "),
            });
        }
    }
}
