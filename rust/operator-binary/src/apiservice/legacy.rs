//! Removal of objects created under the naming scheme that derived names from the API service itself

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::{
        core::v1::{Secret, Service},
        rbac::v1::{ClusterRoleBinding, Role, RoleBinding},
    },
    kube::Resource,
};
use tracing::{debug, info, warn};

use super::{ResourceNames, KUBE_SYSTEM_NAMESPACE};
use crate::{
    cluster::{self, object_ref, ApiObject, Cluster},
    crd::{ApiServiceDescription, ClusterServiceVersion},
    ownership::{is_owned_solely_by, Owner},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to look up legacy object"))]
    Lookup { source: cluster::Error },

    #[snafu(display("failed to delete legacy object"))]
    Delete { source: cluster::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Deletes the legacy-named objects of `description` that are owned by `owner` alone.
///
/// Nothing is deleted when the legacy names coincide with the current ones, since those objects are the
/// ones that were just installed.
pub async fn delete_legacy_api_service_resources<C: Cluster>(
    cluster: &C,
    owner: &ClusterServiceVersion,
    description: &ApiServiceDescription,
) -> Result<()> {
    let legacy = ResourceNames::legacy(description);
    let current = ResourceNames::for_deployment(&description.deployment_name);
    if legacy.service == current.service {
        debug!(
            api_service = description.api_service_name(),
            "legacy names match current names, skipping legacy cleanup"
        );
        return Ok(());
    }
    let namespace = owner.namespace_or_default();
    let owner = Owner::of(owner);
    delete_if_owned::<C, Service>(cluster, &owner, &legacy.service, Some(&namespace)).await?;
    delete_if_owned::<C, Secret>(cluster, &owner, &legacy.secret, Some(&namespace)).await?;
    delete_if_owned::<C, Role>(cluster, &owner, &legacy.role, Some(&namespace)).await?;
    delete_if_owned::<C, RoleBinding>(cluster, &owner, &legacy.role_binding, Some(&namespace))
        .await?;
    delete_if_owned::<C, ClusterRoleBinding>(cluster, &owner, &legacy.cluster_role_binding, None)
        .await?;
    delete_if_owned::<C, RoleBinding>(
        cluster,
        &owner,
        &legacy.auth_reader_role_binding,
        Some(KUBE_SYSTEM_NAMESPACE),
    )
    .await?;
    Ok(())
}

/// Deletes the object unless it is missing or not owned by `owner` alone.
///
/// Returns whether the object was deleted.
pub(super) async fn delete_if_owned<C: Cluster, K: ApiObject>(
    cluster: &C,
    owner: &Owner,
    name: &str,
    namespace: Option<&str>,
) -> Result<bool> {
    let object = object_ref::<K>(name, namespace);
    let Some(existing) = cluster
        .get_opt::<K>(name, namespace)
        .await
        .context(LookupSnafu)?
    else {
        return Ok(false);
    };
    if !is_owned_solely_by(existing.meta(), owner) {
        warn!(%object, %owner, "leaving object that is not owned exclusively by this ClusterServiceVersion");
        return Ok(false);
    }
    match cluster.delete::<K>(name, namespace).await {
        Ok(()) => {
            info!(%object, %owner, "deleted object");
            Ok(true)
        }
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => Err(err).context(DeleteSnafu),
    }
}

#[cfg(test)]
mod tests {
    use stackable_operator::kube::api::ObjectMeta;

    use super::*;
    use crate::{
        apiservice::fixtures::*,
        cluster::memory::{MemoryCluster, Verb},
        ownership::OwnerSet,
    };

    fn owned<K: ApiObject + Default>(
        name: &str,
        namespace: Option<&str>,
        owner: Option<&ClusterServiceVersion>,
    ) -> K {
        let mut obj = K::default();
        *obj.meta_mut() = ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(str::to_string),
            ..ObjectMeta::default()
        };
        if let Some(owner) = owner {
            OwnerSet::single(Owner::of(owner)).apply_to(obj.meta_mut());
        }
        obj
    }

    #[tokio::test]
    async fn deletes_legacy_objects_owned_by_descriptor() {
        let cluster = MemoryCluster::new();
        let csv1 = csv("csv1");
        let other = csv("other");
        cluster.seed(owned::<Service>("v1-a1", Some(NAMESPACE), Some(&csv1)));
        cluster.seed(owned::<Secret>("v1-a1-cert", Some(NAMESPACE), Some(&other)));
        cluster.seed(owned::<Role>("v1-a1-cert", Some(NAMESPACE), None));
        cluster.seed(owned::<ClusterRoleBinding>(
            "v1-a1-system:auth-delegator",
            None,
            Some(&csv1),
        ));
        cluster.seed(owned::<RoleBinding>(
            "v1-a1-auth-reader",
            Some(KUBE_SYSTEM_NAMESPACE),
            Some(&csv1),
        ));

        let description = &csv1.owned_api_services()[0];
        delete_legacy_api_service_resources(&cluster, &csv1, description)
            .await
            .unwrap();

        assert!(!cluster.contains::<Service>("v1-a1", Some(NAMESPACE)));
        assert!(!cluster.contains::<ClusterRoleBinding>("v1-a1-system:auth-delegator", None));
        assert!(!cluster.contains::<RoleBinding>("v1-a1-auth-reader", Some(KUBE_SYSTEM_NAMESPACE)));
        assert!(cluster.contains::<Secret>("v1-a1-cert", Some(NAMESPACE)));
        assert!(cluster.contains::<Role>("v1-a1-cert", Some(NAMESPACE)));
        assert!(cluster
            .take_mutations()
            .iter()
            .all(|mutation| mutation.verb == Verb::Delete));
    }

    #[tokio::test]
    async fn never_deletes_when_legacy_name_is_current_name() {
        let cluster = MemoryCluster::new();
        let mut csv = csv("csv1");
        // v1.a1-service maps to the legacy name "v1-a1-service", which is also the Service name of
        // deployment "v1-a1"
        let description = &mut csv.spec.apiservicedefinitions.owned[0];
        description.group = "a1-service".to_string();
        description.version = "v1".to_string();
        description.deployment_name = "v1-a1".to_string();
        let description = description.clone();
        let names = ResourceNames::for_deployment("v1-a1");
        assert_eq!(ResourceNames::legacy(&description), names);

        cluster.seed(owned::<Service>(&names.service, Some(NAMESPACE), Some(&csv)));
        cluster.seed(owned::<Secret>(&names.secret, Some(NAMESPACE), Some(&csv)));
        delete_legacy_api_service_resources(&cluster, &csv, &description)
            .await
            .unwrap();
        assert!(cluster.contains::<Service>(&names.service, Some(NAMESPACE)));
        assert!(cluster.contains::<Secret>(&names.secret, Some(NAMESPACE)));
        assert!(cluster.take_mutations().is_empty());
    }
}
