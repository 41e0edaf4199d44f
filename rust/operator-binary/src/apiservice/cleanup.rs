//! Garbage collection of API service objects once their [`ClusterServiceVersion`] is gone

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::{
            core::v1::{Secret, Service},
            rbac::v1::{ClusterRoleBinding, Role, RoleBinding},
        },
        kube_aggregator::pkg::apis::apiregistration::v1::APIService,
    },
    kube::ResourceExt,
};
use tracing::info;

use super::{legacy::delete_if_owned, ResourceNames, KUBE_SYSTEM_NAMESPACE};
use crate::{crd::ClusterServiceVersion, ownership::Owner};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to delete resources of API service {api_service:?}"))]
    DeleteResources {
        source: super::legacy::Error,
        api_service: String,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Deletes every object backing the API services of `csv` that is owned by `csv` alone.
///
/// Objects shared with (or taken over by) other descriptors are left in place.
/// Returns the number of deleted objects.
pub async fn delete_owned_api_service_resources<C: crate::cluster::Cluster>(
    cluster: &C,
    csv: &ClusterServiceVersion,
) -> Result<usize> {
    let namespace = csv.namespace_or_default();
    let owner = Owner::of(csv);
    let mut deleted = 0;
    for description in csv.owned_api_services() {
        let api_service = description.api_service_name();
        let names = ResourceNames::for_deployment(&description.deployment_name);
        let ns = Some(namespace.as_str());
        let results = [
            delete_if_owned::<C, APIService>(cluster, &owner, &api_service, None).await,
            delete_if_owned::<C, Service>(cluster, &owner, &names.service, ns).await,
            delete_if_owned::<C, Secret>(cluster, &owner, &names.secret, ns).await,
            delete_if_owned::<C, Role>(cluster, &owner, &names.role, ns).await,
            delete_if_owned::<C, RoleBinding>(cluster, &owner, &names.role_binding, ns).await,
            delete_if_owned::<C, ClusterRoleBinding>(
                cluster,
                &owner,
                &names.cluster_role_binding,
                None,
            )
            .await,
            delete_if_owned::<C, RoleBinding>(
                cluster,
                &owner,
                &names.auth_reader_role_binding,
                Some(KUBE_SYSTEM_NAMESPACE),
            )
            .await,
        ];
        for result in results {
            if result.with_context(|_| DeleteResourcesSnafu {
                api_service: &api_service,
            })? {
                deleted += 1;
            }
        }
    }
    info!(csv = %csv.name_any(), deleted, "cleaned up API service resources");
    Ok(deleted)
}
