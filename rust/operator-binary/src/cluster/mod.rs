//! Read/write access to the Kubernetes objects managed on behalf of a [`ClusterServiceVersion`]
//!
//! Every mutation goes through [`Cluster::create`] or [`Cluster::update`], and updates always carry the
//! `resourceVersion` that was read, so concurrent writers are rejected by the API server rather than
//! silently overwritten.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::Deployment,
            core::v1::{Secret, Service, ServiceAccount},
            rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
        },
        kube_aggregator::pkg::apis::apiregistration::v1::APIService,
    },
    kube::{
        self,
        api::{Api, DeleteParams, DynamicObject, ListParams, PostParams},
        runtime::reflector::ObjectRef,
        Resource, ResourceExt,
    },
};

use crate::crd::ClusterServiceVersion;

#[cfg(test)]
pub mod memory;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {object}"))]
    Get {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to list {kind} objects"))]
    List { source: kube::Error, kind: String },

    #[snafu(display("failed to create {object}"))]
    Create {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to update {object}"))]
    Update {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to delete {object}"))]
    Delete {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("{object} already exists"))]
    AlreadyExists { object: ObjectRef<DynamicObject> },

    #[snafu(display("{object} does not exist"))]
    NotFound { object: ObjectRef<DynamicObject> },

    #[snafu(display("{object} has been modified since it was read"))]
    Conflict { object: ObjectRef<DynamicObject> },

    #[snafu(display("failed to convert {object}"))]
    Convert {
        source: serde_json::Error,
        object: ObjectRef<DynamicObject>,
    },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::AlreadyExists { .. })
    }
}

/// A Kubernetes kind that can be read and written through a [`Cluster`].
pub trait ApiObject:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn api(client: &kube::Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced_api_objects {
    ($($kind:ty),* $(,)?) => {
        $(
            impl ApiObject for $kind {
                fn api(client: &kube::Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(ns) => Api::namespaced(client.clone(), ns),
                        None => Api::all(client.clone()),
                    }
                }
            }
        )*
    };
}

macro_rules! cluster_api_objects {
    ($($kind:ty),* $(,)?) => {
        $(
            impl ApiObject for $kind {
                fn api(client: &kube::Client, _namespace: Option<&str>) -> Api<Self> {
                    Api::all(client.clone())
                }
            }
        )*
    };
}

namespaced_api_objects!(
    Service,
    Secret,
    ServiceAccount,
    Role,
    RoleBinding,
    Deployment,
    ClusterServiceVersion,
);
cluster_api_objects!(APIService, ClusterRole, ClusterRoleBinding);

/// Builds the [`ObjectRef`] used to identify objects in logs and errors.
pub fn object_ref<K: ApiObject>(name: &str, namespace: Option<&str>) -> ObjectRef<DynamicObject> {
    let obj_ref = ObjectRef::<K>::new(name);
    let obj_ref = match namespace {
        Some(ns) => obj_ref.within(ns),
        None => obj_ref,
    };
    obj_ref.erase()
}

pub fn object_ref_of<K: ApiObject>(obj: &K) -> ObjectRef<DynamicObject> {
    object_ref::<K>(&obj.name_any(), obj.meta().namespace.as_deref())
}

/// Synchronous-looking access to cluster state, every call either completes or fails.
///
/// Namespaced kinds take `Some(namespace)`; cluster-scoped kinds ignore it.
#[async_trait]
pub trait Cluster: Clone + Send + Sync + 'static {
    async fn get_opt<K: ApiObject>(&self, name: &str, namespace: Option<&str>)
        -> Result<Option<K>>;

    async fn list<K: ApiObject>(&self, namespace: Option<&str>) -> Result<Vec<K>>;

    async fn create<K: ApiObject>(&self, obj: &K) -> Result<K>;

    /// Replaces `obj`, failing with [`Error::Conflict`] if it was modified after being read.
    async fn update<K: ApiObject>(&self, obj: &K) -> Result<K>;

    /// Replaces the status subresource of `obj`, with the same conflict semantics as [`Cluster::update`].
    async fn update_status<K: ApiObject>(&self, obj: &K) -> Result<K>;

    async fn delete<K: ApiObject>(&self, name: &str, namespace: Option<&str>) -> Result<()>;
}

/// [`Cluster`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &kube::Client {
        &self.client
    }
}

fn error_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get_opt<K: ApiObject>(
        &self,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<K>> {
        K::api(&self.client, namespace)
            .get_opt(name)
            .await
            .with_context(|_| GetSnafu {
                object: object_ref::<K>(name, namespace),
            })
    }

    async fn list<K: ApiObject>(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        Ok(K::api(&self.client, namespace)
            .list(&ListParams::default())
            .await
            .with_context(|_| ListSnafu {
                kind: K::kind(&()).to_string(),
            })?
            .items)
    }

    async fn create<K: ApiObject>(&self, obj: &K) -> Result<K> {
        let object = object_ref_of(obj);
        match K::api(&self.client, obj.meta().namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
        {
            Ok(created) => Ok(created),
            Err(err) if error_code(&err) == Some(409) => AlreadyExistsSnafu { object }.fail(),
            Err(err) => Err(err).context(CreateSnafu { object }),
        }
    }

    async fn update<K: ApiObject>(&self, obj: &K) -> Result<K> {
        let object = object_ref_of(obj);
        match K::api(&self.client, obj.meta().namespace.as_deref())
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(err) if error_code(&err) == Some(409) => ConflictSnafu { object }.fail(),
            Err(err) if error_code(&err) == Some(404) => NotFoundSnafu { object }.fail(),
            Err(err) => Err(err).context(UpdateSnafu { object }),
        }
    }

    async fn update_status<K: ApiObject>(&self, obj: &K) -> Result<K> {
        let object = object_ref_of(obj);
        let data = serde_json::to_vec(obj).context(ConvertSnafu {
            object: object.clone(),
        })?;
        match K::api(&self.client, obj.meta().namespace.as_deref())
            .replace_status(&obj.name_any(), &PostParams::default(), data)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(err) if error_code(&err) == Some(409) => ConflictSnafu { object }.fail(),
            Err(err) if error_code(&err) == Some(404) => NotFoundSnafu { object }.fail(),
            Err(err) => Err(err).context(UpdateSnafu { object }),
        }
    }

    async fn delete<K: ApiObject>(&self, name: &str, namespace: Option<&str>) -> Result<()> {
        let object = object_ref::<K>(name, namespace);
        match K::api(&self.client, namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if error_code(&err) == Some(404) => NotFoundSnafu { object }.fail(),
            Err(err) => Err(err).context(DeleteSnafu { object }),
        }
    }
}
