//! Label-based ownership of objects created on behalf of a [`ClusterServiceVersion`]
//!
//! Owner references would let the garbage collector cascade-delete these objects together with their
//! descriptor (and cannot cross namespaces at all), so ownership is tracked through labels instead and
//! cleanup is handled by this operator.

use std::{collections::BTreeSet, fmt::Display};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use stackable_operator::kube::{
    api::ObjectMeta, runtime::reflector::ObjectRef, Resource, ResourceExt,
};
use tracing::warn;

use crate::{
    cluster::{self, Cluster},
    crd::ClusterServiceVersion,
};

pub const OWNER_KEY: &str = "olm.owner";
pub const OWNER_NAMESPACE_KEY: &str = "olm.owner.namespace";
pub const OWNER_KIND_KEY: &str = "olm.owner.kind";
/// Lists every owner when an object has more than one, the labels only hold the first.
pub const OWNERS_ANNOTATION: &str = "olm.owners";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to look up potential owner {csv}"))]
    LookupOwner {
        source: cluster::Error,
        csv: ObjectRef<ClusterServiceVersion>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Identity of a descriptor that owns an object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Owner {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl Owner {
    pub fn of(csv: &ClusterServiceVersion) -> Self {
        Self {
            kind: ClusterServiceVersion::kind(&()).to_string(),
            namespace: csv.namespace_or_default(),
            name: csv.name_any(),
        }
    }
}

impl Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}.{}", self.kind, self.name, self.namespace)
    }
}

/// The set of descriptors that own an object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnerSet(BTreeSet<Owner>);

impl OwnerSet {
    pub fn single(owner: Owner) -> Self {
        Self(BTreeSet::from([owner]))
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        let mut owners = BTreeSet::new();
        if let Some(labels) = &meta.labels {
            let label = |key: &str| labels.get(key).filter(|value| !value.is_empty()).cloned();
            if let (Some(kind), Some(namespace), Some(name)) = (
                label(OWNER_KIND_KEY),
                label(OWNER_NAMESPACE_KEY),
                label(OWNER_KEY),
            ) {
                owners.insert(Owner {
                    kind,
                    namespace,
                    name,
                });
            }
        }
        if let Some(listed) = meta
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(OWNERS_ANNOTATION))
        {
            match serde_json::from_str::<Vec<Owner>>(listed) {
                Ok(listed) => owners.extend(listed),
                Err(error) => warn!(
                    object.name = meta.name.as_deref(),
                    %error,
                    "ignoring malformed {OWNERS_ANNOTATION} annotation"
                ),
            }
        }
        Self(owners)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Owner> {
        self.0.iter()
    }

    pub fn is_subset_of<'a>(&self, allowed: impl IntoIterator<Item = &'a Owner>) -> bool {
        let allowed = allowed.into_iter().collect::<BTreeSet<_>>();
        self.0.iter().all(|owner| allowed.contains(owner))
    }

    /// Writes the set into the labels (and, for multiple owners, the annotation) of `meta`,
    /// replacing any ownership recorded previously.
    pub fn apply_to(&self, meta: &mut ObjectMeta) {
        let labels = meta.labels.get_or_insert_with(Default::default);
        match self.0.first() {
            Some(primary) => {
                labels.insert(OWNER_KEY.to_string(), primary.name.clone());
                labels.insert(OWNER_NAMESPACE_KEY.to_string(), primary.namespace.clone());
                labels.insert(OWNER_KIND_KEY.to_string(), primary.kind.clone());
            }
            None => {
                for key in [OWNER_KEY, OWNER_NAMESPACE_KEY, OWNER_KIND_KEY] {
                    labels.remove(key);
                }
            }
        }
        if self.0.len() > 1 {
            let listed = self.0.iter().collect::<Vec<_>>();
            meta.annotations.get_or_insert_with(Default::default).insert(
                OWNERS_ANNOTATION.to_string(),
                serde_json::to_string(&listed).unwrap_or_default(),
            );
        } else if let Some(annotations) = &mut meta.annotations {
            annotations.remove(OWNERS_ANNOTATION);
        }
    }
}

/// Whether `meta` records `owner` as its one and only owner.
///
/// Unowned objects are never considered owned, since nothing proves they were created by us.
pub fn is_owned_solely_by(meta: &ObjectMeta, owner: &Owner) -> bool {
    let owners = OwnerSet::from_meta(meta);
    !owners.is_empty() && owners.is_subset_of([owner])
}

async fn find_csv<C: Cluster>(
    cluster: &C,
    name: &str,
    namespace: &str,
) -> Result<Option<ClusterServiceVersion>> {
    match cluster
        .get_opt::<ClusterServiceVersion>(name, Some(namespace))
        .await
    {
        Ok(csv) => Ok(csv),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err).context(LookupOwnerSnafu {
            csv: ObjectRef::new(name).within(namespace),
        }),
    }
}

/// Decides whether `target` may claim an object carrying the ownership recorded in `meta`.
///
/// Unowned objects are always adoptable. Otherwise every owner must be `target` itself, the descriptor
/// that `target` replaces, or a descriptor that is itself being replaced or deleted.
pub async fn is_adoptable<C: Cluster>(
    cluster: &C,
    target: &ClusterServiceVersion,
    meta: &ObjectMeta,
) -> Result<bool> {
    let owners = OwnerSet::from_meta(meta);
    if owners.is_empty() {
        return Ok(true);
    }
    let target_owner = Owner::of(target);
    if owners.iter().any(|owner| owner.kind != target_owner.kind) {
        return Ok(false);
    }

    let mut allowed = vec![target_owner.clone()];
    if let Some(replaces) = target.replaces() {
        if let Some(replaced) = find_csv(cluster, replaces, &target_owner.namespace).await? {
            allowed.push(Owner::of(&replaced));
        }
    }
    for owner in owners.iter() {
        if allowed.contains(owner) {
            continue;
        }
        if let Some(current) = find_csv(cluster, &owner.name, &owner.namespace).await? {
            if current.is_being_replaced() {
                allowed.push(Owner::of(&current));
            }
        }
    }
    Ok(owners.is_subset_of(&allowed))
}
