//! In-memory [`Cluster`] used by tests

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use snafu::{ensure, OptionExt, ResultExt};
use stackable_operator::kube::{Resource, ResourceExt};

use super::{
    object_ref, object_ref_of, AlreadyExistsSnafu, ApiObject, Cluster, ConflictSnafu,
    ConvertSnafu, NotFoundSnafu, Result,
};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    kind: String,
    namespace: Option<String>,
    name: String,
}

impl Key {
    fn new<K: ApiObject>(name: &str, namespace: Option<&str>) -> Self {
        Self {
            kind: format!("{}/{}", K::api_version(&()), K::kind(&())),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    fn of<K: ApiObject>(obj: &K) -> Self {
        Self::new::<K>(&obj.name_any(), obj.meta().namespace.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verb {
    Create,
    Update,
    UpdateStatus,
    Delete,
}

/// A write that went through the [`MemoryCluster`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub verb: Verb,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, serde_json::Value>,
    mutations: Vec<Mutation>,
    resource_version: u64,
}

impl State {
    fn record(&mut self, verb: Verb, key: &Key) {
        self.mutations.push(Mutation {
            verb,
            kind: key.kind.clone(),
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        });
    }

    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// Free-form maps whose empty values the API server keeps.
const OPAQUE_MAPS: &[&str] = &["data", "stringData", "labels", "annotations"];

/// Drops empty string fields like the API server does for `omitempty` fields, so that a read-back
/// differs from what was written in the same way it would on a real cluster.
fn omit_empty_strings(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(fields) => {
            fields.retain(|_, field| field.as_str() != Some(""));
            for (name, field) in fields.iter_mut() {
                if !OPAQUE_MAPS.contains(&name.as_str()) {
                    omit_empty_strings(field);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(omit_empty_strings),
        _ => {}
    }
}

/// Serializes `obj` the way it would be persisted.
fn store<K: ApiObject>(obj: &K) -> serde_json::Result<serde_json::Value> {
    let mut value = serde_json::to_value(obj)?;
    omit_empty_strings(&mut value);
    Ok(value)
}

#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<State>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `obj` without recording a mutation, overwriting whatever was there.
    pub fn seed<K: ApiObject>(&self, obj: K) {
        let mut state = self.state.lock().unwrap();
        let mut obj = obj;
        let rv = state.next_resource_version();
        obj.meta_mut().resource_version = Some(rv);
        obj.meta_mut()
            .uid
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
        state
            .objects
            .insert(Key::of(&obj), store(&obj).unwrap());
    }

    /// Reads an object, panicking if it does not exist.
    pub fn fetch<K: ApiObject>(&self, name: &str, namespace: Option<&str>) -> K {
        let state = self.state.lock().unwrap();
        let value = state
            .objects
            .get(&Key::new::<K>(name, namespace))
            .unwrap_or_else(|| panic!("{} does not exist", object_ref::<K>(name, namespace)));
        serde_json::from_value(value.clone()).unwrap()
    }

    /// Replaces a stored object with something that cannot be read back as `K`.
    pub fn corrupt<K: ApiObject>(&self, name: &str, namespace: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state.objects.insert(
            Key::new::<K>(name, namespace),
            serde_json::json!({ "metadata": "corrupt" }),
        );
    }

    pub fn contains<K: ApiObject>(&self, name: &str, namespace: Option<&str>) -> bool {
        let state = self.state.lock().unwrap();
        state.objects.contains_key(&Key::new::<K>(name, namespace))
    }

    pub fn take_mutations(&self) -> Vec<Mutation> {
        std::mem::take(&mut self.state.lock().unwrap().mutations)
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn get_opt<K: ApiObject>(
        &self,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<K>> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&Key::new::<K>(name, namespace))
            .map(|value| {
                serde_json::from_value(value.clone()).context(ConvertSnafu {
                    object: object_ref::<K>(name, namespace),
                })
            })
            .transpose()
    }

    async fn list<K: ApiObject>(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let kind = Key::new::<K>("", None).kind;
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|(key, _)| {
                key.kind == kind && (namespace.is_none() || key.namespace.as_deref() == namespace)
            })
            .map(|(key, value)| {
                serde_json::from_value(value.clone()).context(ConvertSnafu {
                    object: object_ref::<K>(&key.name, key.namespace.as_deref()),
                })
            })
            .collect()
    }

    async fn create<K: ApiObject>(&self, obj: &K) -> Result<K> {
        let object = object_ref_of(obj);
        let key = Key::of(obj);
        let mut state = self.state.lock().unwrap();
        ensure!(
            !state.objects.contains_key(&key),
            AlreadyExistsSnafu { object }
        );
        let mut created = obj.clone();
        created.meta_mut().resource_version = Some(state.next_resource_version());
        created.meta_mut().uid = Some(uuid::Uuid::new_v4().to_string());
        let value = store(&created).context(ConvertSnafu {
            object: object.clone(),
        })?;
        let created = serde_json::from_value(value.clone()).context(ConvertSnafu { object })?;
        state.objects.insert(key.clone(), value);
        state.record(Verb::Create, &key);
        Ok(created)
    }

    async fn update<K: ApiObject>(&self, obj: &K) -> Result<K> {
        let object = object_ref_of(obj);
        let key = Key::of(obj);
        let mut state = self.state.lock().unwrap();
        let stored = state
            .objects
            .get(&key)
            .context(NotFoundSnafu {
                object: object.clone(),
            })?
            .clone();
        let stored: K = serde_json::from_value(stored).context(ConvertSnafu {
            object: object.clone(),
        })?;
        if let Some(expected) = &obj.meta().resource_version {
            ensure!(
                stored.meta().resource_version.as_ref() == Some(expected),
                ConflictSnafu { object }
            );
        }
        let mut updated = obj.clone();
        updated.meta_mut().resource_version = Some(state.next_resource_version());
        updated.meta_mut().uid = stored.meta().uid.clone();
        let value = store(&updated).context(ConvertSnafu {
            object: object.clone(),
        })?;
        let updated = serde_json::from_value(value.clone()).context(ConvertSnafu { object })?;
        state.objects.insert(key.clone(), value);
        state.record(Verb::Update, &key);
        Ok(updated)
    }

    async fn update_status<K: ApiObject>(&self, obj: &K) -> Result<K> {
        let object = object_ref_of(obj);
        let key = Key::of(obj);
        let mut state = self.state.lock().unwrap();
        let mut stored = state
            .objects
            .get(&key)
            .context(NotFoundSnafu {
                object: object.clone(),
            })?
            .clone();
        let expected = &obj.meta().resource_version;
        ensure!(
            expected.is_none() || stored["metadata"]["resourceVersion"].as_str() == expected.as_deref(),
            ConflictSnafu { object }
        );
        let mut replacement = serde_json::to_value(obj).context(ConvertSnafu {
            object: object.clone(),
        })?;
        stored["status"] = replacement["status"].take();
        stored["metadata"]["resourceVersion"] = state.next_resource_version().into();
        let updated = serde_json::from_value(stored.clone()).context(ConvertSnafu { object })?;
        state.objects.insert(key.clone(), stored);
        state.record(Verb::UpdateStatus, &key);
        Ok(updated)
    }

    async fn delete<K: ApiObject>(&self, name: &str, namespace: Option<&str>) -> Result<()> {
        let key = Key::new::<K>(name, namespace);
        let mut state = self.state.lock().unwrap();
        state.objects.remove(&key).context(NotFoundSnafu {
            object: object_ref::<K>(name, namespace),
        })?;
        state.record(Verb::Delete, &key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use stackable_operator::{
        k8s_openapi::api::core::v1::Secret, kube::api::ObjectMeta,
    };

    use super::*;

    fn secret(name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        }
    }

    #[tokio::test]
    async fn stale_updates_are_rejected() {
        let cluster = MemoryCluster::new();
        let created = cluster.create(&secret("s")).await.unwrap();
        let mut first = created.clone();
        first.type_ = Some("Opaque".to_string());
        cluster.update(&first).await.unwrap();

        let err = cluster.update(&created).await.unwrap_err();
        assert!(err.is_conflict(), "{err}");
        assert!(cluster.create(&secret("s")).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn empty_strings_are_not_persisted() {
        let cluster = MemoryCluster::new();
        let mut obj = secret("s");
        obj.type_ = Some(String::new());
        obj.metadata.annotations = Some([("kept".to_string(), String::new())].into());
        let created = cluster.create(&obj).await.unwrap();
        assert_eq!(created.type_, None);

        let stored = cluster.fetch::<Secret>("s", Some("ns"));
        assert_eq!(stored.type_, None);
        assert_eq!(stored.annotations().get("kept").map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn mutations_are_recorded() {
        let cluster = MemoryCluster::new();
        cluster.seed(secret("seeded"));
        cluster.create(&secret("s")).await.unwrap();
        cluster.delete::<Secret>("s", Some("ns")).await.unwrap();
        assert!(cluster
            .delete::<Secret>("s", Some("ns"))
            .await
            .unwrap_err()
            .is_not_found());

        let verbs = cluster
            .take_mutations()
            .into_iter()
            .map(|m| m.verb)
            .collect::<Vec<_>>();
        assert_eq!(verbs, vec![Verb::Create, Verb::Delete]);
        assert_eq!(cluster.list::<Secret>(Some("ns")).await.unwrap().len(), 1);
        assert!(cluster.list::<Secret>(Some("other")).await.unwrap().is_empty());
    }
}
