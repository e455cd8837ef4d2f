//! Resource store capability, one instance per manifest type.

use std::fmt::Debug;
use std::marker::PhantomData;

use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, ValidationDirective},
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;
use tracing::debug;

use crate::StoreError;

/// Namespaced, statically-typed manifest that a store can hold.
pub trait Manifested:
    Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> Manifested for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Kind name used in errors and logs.
pub fn kind_of<K: Manifested>() -> String {
    K::kind(&()).to_string()
}

/// `(namespace, name)` from a manifest's metadata.
pub fn identity<K: Manifested>(obj: &K) -> Result<(String, String), StoreError> {
    let meta = obj.meta();
    let ns = meta.namespace.clone().filter(|s| !s.is_empty()).ok_or(StoreError::MissingIdentity("namespace"))?;
    let name = meta.name.clone().filter(|s| !s.is_empty()).ok_or(StoreError::MissingIdentity("name"))?;
    Ok((ns, name))
}

/// Authoritative store operations. Nothing is cached: each call goes to the backend.
#[async_trait::async_trait]
pub trait ResourceStore<K: Manifested>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError>;
    async fn create(&self, obj: &K) -> Result<K, StoreError>;
    /// Full update of an existing object; `NotFound` when absent.
    async fn update(&self, obj: &K) -> Result<K, StoreError>;
    /// Strategic merge patch scoped to the named object. Fields the schema does not
    /// know are rejected rather than dropped.
    async fn patch(&self, namespace: &str, name: &str, body: &Json) -> Result<K, StoreError>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
    async fn list(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<K>, StoreError>;
}

/// kube-rs backed store. Cloning shares the underlying client.
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for KubeStore<K> {
    fn clone(&self) -> Self {
        Self { client: self.client.clone(), _kind: PhantomData }
    }
}

impl<K: Manifested> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self { client, _kind: PhantomData }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl<K: Manifested> ResourceStore<K> for KubeStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        self.api(namespace).get(name).await.map_err(|e| StoreError::from_kube(e, &kind_of::<K>(), namespace, name))
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let (ns, name) = identity(obj)?;
        debug!(kind = %kind_of::<K>(), ns = %ns, name = %name, "create");
        self.api(&ns)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| StoreError::from_kube(e, &kind_of::<K>(), &ns, &name))
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let (ns, name) = identity(obj)?;
        debug!(kind = %kind_of::<K>(), ns = %ns, name = %name, "update");
        self.api(&ns)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| StoreError::from_kube(e, &kind_of::<K>(), &ns, &name))
    }

    async fn patch(&self, namespace: &str, name: &str, body: &Json) -> Result<K, StoreError> {
        debug!(kind = %kind_of::<K>(), ns = %namespace, name = %name, "strategic merge patch");
        let params = PatchParams { field_validation: Some(ValidationDirective::Strict), ..Default::default() };
        self.api(namespace)
            .patch(name, &params, &Patch::Strategic(body))
            .await
            .map_err(|e| StoreError::from_kube(e, &kind_of::<K>(), namespace, name))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(e, &kind_of::<K>(), namespace, name))
    }

    async fn list(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<K>, StoreError> {
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        self.api(namespace)
            .list(&lp)
            .await
            .map(|l| l.items)
            .map_err(|e| StoreError::from_kube(e, &kind_of::<K>(), namespace, ""))
    }
}
