//! drydock apply: create-or-update reconciliation of declarative manifests.
//!
//! Every kind goes through the same [`Reconciler`]: update first, create only when the
//! update reports `NotFound`. Kinds whose desired state depends on live state implement
//! [`Reconcile::seed`]. [`Reconciler::create`] is the create-only path for objects that
//! must be new, such as run pods.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use drydock_core::{Manifest, SpecError, WorkloadSpec};
use drydock_kubehub::{identity, kind_of, Manifested, ResourceStore, StoreError, Stores};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

mod yaml;

pub use yaml::{parse_manifests, KindedManifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Updated,
    Created,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Updated => "updated",
            ApplyOutcome::Created => "created",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("invalid workload: {0}")]
    Spec(#[from] SpecError),
    #[error("invalid manifest: {0}")]
    Manifest(#[source] StoreError),
    #[error("update {kind} {namespace}/{name} failed: {source}")]
    Update { kind: String, namespace: String, name: String, #[source] source: StoreError },
    #[error("create {kind} {namespace}/{name} failed: {source}")]
    Create { kind: String, namespace: String, name: String, #[source] source: StoreError },
    #[error("parsing manifests: {0}")]
    Yaml(String),
    #[error("unsupported kind {0} (expect Deployment, CronJob, Pod, ConfigMap, Secret or HorizontalPodAutoscaler)")]
    UnsupportedKind(String),
}

/// Per-kind reconciliation hooks.
pub trait Reconcile: Manifested {
    /// Read the live object before updating and pass it to [`Reconcile::seed`].
    const SEEDS_FROM_LIVE: bool = false;

    /// Copy mutable, controller-owned fields from the live object into `self`.
    /// `live` is `None` when the object is missing or could not be read.
    fn seed(&mut self, _live: Option<&Self>) {}
}

impl Reconcile for Deployment {
    const SEEDS_FROM_LIVE: bool = true;

    /// Keep the running replica count unless the manifest pins one (minimum 1).
    fn seed(&mut self, live: Option<&Self>) {
        let Some(spec) = self.spec.as_mut() else { return };
        if spec.replicas.is_some() {
            return;
        }
        let current = live.and_then(|d| d.status.as_ref()).and_then(|s| s.replicas).unwrap_or(0);
        spec.replicas = Some(current.max(1));
    }
}

impl Reconcile for CronJob {}
impl Reconcile for Pod {}
impl Reconcile for ConfigMap {}
impl Reconcile for Secret {}
impl Reconcile for HorizontalPodAutoscaler {}

/// Update-or-create over one kind's store.
pub struct Reconciler<K: Manifested> {
    store: Arc<dyn ResourceStore<K>>,
}

impl<K: Manifested> Clone for Reconciler<K> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone() }
    }
}

impl<K: Reconcile> Reconciler<K> {
    pub fn new(store: Arc<dyn ResourceStore<K>>) -> Self {
        Self { store }
    }

    pub async fn apply(&self, desired: &K) -> Result<ApplyOutcome, ApplyError> {
        let t0 = Instant::now();
        let kind = kind_of::<K>();
        let (ns, name) = identity(desired).map_err(ApplyError::Manifest)?;

        let mut desired = desired.clone();
        if K::SEEDS_FROM_LIVE {
            let live = match self.store.get(&ns, &name).await {
                Ok(obj) => Some(obj),
                Err(e) => {
                    if !e.is_not_found() {
                        debug!(kind = %kind, ns = %ns, name = %name, error = %e, "live read failed; seeding defaults");
                    }
                    None
                }
            };
            desired.seed(live.as_ref());
        }

        let outcome = match self.store.update(&desired).await {
            Ok(_) => ApplyOutcome::Updated,
            Err(e) if e.is_not_found() => {
                debug!(kind = %kind, ns = %ns, name = %name, "not found on update; creating");
                match self.store.create(&desired).await {
                    Ok(_) => ApplyOutcome::Created,
                    Err(source) => {
                        counter!("apply_err", 1u64, "kind" => kind.clone());
                        return Err(ApplyError::Create { kind, namespace: ns, name, source });
                    }
                }
            }
            Err(source) => {
                counter!("apply_err", 1u64, "kind" => kind.clone());
                return Err(ApplyError::Update { kind, namespace: ns, name, source });
            }
        };
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("apply_total", 1u64, "kind" => kind.clone(), "outcome" => outcome.as_str());
        info!(kind = %kind, ns = %ns, name = %name, outcome = outcome.as_str(), "applied");
        Ok(outcome)
    }

    /// Create-only: an existing object with the same name is an error, never updated.
    pub async fn create(&self, desired: &K) -> Result<ApplyOutcome, ApplyError> {
        let t0 = Instant::now();
        let kind = kind_of::<K>();
        let (ns, name) = identity(desired).map_err(ApplyError::Manifest)?;
        let mut desired = desired.clone();
        desired.seed(None);
        if let Err(source) = self.store.create(&desired).await {
            counter!("apply_err", 1u64, "kind" => kind.clone());
            return Err(ApplyError::Create { kind, namespace: ns, name, source });
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("apply_total", 1u64, "kind" => kind.clone(), "outcome" => ApplyOutcome::Created.as_str());
        info!(kind = %kind, ns = %ns, name = %name, "created");
        Ok(ApplyOutcome::Created)
    }
}

/// Reconcilers for every managed kind.
#[derive(Clone)]
pub struct Applier {
    pub deployments: Reconciler<Deployment>,
    pub cron_jobs: Reconciler<CronJob>,
    pub pods: Reconciler<Pod>,
    pub config_maps: Reconciler<ConfigMap>,
    pub secrets: Reconciler<Secret>,
    pub autoscalers: Reconciler<HorizontalPodAutoscaler>,
}

impl Applier {
    pub fn new(stores: &Stores) -> Self {
        Self {
            deployments: Reconciler::new(stores.deployments.clone()),
            cron_jobs: Reconciler::new(stores.cron_jobs.clone()),
            pods: Reconciler::new(stores.pods.clone()),
            config_maps: Reconciler::new(stores.config_maps.clone()),
            secrets: Reconciler::new(stores.secrets.clone()),
            autoscalers: Reconciler::new(stores.autoscalers.clone()),
        }
    }

    pub async fn apply_workload(&self, spec: &WorkloadSpec) -> Result<ApplyOutcome, ApplyError> {
        let manifest = spec.to_manifest()?;
        self.apply_manifest(&manifest).await
    }

    pub async fn apply_manifest(&self, manifest: &Manifest) -> Result<ApplyOutcome, ApplyError> {
        match manifest {
            Manifest::Deployment(d) => self.deployments.apply(d).await,
            Manifest::CronJob(cj) => self.cron_jobs.apply(cj).await,
            Manifest::Pod(p) => self.pods.apply(p).await,
        }
    }

    pub async fn apply_kinded(&self, manifest: &KindedManifest) -> Result<ApplyOutcome, ApplyError> {
        match manifest {
            KindedManifest::Deployment(d) => self.deployments.apply(d).await,
            KindedManifest::CronJob(cj) => self.cron_jobs.apply(cj).await,
            KindedManifest::Pod(p) => self.pods.apply(p).await,
            KindedManifest::ConfigMap(cm) => self.config_maps.apply(cm).await,
            KindedManifest::Secret(s) => self.secrets.apply(s).await,
            KindedManifest::HorizontalPodAutoscaler(h) => self.autoscalers.apply(h).await,
        }
    }

    /// Apply each document in order, stopping at the first failure.
    pub async fn apply_yaml(&self, yaml: &str, ns_override: Option<&str>) -> Result<Vec<(String, ApplyOutcome)>, ApplyError> {
        let docs = parse_manifests(yaml, ns_override)?;
        let mut applied = Vec::with_capacity(docs.len());
        for doc in &docs {
            let outcome = self.apply_kinded(doc).await?;
            applied.push((doc.kind().to_string(), outcome));
        }
        Ok(applied)
    }

    pub async fn config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) -> Result<ApplyOutcome, ApplyError> {
        let cm = ConfigMap { metadata: meta(namespace, name), data: Some(data), ..Default::default() };
        self.config_maps.apply(&cm).await
    }

    /// Opaque secret holding `data` verbatim.
    pub async fn secret(&self, namespace: &str, name: &str, data: BTreeMap<String, Vec<u8>>) -> Result<ApplyOutcome, ApplyError> {
        let s = Secret {
            metadata: meta(namespace, name),
            type_: Some("Opaque".to_string()),
            data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()),
            ..Default::default()
        };
        self.secrets.apply(&s).await
    }
}

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta { name: Some(name.to_string()), namespace: Some(namespace.to_string()), ..Default::default() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};

    fn deploy(replicas: Option<i32>) -> Deployment {
        Deployment {
            metadata: meta("ns", "web"),
            spec: Some(DeploymentSpec { replicas, ..Default::default() }),
            status: None,
        }
    }

    fn live(status_replicas: i32) -> Option<Deployment> {
        let mut d = deploy(Some(status_replicas));
        d.status = Some(DeploymentStatus { replicas: Some(status_replicas), ..Default::default() });
        Some(d)
    }

    #[test]
    fn seed_takes_live_status_replicas() {
        let mut d = deploy(None);
        d.seed(live(5).as_ref());
        assert_eq!(d.spec.unwrap().replicas, Some(5));
    }

    #[test]
    fn seed_defaults_to_one_when_missing_or_zero() {
        let mut d = deploy(None);
        d.seed(None);
        assert_eq!(d.spec.unwrap().replicas, Some(1));

        let mut d = deploy(None);
        d.seed(live(0).as_ref());
        assert_eq!(d.spec.unwrap().replicas, Some(1));
    }

    #[test]
    fn seed_keeps_explicit_override() {
        let mut d = deploy(Some(3));
        d.seed(live(7).as_ref());
        assert_eq!(d.spec.unwrap().replicas, Some(3));
    }
}
