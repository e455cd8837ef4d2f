//! drydock kubehub: the resource store and log stream capabilities, backed by kube.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, Service};
use kube::{
    api::{Api, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use tracing::info;

mod error;
mod logs;
pub mod memory;
mod store;

pub use error::StoreError;
pub use logs::{ByteStream, KubeLogs, LogOptions, LogSource};
pub use store::{identity, kind_of, KubeStore, Manifested, ResourceStore};

/// One store per managed kind, all sharing the same client.
#[derive(Clone)]
pub struct Stores {
    pub deployments: Arc<dyn ResourceStore<Deployment>>,
    pub cron_jobs: Arc<dyn ResourceStore<CronJob>>,
    pub pods: Arc<dyn ResourceStore<Pod>>,
    pub config_maps: Arc<dyn ResourceStore<ConfigMap>>,
    pub secrets: Arc<dyn ResourceStore<Secret>>,
    pub autoscalers: Arc<dyn ResourceStore<HorizontalPodAutoscaler>>,
    pub services: Arc<dyn ResourceStore<Service>>,
}

impl Stores {
    pub fn kube(client: Client) -> Self {
        Self {
            deployments: Arc::new(KubeStore::new(client.clone())),
            cron_jobs: Arc::new(KubeStore::new(client.clone())),
            pods: Arc::new(KubeStore::new(client.clone())),
            config_maps: Arc::new(KubeStore::new(client.clone())),
            secrets: Arc::new(KubeStore::new(client.clone())),
            autoscalers: Arc::new(KubeStore::new(client.clone())),
            services: Arc::new(KubeStore::new(client)),
        }
    }
}

/// Build the single shared client. An explicit kubeconfig path wins; otherwise
/// in-cluster config or the default kubeconfig is inferred.
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("loading kubeconfig {}", path.display()))?
        }
        None => Config::infer().await.context("inferring kube config (in-cluster or default kubeconfig)")?,
    };
    info!(cluster_url = %config.cluster_url, namespace = %config.default_namespace, "kube config loaded");
    Client::try_from(config).context("building kube client")
}

/// Cheap authenticated round-trip: list at most one namespace.
pub async fn health_check(client: &Client) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    api.list(&ListParams::default().limit(1)).await.context("listing namespaces")?;
    Ok(())
}
